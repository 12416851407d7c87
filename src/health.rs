use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn escalates(self) -> bool {
        self >= Self::High
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Alert {
    fn new(severity: Severity, code: &str, message: String) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message,
        }
    }
}

/// Run health summarised from the validation phase's refinements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub run_id: String,
    pub healthy: bool,
    pub timeline_violations: Vec<Value>,
    pub thematic_issues: Vec<Value>,
    pub unresolved_threads: Vec<Value>,
    pub pacing_issues: Vec<Value>,
    pub alerts: Vec<Alert>,
    pub escalation_required: bool,
}

fn list<'a>(section: Option<&'a Value>, key: &str) -> &'a [Value] {
    section
        .and_then(|s| s.get(key))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

impl HealthReport {
    /// Builds the report from a refinements object with `timeline_validation`,
    /// `theme_analysis`, `foreshadowing_analysis` and `pacing_analysis`
    /// sections. Missing sections count as clean.
    pub fn from_refinements(run_id: impl Into<String>, refinements: &Value) -> Self {
        let mut report = Self {
            run_id: run_id.into(),
            healthy: true,
            timeline_violations: Vec::new(),
            thematic_issues: Vec::new(),
            unresolved_threads: Vec::new(),
            pacing_issues: Vec::new(),
            alerts: Vec::new(),
            escalation_required: false,
        };

        let violations = list(refinements.get("timeline_validation"), "violations");
        if !violations.is_empty() {
            let severity = if violations.len() > 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            report.healthy = false;
            report.timeline_violations = violations.to_vec();
            report.alerts.push(Alert::new(
                severity,
                "timeline_violations",
                format!("{} timeline violation(s)", violations.len()),
            ));
        }

        let inconsistencies = list(refinements.get("theme_analysis"), "thematic_inconsistencies");
        if !inconsistencies.is_empty() {
            report.healthy = false;
            report.thematic_issues = inconsistencies.to_vec();
            report.alerts.push(Alert::new(
                Severity::Medium,
                "thematic_inconsistencies",
                format!("{} thematic inconsistency(ies)", inconsistencies.len()),
            ));
        }

        let unresolved = list(refinements.get("foreshadowing_analysis"), "unresolved_promises");
        if !unresolved.is_empty() {
            report.unresolved_threads = unresolved.to_vec();
            report.alerts.push(Alert::new(
                Severity::Low,
                "unresolved_promises",
                format!("{} unresolved promise(s)", unresolved.len()),
            ));
        }

        let pacing = refinements.get("pacing_analysis");
        let monotony = list(pacing, "monotony_flags");
        let rushed = list(pacing, "rushed_sequences");
        if !monotony.is_empty() || !rushed.is_empty() {
            report.pacing_issues = monotony.iter().chain(rushed).cloned().collect();
            report.alerts.push(Alert::new(
                Severity::Low,
                "pacing_issues",
                "Pacing issues detected".to_string(),
            ));
        }

        report.escalation_required = report.alerts.iter().any(|a| a.severity.escalates());
        report
    }

    /// Alerts severe enough to need a human.
    pub fn escalations(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.severity.escalates())
    }
}
