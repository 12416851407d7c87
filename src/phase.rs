use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{GateOutcome, PlanOutcome, PlanReport, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Synthesis,
    EarlyThemeValidation,
    CoverageVerification,
    CharacterPlanning,
    SceneExpansion,
    ValidationRefinement,
    IdeaGeneration,
    Consolidation,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Self::Synthesis,
        Self::EarlyThemeValidation,
        Self::CoverageVerification,
        Self::CharacterPlanning,
        Self::SceneExpansion,
        Self::ValidationRefinement,
        Self::IdeaGeneration,
        Self::Consolidation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis",
            Self::EarlyThemeValidation => "early_theme_validation",
            Self::CoverageVerification => "coverage_verification",
            Self::CharacterPlanning => "character_planning",
            Self::SceneExpansion => "scene_expansion",
            Self::ValidationRefinement => "validation_refinement",
            Self::IdeaGeneration => "idea_generation",
            Self::Consolidation => "consolidation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of a phase's output can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Generated,
    /// Output exists but some task failed or a gate did not pass.
    GeneratedWithWarnings,
    /// Nothing ran because work from an earlier phase failed.
    MissingUpstreamFailed,
    Failed,
    Stuck,
    /// Skipped because a blocking gate halted the loop.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDiagnostic {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub outcome: Option<PlanOutcome>,
    pub passes: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PhaseDiagnostic {
    fn empty(phase: Phase, status: PhaseStatus) -> Self {
        Self {
            phase,
            status,
            outcome: None,
            passes: 0,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            errors: BTreeMap::new(),
            gates: Vec::new(),
            note: None,
        }
    }

    pub fn from_report(phase: Phase, report: &PlanReport) -> Self {
        let names = |status: TaskStatus| -> Vec<String> {
            report
                .tasks
                .iter()
                .filter(|t| t.status == status)
                .map(|t| t.name.clone())
                .collect()
        };
        let completed = names(TaskStatus::Completed);
        let failed = names(TaskStatus::Failed);
        let skipped = names(TaskStatus::Skipped);

        let status = match &report.outcome {
            PlanOutcome::AllCompleted => PhaseStatus::Generated,
            _ if !completed.is_empty() => PhaseStatus::GeneratedWithWarnings,
            _ if !report.tasks.is_empty() && skipped.len() == report.tasks.len() => {
                PhaseStatus::MissingUpstreamFailed
            }
            PlanOutcome::PartialFailure { .. } => PhaseStatus::Failed,
            PlanOutcome::Stuck { .. } | PlanOutcome::PassesExhausted { .. } => PhaseStatus::Stuck,
        };

        let errors = report
            .tasks
            .iter()
            .filter(|t| !t.errors.is_empty())
            .map(|t| (t.name.clone(), t.errors.clone()))
            .collect();

        Self {
            phase,
            status,
            outcome: Some(report.outcome.clone()),
            passes: report.iteration_count,
            completed,
            failed,
            skipped,
            errors,
            gates: Vec::new(),
            note: None,
        }
    }

    pub fn not_run(phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            note: Some(reason.into()),
            ..Self::empty(phase, PhaseStatus::NotRun)
        }
    }

    pub fn missing_upstream(phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            note: Some(reason.into()),
            ..Self::empty(phase, PhaseStatus::MissingUpstreamFailed)
        }
    }

    /// A phase with no scheduled work that still produced output.
    pub fn generated(phase: Phase) -> Self {
        Self::empty(phase, PhaseStatus::Generated)
    }

    /// Attaches a gate outcome. A failed gate downgrades a clean phase.
    pub fn record_gate(&mut self, outcome: GateOutcome) {
        if !outcome.passed && self.status == PhaseStatus::Generated {
            self.status = PhaseStatus::GeneratedWithWarnings;
        }
        self.gates.push(outcome);
    }

    pub fn produced_output(&self) -> bool {
        matches!(
            self.status,
            PhaseStatus::Generated | PhaseStatus::GeneratedWithWarnings
        )
    }
}

/// A gate outcome tagged with the phase it guarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: GateOutcome,
}
