use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{GateRecord, Outline, PhaseDiagnostic, PlannerError};

/// Side effects observed by the planning loop. Every method defaults to a
/// no-op, and errors are logged by the caller rather than aborting the run.
#[async_trait]
pub trait PlanningHooks: Send + Sync {
    async fn on_phase_complete(
        &self,
        _run_id: &str,
        _diagnostic: &PhaseDiagnostic,
    ) -> Result<(), PlannerError> {
        Ok(())
    }

    async fn on_gate_evaluated(&self, _run_id: &str, _record: &GateRecord) -> Result<(), PlannerError> {
        Ok(())
    }

    /// Snapshot of the consolidated outline under `label`.
    async fn checkpoint(&self, _label: &str, _outline: &Outline) -> Result<(), PlannerError> {
        Ok(())
    }

    async fn request_approval(&self, _request: ApprovalRequest) -> Result<(), PlannerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PlanningHooks for NoopHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// A generated idea that needs a human decision before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub source_agent: String,
    pub request_type: String,
    pub description: String,
    pub priority: ApprovalPriority,
    pub context: Value,
}

impl ApprovalRequest {
    /// Builds a request for an idea flagged `requires_approval`; other ideas
    /// yield `None`.
    pub fn from_idea(run_id: &str, source_agent: &str, idea: &Value) -> Option<Self> {
        let flagged = idea
            .get("requires_approval")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !flagged {
            return None;
        }

        let text = |key: &str, default: &str| {
            idea.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let priority = if idea.get("benefit").and_then(Value::as_str) == Some("high") {
            ApprovalPriority::High
        } else {
            ApprovalPriority::Medium
        };

        Some(Self {
            run_id: run_id.to_string(),
            source_agent: source_agent.to_string(),
            request_type: text("type", "idea"),
            description: text("description", ""),
            priority,
            context: idea.clone(),
        })
    }
}
