use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{AgentOutput, CompletionLedger, Task, TaskContext, TaskStatus};

/// How a scheduling run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanOutcome {
    AllCompleted,
    /// Some tasks exhausted their budget; `skipped` were starved by them.
    PartialFailure {
        failed: Vec<String>,
        skipped: Vec<String>,
    },
    /// Pending tasks that can never become ready and are not blocked by a
    /// failure: most likely a circular or unknown dependency.
    Stuck { pending: Vec<String> },
    PassesExhausted { pending: Vec<String> },
}

impl PlanOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::AllCompleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: TaskStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub errors: Vec<String>,
    pub has_result: bool,
    pub dependencies: Vec<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            name: task.name().to_string(),
            status: task.status(),
            iteration_count: task.iteration_count(),
            max_iterations: task.get_max_iterations(),
            errors: task.errors().to_vec(),
            has_result: task.result().is_some(),
            dependencies: task.dependencies().iter().map(ToString::to_string).collect(),
        }
    }
}

/// One invocation of one task's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub pass: usize,
    pub task: String,
    pub iteration: u32,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct PlanReport {
    /// Results of completed tasks, keyed by task name.
    pub results: HashMap<String, AgentOutput>,
    /// Passes used.
    pub iteration_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub outcome: PlanOutcome,
    pub tasks: Vec<TaskSummary>,
    pub trace: Vec<AttemptRecord>,
    /// Seed ledger plus everything this run completed or failed.
    pub ledger: CompletionLedger,
}

impl PlanReport {
    pub fn output(&self, task: &str) -> Option<&TaskContext> {
        self.results.get(task).map(|result| &result.output)
    }

    pub fn task_status(&self, task: &str) -> Option<&TaskSummary> {
        self.tasks.iter().find(|summary| summary.name == task)
    }

    pub fn status(&self) -> PlanStatus {
        let count = |status| self.tasks.iter().filter(|t| t.status == status).count();
        PlanStatus {
            total: self.tasks.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            pending: count(TaskStatus::Pending),
            skipped: count(TaskStatus::Skipped),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Names of completed tasks in the order they completed.
    pub fn completion_order(&self) -> Vec<&str> {
        self.trace
            .iter()
            .filter(|attempt| attempt.succeeded())
            .map(|attempt| attempt.task.as_str())
            .collect()
    }

    pub fn execution_order(&self) -> String {
        let mut result = String::from("\n");
        for (i, attempt) in self.trace.iter().enumerate() {
            let verdict = match &attempt.error {
                None => "ok".to_string(),
                Some(err) => format!("failed: {err}"),
            };
            result.push_str(&format!(
                "{}. [pass {}] {} (attempt {}) {}\n",
                i + 1,
                attempt.pass,
                attempt.task,
                attempt.iteration,
                verdict
            ));
        }
        result
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskSummary> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    pub fn skipped_tasks(&self) -> impl Iterator<Item = &TaskSummary> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Skipped)
    }
}
