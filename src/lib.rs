pub mod config;
pub mod cycle_check;
pub mod dependency;
pub mod executor;
pub mod gates;
pub mod health;
pub mod hooks;
pub mod outline;
pub mod phase;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod store;
pub mod task;
pub mod validator;

pub use config::{GateConfig, PersistenceConfig, PlannerConfig, SchedulerConfig};
pub use cycle_check::{check_declared_inputs, find_cycle};
pub use dependency::{CompletionLedger, Dependency, FanOutGroup};
pub use executor::{Scheduler, render_graph};
pub use gates::{GateOutcome, GatePolicy, GateResult, QualityGate, QualityGateRegistry};
pub use health::{Alert, HealthReport, Severity};
pub use hooks::{ApprovalPriority, ApprovalRequest, NoopHooks, PlanningHooks};
pub use outline::{ExpandedArc, Outline, OutlineMetadata, OutlineStatus, PhaseOutputs, Scene};
pub use phase::{GateRecord, Phase, PhaseDiagnostic, PhaseStatus};
pub use pipeline::{AgentRole, AgentRoster, PlanningLoop};
pub use report::{AttemptRecord, PlanOutcome, PlanReport, PlanStatus, TaskSummary};
pub use retry::RetryPolicy;
pub use store::{MemoryStore, OutlineStore};
pub use task::{Agent, AgentOutput, ResultValidator, Task, TaskStatus, Validation, context};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Insertion-ordered key/value payload handed to an agent.
pub type TaskContext = serde_json::Map<String, serde_json::Value>;
pub type BoxAgent = Arc<dyn Agent>;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("Invalid task {task}: {reason}")]
    InvalidTask { task: String, reason: String },
    #[error("Task {task} expects context key '{key}' that no dependency can produce")]
    UndeclaredInput { task: String, key: String },
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("Context cancelled: {0}")]
    Cancelled(String),
    #[error("No agent registered for role {0}")]
    MissingAgent(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
