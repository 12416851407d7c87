use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{BoxAgent, Dependency, FanOutGroup, PlannerError, TaskContext};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const SUCCESS: &str = "success";

/// What an agent hands back: a status string and the `output` mapping that
/// gets merged into every dependent's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub status: String,
    #[serde(default)]
    pub output: TaskContext,
}

impl AgentOutput {
    pub fn success(output: TaskContext) -> Self {
        Self {
            status: SUCCESS.to_string(),
            output,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.output.get(key)
    }
}

/// An opaque unit of work. The scheduler may call `execute` up to a task's
/// `max_iterations` times, so implementations must tolerate retries.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Keys this agent promises to place under `output`. Empty means the
    /// agent makes no promise and may produce anything.
    fn output_keys(&self) -> Vec<String> {
        Vec::new()
    }

    async fn pre_execution(
        &self,
        _ctx: CancellationToken,
        _context: &TaskContext,
    ) -> Result<(), PlannerError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        context: &TaskContext,
    ) -> Result<AgentOutput, PlannerError>;

    async fn post_execution(
        &self,
        _ctx: CancellationToken,
        _output: &AgentOutput,
    ) -> Result<(), PlannerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub message: String,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: "OK".to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

pub type ResultValidator = Arc<dyn Fn(&AgentOutput) -> Validation + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Builds a context from `(key, value)` pairs, keeping their order.
pub fn context<I, K>(pairs: I) -> TaskContext
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A declarative unit of work inside one scheduling run.
pub struct Task {
    name: String,
    agent: BoxAgent,
    pub(crate) context: TaskContext,
    dependencies: Vec<Dependency>,
    group: Option<FanOutGroup>,
    priority: i32,
    max_iterations: u32,
    validator: Option<ResultValidator>,
    expected_keys: Vec<String>,
    pub(crate) status: TaskStatus,
    pub(crate) result: Option<AgentOutput>,
    pub(crate) errors: Vec<String>,
    pub(crate) iteration_count: u32,
}

impl Task {
    pub fn new(name: impl Into<String>, agent: BoxAgent) -> Self {
        Self {
            name: name.into(),
            agent,
            context: TaskContext::new(),
            dependencies: Vec::new(),
            group: None,
            priority: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            validator: None,
            expected_keys: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            errors: Vec::new(),
            iteration_count: 0,
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Adds a dependency. Strings ending in `*` become prefix wildcards.
    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn depends_on_all<I, D>(self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        dependencies
            .into_iter()
            .fold(self, |task, dep| task.depends_on(dep))
    }

    pub fn in_group(mut self, group: FanOutGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&AgentOutput) -> Validation + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_validator(mut self, validator: ResultValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Declares context keys this task reads from upstream outputs.
    pub fn expects<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.expected_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent(&self) -> &BoxAgent {
        &self.agent
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn group(&self) -> Option<&FanOutGroup> {
        self.group.as_ref()
    }

    pub fn get_priority(&self) -> i32 {
        self.priority
    }

    pub fn get_max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn result_validator(&self) -> Option<&ResultValidator> {
        self.validator.as_ref()
    }

    pub fn expected_keys(&self) -> &[String] {
        &self.expected_keys
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&AgentOutput> {
        self.result.as_ref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.iteration_count < self.max_iterations
    }

    /// True when `dependency` of some other task refers to this one.
    pub fn is_matched_by(&self, dependency: &Dependency) -> bool {
        dependency.matches(&self.name, self.group.as_ref())
    }

    pub fn depends_on_task(&self, other: &Task) -> bool {
        self.dependencies.iter().any(|dep| other.is_matched_by(dep))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("agent", &self.agent.name())
            .field("dependencies", &self.dependencies)
            .field("group", &self.group)
            .field("priority", &self.priority)
            .field("max_iterations", &self.max_iterations)
            .field("status", &self.status)
            .field("iteration_count", &self.iteration_count)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            _ctx: CancellationToken,
            context: &TaskContext,
        ) -> Result<AgentOutput, PlannerError> {
            Ok(AgentOutput::success(context.clone()))
        }
    }

    #[test]
    fn builder_deduplicates_dependencies() {
        let task = Task::new("b", Arc::new(Echo))
            .depends_on("a")
            .depends_on("a")
            .depends_on("scene_*");

        assert_eq!(
            task.dependencies(),
            &[Dependency::exact("a"), Dependency::prefix("scene_")]
        );
        assert_eq!(task.get_max_iterations(), DEFAULT_MAX_ITERATIONS);
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn retry_requires_remaining_budget() {
        let mut task = Task::new("x", Arc::new(Echo)).max_iterations(2);
        task.status = TaskStatus::Failed;
        task.iteration_count = 1;
        assert!(task.can_retry());

        task.iteration_count = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn context_keeps_insertion_order() {
        let ctx = context([("zeta", json!(1)), ("alpha", json!(2))]);
        let keys: Vec<_> = ctx.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn output_status_defaults_to_success_constructor() {
        let out = AgentOutput::success(context([("k", json!("v"))]));
        assert!(out.is_success());
        assert_eq!(out.get("k"), Some(&json!("v")));
    }
}
