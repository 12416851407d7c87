#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storyloom::{Agent, AgentOutput, PlannerError, TaskContext};
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Converts a JSON object literal into a context.
pub fn obj(value: Value) -> TaskContext {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

#[derive(Clone)]
pub enum Step {
    Succeed(TaskContext),
    Fail(String),
}

/// Agent that replays a fixed script, repeating the last step once the
/// script runs out, and records every context it was handed.
pub struct Scripted {
    name: String,
    steps: Vec<Step>,
    keys: Vec<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<TaskContext>>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl Scripted {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps,
            keys: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            log: None,
        }
    }

    pub fn ok(name: &str, output: Value) -> Self {
        Self::new(name, vec![Step::Succeed(obj(output))])
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::new(name, vec![Step::Fail(message.to_string())])
    }

    pub fn declaring(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn logging_to(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<TaskContext> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last_context(&self) -> Option<TaskContext> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Agent for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        context: &TaskContext,
    ) -> Result<AgentOutput, PlannerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(context.clone());
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.name.clone());
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(PlannerError::Cancelled(format!("{} interrupted", self.name)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let step = self
            .steps
            .get(call)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or(Step::Succeed(TaskContext::new()));
        match step {
            Step::Succeed(output) => Ok(AgentOutput::success(output)),
            Step::Fail(message) => Err(PlannerError::TaskExecution(message)),
        }
    }
}
