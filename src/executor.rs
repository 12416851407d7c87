use futures::future::join_all;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    AgentOutput, AttemptRecord, BoxAgent, CompletionLedger, PlanOutcome, PlanReport, PlannerError,
    ResultValidator, SchedulerConfig, Task, TaskContext, TaskStatus, TaskSummary,
    check_declared_inputs, find_cycle,
};

/// Runs one plan of tasks to completion in bounded global passes.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let mut config = config;
        config.retry = config.retry.normalized();
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn execute_plan(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
    ) -> Result<PlanReport, PlannerError> {
        self.execute_plan_with(ctx, tasks, &CompletionLedger::new())
            .await
    }

    /// Like [`Scheduler::execute_plan`], but dependencies may also be
    /// satisfied by tasks recorded in `prior` (earlier runs).
    pub async fn execute_plan_with(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
        prior: &CompletionLedger,
    ) -> Result<PlanReport, PlannerError> {
        let mut plan = Plan::new(tasks, prior)?;

        if self.config.detect_cycles {
            if let Some(cycle) = find_cycle(&plan.tasks) {
                return Err(PlannerError::CircularDependency(cycle));
            }
        }
        check_declared_inputs(&plan.tasks, prior)?;

        info!(tasks = plan.tasks.len(), "executing plan");

        let max_passes = self.config.max_global_iterations.max(1);
        let mut trace = Vec::new();
        let mut outcome = None;
        let mut passes = 0;

        for pass in 1..=max_passes {
            if ctx.is_cancelled() {
                return Err(PlannerError::Cancelled(format!(
                    "plan cancelled before pass {pass}"
                )));
            }
            passes = pass;

            let counts = plan.counts();
            info!(
                pass,
                completed = counts.completed,
                pending = counts.pending,
                failed = counts.failed,
                "scheduler pass"
            );

            let ready = plan.ready_tasks();
            if ready.is_empty() {
                outcome = Some(plan.classify_unready());
                break;
            }
            debug!(pass, ready = ?plan.names(&ready), "ready tasks");

            self.run_ready(&ctx, &mut plan, &ready, pass, &mut trace)
                .await?;

            if plan.all_completed() {
                info!(pass, "all tasks completed");
                outcome = Some(PlanOutcome::AllCompleted);
                break;
            }

            // Failures on the last pass stay Failed.
            if pass == max_passes {
                break;
            }
            let reset = plan.reset_retryable();
            if reset > 0 {
                let attempt = u32::try_from(pass).unwrap_or(u32::MAX);
                let delay = self.config.retry.delay_for(attempt);
                if !delay.is_zero() {
                    debug!(?delay, "waiting before retry pass");
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(PlannerError::Cancelled(
                                "Context cancelled during retry wait".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| plan.exhausted_outcome());
        Ok(plan.into_report(passes, outcome, trace))
    }

    async fn run_ready(
        &self,
        ctx: &CancellationToken,
        plan: &mut Plan,
        ready: &[usize],
        pass: usize,
        trace: &mut Vec<AttemptRecord>,
    ) -> Result<(), PlannerError> {
        let timeout = self.config.task_timeout();
        let limit = self.config.max_concurrency.max(1);

        // Sequential: each outcome is applied before the next task starts.
        if limit == 1 {
            for &idx in ready {
                let attempt = plan.start(idx);
                let result = tokio::select! {
                    result = attempt.run(ctx.clone(), timeout) => result,
                    _ = ctx.cancelled() => {
                        return Err(PlannerError::Cancelled(format!(
                            "cancelled while running {}",
                            plan.tasks[idx].name()
                        )));
                    }
                };
                plan.finish(idx, result, pass, trace);
            }
            return Ok(());
        }

        // Concurrent: outcomes are applied in priority order once the whole
        // batch is back, so propagation never races.
        let semaphore = Arc::new(Semaphore::new(limit));
        let handles: Vec<_> = ready
            .iter()
            .map(|&idx| {
                let attempt = plan.start(idx);
                let semaphore = Arc::clone(&semaphore);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        PlannerError::TaskExecution("Failed to acquire semaphore".to_string())
                    })?;
                    attempt.run(ctx, timeout).await
                })
            })
            .collect();

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::select! {
            joined = join_all(handles) => joined,
            _ = ctx.cancelled() => {
                aborts.iter().for_each(AbortHandle::abort);
                return Err(PlannerError::Cancelled(
                    "cancelled while running a ready batch".to_string(),
                ));
            }
        };

        for (&idx, joined) in ready.iter().zip(joined) {
            let result = joined.unwrap_or_else(|e| {
                Err(PlannerError::TaskExecution(format!("Join error: {e}")))
            });
            plan.finish(idx, result, pass, trace);
        }
        Ok(())
    }
}

/// Everything one agent invocation needs, detached from the plan.
struct Attempt {
    task: String,
    agent: BoxAgent,
    context: TaskContext,
    validator: Option<ResultValidator>,
}

impl Attempt {
    async fn run(
        self,
        ctx: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<AgentOutput, PlannerError> {
        let invoke = async {
            self.agent.pre_execution(ctx.clone(), &self.context).await?;
            let output = self.agent.execute(ctx.clone(), &self.context).await?;
            self.agent.post_execution(ctx.clone(), &output).await?;
            Ok::<_, PlannerError>(output)
        };

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, invoke)
                .await
                .map_err(|_| PlannerError::Timeout(limit))??,
            None => invoke.await?,
        };

        if let Some(validator) = &self.validator {
            let verdict = validator(&output);
            if !verdict.valid {
                debug!(task = %self.task, message = %verdict.message, "result rejected");
                return Err(PlannerError::Validation(verdict.message));
            }
        }
        Ok(output)
    }
}

/// Merges an upstream `output` mapping into a dependent's context. Keys are
/// overwritten, never removed, so delivering the same output twice is a no-op.
pub(crate) fn merge_output(context: &mut TaskContext, output: &TaskContext) {
    for (key, value) in output {
        context.insert(key.clone(), value.clone());
    }
}

/// Task map plus completed/failed bookkeeping for one run.
struct Plan {
    tasks: Vec<Task>,
    ledger: CompletionLedger,
}

impl Plan {
    fn new(tasks: Vec<Task>, prior: &CompletionLedger) -> Result<Self, PlannerError> {
        let mut seen = HashSet::new();
        let mut ledger = prior.clone();

        for task in &tasks {
            if !seen.insert(task.name().to_string()) {
                return Err(PlannerError::DuplicateTask(task.name().to_string()));
            }
            if task.get_max_iterations() == 0 {
                return Err(PlannerError::InvalidTask {
                    task: task.name().to_string(),
                    reason: "max_iterations must be positive".to_string(),
                });
            }
            ledger.register(task.name(), task.group());
        }

        Ok(Self { tasks, ledger })
    }

    fn names(&self, indices: &[usize]) -> Vec<&str> {
        indices.iter().map(|&i| self.tasks[i].name()).collect()
    }

    fn names_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.name().to_string())
            .collect()
    }

    fn counts(&self) -> crate::PlanStatus {
        let count = |status| self.tasks.iter().filter(|t| t.status == status).count();
        crate::PlanStatus {
            total: self.tasks.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            pending: count(TaskStatus::Pending),
            skipped: count(TaskStatus::Skipped),
        }
    }

    fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    /// Pending tasks whose dependencies are all satisfied, highest priority
    /// first. The sort is stable, so ties keep declaration order.
    fn ready_tasks(&self) -> Vec<usize> {
        let mut ready: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                task.status == TaskStatus::Pending
                    && task
                        .dependencies()
                        .iter()
                        .all(|dep| self.ledger.is_satisfied(dep))
            })
            .map(|(idx, _)| idx)
            .collect();
        ready.sort_by_key(|&idx| Reverse(self.tasks[idx].get_priority()));
        ready
    }

    fn start(&mut self, idx: usize) -> Attempt {
        let task = &mut self.tasks[idx];
        task.status = TaskStatus::Running;
        task.iteration_count += 1;

        info!(task = %task.name(), iteration = task.iteration_count, "executing task");
        debug!(task = %task.name(), keys = ?task.context.keys().collect::<Vec<_>>(), "task context");

        Attempt {
            task: task.name().to_string(),
            agent: Arc::clone(task.agent()),
            context: task.context.clone(),
            validator: task.result_validator().cloned(),
        }
    }

    fn finish(
        &mut self,
        idx: usize,
        result: Result<AgentOutput, PlannerError>,
        pass: usize,
        trace: &mut Vec<AttemptRecord>,
    ) {
        let name = self.tasks[idx].name().to_string();
        let iteration = self.tasks[idx].iteration_count;

        match result {
            Ok(output) => {
                self.ledger.mark_completed(&name, &output.output);
                self.propagate(idx, &output.output);

                let task = &mut self.tasks[idx];
                task.status = TaskStatus::Completed;
                task.result = Some(output);

                info!(task = %name, iteration, "task completed");
                trace.push(AttemptRecord {
                    pass,
                    task: name,
                    iteration,
                    error: None,
                });
            }
            Err(err) => {
                let message = err.to_string();
                let task = &mut self.tasks[idx];
                task.status = TaskStatus::Failed;
                task.errors.push(message.clone());
                let max_iterations = task.get_max_iterations();
                self.ledger.mark_failed(&name);

                warn!(task = %name, iteration, max_iterations, error = %message, "task failed");
                trace.push(AttemptRecord {
                    pass,
                    task: name,
                    iteration,
                    error: Some(message),
                });
            }
        }
    }

    fn propagate(&mut self, source: usize, output: &TaskContext) {
        let name = self.tasks[source].name().to_string();
        let group = self.tasks[source].group().cloned();

        for (idx, task) in self.tasks.iter_mut().enumerate() {
            if idx == source {
                continue;
            }
            let depends = task
                .dependencies()
                .iter()
                .any(|dep| dep.matches(&name, group.as_ref()));
            if depends {
                merge_output(&mut task.context, output);
                debug!(from = %name, to = %task.name(), keys = output.len(), "propagated output");
            }
        }
    }

    fn reset_retryable(&mut self) -> usize {
        let mut reset = 0;
        for task in self.tasks.iter_mut().filter(|t| t.can_retry()) {
            task.status = TaskStatus::Pending;
            reset += 1;
            info!(
                task = %task.name(),
                iteration = task.iteration_count,
                max_iterations = task.get_max_iterations(),
                "resetting for retry"
            );
        }
        reset
    }

    /// Called when no task is ready. Pending tasks that wait on a permanently
    /// failed (or already starved) task are skipped; anything left is stuck.
    fn classify_unready(&mut self) -> PlanOutcome {
        let pending: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].status == TaskStatus::Pending)
            .collect();

        if pending.is_empty() {
            let failed = self.names_with(TaskStatus::Failed);
            if failed.is_empty() {
                info!("all tasks completed");
                return PlanOutcome::AllCompleted;
            }
            warn!(failed = failed.len(), "some tasks failed, stopping");
            for task in self.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
                error!(task = %task.name(), errors = ?task.errors(), "failed task");
            }
            return PlanOutcome::PartialFailure {
                failed,
                skipped: Vec::new(),
            };
        }

        let mut starved: HashSet<usize> = HashSet::new();
        loop {
            let mut changed = false;
            for &idx in &pending {
                if starved.contains(&idx) {
                    continue;
                }
                let blocked = self.tasks[idx].dependencies().iter().any(|dep| {
                    !self.ledger.is_satisfied(dep)
                        && (self.ledger.has_failed_match(dep)
                            || starved.iter().any(|&s| self.tasks[s].is_matched_by(dep)))
                });
                if blocked {
                    starved.insert(idx);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut skipped = Vec::new();
        let mut stuck = Vec::new();
        for &idx in &pending {
            let task = &mut self.tasks[idx];
            if starved.contains(&idx) {
                task.status = TaskStatus::Skipped;
                warn!(task = %task.name(), "skipping task: upstream dependency permanently failed");
                // Later runs seeded with this ledger must see it as unreachable.
                self.ledger.mark_failed(task.name());
                skipped.push(task.name().to_string());
            } else {
                warn!(task = %task.name(), dependencies = ?task.dependencies(), "pending task");
                stuck.push(task.name().to_string());
            }
        }

        if stuck.is_empty() {
            PlanOutcome::PartialFailure {
                failed: self.names_with(TaskStatus::Failed),
                skipped,
            }
        } else {
            warn!("No ready tasks but not all completed - possible circular dependency");
            PlanOutcome::Stuck { pending: stuck }
        }
    }

    fn exhausted_outcome(&self) -> PlanOutcome {
        let pending = self.names_with(TaskStatus::Pending);
        if !pending.is_empty() {
            warn!(pending = pending.len(), "global iteration limit reached");
            return PlanOutcome::PassesExhausted { pending };
        }
        let failed = self.names_with(TaskStatus::Failed);
        if failed.is_empty() {
            PlanOutcome::AllCompleted
        } else {
            PlanOutcome::PartialFailure {
                failed,
                skipped: self.names_with(TaskStatus::Skipped),
            }
        }
    }

    fn into_report(self, passes: usize, outcome: PlanOutcome, trace: Vec<AttemptRecord>) -> PlanReport {
        let results = self
            .tasks
            .iter()
            .filter_map(|task| {
                task.result
                    .clone()
                    .map(|result| (task.name().to_string(), result))
            })
            .collect();
        let counts = self.counts();

        PlanReport {
            results,
            iteration_count: passes,
            completed_count: counts.completed,
            failed_count: counts.failed,
            outcome,
            tasks: self.tasks.iter().map(TaskSummary::from).collect(),
            trace,
            ledger: self.ledger,
        }
    }
}

/// Renders each root task followed by the chains of tasks that wait on it.
pub fn render_graph(tasks: &[Task]) -> String {
    let mut out = String::new();
    let roots = tasks.iter().enumerate().filter(|(_, task)| {
        !tasks
            .iter()
            .any(|other| other.name() != task.name() && task.depends_on_task(other))
    });

    for (idx, root) in roots {
        out.push_str(root.name());
        out.push('\n');
        render_chain(tasks, idx, "  ", &mut vec![idx], &mut out);
        out.push('\n');
    }
    out
}

fn render_chain(tasks: &[Task], idx: usize, prefix: &str, path: &mut Vec<usize>, out: &mut String) {
    for (child_idx, child) in tasks.iter().enumerate() {
        if child_idx == idx || path.contains(&child_idx) || !child.depends_on_task(&tasks[idx]) {
            continue;
        }
        out.push_str(&format!("{prefix}└─> {}\n", child.name()));
        path.push(child_idx);
        render_chain(tasks, child_idx, &format!("{prefix}    "), path, out);
        path.pop();
    }
}
