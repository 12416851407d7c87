//! The planning loop: a fixed sequence of phases, each one scheduler run,
//! with quality gates between them and a consolidated outline at the end.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::validator::{entity_ids, entity_reference_validator};
use crate::{
    ApprovalRequest, BoxAgent, CompletionLedger, Dependency, ExpandedArc, FanOutGroup, GateRecord,
    HealthReport, NoopHooks, Outline, OutlineStore, Phase, PhaseDiagnostic, PhaseOutputs, PlanReport,
    PlannerConfig, PlannerError, PlanningHooks, QualityGate, QualityGateRegistry, Scheduler, Task,
    TaskContext, context,
};

const OUTLINE_ARCHITECT: &str = "outline_architect";
const SCENE_TASK_PREFIX: &str = "scene_expansion_";
const SCENE_GROUP: &str = "scene_expansion";
const VALIDATION_TASKS: [&str; 4] = [
    "theme_guardian",
    "timeline_manager",
    "pacing_agent",
    "foreshadowing_agent",
];
const CHECKPOINT_LABEL: &str = "post_planning_loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Synthesis,
    OutlineArchitect,
    ThemeGuardian,
    CoverageVerifier,
    CharacterPlanner,
    SceneDynamics,
    TimelineManager,
    Pacing,
    Foreshadowing,
    IdeaGenerator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 10] = [
        Self::Synthesis,
        Self::OutlineArchitect,
        Self::ThemeGuardian,
        Self::CoverageVerifier,
        Self::CharacterPlanner,
        Self::SceneDynamics,
        Self::TimelineManager,
        Self::Pacing,
        Self::Foreshadowing,
        Self::IdeaGenerator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis",
            Self::OutlineArchitect => "outline_architect",
            Self::ThemeGuardian => "theme_guardian",
            Self::CoverageVerifier => "coverage_verifier",
            Self::CharacterPlanner => "character_planner",
            Self::SceneDynamics => "scene_dynamics",
            Self::TimelineManager => "timeline_manager",
            Self::Pacing => "pacing",
            Self::Foreshadowing => "foreshadowing",
            Self::IdeaGenerator => "idea_generator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent behind each role. One agent may fill several roles.
#[derive(Clone, Default)]
pub struct AgentRoster {
    agents: HashMap<AgentRole, BoxAgent>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: AgentRole, agent: BoxAgent) -> Self {
        self.agents.insert(role, agent);
        self
    }

    pub fn insert(&mut self, role: AgentRole, agent: BoxAgent) {
        self.agents.insert(role, agent);
    }

    pub fn get(&self, role: AgentRole) -> Result<BoxAgent, PlannerError> {
        self.agents
            .get(&role)
            .cloned()
            .ok_or_else(|| PlannerError::MissingAgent(role.to_string()))
    }

    pub fn missing(&self) -> Vec<AgentRole> {
        AgentRole::ALL
            .into_iter()
            .filter(|role| !self.agents.contains_key(role))
            .collect()
    }
}

impl fmt::Debug for AgentRoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut roles: Vec<_> = self
            .agents
            .iter()
            .map(|(role, agent)| (role.as_str(), agent.name()))
            .collect();
        roles.sort();
        f.debug_map().entries(roles).finish()
    }
}

/// Inputs fixed for the whole run.
struct Run {
    id: String,
    entities: Value,
    parameters: Value,
    known_ids: BTreeSet<String>,
}

/// What carries from one phase to the next.
#[derive(Default)]
struct RunState {
    outputs: PhaseOutputs,
    ledger: CompletionLedger,
    scene_tasks: bool,
}

pub struct PlanningLoop {
    config: PlannerConfig,
    scheduler: Scheduler,
    roster: AgentRoster,
    gates: Arc<QualityGateRegistry>,
    store: Arc<dyn OutlineStore>,
    hooks: Arc<dyn PlanningHooks>,
}

impl fmt::Debug for PlanningLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanningLoop")
            .field("config", &self.config)
            .field("roster", &self.roster)
            .field("gates", &self.gates)
            .finish_non_exhaustive()
    }
}

fn output_of(report: &PlanReport, task: &str) -> Value {
    Value::Object(report.output(task).cloned().unwrap_or_default())
}

fn list_or_empty(value: &Value, key: &str) -> Value {
    value.get(key).cloned().unwrap_or_else(|| json!([]))
}

fn arc_id(arc: &Value, idx: usize) -> String {
    match arc.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("arc_{idx}"),
    }
}

/// `id`, or the first free `{id}_{idx}`, `{id}_{idx}_{idx}`, ... when taken.
fn unique_arc_id(id: String, idx: usize, seen: &mut HashSet<String>) -> String {
    let mut candidate = id;
    while !seen.insert(candidate.clone()) {
        candidate = format!("{candidate}_{idx}");
    }
    candidate
}

fn scene_priority(idx: usize) -> i32 {
    7i32.saturating_sub(i32::try_from(idx).unwrap_or(i32::MAX))
}

fn draft_value(run: &Run, arcs: &[ExpandedArc]) -> Result<Value, PlannerError> {
    let draft = Outline::draft(&run.id, &run.parameters, &run.entities, arcs);
    Ok(serde_json::to_value(&draft)?)
}

/// A gate, the task whose output it judges (if a single one), and its input.
type GateInput = (QualityGate, Option<&'static str>, Value);

/// Gate inputs evaluated once `phase` has produced output.
fn gate_inputs(phase: Phase, outputs: &PhaseOutputs) -> Result<Vec<GateInput>, PlannerError> {
    let inputs = match phase {
        Phase::Synthesis => vec![(
            QualityGate::ArcStructure,
            Some(OUTLINE_ARCHITECT),
            outputs.arc_plan.clone(),
        )],
        Phase::CoverageVerification => vec![(
            QualityGate::EntityCoverage,
            Some("coverage_verifier"),
            outputs.coverage.clone(),
        )],
        Phase::SceneExpansion => vec![(
            QualityGate::SceneQuality,
            None,
            serde_json::to_value(&outputs.expanded_arcs)?,
        )],
        Phase::ValidationRefinement => vec![
            (
                QualityGate::TimelineConsistency,
                Some("timeline_manager"),
                outputs.refinements.clone(),
            ),
            (QualityGate::Pacing, Some("pacing_agent"), outputs.refinements.clone()),
            (
                QualityGate::ThematicCoherence,
                Some("theme_guardian"),
                outputs.refinements.clone(),
            ),
        ],
        _ => Vec::new(),
    };
    Ok(inputs)
}

fn phase_output(phase: Phase, outputs: &PhaseOutputs) -> Result<Value, PlannerError> {
    let value = match phase {
        Phase::Synthesis => outputs.arc_plan.clone(),
        Phase::EarlyThemeValidation => outputs.theme_validation.clone(),
        Phase::CoverageVerification => outputs.coverage.clone(),
        Phase::CharacterPlanning => outputs.character_plan.clone(),
        Phase::SceneExpansion => serde_json::to_value(&outputs.expanded_arcs)?,
        Phase::ValidationRefinement => json!({
            "refinements": outputs.refinements,
            "health": outputs.health,
        }),
        Phase::IdeaGeneration => outputs.ideas.clone(),
        Phase::Consolidation => Value::Null,
    };
    Ok(value)
}

impl PlanningLoop {
    pub fn new(
        config: PlannerConfig,
        roster: AgentRoster,
        gates: Arc<QualityGateRegistry>,
        store: Arc<dyn OutlineStore>,
    ) -> Result<Self, PlannerError> {
        config.validate()?;
        if let Some(role) = roster.missing().first() {
            return Err(PlannerError::MissingAgent(role.to_string()));
        }

        Ok(Self {
            scheduler: Scheduler::new(config.scheduler.clone()),
            config,
            roster,
            gates,
            store,
            hooks: Arc::new(NoopHooks),
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PlanningHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn execute_planning(
        &self,
        entities: Value,
        parameters: Value,
        run_id: Option<String>,
    ) -> Result<Outline, PlannerError> {
        self.execute_planning_with(CancellationToken::new(), entities, parameters, run_id)
            .await
    }

    /// Runs every phase in order and returns the consolidated outline.
    /// Phase failures end up in the outline metadata; only cancellation,
    /// malformed plans and a failed final write are returned as errors.
    pub async fn execute_planning_with(
        &self,
        ctx: CancellationToken,
        entities: Value,
        parameters: Value,
        run_id: Option<String>,
    ) -> Result<Outline, PlannerError> {
        let run = Run {
            id: run_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            known_ids: entity_ids(&entities),
            entities,
            parameters,
        };
        let mut state = RunState::default();

        info!(run_id = %run.id, known_entities = run.known_ids.len(), "starting planning loop");

        for phase in Phase::ALL.into_iter().filter(|p| *p != Phase::Consolidation) {
            if ctx.is_cancelled() {
                return Err(PlannerError::Cancelled(format!("planning cancelled before {phase}")));
            }
            if let Some(halted) = state.outputs.halted_at {
                let diagnostic =
                    PhaseDiagnostic::not_run(phase, format!("halted by a blocking gate after {halted}"));
                state.outputs.phases.push(diagnostic);
                continue;
            }

            info!(%phase, "starting phase");
            let diagnostic = match phase {
                Phase::Synthesis => self.synthesis(&ctx, &run, &mut state).await?,
                Phase::EarlyThemeValidation => self.early_theme_validation(&ctx, &run, &mut state).await?,
                Phase::CoverageVerification => self.coverage_verification(&ctx, &run, &mut state).await?,
                Phase::CharacterPlanning => self.character_planning(&ctx, &run, &mut state).await?,
                Phase::SceneExpansion => self.scene_expansion(&ctx, &run, &mut state).await?,
                Phase::ValidationRefinement => self.validation_refinement(&ctx, &run, &mut state).await?,
                Phase::IdeaGeneration => self.idea_generation(&ctx, &run, &mut state).await?,
                Phase::Consolidation => continue,
            };
            self.finish_phase(&run, &mut state.outputs, diagnostic).await?;
        }

        self.consolidate(&run, state.outputs).await
    }

    async fn run_tasks(
        &self,
        ctx: &CancellationToken,
        phase: Phase,
        tasks: Vec<Task>,
        state: &mut RunState,
    ) -> Result<PlanReport, PlannerError> {
        let report = self
            .scheduler
            .execute_plan_with(ctx.clone(), tasks, &state.ledger)
            .await?;
        debug!(%phase, order = %report.execution_order(), "phase execution order");
        state.ledger = report.ledger.clone();
        Ok(report)
    }

    async fn synthesis(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let tasks = vec![
            Task::new("synthesis", self.roster.get(AgentRole::Synthesis)?)
                .with_context(context([
                    ("entity_registry", run.entities.clone()),
                    ("novel_input", run.parameters.clone()),
                ]))
                .priority(10),
            Task::new(OUTLINE_ARCHITECT, self.roster.get(AgentRole::OutlineArchitect)?)
                .with_context(context([("entity_registry", run.entities.clone())]))
                .depends_on("synthesis")
                .expects(["relationships", "themes"])
                .with_validator(entity_reference_validator(run.known_ids.clone()))
                .priority(9),
        ];

        let report = self.run_tasks(ctx, Phase::Synthesis, tasks, state).await?;
        let synthesis = output_of(&report, "synthesis");
        let architect = output_of(&report, OUTLINE_ARCHITECT);
        state.outputs.arc_plan = json!({
            "relationships": list_or_empty(&synthesis, "relationships"),
            "conflicts": list_or_empty(&synthesis, "conflicts"),
            "themes": list_or_empty(&synthesis, "themes"),
            "arcs": list_or_empty(&architect, "arcs"),
            "timeline": list_or_empty(&architect, "timeline"),
        });
        Ok(PhaseDiagnostic::from_report(Phase::Synthesis, &report))
    }

    async fn early_theme_validation(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let arc_plan = &state.outputs.arc_plan;
        let relationships = json!({
            "themes": list_or_empty(arc_plan, "themes"),
            "relationships": list_or_empty(arc_plan, "relationships"),
        });
        let tasks = vec![
            Task::new("theme_guardian_early", self.roster.get(AgentRole::ThemeGuardian)?)
                .with_context(context([
                    ("relationships", relationships),
                    ("arc_plan", arc_plan.clone()),
                    ("entity_registry", run.entities.clone()),
                ]))
                .depends_on(OUTLINE_ARCHITECT)
                .priority(8),
        ];

        let report = self.run_tasks(ctx, Phase::EarlyThemeValidation, tasks, state).await?;
        state.outputs.theme_validation = output_of(&report, "theme_guardian_early");
        Ok(PhaseDiagnostic::from_report(Phase::EarlyThemeValidation, &report))
    }

    async fn coverage_verification(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let tasks = vec![
            Task::new("coverage_verifier", self.roster.get(AgentRole::CoverageVerifier)?)
                .with_context(context([
                    ("entity_registry", run.entities.clone()),
                    ("arc_plan", state.outputs.arc_plan.clone()),
                ]))
                .priority(8),
        ];

        let report = self.run_tasks(ctx, Phase::CoverageVerification, tasks, state).await?;
        state.outputs.coverage = output_of(&report, "coverage_verifier");
        Ok(PhaseDiagnostic::from_report(Phase::CoverageVerification, &report))
    }

    async fn character_planning(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let tasks = vec![
            Task::new("character_planner", self.roster.get(AgentRole::CharacterPlanner)?)
                .with_context(context([
                    ("entity_registry", run.entities.clone()),
                    ("arc_plan", state.outputs.arc_plan.clone()),
                ]))
                .depends_on(OUTLINE_ARCHITECT)
                .priority(7),
        ];

        let report = self.run_tasks(ctx, Phase::CharacterPlanning, tasks, state).await?;
        state.outputs.character_plan = output_of(&report, "character_planner");
        Ok(PhaseDiagnostic::from_report(Phase::CharacterPlanning, &report))
    }

    async fn scene_expansion(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let arcs = state
            .outputs
            .arc_plan
            .get("arcs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if arcs.is_empty() {
            return Ok(if state.ledger.is_completed(OUTLINE_ARCHITECT) {
                warn!("arc plan has no arcs to expand");
                let mut diagnostic = PhaseDiagnostic::generated(Phase::SceneExpansion);
                diagnostic.note = Some("no arcs planned".to_string());
                diagnostic
            } else {
                PhaseDiagnostic::missing_upstream(
                    Phase::SceneExpansion,
                    format!("{OUTLINE_ARCHITECT} did not complete"),
                )
            });
        }

        let agent = self.roster.get(AgentRole::SceneDynamics)?;
        let group = FanOutGroup::new(SCENE_GROUP);
        let mut seen = HashSet::new();
        let mut arc_ids = Vec::with_capacity(arcs.len());
        let mut tasks = Vec::with_capacity(arcs.len());

        for (idx, arc) in arcs.into_iter().enumerate() {
            let id = unique_arc_id(arc_id(&arc, idx), idx, &mut seen);
            tasks.push(
                Task::new(format!("{SCENE_TASK_PREFIX}{id}"), Arc::clone(&agent))
                    .with_context(context([
                        ("arc", arc),
                        ("entity_registry", run.entities.clone()),
                        ("novel_input", run.parameters.clone()),
                    ]))
                    .depends_on(OUTLINE_ARCHITECT)
                    .in_group(group.clone())
                    .with_validator(entity_reference_validator(run.known_ids.clone()))
                    .priority(scene_priority(idx)),
            );
            arc_ids.push(id);
        }

        let report = self.run_tasks(ctx, Phase::SceneExpansion, tasks, state).await?;
        state.scene_tasks = true;
        state.outputs.expanded_arcs = arc_ids
            .into_iter()
            .filter_map(|id| {
                let output = report.output(&format!("{SCENE_TASK_PREFIX}{id}"))?;
                let scenes = output
                    .get("scenes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Some(ExpandedArc { arc_id: id, scenes })
            })
            .collect();
        Ok(PhaseDiagnostic::from_report(Phase::SceneExpansion, &report))
    }

    async fn validation_refinement(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let outline = draft_value(run, &state.outputs.expanded_arcs)?;
        let arc_plan = state.outputs.arc_plan.clone();
        let relationships = match arc_plan.get("relationships") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };
        let genre = run
            .parameters
            .get("genre")
            .cloned()
            .unwrap_or_else(|| json!("other"));

        // Scene-level validators wait for the whole fan-out when there was one.
        let after_scenes = if state.scene_tasks {
            Dependency::all_of(FanOutGroup::new(SCENE_GROUP))
        } else {
            Dependency::exact(OUTLINE_ARCHITECT)
        };

        // Theme and timeline findings are judged by the quality gates; these
        // tasks carry no result validator.
        let tasks = vec![
            Task::new("theme_guardian", self.roster.get(AgentRole::ThemeGuardian)?)
                .with_context(context([
                    ("outline", outline.clone()),
                    ("relationships", relationships),
                    ("arc_plan", arc_plan.clone()),
                ]))
                .depends_on(OUTLINE_ARCHITECT)
                .priority(6),
            Task::new("timeline_manager", self.roster.get(AgentRole::TimelineManager)?)
                .with_context(context([
                    ("outline", outline.clone()),
                    ("entity_registry", run.entities.clone()),
                ]))
                .depends_on(after_scenes.clone())
                .priority(5),
            Task::new("pacing_agent", self.roster.get(AgentRole::Pacing)?)
                .with_context(context([
                    ("outline", outline.clone()),
                    ("arc_plan", arc_plan.clone()),
                    ("genre", genre),
                ]))
                .depends_on(after_scenes.clone())
                .priority(4),
            Task::new("foreshadowing_agent", self.roster.get(AgentRole::Foreshadowing)?)
                .with_context(context([("outline", outline), ("arc_plan", arc_plan)]))
                .depends_on(after_scenes)
                .priority(3),
        ];

        let report = self.run_tasks(ctx, Phase::ValidationRefinement, tasks, state).await?;
        state.outputs.refinements = json!({
            "theme_analysis": output_of(&report, "theme_guardian"),
            "timeline_validation": output_of(&report, "timeline_manager"),
            "pacing_analysis": output_of(&report, "pacing_agent"),
            "foreshadowing_analysis": output_of(&report, "foreshadowing_agent"),
        });

        let health = HealthReport::from_refinements(&run.id, &state.outputs.refinements);
        if !health.alerts.is_empty() {
            info!(alerts = health.alerts.len(), healthy = health.healthy, "health report");
        }
        if health.escalation_required {
            warn!(escalations = health.escalations().count(), "health report requires escalation");
        }
        state.outputs.health = Some(health);

        Ok(PhaseDiagnostic::from_report(Phase::ValidationRefinement, &report))
    }

    async fn idea_generation(
        &self,
        ctx: &CancellationToken,
        run: &Run,
        state: &mut RunState,
    ) -> Result<PhaseDiagnostic, PlannerError> {
        let tasks = vec![
            Task::new("idea_generator", self.roster.get(AgentRole::IdeaGenerator)?)
                .with_context(context([
                    ("outline", draft_value(run, &state.outputs.expanded_arcs)?),
                    ("entity_registry", run.entities.clone()),
                    ("arc_plan", state.outputs.arc_plan.clone()),
                    ("validation_results", state.outputs.refinements.clone()),
                    ("user_constraints", Value::Object(TaskContext::new())),
                ]))
                .depends_on_all(VALIDATION_TASKS)
                .priority(2),
        ];

        let report = self.run_tasks(ctx, Phase::IdeaGeneration, tasks, state).await?;
        state.outputs.ideas = output_of(&report, "idea_generator");
        Ok(PhaseDiagnostic::from_report(Phase::IdeaGeneration, &report))
    }

    async fn finish_phase(
        &self,
        run: &Run,
        outputs: &mut PhaseOutputs,
        mut diagnostic: PhaseDiagnostic,
    ) -> Result<(), PlannerError> {
        let phase = diagnostic.phase;

        if diagnostic.produced_output() {
            for (gate, source, data) in gate_inputs(phase, outputs)? {
                let missing = source.filter(|task| !diagnostic.completed.iter().any(|c| c == task));
                let outcome = match missing {
                    Some(task) => self.gates.unevaluated(gate, format!("{task} did not complete")),
                    None => self.gates.evaluate(gate, &data, Some(&run.entities)),
                };
                let record = GateRecord {
                    phase,
                    outcome: outcome.clone(),
                };
                if let Err(err) = self.hooks.on_gate_evaluated(&run.id, &record).await {
                    warn!(%phase, %gate, error = %err, "gate hook failed");
                }
                if outcome.halts() && outputs.halted_at.is_none() {
                    warn!(%phase, %gate, message = %outcome.message, "blocking gate failed, halting");
                    outputs.halted_at = Some(phase);
                }
                outputs.gates.push(record);
                diagnostic.record_gate(outcome);
            }
        } else {
            debug!(%phase, "phase produced no output, skipping gates");
        }

        info!(%phase, status = ?diagnostic.status, "phase finished");
        if let Err(err) = self.hooks.on_phase_complete(&run.id, &diagnostic).await {
            warn!(%phase, error = %err, "phase hook failed");
        }
        if self.config.persistence.persist_phase_outputs {
            self.persist_checkpoint(run, outputs, &diagnostic).await?;
        }
        outputs.phases.push(diagnostic);
        Ok(())
    }

    async fn persist_checkpoint(
        &self,
        run: &Run,
        outputs: &PhaseOutputs,
        diagnostic: &PhaseDiagnostic,
    ) -> Result<(), PlannerError> {
        let record = json!({
            "id": format!("{}:{}", run.id, diagnostic.phase),
            "run_id": run.id,
            "phase": diagnostic.phase,
            "status": diagnostic.status,
            "diagnostic": diagnostic,
            "output": phase_output(diagnostic.phase, outputs)?,
            "recorded_at": Utc::now(),
        });
        let collection = &self.config.persistence.checkpoint_collection;
        if let Err(err) = self.store.write(collection, record).await {
            warn!(phase = %diagnostic.phase, error = %err, "phase checkpoint write failed");
        }
        Ok(())
    }

    async fn consolidate(&self, run: &Run, mut outputs: PhaseOutputs) -> Result<Outline, PlannerError> {
        info!(phase = %Phase::Consolidation, "starting phase");
        outputs
            .phases
            .push(PhaseDiagnostic::generated(Phase::Consolidation));
        let ideas = outputs.idea_list();
        let outline = outputs.consolidate(&run.id, &run.parameters, &run.entities);

        self.store
            .write(
                &self.config.persistence.outline_collection,
                serde_json::to_value(&outline)?,
            )
            .await?;

        if let Err(err) = self.hooks.checkpoint(CHECKPOINT_LABEL, &outline).await {
            warn!(error = %err, "version checkpoint failed");
        }

        for request in ideas
            .iter()
            .filter_map(|idea| ApprovalRequest::from_idea(&run.id, AgentRole::IdeaGenerator.as_str(), idea))
        {
            if let Err(err) = self.hooks.request_approval(request).await {
                warn!(error = %err, "approval request failed");
            }
        }

        info!(
            run_id = %run.id,
            status = ?outline.status,
            scenes = outline.scenes.len(),
            "planning complete"
        );
        Ok(outline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Agent, AgentOutput, MemoryStore};
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl Agent for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn execute(
            &self,
            _ctx: CancellationToken,
            _context: &TaskContext,
        ) -> Result<AgentOutput, PlannerError> {
            Ok(AgentOutput::success(TaskContext::new()))
        }
    }

    #[test]
    fn arc_ids_fall_back_to_position() {
        assert_eq!(arc_id(&json!({"id": "rise"}), 0), "rise");
        assert_eq!(arc_id(&json!({"id": 4}), 0), "4");
        assert_eq!(arc_id(&json!({"title": "x"}), 2), "arc_2");
        assert_eq!(scene_priority(0), 7);
        assert_eq!(scene_priority(9), -2);
        assert_eq!(scene_priority(usize::MAX), 7 - i32::MAX);
    }

    #[test]
    fn suffixed_arc_ids_never_collide() {
        let arcs = [json!({"id": "a_2"}), json!({"id": "a"}), json!({"id": "a"})];
        let mut seen = HashSet::new();
        let ids: Vec<String> = arcs
            .iter()
            .enumerate()
            .map(|(idx, arc)| unique_arc_id(arc_id(arc, idx), idx, &mut seen))
            .collect();
        assert_eq!(ids, vec!["a_2", "a", "a_2_2"]);
    }

    #[test]
    fn roster_reports_missing_roles() {
        let agent: BoxAgent = Arc::new(Silent);
        let roster = AgentRoster::new()
            .with(AgentRole::Synthesis, Arc::clone(&agent))
            .with(AgentRole::Pacing, agent);
        let missing = roster.missing();
        assert_eq!(missing.len(), AgentRole::ALL.len() - 2);
        assert!(!missing.contains(&AgentRole::Pacing));
        assert!(roster.get(AgentRole::Synthesis).is_ok());
    }

    #[test]
    fn construction_requires_every_role() {
        let roster = AgentRoster::new().with(AgentRole::Synthesis, Arc::new(Silent));
        let err = PlanningLoop::new(
            PlannerConfig::default(),
            roster,
            Arc::new(QualityGateRegistry::default()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PlannerError::MissingAgent(role) if role == "outline_architect"));
    }
}
