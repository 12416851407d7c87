use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storyloom::*;
use tokio_util::sync::CancellationToken;

/// Stand-in for a model-backed agent: waits a moment and returns a canned
/// output for its role.
struct CannedAgent {
    name: String,
    output: Value,
}

impl CannedAgent {
    fn boxed(name: &str, output: Value) -> BoxAgent {
        Arc::new(Self {
            name: name.to_string(),
            output,
        })
    }
}

#[async_trait]
impl Agent for CannedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        _context: &TaskContext,
    ) -> Result<AgentOutput, PlannerError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(PlannerError::Cancelled(self.name.clone())),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                let output = match &self.output {
                    Value::Object(map) => map.clone(),
                    _ => TaskContext::new(),
                };
                Ok(AgentOutput::success(output))
            }
        }
    }
}

fn roster() -> AgentRoster {
    let canned = [
        (
            AgentRole::Synthesis,
            json!({"relationships": [{"from": "c-wren", "to": "c-hale", "kind": "rivals"}], "conflicts": ["inheritance"], "themes": ["debt"]}),
        ),
        (
            AgentRole::OutlineArchitect,
            json!({
                "arcs": [{"id": "claim", "character_ids": ["c-wren"]}, {"id": "reckoning", "character_ids": ["c-hale"]}],
                "timeline": [{"arc_id": "claim"}, {"arc_id": "reckoning"}]
            }),
        ),
        (AgentRole::ThemeGuardian, json!({"thematic_inconsistencies": []})),
        (AgentRole::CoverageVerifier, json!({"coverage_percentage": 100.0})),
        (AgentRole::CharacterPlanner, json!({"character_arcs": {"c-wren": "learns to let go"}})),
        (
            AgentRole::SceneDynamics,
            json!({"scenes": [
                {"title": "The Will", "goal": "hear the will", "conflict": "a second heir", "outcome": "feud begins", "pov_character": "c-wren"},
                {"title": "Low Tide", "goal": "find the deed", "conflict": "the tide", "outcome": "deed lost", "location_id": "l-quay"}
            ]}),
        ),
        (AgentRole::TimelineManager, json!({"is_valid": true, "violations": []})),
        (AgentRole::Pacing, json!({"monotony_flags": [], "rushed_sequences": []})),
        (AgentRole::Foreshadowing, json!({"unresolved_promises": ["the sealed letter"]})),
        (
            AgentRole::IdeaGenerator,
            json!({"ideas": [{"description": "the deed was forged", "requires_approval": true, "benefit": "high"}]}),
        ),
    ];

    canned
        .into_iter()
        .fold(AgentRoster::new(), |roster, (role, output)| {
            roster.with(role, CannedAgent::boxed(role.as_str(), output))
        })
}

async fn scheduler_demo() -> Result<(), PlannerError> {
    let agent = CannedAgent::boxed("worker", json!({"status": "completed"}));
    let tasks = vec![
        Task::new("outline", Arc::clone(&agent)).priority(10),
        Task::new("scene_1", Arc::clone(&agent)).depends_on("outline").priority(5),
        Task::new("scene_2", Arc::clone(&agent)).depends_on("outline").priority(4),
        Task::new("review", Arc::clone(&agent)).depends_on("scene_*"),
        Task::new("ideas", agent).depends_on_all(["outline", "review"]),
    ];

    println!("=== Task graph ===");
    print!("{}", render_graph(&tasks));

    let scheduler = Scheduler::new(SchedulerConfig {
        max_concurrency: 2,
        ..SchedulerConfig::default()
    });
    let start = Instant::now();
    let report = scheduler.execute_plan(CancellationToken::new(), tasks).await?;

    println!("=== Plan finished in {:?} ===", start.elapsed());
    println!("Status: {:?}", report.status());
    println!("Execution order: {}", report.execution_order());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    scheduler_demo().await?;

    let config = PlannerConfig::from_toml_str(
        r#"
        [scheduler]
        max_concurrency = 2

        [quality_gates]
        policies = { arc_structure = "blocking" }
        "#,
    )?;
    let store = Arc::new(MemoryStore::new());
    let gates = Arc::new(QualityGateRegistry::with_defaults(&config.quality_gates));
    let planner = PlanningLoop::new(config, roster(), gates, store.clone())?;

    let entities = json!({
        "characters": [{"id": "c-wren", "name": "Wren"}, {"id": "c-hale", "name": "Hale"}],
        "locations": [{"id": "l-quay", "name": "The Quay"}]
    });
    let parameters = json!({"title": "Salt and Paper", "genre": "literary"});

    println!("=== Planning ===");
    let start = Instant::now();
    let outline = planner.execute_planning(entities, parameters, None).await?;

    println!("=== Planning finished in {:?} ===", start.elapsed());
    println!("Outline {} is {:?}", outline.id, outline.status);
    for diagnostic in &outline.metadata.phases {
        println!("  {:<24} {:?}", diagnostic.phase.as_str(), diagnostic.status);
    }
    for (idx, scene) in outline.scenes.iter().enumerate() {
        let title = scene.title.as_deref().unwrap_or("untitled");
        println!("{}. {title}: {} / {} / {}", idx + 1, scene.goal, scene.conflict, scene.outcome);
    }
    println!(
        "Checkpoints written: {}",
        store.records("planning-checkpoints").await.len()
    );

    Ok(())
}
