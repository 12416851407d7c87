//! The consolidated planning result and the per-phase outputs it folds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{GateRecord, HealthReport, Phase, PhaseDiagnostic, PhaseStatus};

/// One planned scene. Fields beyond the three required ones are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub goal: String,
    pub conflict: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Scene {
    /// Parses a scene, rejecting ones with an empty goal, conflict or outcome.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let scene: Scene = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        for (field, text) in [
            ("goal", &scene.goal),
            ("conflict", &scene.conflict),
            ("outcome", &scene.outcome),
        ] {
            if text.trim().is_empty() {
                return Err(format!("scene has an empty {field}"));
            }
        }
        Ok(scene)
    }
}

/// Scenes produced for one arc by the scene expansion phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedArc {
    pub arc_id: String,
    pub scenes: Vec<Value>,
}

/// Every valid scene across `arcs`, in arc order. Invalid ones are skipped.
pub fn collect_scenes(arcs: &[ExpandedArc]) -> Vec<Scene> {
    let mut scenes = Vec::new();
    for arc in arcs {
        for (idx, raw) in arc.scenes.iter().enumerate() {
            match Scene::from_value(raw) {
                Ok(scene) => scenes.push(scene),
                Err(reason) => warn!(arc = %arc.arc_id, scene = idx, %reason, "skipping scene"),
            }
        }
    }
    scenes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlineStatus {
    InProgress,
    Completed,
    CompletedWithWarnings,
    /// A blocking gate stopped the loop before every phase ran.
    Halted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationships {
    pub arcs: Vec<Value>,
    pub timeline: Vec<Value>,
    pub themes: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlineMetadata {
    pub validation_results: Value,
    pub idea_proposals: Vec<Value>,
    pub character_plan: Value,
    pub theme_validation: Value,
    pub coverage: Value,
    pub gate_outcomes: Vec<GateRecord>,
    pub phases: Vec<PhaseDiagnostic>,
    pub health: Option<HealthReport>,
    pub halted_at: Option<Phase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub id: String,
    pub status: OutlineStatus,
    pub input: Value,
    pub entity_registry: Value,
    pub scenes: Vec<Scene>,
    pub relationships: Relationships,
    pub metadata: OutlineMetadata,
    pub updated_at: DateTime<Utc>,
}

impl Outline {
    /// In-progress outline handed to validation and idea agents.
    pub fn draft(id: &str, input: &Value, entity_registry: &Value, arcs: &[ExpandedArc]) -> Self {
        Self {
            id: id.to_string(),
            status: OutlineStatus::InProgress,
            input: input.clone(),
            entity_registry: entity_registry.clone(),
            scenes: collect_scenes(arcs),
            relationships: Relationships::default(),
            metadata: OutlineMetadata::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseDiagnostic> {
        self.metadata.phases.iter().find(|d| d.phase == phase)
    }
}

fn array(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Everything the phases produced, accumulated as the loop runs.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutputs {
    /// relationships, conflicts, themes, arcs, timeline
    pub arc_plan: Value,
    pub theme_validation: Value,
    pub coverage: Value,
    pub character_plan: Value,
    pub expanded_arcs: Vec<ExpandedArc>,
    pub refinements: Value,
    pub ideas: Value,
    pub health: Option<HealthReport>,
    pub phases: Vec<PhaseDiagnostic>,
    pub gates: Vec<GateRecord>,
    pub halted_at: Option<Phase>,
}

impl PhaseOutputs {
    pub fn diagnostic(&self, phase: Phase) -> Option<&PhaseDiagnostic> {
        self.phases.iter().find(|d| d.phase == phase)
    }

    pub fn idea_list(&self) -> Vec<Value> {
        array(&self.ideas, "ideas")
    }

    fn status(&self) -> OutlineStatus {
        if self.halted_at.is_some() {
            return OutlineStatus::Halted;
        }
        let clean_phases = self
            .phases
            .iter()
            .all(|d| d.status == PhaseStatus::Generated);
        let clean_gates = self.gates.iter().all(|g| g.outcome.passed);
        if clean_phases && clean_gates {
            OutlineStatus::Completed
        } else {
            OutlineStatus::CompletedWithWarnings
        }
    }

    /// Folds every phase output into the final outline.
    pub fn consolidate(self, id: &str, input: &Value, entity_registry: &Value) -> Outline {
        let status = self.status();
        let relationships = Relationships {
            arcs: array(&self.arc_plan, "arcs"),
            timeline: array(&self.arc_plan, "timeline"),
            themes: array(&self.arc_plan, "themes"),
        };
        let idea_proposals = self.idea_list();

        Outline {
            id: id.to_string(),
            status,
            input: input.clone(),
            entity_registry: entity_registry.clone(),
            scenes: collect_scenes(&self.expanded_arcs),
            relationships,
            metadata: OutlineMetadata {
                validation_results: self.refinements,
                idea_proposals,
                character_plan: self.character_plan,
                theme_validation: self.theme_validation,
                coverage: self.coverage,
                gate_outcomes: self.gates,
                phases: self.phases,
                health: self.health,
                halted_at: self.halted_at,
            },
            updated_at: Utc::now(),
        }
    }
}
