//! Quality gates: named, pure checks over a phase's output.
//!
//! The registry is assembled once with [`QualityGateRegistry::builder`] (or
//! [`QualityGateRegistry::with_defaults`]) and is read-only afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::GateConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGate {
    EntityCoverage,
    ArcStructure,
    SceneQuality,
    TimelineConsistency,
    Pacing,
    ThematicCoherence,
}

impl QualityGate {
    pub const ALL: [QualityGate; 6] = [
        Self::EntityCoverage,
        Self::ArcStructure,
        Self::SceneQuality,
        Self::TimelineConsistency,
        Self::Pacing,
        Self::ThematicCoherence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntityCoverage => "entity_coverage",
            Self::ArcStructure => "arc_structure",
            Self::SceneQuality => "scene_quality",
            Self::TimelineConsistency => "timeline_consistency",
            Self::Pacing => "pacing",
            Self::ThematicCoherence => "thematic_coherence",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|gate| gate.as_str() == name)
    }
}

impl fmt::Display for QualityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub message: String,
}

impl GateResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Whether a failing gate only warns or stops further phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    #[default]
    Advisory,
    Blocking,
}

/// `(phase output, optional reference data) -> verdict`. Must not mutate or
/// depend on anything but its arguments.
pub type GateValidator = Arc<dyn Fn(&Value, Option<&Value>) -> GateResult + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: QualityGate,
    pub passed: bool,
    pub message: String,
    pub policy: GatePolicy,
    /// False when no validator was registered and the gate passed by default.
    pub registered: bool,
}

impl GateOutcome {
    pub fn halts(&self) -> bool {
        !self.passed && self.policy == GatePolicy::Blocking
    }
}

#[derive(Clone, Default)]
pub struct QualityGateRegistry {
    validators: HashMap<QualityGate, GateValidator>,
    policies: HashMap<QualityGate, GatePolicy>,
}

#[derive(Default)]
pub struct QualityGateRegistryBuilder {
    registry: QualityGateRegistry,
}

impl QualityGateRegistryBuilder {
    pub fn register<F>(mut self, gate: QualityGate, validator: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> GateResult + Send + Sync + 'static,
    {
        self.registry.validators.insert(gate, Arc::new(validator));
        self
    }

    pub fn policy(mut self, gate: QualityGate, policy: GatePolicy) -> Self {
        self.registry.policies.insert(gate, policy);
        self
    }

    pub fn build(self) -> QualityGateRegistry {
        self.registry
    }
}

impl QualityGateRegistry {
    pub fn builder() -> QualityGateRegistryBuilder {
        QualityGateRegistryBuilder::default()
    }

    /// The six stock gates, with policies taken from `config`.
    pub fn with_defaults(config: &GateConfig) -> Self {
        let threshold = config.coverage_threshold;
        let mut builder = Self::builder()
            .register(QualityGate::EntityCoverage, move |data, _| {
                entity_coverage(data, threshold)
            })
            .register(QualityGate::ArcStructure, |data, _| arc_structure(data))
            .register(QualityGate::SceneQuality, |data, _| scene_quality(data))
            .register(QualityGate::TimelineConsistency, |data, _| {
                timeline_consistency(data)
            })
            .register(QualityGate::Pacing, |data, _| pacing(data))
            .register(QualityGate::ThematicCoherence, |data, _| {
                thematic_coherence(data)
            });

        for (name, policy) in &config.policies {
            match QualityGate::from_name(name) {
                Some(gate) => builder = builder.policy(gate, *policy),
                None => warn!(gate = %name, "ignoring policy for unknown gate"),
            }
        }
        builder.build()
    }

    pub fn is_registered(&self, gate: QualityGate) -> bool {
        self.validators.contains_key(&gate)
    }

    pub fn policy(&self, gate: QualityGate) -> GatePolicy {
        self.policies.get(&gate).copied().unwrap_or_default()
    }

    /// Runs `gate` over `data`. Unregistered gates pass.
    pub fn evaluate(&self, gate: QualityGate, data: &Value, reference: Option<&Value>) -> GateOutcome {
        let policy = self.policy(gate);
        let Some(validator) = self.validators.get(&gate) else {
            return GateOutcome {
                gate,
                passed: true,
                message: "No validator registered".to_string(),
                policy,
                registered: false,
            };
        };

        let result = validator(data, reference);
        if result.passed {
            info!(%gate, message = %result.message, "quality gate passed");
        } else {
            warn!(%gate, ?policy, message = %result.message, "quality gate failed");
        }
        GateOutcome {
            gate,
            passed: result.passed,
            message: result.message,
            policy,
            registered: true,
        }
    }

    /// Outcome for a gate whose input was never produced. Counts as failed.
    pub fn unevaluated(&self, gate: QualityGate, reason: impl Into<String>) -> GateOutcome {
        let reason = reason.into();
        warn!(%gate, %reason, "quality gate not evaluated");
        GateOutcome {
            gate,
            passed: false,
            message: format!("Not evaluated: {reason}"),
            policy: self.policy(gate),
            registered: self.is_registered(gate),
        }
    }
}

impl fmt::Debug for QualityGateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: BTreeSet<_> = self.validators.keys().collect();
        f.debug_struct("QualityGateRegistry")
            .field("registered", &registered)
            .field("policies", &self.policies)
            .finish()
    }
}

fn list_len(value: Option<&Value>) -> usize {
    value.and_then(Value::as_array).map_or(0, Vec::len)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Number(_)) => true,
    }
}

/// Reads `key` from `data`, falling back to `data` itself, for gates that
/// accept either a wrapped analysis or the bare analysis object.
fn section<'a>(data: &'a Value, key: &str) -> &'a Value {
    data.get(key).unwrap_or(data)
}

fn entity_coverage(data: &Value, threshold: f64) -> GateResult {
    let pct = data
        .get("coverage_percentage")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    GateResult {
        passed: pct >= threshold,
        message: format!("Coverage {pct}% (threshold {threshold}%)"),
    }
}

/// An arc or timeline entry's id: a bare string, or an object's `arc_id`/`id`.
fn entry_id(entry: &Value) -> Option<&str> {
    match entry {
        Value::String(id) => Some(id),
        Value::Object(map) => map
            .get("arc_id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str),
        _ => None,
    }
}

fn arc_structure(data: &Value) -> GateResult {
    let empty = Vec::new();
    let arcs = data.get("arcs").and_then(Value::as_array).unwrap_or(&empty);
    let timeline = data.get("timeline").and_then(Value::as_array).unwrap_or(&empty);

    if arcs.is_empty() {
        return GateResult::fail("Arc structure invalid: no arcs");
    }
    if timeline.is_empty() {
        return GateResult::pass("Arcs non-empty and timeline consistent");
    }

    let arc_ids: Option<BTreeSet<&str>> = arcs.iter().map(entry_id).collect();
    let timeline_ids: Option<Vec<&str>> = timeline.iter().map(entry_id).collect();
    let consistent = match (arc_ids, timeline_ids) {
        (Some(arc_ids), Some(timeline_ids)) => {
            timeline_ids.len() == arc_ids.len()
                && timeline_ids.iter().collect::<BTreeSet<_>>().len() == arc_ids.len()
                && timeline_ids.iter().all(|id| arc_ids.contains(id))
        }
        _ => timeline.len() == arcs.len(),
    };

    if consistent {
        GateResult::pass("Arcs non-empty and timeline consistent")
    } else {
        GateResult::fail(format!(
            "Arc structure invalid: timeline lists {} entries for {} arcs",
            timeline.len(),
            arcs.len()
        ))
    }
}

/// Flattens either a list of arc expansions (or bare scenes) or an object
/// carrying `expanded_arcs` into one list of scenes.
pub(crate) fn collect_scenes(data: &Value) -> Vec<&Value> {
    let mut scenes = Vec::new();
    match data {
        Value::Array(items) => {
            for item in items {
                match item.get("scenes").and_then(Value::as_array) {
                    Some(nested) => scenes.extend(nested),
                    None => scenes.push(item),
                }
            }
        }
        Value::Object(map) => {
            if let Some(arcs) = map.get("expanded_arcs").and_then(Value::as_array) {
                for arc in arcs {
                    if let Some(nested) = arc.get("scenes").and_then(Value::as_array) {
                        scenes.extend(nested);
                    }
                }
            }
        }
        _ => {}
    }
    scenes
}

fn scene_quality(data: &Value) -> GateResult {
    let scenes = collect_scenes(data);
    let incomplete = scenes
        .iter()
        .filter(|scene| {
            ["goal", "conflict", "outcome"]
                .iter()
                .any(|field| !is_truthy(scene.get(field)))
        })
        .count();

    if incomplete == 0 {
        GateResult::pass("Scene quality OK")
    } else {
        GateResult::fail(format!(
            "{incomplete} of {} scene(s) missing goal/conflict/outcome",
            scenes.len()
        ))
    }
}

fn timeline_consistency(data: &Value) -> GateResult {
    let validation = section(data, "timeline_validation");
    let violations = list_len(validation.get("violations"));
    let flagged_invalid = validation.get("is_valid").and_then(Value::as_bool) == Some(false);
    if violations > 0 {
        GateResult::fail(format!("{violations} timeline violation(s)"))
    } else if flagged_invalid {
        GateResult::fail("Timeline marked invalid")
    } else {
        GateResult::pass("OK")
    }
}

fn pacing(data: &Value) -> GateResult {
    let analysis = section(data, "pacing_analysis");
    let critical = list_len(analysis.get("monotony_flags")) + list_len(analysis.get("rushed_sequences"));
    if critical == 0 {
        GateResult::pass("Pacing OK")
    } else {
        GateResult::fail(format!("{critical} pacing issue(s)"))
    }
}

fn thematic_coherence(data: &Value) -> GateResult {
    let inconsistencies = list_len(section(data, "theme_analysis").get("thematic_inconsistencies"));
    if inconsistencies == 0 {
        GateResult::pass("Thematic coherence OK")
    } else {
        GateResult::fail(format!("{inconsistencies} inconsistency(ies)"))
    }
}
