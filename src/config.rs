//! Planner configuration, loaded from TOML.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! [scheduler]
//! max_global_iterations = 5
//! max_concurrency = 1
//! task_timeout_secs = 120
//!
//! [scheduler.retry]
//! interval_ms = 500
//!
//! [quality_gates]
//! coverage_threshold = 70.0
//! policies = { arc_structure = "blocking" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{GatePolicy, PlannerError, QualityGate, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub scheduler: SchedulerConfig,
    pub quality_gates: GateConfig,
    pub persistence: PersistenceConfig,
}

/// [scheduler]: pass limit, ready-batch concurrency, per-attempt deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_global_iterations: usize,
    /// 1 runs ready tasks one at a time.
    pub max_concurrency: usize,
    pub task_timeout_secs: Option<u64>,
    pub detect_cycles: bool,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_global_iterations: 5,
            max_concurrency: 1,
            task_timeout_secs: None,
            detect_cycles: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// [quality_gates]: coverage threshold (percent) and per-gate policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub coverage_threshold: f64,
    pub policies: BTreeMap<String, GatePolicy>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 70.0,
            policies: BTreeMap::new(),
        }
    }
}

/// [persistence]: collection names handed to the outline store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub outline_collection: String,
    pub checkpoint_collection: String,
    pub persist_phase_outputs: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            outline_collection: "novel-outlines".to_string(),
            checkpoint_collection: "planning-checkpoints".to_string(),
            persist_phase_outputs: true,
        }
    }
}

impl PlannerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PlannerError> {
        let config: Self = toml::from_str(raw).map_err(|e| PlannerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlannerError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.scheduler.max_global_iterations == 0 {
            return Err(PlannerError::Config(
                "scheduler.max_global_iterations must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(PlannerError::Config(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(unknown) = self
            .quality_gates
            .policies
            .keys()
            .find(|name| QualityGate::from_name(name).is_none())
        {
            return Err(PlannerError::Config(format!(
                "quality_gates.policies names unknown gate '{unknown}'"
            )));
        }
        let threshold = self.quality_gates.coverage_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(PlannerError::Config(format!(
                "quality_gates.coverage_threshold must be within 0..=100, got {threshold}"
            )));
        }
        Ok(())
    }
}
