//! Result validator that rejects entity references the run cannot resolve.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use crate::{AgentOutput, ResultValidator, Validation};

/// Output keys whose values name entities.
const REFERENCE_KEYS: [&str; 9] = [
    "character_id",
    "character_ids",
    "location_id",
    "location_ids",
    "scene_concept_id",
    "scene_concept_ids",
    "pov_character",
    "characters_present",
    "entity_id",
];

const REPORTED_IDS: usize = 5;

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b(?:char_id|loc_id|character_id|location_id)\d+\b")
            .expect("PLACEHOLDER_REGEX is valid")
    })
}

/// Every `id` string found anywhere in an entity universe document.
pub fn entity_ids(universe: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_ids(universe, &mut ids);
    ids
}

fn collect_ids(value: &Value, ids: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                ids.insert(id.to_string());
            }
            map.values().for_each(|v| collect_ids(v, ids));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, ids)),
        _ => {}
    }
}

fn collect_references<'a>(value: &'a Value, refs: &mut BTreeSet<&'a str>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if REFERENCE_KEYS.contains(&key.as_str()) {
                    match v {
                        Value::String(id) => {
                            refs.insert(id);
                        }
                        Value::Array(items) => {
                            refs.extend(items.iter().filter_map(Value::as_str));
                        }
                        _ => {}
                    }
                }
                collect_references(v, refs);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, refs)),
        _ => {}
    }
}

fn collect_placeholders(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            found.extend(placeholder_regex().find_iter(text).map(|m| m.as_str().to_string()));
        }
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, found)),
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, found)),
        _ => {}
    }
}

/// Placeholder ids anywhere in `output`, plus referenced ids missing from
/// `known`, sorted.
pub fn find_invalid_references(output: &Value, known: &BTreeSet<String>) -> Vec<String> {
    let mut invalid = BTreeSet::new();
    collect_placeholders(output, &mut invalid);

    let mut refs = BTreeSet::new();
    collect_references(output, &mut refs);
    invalid.extend(
        refs.into_iter()
            .filter(|id| !known.contains(*id))
            .map(str::to_string),
    );
    invalid.into_iter().collect()
}

/// Rejects outputs that reference unknown or placeholder entity ids. With no
/// known ids there is nothing to check against and every output passes.
pub fn entity_reference_validator(known: BTreeSet<String>) -> ResultValidator {
    Arc::new(move |result: &AgentOutput| {
        if known.is_empty() {
            return Validation::ok();
        }
        let output = Value::Object(result.output.clone());
        let invalid = find_invalid_references(&output, &known);
        if invalid.is_empty() {
            return Validation::ok();
        }
        let shown: Vec<&str> = invalid.iter().take(REPORTED_IDS).map(String::as_str).collect();
        Validation::invalid(format!(
            "Invalid or placeholder entity IDs found: {}. Must use actual entity IDs from registry.",
            shown.join(", ")
        ))
    })
}
