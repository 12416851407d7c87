//! Dependency kinds and the completion ledger that resolves them.
//!
//! A dependency is satisfied against the ledger, never against live task
//! objects. The ledger is seeded from earlier phases so tasks may depend on
//! work that finished in a previous scheduling run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::TaskContext;

pub const WILDCARD: char = '*';

/// Identifier shared by every task produced by one fan-out step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FanOutGroup(String);

impl FanOutGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FanOutGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Dependency {
    /// Satisfied once the named task completed.
    Exact(String),
    /// Satisfied once any completed task name starts with the prefix.
    Prefix(String),
    /// Satisfied once every member of the group completed.
    AllOf(FanOutGroup),
}

impl Dependency {
    /// Parses the string form: a trailing `*` makes a prefix wildcard.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix(WILDCARD) {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(raw.to_string()),
        }
    }

    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn all_of(group: FanOutGroup) -> Self {
        Self::AllOf(group)
    }

    /// Whether a task with this name and group is one this dependency waits on.
    pub fn matches(&self, name: &str, group: Option<&FanOutGroup>) -> bool {
        match self {
            Self::Exact(target) => target == name,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Self::AllOf(target) => group == Some(target),
        }
    }
}

impl From<&str> for Dependency {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for Dependency {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<FanOutGroup> for Dependency {
    fn from(group: FanOutGroup) -> Self {
        Self::AllOf(group)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}{WILDCARD}"),
            Self::AllOf(group) => write!(f, "all of group '{group}'"),
        }
    }
}

/// Which tasks have completed or can no longer complete (failed, or skipped
/// behind a failure), which fan-out group each belongs to, and what keys each
/// completed task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionLedger {
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    groups: BTreeMap<String, FanOutGroup>,
    outputs: BTreeMap<String, BTreeSet<String>>,
}

impl CompletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, group: Option<&FanOutGroup>) {
        if let Some(group) = group {
            self.groups.insert(name.to_string(), group.clone());
        }
    }

    pub fn mark_completed(&mut self, name: &str, output: &TaskContext) {
        self.failed.remove(name);
        self.completed.insert(name.to_string());
        self.outputs
            .insert(name.to_string(), output.keys().cloned().collect());
    }

    pub fn mark_failed(&mut self, name: &str) {
        if !self.completed.contains(name) {
            self.failed.insert(name.to_string());
        }
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.completed.contains(name)
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.failed.contains(name)
    }

    pub fn group_of(&self, name: &str) -> Option<&FanOutGroup> {
        self.groups.get(name)
    }

    pub fn members<'a>(&'a self, group: &'a FanOutGroup) -> impl Iterator<Item = &'a str> + 'a {
        self.groups
            .iter()
            .filter(move |(_, g)| *g == group)
            .map(|(name, _)| name.as_str())
    }

    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(String::as_str)
    }

    pub fn output_keys(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.outputs.get(name)
    }

    pub fn is_satisfied(&self, dependency: &Dependency) -> bool {
        match dependency {
            Dependency::Exact(name) => self.completed.contains(name),
            Dependency::Prefix(prefix) => self
                .completed
                .iter()
                .any(|name| name.starts_with(prefix.as_str())),
            Dependency::AllOf(group) => {
                let mut members = self.members(group).peekable();
                members.peek().is_some() && members.all(|name| self.completed.contains(name))
            }
        }
    }

    /// Whether some permanently failed task is one `dependency` waits on.
    pub fn has_failed_match(&self, dependency: &Dependency) -> bool {
        self.failed
            .iter()
            .any(|name| dependency.matches(name, self.group_of(name)))
    }
}
