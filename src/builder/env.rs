//! The environment threaded through a build.
//!
//! Handlers never touch the orchestrator's process environment. Each step
//! receives the current [`Environment`]; changes a plugin asks for (through
//! `env` messages or `build.environment` mutations) are applied to it and
//! seen by every later step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::mutable::Mutation;

/// Changes between two environment snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDiff {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl EnvDiff {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// Environment variables visible to handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Snapshot the orchestrator's own environment.
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) {
        self.vars.remove(name);
    }

    /// All variables, sorted by name.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// What changed from `self` to `after`.
    pub fn diff(&self, after: &Environment) -> EnvDiff {
        let mut diff = EnvDiff::default();
        for (name, value) in &after.vars {
            if self.vars.get(name) != Some(value) {
                diff.set.insert(name.clone(), value.clone());
            }
        }
        for name in self.vars.keys() {
            if !after.vars.contains_key(name) {
                diff.unset.push(name.clone());
            }
        }
        diff
    }

    /// Apply a diff. Unsets are applied after sets.
    pub fn apply(&mut self, diff: &EnvDiff) {
        for (name, value) in &diff.set {
            self.vars.insert(name.clone(), value.clone());
        }
        for name in &diff.unset {
            self.vars.remove(name);
        }
    }

    /// Apply the entries of a `build.environment` object.
    ///
    /// Non-string scalars are stringified; nulls and nested values are ignored.
    pub fn apply_config(&mut self, environment: &Value) {
        if let Some(map) = environment.as_object() {
            for (name, value) in map {
                if let Some(value) = env_value(value) {
                    self.vars.insert(name.clone(), value);
                }
            }
        }
    }

    /// Variables declared by a `build.environment` object.
    fn from_config(environment: Option<&Value>) -> Self {
        let mut env = Environment::new();
        if let Some(environment) = environment {
            env.apply_config(environment);
        }
        env
    }

    /// Reflect an accepted `build.environment` mutation.
    ///
    /// `previous` is `build.environment` before the change. When the whole
    /// object is replaced, the names it no longer declares are unset.
    /// Returns whether the mutation concerned the environment.
    pub fn apply_mutation(&mut self, mutation: &Mutation, previous: Option<&Value>) -> bool {
        match mutation.keys.as_slice() {
            [build, environment] if build == "build" && environment == "environment" => {
                let dropped = Environment::from_config(previous).diff(&Environment::from_config(Some(&mutation.value)));
                for name in &dropped.unset {
                    self.unset(name);
                }
                self.apply_config(&mutation.value);
                true
            }
            [build, environment, name] if build == "build" && environment == "environment" => {
                match env_value(&mutation.value) {
                    Some(value) => self.set(name.clone(), value),
                    None => self.unset(name),
                }
                true
            }
            _ => false,
        }
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Environment {
            vars: iter.into_iter().collect(),
        }
    }
}

fn env_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
