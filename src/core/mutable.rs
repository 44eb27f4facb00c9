//! Access-controlled configuration mutations.
//!
//! Handlers never touch the configuration tree directly. Every write goes
//! through [`MutableConfig`], which checks the key against its mutability
//! window, applies the change, type-checks well-known keys (rolling back on
//! failure) and appends the fully resolved value to the [`MutationLog`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::event::LifecycleEvent;

/// A path into the configuration tree. Array elements use their index.
pub type KeyPath = Vec<String>;

/// Split a dotted key string into a path.
pub fn parse_keys(keys: &str) -> KeyPath {
    keys.split('.')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One accepted configuration change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub keys: KeyPath,
    pub keys_string: String,
    /// Value at `keys` after the change; `null` records a deletion.
    pub value: Value,
    pub event: LifecycleEvent,
}

impl Mutation {
    pub fn new(keys: KeyPath, value: Value, event: LifecycleEvent) -> Self {
        let keys_string = keys.join(".");
        Mutation {
            keys,
            keys_string,
            value,
            event,
        }
    }

    /// Whether this entry removed the key.
    pub fn is_deletion(&self) -> bool {
        self.value.is_null()
    }

    /// Log line announcing the change, if it should be shown.
    pub fn describe(&self, debug: bool) -> Option<String> {
        if self.keys.first().map(String::as_str) == Some("functions") && !debug {
            return None;
        }
        if self.keys.starts_with(&["build".to_string(), "environment".to_string()]) {
            return Some(format!("Config property \"{}\" value changed.", self.keys_string));
        }
        Some(format!(
            "Config property \"{}\" value changed to {}.",
            self.keys_string, self.value
        ))
    }
}

/// Append-only, ordered record of accepted mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationLog {
    entries: Vec<Mutation>,
}

impl MutationLog {
    pub fn new() -> Self {
        MutationLog::default()
    }

    pub fn entries(&self) -> &[Mutation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.entries.iter()
    }

    fn push(&mut self, mutation: Mutation) -> &Mutation {
        self.entries.push(mutation);
        &self.entries[self.entries.len() - 1]
    }
}

/// Why a mutation was refused.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MutationError {
    #[error("\"config.{keys}\" is read-only.")]
    ReadOnly { keys: String },

    #[error("\"config.{keys}\" cannot be modified after \"{last_event}\".")]
    Frozen {
        keys: String,
        last_event: LifecycleEvent,
    },

    #[error("Setting \"config.{keys}\" to null is not allowed.")]
    NullNotAllowed { keys: String },

    #[error("Configuration property {keys} must be {expected}")]
    InvalidType { keys: String, expected: String },

    #[error("Cannot modify \"config.{keys}\": {reason}")]
    InvalidPath { keys: String, reason: String },
}

impl MutationError {
    /// The offending key, as a dotted string.
    pub fn keys(&self) -> &str {
        match self {
            MutationError::ReadOnly { keys }
            | MutationError::Frozen { keys, .. }
            | MutationError::NullNotAllowed { keys }
            | MutationError::InvalidType { keys, .. }
            | MutationError::InvalidPath { keys, .. } => keys,
        }
    }
}

// =============================================================================
// Mutability windows
// =============================================================================

/// A mutable key pattern and the last event during which it can change.
#[derive(Debug, Clone, Copy)]
struct MutabilityRule {
    pattern: &'static str,
    last_event: LifecycleEvent,
    deletable: bool,
}

const fn rule(pattern: &'static str, last_event: LifecycleEvent) -> MutabilityRule {
    MutabilityRule {
        pattern,
        last_event,
        deletable: false,
    }
}

const fn deletable(pattern: &'static str, last_event: LifecycleEvent) -> MutabilityRule {
    MutabilityRule {
        pattern,
        last_event,
        deletable: true,
    }
}

/// Keys not listed here are permanently read-only.
const RULES: &[MutabilityRule] = &[
    rule("build.command", LifecycleEvent::PreBuild),
    rule("build.edge_functions", LifecycleEvent::PreBuild),
    rule("functions", LifecycleEvent::Build),
    rule("functions.*", LifecycleEvent::Build),
    rule("functions.*.*", LifecycleEvent::Build),
    rule("build.publish", LifecycleEvent::PostBuild),
    rule("build.environment", LifecycleEvent::PostBuild),
    deletable("build.environment.*", LifecycleEvent::PostBuild),
    rule("build.processing", LifecycleEvent::PostBuild),
    rule("build.processing.*", LifecycleEvent::PostBuild),
    rule("build.processing.*.*", LifecycleEvent::PostBuild),
    rule("build.services", LifecycleEvent::PostBuild),
    rule("build.services.*", LifecycleEvent::PostBuild),
    rule("headers", LifecycleEvent::PostBuild),
    rule("redirects", LifecycleEvent::PostBuild),
    rule("edge_functions", LifecycleEvent::PostBuild),
];

fn pattern_matches(pattern: &str, keys: &[String]) -> bool {
    let segments: Vec<&str> = pattern.split('.').collect();
    segments.len() == keys.len()
        && segments
            .iter()
            .zip(keys)
            .all(|(segment, key)| *segment == "*" || segment == key)
}

fn find_rule(keys: &[String]) -> Option<&'static MutabilityRule> {
    RULES.iter().find(|r| pattern_matches(r.pattern, keys))
}

/// Rank of an event for freeze checks. Dev events share the rank of their
/// build counterpart.
fn freeze_rank(event: LifecycleEvent) -> u8 {
    match event {
        LifecycleEvent::PreBuild | LifecycleEvent::PreDev => 0,
        LifecycleEvent::Build | LifecycleEvent::Dev => 1,
        LifecycleEvent::PostBuild => 2,
        LifecycleEvent::Success => 3,
        LifecycleEvent::Error => 4,
        LifecycleEvent::End => 5,
    }
}

/// Legacy locations of the functions directory, folded into the canonical key.
fn normalize_alias(path: &[String]) -> KeyPath {
    let is_alias = matches!(
        path.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["build", "functions"] | ["functions", "directory"]
    );
    if is_alias {
        vec!["functions".into(), "*".into(), "directory".into()]
    } else {
        path.to_vec()
    }
}

// =============================================================================
// Type checks
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Expected {
    String,
    StringMap,
    StringArray,
}

impl Expected {
    fn check(&self, value: &Value) -> bool {
        match self {
            Expected::String => value.is_string(),
            Expected::StringMap => value
                .as_object()
                .is_some_and(|map| map.values().all(Value::is_string)),
            Expected::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::String => write!(f, "a string"),
            Expected::StringMap => write!(f, "an object of strings"),
            Expected::StringArray => write!(f, "an array of strings"),
        }
    }
}

const TYPE_CHECKS: &[(&str, Expected)] = &[
    ("build.command", Expected::String),
    ("build.publish", Expected::String),
    ("build.environment", Expected::StringMap),
    ("functions.*.directory", Expected::String),
    ("functions.*.included_files", Expected::StringArray),
];

/// Expand a pattern into the concrete key paths present in `root`.
fn expand_pattern(root: &Value, segments: &[&str], prefix: &mut KeyPath, out: &mut Vec<KeyPath>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(prefix.clone());
        return;
    };
    let Some(map) = root.as_object() else {
        return;
    };
    for (key, child) in map {
        if *head == "*" || head == key {
            prefix.push(key.clone());
            expand_pattern(child, rest, prefix, out);
            prefix.pop();
        }
    }
}

fn is_related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b).all(|(x, y)| x == y)
}

fn validate_types(root: &Value, changed: &[String]) -> Result<(), MutationError> {
    for (pattern, expected) in TYPE_CHECKS {
        let segments: Vec<&str> = pattern.split('.').collect();
        let mut found = Vec::new();
        expand_pattern(root, &segments, &mut Vec::new(), &mut found);
        for keys in found {
            if !is_related(&keys, changed) {
                continue;
            }
            if let Some(value) = get_at(root, &keys) {
                if !value.is_null() && !expected.check(value) {
                    return Err(MutationError::InvalidType {
                        keys: keys.join("."),
                        expected: expected.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tree helpers
// =============================================================================

/// Read the value at `path`.
pub fn get_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at `path`, creating intermediate objects.
pub fn write_at(root: &mut Value, path: &[String], value: Value) -> Result<(), MutationError> {
    let invalid = |reason: &str| MutationError::InvalidPath {
        keys: path.join("."),
        reason: reason.to_string(),
    };
    let Some((last, parents)) = path.split_last() else {
        return Err(invalid("empty key path"));
    };

    let mut current = root;
    for key in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            Value::Array(items) => {
                let index: usize = key.parse().map_err(|_| invalid("array index expected"))?;
                if index == items.len() {
                    items.push(Value::Object(serde_json::Map::new()));
                }
                items.get_mut(index).ok_or_else(|| invalid("array index out of bounds"))?
            }
            _ => return Err(invalid("parent is not an object")),
        };
    }

    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = last.parse().map_err(|_| invalid("array index expected"))?;
            if index < items.len() {
                items[index] = value;
            } else if index == items.len() {
                items.push(value);
            } else {
                return Err(invalid("array index out of bounds"));
            }
            Ok(())
        }
        _ => Err(invalid("parent is not an object")),
    }
}

/// Remove the value at `path`. Returns whether something was removed.
pub fn remove_at(root: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = root;
    for key in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return false,
        }
    }
    match current {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

// =============================================================================
// MutableConfig
// =============================================================================

/// The live configuration tree and its mutation log.
#[derive(Debug, Clone)]
pub struct MutableConfig {
    value: Value,
    log: MutationLog,
}

impl MutableConfig {
    /// Wrap a resolved configuration tree.
    pub fn new(value: Value) -> Self {
        MutableConfig {
            value,
            log: MutationLog::new(),
        }
    }

    /// The current tree.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn log(&self) -> &MutationLog {
        &self.log
    }

    pub fn into_parts(self) -> (Value, MutationLog) {
        (self.value, self.log)
    }

    /// Read a value by dotted key (`build.publish`).
    pub fn get(&self, keys: &str) -> Option<&Value> {
        get_at(&self.value, &parse_keys(keys))
    }

    /// Read a string value by dotted key.
    pub fn get_str(&self, keys: &str) -> Option<&str> {
        self.get(keys).and_then(Value::as_str)
    }

    /// Set `path` to `value` during `event`.
    ///
    /// A `null` value is a deletion and is only accepted for deletable keys.
    pub fn set(
        &mut self,
        path: &[String],
        value: Value,
        event: LifecycleEvent,
    ) -> Result<&Mutation, MutationError> {
        let path = normalize_alias(path);
        if value.is_null() {
            return self.delete(&path, event);
        }
        let logged = self.logged_path(&path);
        self.check_writable(&logged, event)?;
        self.apply(logged, event, |root| write_at(root, &path, value))
    }

    /// Remove `path` during `event`.
    pub fn delete(&mut self, path: &[String], event: LifecycleEvent) -> Result<&Mutation, MutationError> {
        let path = normalize_alias(path);
        let logged = self.logged_path(&path);
        let rule = self.check_writable(&logged, event)?;
        if logged == path && !rule.deletable {
            return Err(MutationError::NullNotAllowed {
                keys: logged.join("."),
            });
        }
        self.apply(logged, event, |root| {
            remove_at(root, &path);
            Ok(())
        })
    }

    /// Append `value` to the array at `path` during `event`.
    pub fn push(
        &mut self,
        path: &[String],
        value: Value,
        event: LifecycleEvent,
    ) -> Result<&Mutation, MutationError> {
        let path = normalize_alias(path);
        let logged = self.logged_path(&path);
        self.check_writable(&logged, event)?;
        self.apply(logged, event, |root| match get_at(root, &path) {
            None | Some(Value::Null) => write_at(root, &path, Value::Array(vec![value])),
            Some(Value::Array(items)) => {
                let index = items.len().to_string();
                let mut element = path.clone();
                element.push(index);
                write_at(root, &element, value)
            }
            Some(_) => Err(MutationError::InvalidPath {
                keys: path.join("."),
                reason: "not an array".to_string(),
            }),
        })
    }

    /// Path a write is recorded under: the first array on the way down
    /// absorbs any deeper keys.
    fn logged_path(&self, path: &[String]) -> KeyPath {
        let mut current = &self.value;
        for (index, key) in path.iter().enumerate() {
            match current {
                Value::Array(_) if index > 0 => return path[..index].to_vec(),
                Value::Object(map) => match map.get(key) {
                    Some(next) => current = next,
                    None => break,
                },
                _ => break,
            }
        }
        path.to_vec()
    }

    fn check_writable(
        &self,
        keys: &[String],
        event: LifecycleEvent,
    ) -> Result<&'static MutabilityRule, MutationError> {
        let rule = find_rule(keys).ok_or_else(|| MutationError::ReadOnly {
            keys: keys.join("."),
        })?;
        if freeze_rank(event) > freeze_rank(rule.last_event) {
            return Err(MutationError::Frozen {
                keys: keys.join("."),
                last_event: rule.last_event,
            });
        }
        Ok(rule)
    }

    fn apply<F>(&mut self, logged: KeyPath, event: LifecycleEvent, edit: F) -> Result<&Mutation, MutationError>
    where
        F: FnOnce(&mut Value) -> Result<(), MutationError>,
    {
        let snapshot = self.value.clone();
        let outcome = edit(&mut self.value).and_then(|()| validate_types(&self.value, &logged));
        if let Err(err) = outcome {
            self.value = snapshot;
            return Err(err);
        }

        let resolved = get_at(&self.value, &logged).cloned().unwrap_or(Value::Null);
        tracing::debug!(keys = %logged.join("."), event = %event, "config mutation accepted");
        Ok(self.log.push(Mutation::new(logged, resolved, event)))
    }
}

/// Replay a mutation log against a configuration tree.
pub fn replay(base: &Value, log: &[Mutation]) -> Value {
    let mut value = base.clone();
    for mutation in log {
        if mutation.is_deletion() {
            remove_at(&mut value, &mutation.keys);
        } else if let Err(err) = write_at(&mut value, &mutation.keys, mutation.value.clone()) {
            tracing::warn!("skipping mutation of {}: {}", mutation.keys_string, err);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(s: &str) -> KeyPath {
        parse_keys(s)
    }

    fn config() -> MutableConfig {
        MutableConfig::new(json!({
            "build": {
                "base": "",
                "command": "make",
                "publish": "dist",
                "environment": {"NODE_ENV": "production"}
            },
            "headers": [{"for": "/*", "values": {"X-Frame-Options": "DENY"}}],
            "plugins": []
        }))
    }

    #[test]
    fn test_set_build_command_on_pre_build() {
        let mut cfg = config();
        cfg.set(&keys("build.command"), json!("npm run build"), LifecycleEvent::PreBuild)
            .unwrap();

        assert_eq!(cfg.get_str("build.command"), Some("npm run build"));
        let log = cfg.log().entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].keys, vec!["build", "command"]);
        assert_eq!(log[0].keys_string, "build.command");
        assert_eq!(log[0].value, json!("npm run build"));
        assert_eq!(log[0].event, LifecycleEvent::PreBuild);
    }

    #[test]
    fn test_frozen_key_rejected_after_window() {
        let mut cfg = config();
        let err = cfg
            .set(&keys("build.command"), json!("x"), LifecycleEvent::Build)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"config.build.command\" cannot be modified after \"onPreBuild\"."
        );
        assert_eq!(cfg.get_str("build.command"), Some("make"));
        assert!(cfg.log().is_empty());
    }

    #[test]
    fn test_read_only_key_rejected_in_every_event() {
        for event in LifecycleEvent::ALL {
            let mut cfg = config();
            let err = cfg.set(&keys("build.base"), json!("site"), event).unwrap_err();
            assert_eq!(err.to_string(), "\"config.build.base\" is read-only.");
        }
    }

    #[test]
    fn test_null_not_allowed_unless_deletable() {
        let mut cfg = config();
        let err = cfg
            .set(&keys("build.publish"), Value::Null, LifecycleEvent::Build)
            .unwrap_err();
        assert_eq!(err.to_string(), "Setting \"config.build.publish\" to null is not allowed.");

        cfg.set(&keys("build.environment.NODE_ENV"), Value::Null, LifecycleEvent::Build)
            .unwrap();
        assert!(cfg.get("build.environment.NODE_ENV").is_none());
        assert!(cfg.log().entries()[0].is_deletion());
    }

    #[test]
    fn test_array_writes_logged_at_array_path() {
        let mut cfg = config();
        cfg.set(&keys("headers.0.for"), json!("/api/*"), LifecycleEvent::PostBuild)
            .unwrap();

        let entry = &cfg.log().entries()[0];
        assert_eq!(entry.keys, vec!["headers"]);
        assert_eq!(entry.value[0]["for"], "/api/*");
        assert_eq!(entry.value[0]["values"]["X-Frame-Options"], "DENY");
    }

    #[test]
    fn test_push_appends_whole_array() {
        let mut cfg = config();
        cfg.push(&keys("redirects"), json!({"from": "/a", "to": "/b"}), LifecycleEvent::Build)
            .unwrap();
        cfg.push(&keys("redirects"), json!({"from": "/c", "to": "/d"}), LifecycleEvent::Build)
            .unwrap();

        let last = cfg.log().entries().last().unwrap();
        assert_eq!(last.keys, vec!["redirects"]);
        assert_eq!(last.value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_type_violation_rolls_back() {
        let mut cfg = config();
        let err = cfg
            .set(&keys("build.command"), json!(42), LifecycleEvent::PreBuild)
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration property build.command must be a string");
        assert_eq!(cfg.get_str("build.command"), Some("make"));
        assert!(cfg.log().is_empty());

        let err = cfg
            .set(&keys("build.environment.PORT"), json!(8080), LifecycleEvent::Build)
            .unwrap_err();
        assert!(matches!(err, MutationError::InvalidType { .. }));
        assert!(cfg.get("build.environment.PORT").is_none());
    }

    #[test]
    fn test_functions_directory_aliases() {
        let mut cfg = config();
        cfg.set(&keys("build.functions"), json!("lambda"), LifecycleEvent::Build)
            .unwrap();
        assert_eq!(cfg.get_str("functions.*.directory"), Some("lambda"));
        assert_eq!(cfg.log().entries()[0].keys_string, "functions.*.directory");
    }

    #[test]
    fn test_dev_events_follow_build_windows() {
        let mut cfg = config();
        assert!(cfg
            .set(&keys("build.command"), json!("dev"), LifecycleEvent::PreDev)
            .is_ok());
        assert!(cfg
            .set(&keys("build.command"), json!("dev"), LifecycleEvent::Dev)
            .is_err());
    }

    #[test]
    fn test_replay_reproduces_final_config() {
        let original = config();
        let mut cfg = original.clone();
        cfg.set(&keys("build.command"), json!("a"), LifecycleEvent::PreBuild).unwrap();
        cfg.set(&keys("functions.*.included_files"), json!(["x.txt"]), LifecycleEvent::Build)
            .unwrap();
        cfg.set(&keys("headers.0.for"), json!("/b"), LifecycleEvent::PostBuild).unwrap();
        cfg.delete(&keys("build.environment.NODE_ENV"), LifecycleEvent::PostBuild)
            .unwrap();
        cfg.push(&keys("redirects"), json!({"from": "/x"}), LifecycleEvent::PostBuild)
            .unwrap();

        let replayed = replay(original.value(), cfg.log().entries());
        assert_eq!(&replayed, cfg.value());
    }

    #[test]
    fn test_describe_hides_environment_values() {
        let m = Mutation::new(keys("build.environment.TOKEN"), json!("secret"), LifecycleEvent::Build);
        assert_eq!(
            m.describe(false).unwrap(),
            "Config property \"build.environment.TOKEN\" value changed."
        );

        let m = Mutation::new(keys("functions.*.directory"), json!("f"), LifecycleEvent::Build);
        assert!(m.describe(false).is_none());
        assert!(m.describe(true).is_some());
    }
}
