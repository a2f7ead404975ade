//! # YAML Test Runner
//!
//! A test spec starts a workflow with an input and asserts over the run's
//! terminal record. Assertions address values by path (`output.name`,
//! `status`) and combine freely:
//!
//! ```yaml
//! tests:
//!   - name: hello world
//!     workflow: hello
//!     input: { name: World }
//!     expect:
//!       - { path: status, eq: completed }
//!       - { path: output.name, eq: World }
//!       - { path: output, has_keys: [name] }
//! ```
//!
//! Operators: `eq`, `not_eq`, `gt`, `gte`, `lt`, `lte`, `contains`,
//! `not_contains`, `matches`, `starts_with`, `ends_with`, `length`,
//! `min_length`, `max_length`, `type`, `exists`, `not_empty`, `has_keys`,
//! `every`, `some`, `not`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::engine::Engine;
use crate::expr;
use crate::run::RunStatus;

static WORKFLOW_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static pattern compiles"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,

    pub workflow: String,

    #[serde(default = "default_version")]
    pub workflow_version: u32,

    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub expect: Vec<Assertion>,
}

fn default_version() -> u32 {
    1
}

/// One assertion: a path plus any number of operators, all of which must
/// hold.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Assertion {
    /// Path into the test record `{ status, output, error }`. `every`,
    /// `some`, and `not` evaluate their nested assertion against each
    /// element / the same record.
    #[serde(default)]
    pub path: Option<String>,

    pub eq: Option<Value>,
    pub not_eq: Option<Value>,
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
    pub contains: Option<Value>,
    pub not_contains: Option<Value>,
    pub matches: Option<String>,
    pub starts_with: Option<String>,
    pub ends_with: Option<String>,
    pub length: Option<usize>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub exists: Option<bool>,
    pub not_empty: Option<bool>,
    pub has_keys: Option<Vec<String>>,
    pub every: Option<Box<Assertion>>,
    pub some: Option<Box<Assertion>>,
    pub not: Option<Box<Assertion>>,
}

/// Result of one test case.
#[derive(Debug)]
pub struct TestOutcome {
    pub name: String,
    pub failures: Vec<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Load a suite from disk.
pub fn load_suite(path: &Path) -> Result<TestSuite, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_yaml::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Run every case in a suite against the engine.
pub async fn run_suite(engine: &Engine, suite: &TestSuite) -> Vec<TestOutcome> {
    let mut outcomes = Vec::with_capacity(suite.tests.len());
    for case in &suite.tests {
        outcomes.push(run_case(engine, case).await);
    }
    outcomes
}

async fn run_case(engine: &Engine, case: &TestCase) -> TestOutcome {
    let mut failures = Vec::new();
    if !WORKFLOW_ID.is_match(&case.workflow) {
        failures.push(format!("'{}' is not a plausible workflow id", case.workflow));
        return TestOutcome { name: case.name.clone(), failures };
    }

    let record = match engine
        .run_to_completion(&case.workflow, case.workflow_version, case.input.clone())
        .await
    {
        Ok(run) => json!({
            "status": status_str(run.status),
            "output": run.output.unwrap_or(Value::Null),
            "error": run.error,
        }),
        Err(e) => json!({
            "status": "error",
            "output": null,
            "error": e.to_string(),
        }),
    };

    for (i, assertion) in case.expect.iter().enumerate() {
        if let Err(reason) = check(assertion, &record) {
            failures.push(format!("expect[{}]: {}", i, reason));
        }
    }
    TestOutcome { name: case.name.clone(), failures }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Evaluate one assertion against a record.
pub fn check(assertion: &Assertion, record: &Value) -> Result<(), String> {
    let (value, present) = match &assertion.path {
        Some(path) => resolve(record, path)?,
        None => (record.clone(), true),
    };
    let at = assertion.path.as_deref().unwrap_or("<record>");

    if let Some(want) = assertion.exists {
        if present != want {
            return Err(format!(
                "{}: expected exists={}, value was {}",
                at,
                want,
                if present { "present" } else { "absent" }
            ));
        }
    }

    if let Some(expected) = &assertion.eq {
        if !values_equal(&value, expected) {
            return Err(format!("{}: expected {}, got {}", at, expected, value));
        }
    }
    if let Some(unexpected) = &assertion.not_eq {
        if values_equal(&value, unexpected) {
            return Err(format!("{}: expected anything but {}", at, unexpected));
        }
    }

    for (op, bound, cmp) in [
        ("gt", assertion.gt, f64::gt as fn(&f64, &f64) -> bool),
        ("gte", assertion.gte, f64::ge),
        ("lt", assertion.lt, f64::lt),
        ("lte", assertion.lte, f64::le),
    ] {
        if let Some(bound) = bound {
            let n = value
                .as_f64()
                .ok_or_else(|| format!("{}: {} requires a number, got {}", at, op, value))?;
            if !cmp(&n, &bound) {
                return Err(format!("{}: expected {} {}, got {}", at, op, bound, n));
            }
        }
    }

    if let Some(needle) = &assertion.contains {
        if !contains(&value, needle) {
            return Err(format!("{}: {} does not contain {}", at, value, needle));
        }
    }
    if let Some(needle) = &assertion.not_contains {
        if contains(&value, needle) {
            return Err(format!("{}: {} unexpectedly contains {}", at, value, needle));
        }
    }

    if let Some(pattern) = &assertion.matches {
        let re = Regex::new(pattern).map_err(|e| format!("{}: bad regex: {}", at, e))?;
        let s = value
            .as_str()
            .ok_or_else(|| format!("{}: matches requires a string, got {}", at, value))?;
        if !re.is_match(s) {
            return Err(format!("{}: '{}' does not match /{}/", at, s, pattern));
        }
    }
    if let Some(prefix) = &assertion.starts_with {
        let s = value
            .as_str()
            .ok_or_else(|| format!("{}: starts_with requires a string", at))?;
        if !s.starts_with(prefix.as_str()) {
            return Err(format!("{}: '{}' does not start with '{}'", at, s, prefix));
        }
    }
    if let Some(suffix) = &assertion.ends_with {
        let s = value
            .as_str()
            .ok_or_else(|| format!("{}: ends_with requires a string", at))?;
        if !s.ends_with(suffix.as_str()) {
            return Err(format!("{}: '{}' does not end with '{}'", at, s, suffix));
        }
    }

    if assertion.length.is_some() || assertion.min_length.is_some() || assertion.max_length.is_some()
    {
        let len = length_of(&value)
            .ok_or_else(|| format!("{}: length checks need a string, array, or object", at))?;
        if let Some(exact) = assertion.length {
            if len != exact {
                return Err(format!("{}: expected length {}, got {}", at, exact, len));
            }
        }
        if let Some(min) = assertion.min_length {
            if len < min {
                return Err(format!("{}: expected length >= {}, got {}", at, min, len));
            }
        }
        if let Some(max) = assertion.max_length {
            if len > max {
                return Err(format!("{}: expected length <= {}, got {}", at, max, len));
            }
        }
    }

    if let Some(type_name) = &assertion.type_name {
        let actual = json_type(&value);
        if actual != type_name {
            return Err(format!("{}: expected type {}, got {}", at, type_name, actual));
        }
    }

    if assertion.not_empty == Some(true) {
        let empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        if empty {
            return Err(format!("{}: expected a non-empty value", at));
        }
    }

    if let Some(keys) = &assertion.has_keys {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{}: has_keys requires an object", at))?;
        for key in keys {
            if !obj.contains_key(key) {
                return Err(format!("{}: missing key '{}'", at, key));
            }
        }
    }

    if let Some(nested) = &assertion.every {
        let items = value
            .as_array()
            .ok_or_else(|| format!("{}: every requires an array", at))?;
        for (i, item) in items.iter().enumerate() {
            check(nested, item).map_err(|e| format!("{}[{}]: {}", at, i, e))?;
        }
    }
    if let Some(nested) = &assertion.some {
        let items = value
            .as_array()
            .ok_or_else(|| format!("{}: some requires an array", at))?;
        if !items.iter().any(|item| check(nested, item).is_ok()) {
            return Err(format!("{}: no element satisfied the nested assertion", at));
        }
    }
    if let Some(nested) = &assertion.not {
        if check(nested, &value).is_ok() {
            return Err(format!("{}: nested assertion unexpectedly passed", at));
        }
    }

    Ok(())
}

/// Resolve a dotted path; the bool is presence.
fn resolve(record: &Value, path: &str) -> Result<(Value, bool), String> {
    let parsed = expr::parse(path).map_err(|e| format!("bad path '{}': {}", path, e))?;
    match parsed {
        expr::Expr::Path(segs) => Ok(match expr::resolve_path(record, &segs) {
            Some(v) => (v, true),
            None => (Value::Null, false),
        }),
        _ => Err(format!("'{}' is not a plain path", path)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
