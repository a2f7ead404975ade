//! `mock` handler: schema-driven value generation for tests and dry runs.
//!
//! Generates a value satisfying the configured JSON schema, optionally
//! sleeping a uniform-random delay first. A `seed` makes both the delay and
//! the generated value reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::action::MockImplementation;

use super::{parse_impl, ActionResult};

const SAMPLE_WORDS: &[&str] = &["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"];

pub async fn execute(implementation: &Value) -> ActionResult {
    let imp: MockImplementation = match parse_impl(implementation, "mock") {
        Ok(imp) => imp,
        Err(fail) => return *fail,
    };

    let mut rng = match imp.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if let Some(delay) = imp.delay {
        let (lo, hi) = (delay.min_ms.min(delay.max_ms), delay.min_ms.max(delay.max_ms));
        let ms = if lo == hi { lo } else { rng.gen_range(lo..=hi) };
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    let value = match &imp.schema {
        Some(schema) => generate(schema, &mut rng),
        None => Value::Object(Map::new()),
    };

    // Objects spread as the output; anything else wraps as { value }.
    let output = match value {
        Value::Object(map) => Value::Object(map),
        other => json!({ "value": other }),
    };
    ActionResult::ok(output)
}

/// Generate a value satisfying `schema`.
fn generate(schema: &Value, rng: &mut StdRng) -> Value {
    if let Some(constant) = schema.get("const") {
        return constant.clone();
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if options.is_empty() {
            return Value::Null;
        }
        return options[rng.gen_range(0..options.len())].clone();
    }

    match schema_type(schema) {
        "object" => {
            let mut out = Map::new();
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in props {
                    out.insert(key.clone(), generate(prop_schema, rng));
                }
            }
            Value::Object(out)
        }
        "array" => {
            let min = schema.get("minItems").and_then(Value::as_u64).unwrap_or(1) as usize;
            let max = schema.get("maxItems").and_then(Value::as_u64).unwrap_or(min as u64) as usize;
            let len = if max > min { rng.gen_range(min..=max) } else { min };
            let item_schema = schema.get("items").cloned().unwrap_or(json!({}));
            Value::Array((0..len).map(|_| generate(&item_schema, rng)).collect())
        }
        "string" => {
            let word = SAMPLE_WORDS[rng.gen_range(0..SAMPLE_WORDS.len())];
            Value::String(word.to_string())
        }
        "integer" => {
            let min = schema.get("minimum").and_then(Value::as_i64).unwrap_or(0);
            let max = schema.get("maximum").and_then(Value::as_i64).unwrap_or(min + 100);
            Value::Number(rng.gen_range(min..=max.max(min)).into())
        }
        "number" => {
            let min = schema.get("minimum").and_then(Value::as_f64).unwrap_or(0.0);
            let max = schema.get("maximum").and_then(Value::as_f64).unwrap_or(min + 100.0);
            let n = rng.gen_range(min..=max.max(min));
            serde_json::Number::from_f64((n * 100.0).round() / 100.0)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        "boolean" => Value::Bool(rng.gen()),
        "null" => Value::Null,
        _ => Value::Null,
    }
}

/// Declared or inferred schema type.
fn schema_type(schema: &Value) -> &str {
    if let Some(t) = schema.get("type").and_then(Value::as_str) {
        return t;
    }
    if schema.get("properties").is_some() {
        return "object";
    }
    if schema.get("items").is_some() {
        return "array";
    }
    ""
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "age": { "type": "integer", "minimum": 18, "maximum": 65 },
                "tags": { "type": "array", "items": { "type": "string" }, "minItems": 2 },
                "active": { "type": "boolean" },
            },
        })
    }

    #[tokio::test]
    async fn generated_object_spreads_as_output() {
        let imp = json!({ "schema": person_schema(), "seed": 7 });
        let result = execute(&imp).await;
        assert!(result.success);
        let out = result.output.as_object().unwrap();
        assert!(out["name"].is_string());
        let age = out["age"].as_i64().unwrap();
        assert!((18..=65).contains(&age));
        assert!(out["tags"].as_array().unwrap().len() >= 2);
        assert!(out["active"].is_boolean());
    }

    #[tokio::test]
    async fn seeded_generation_is_deterministic() {
        let imp = json!({ "schema": person_schema(), "seed": 42 });
        let first = execute(&imp).await;
        let second = execute(&imp).await;
        assert_eq!(first.output, second.output);
    }

    #[tokio::test]
    async fn scalar_schema_wraps_as_value() {
        let imp = json!({ "schema": { "type": "integer", "minimum": 5, "maximum": 5 } });
        let result = execute(&imp).await;
        assert_eq!(result.output, json!({ "value": 5 }));
    }

    #[tokio::test]
    async fn enum_and_const_are_respected() {
        let imp = json!({ "schema": { "enum": ["a", "b"] }, "seed": 1 });
        let result = execute(&imp).await;
        let v = &result.output["value"];
        assert!(v == &json!("a") || v == &json!("b"));

        let imp = json!({ "schema": { "const": "fixed" } });
        assert_eq!(execute(&imp).await.output, json!({ "value": "fixed" }));
    }

    #[tokio::test]
    async fn delay_bounds_are_honoured() {
        let imp = json!({ "delay": { "minMs": 5, "maxMs": 10 }, "seed": 3 });
        let started = std::time::Instant::now();
        let result = execute(&imp).await;
        assert!(result.success);
        assert!(started.elapsed() >= std::time::Duration::from_millis(5));
    }

    #[tokio::test]
    async fn no_schema_yields_empty_object() {
        let result = execute(&json!({})).await;
        assert_eq!(result.output, json!({}));
    }
}
