//! `context` handler: deterministic context transforms.
//!
//! Default mode passes the input through untouched. `merge` mode combines
//! `sources` under a target key with one of two policies:
//!
//! - `flatten`: array sources spread element-wise, scalars push as-is, so
//!   `merge(flatten, [A, s, B]) = concat(A, [s], B)`.
//! - `append`: the first array source seeds the output; every later
//!   source appends as a single element (arrays stay nested).
//!
//! Sources that resolve to nothing are skipped. This handler always
//! succeeds.

use serde_json::Value;

use crate::action::{ContextImplementation, MergePolicy};
use crate::expr;

use super::{input_record, parse_impl, ActionResult};

pub fn execute(implementation: &Value, input: Value) -> ActionResult {
    let imp: ContextImplementation = match parse_impl(implementation, "context") {
        Ok(imp) => imp,
        Err(fail) => return *fail,
    };

    let Some(merge) = imp.merge else {
        // Passthrough: output is byte-identical to input.
        return ActionResult::ok(input);
    };

    let record = input_record(&input);
    let mut resolved: Vec<Value> = Vec::with_capacity(merge.sources.len());
    for source in &merge.sources {
        match expr::evaluate(source, &record) {
            Ok(Value::Null) | Err(_) => continue,
            Ok(value) => resolved.push(value),
        }
    }

    let merged = match merge.policy {
        MergePolicy::Flatten => {
            let mut out = Vec::new();
            for value in resolved {
                match value {
                    Value::Array(items) => out.extend(items),
                    scalar => out.push(scalar),
                }
            }
            Value::Array(out)
        }
        MergePolicy::Append => {
            let mut iter = resolved.into_iter();
            let mut out = match iter.next() {
                Some(Value::Array(items)) => items,
                Some(first) => vec![first],
                None => Vec::new(),
            };
            out.extend(iter);
            Value::Array(out)
        }
    };

    let mut output = match input {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            if !other.is_null() {
                map.insert("value".to_string(), other);
            }
            map
        }
    };
    output.insert(merge.target, merged);
    ActionResult::ok(Value::Object(output))
}
