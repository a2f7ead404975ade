//! # Mapping Engine
//!
//! Translates one context into another through declarative mapping objects.
//! Keys name target fields, values are either expression strings (evaluated
//! with [`crate::expr`]) or literals that pass through unchanged.
//!
//! Input mappings produce a flat object handed to an action. Output mappings
//! treat the target key as a dotted path into the task context
//! (`output.report.title`) and create intermediate containers of the right
//! kind: a numeric next segment means an array, anything else an object.
//! When the write target and the incoming value are both objects they deep
//! merge (objects recurse, arrays and scalars replace).

use serde_json::{Map, Value};
use thiserror::Error;

use crate::expr::{self, ExprError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MappingError {
    #[error("mapping for '{target}' failed: {source}")]
    Expr {
        target: String,
        #[source]
        source: ExprError,
    },

    #[error("invalid mapping target '{0}'")]
    InvalidTarget(String),
}

/// Apply a mapping, producing a fresh object.
///
/// String values are evaluated as expressions against `ctx`; every other
/// value kind passes through verbatim.
pub fn apply(mapping: &Map<String, Value>, ctx: &Value) -> Result<Map<String, Value>, MappingError> {
    let mut out = Map::with_capacity(mapping.len());
    for (target, raw) in mapping {
        out.insert(target.clone(), resolve_value(target, raw, ctx)?);
    }
    Ok(out)
}

/// Apply a mapping whose keys are dotted paths, writing into `target`.
pub fn apply_into(
    mapping: &Map<String, Value>,
    ctx: &Value,
    target: &mut Value,
) -> Result<(), MappingError> {
    for (path, raw) in mapping {
        let value = resolve_value(path, raw, ctx)?;
        write_path(target, path, value)?;
    }
    Ok(())
}

fn resolve_value(target: &str, raw: &Value, ctx: &Value) -> Result<Value, MappingError> {
    match raw {
        Value::String(src) => expr::evaluate(src, ctx).map_err(|source| MappingError::Expr {
            target: target.to_string(),
            source,
        }),
        other => Ok(other.clone()),
    }
}

/// One segment of a write path.
#[derive(Debug, Clone, PartialEq)]
enum WriteSeg {
    Key(String),
    Index(usize),
}

fn parse_target(path: &str) -> Result<Vec<WriteSeg>, MappingError> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(MappingError::InvalidTarget(path.to_string()));
        }
        let mut rest = part;
        // "field[0][1]" style: field first, then bracketed indices.
        if let Some(bracket) = rest.find('[') {
            let field = &rest[..bracket];
            if !field.is_empty() {
                segs.push(WriteSeg::Key(field.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| MappingError::InvalidTarget(path.to_string()))?;
                let idx: usize = stripped[..close]
                    .parse()
                    .map_err(|_| MappingError::InvalidTarget(path.to_string()))?;
                segs.push(WriteSeg::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(MappingError::InvalidTarget(path.to_string()));
            }
        } else if let Ok(idx) = rest.parse::<usize>() {
            segs.push(WriteSeg::Index(idx));
        } else {
            segs.push(WriteSeg::Key(rest.to_string()));
        }
    }
    if segs.is_empty() {
        return Err(MappingError::InvalidTarget(path.to_string()));
    }
    Ok(segs)
}

/// Write `value` at `path` inside `target`, creating intermediate containers.
pub fn write_path(target: &mut Value, path: &str, value: Value) -> Result<(), MappingError> {
    let segs = parse_target(path)?;
    let mut current = target;

    for (i, seg) in segs.iter().enumerate() {
        let last = i + 1 == segs.len();
        match seg {
            WriteSeg::Key(k) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                let map = current.as_object_mut().expect("just coerced to object");
                if last {
                    match map.get_mut(k) {
                        Some(existing) if existing.is_object() && value.is_object() => {
                            deep_merge(existing, value);
                            return Ok(());
                        }
                        _ => {
                            map.insert(k.clone(), value);
                            return Ok(());
                        }
                    }
                }
                let next_is_index = matches!(segs[i + 1], WriteSeg::Index(_));
                current = map.entry(k.clone()).or_insert_with(|| {
                    if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(Map::new())
                    }
                });
            }
            WriteSeg::Index(idx) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let arr = current.as_array_mut().expect("just coerced to array");
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*idx] = value;
                    return Ok(());
                }
                let next_is_index = matches!(segs[i + 1], WriteSeg::Index(_));
                if arr[*idx].is_null() {
                    arr[*idx] = if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(Map::new())
                    };
                }
                current = &mut arr[*idx];
            }
        }
    }
    unreachable!("loop always returns on the last segment")
}

/// Deep merge: objects recurse key-wise, arrays and scalars replace.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}
