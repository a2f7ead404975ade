//! JSON-schema validation at task entry and exit.

use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema does not compile: {0}")]
    Compile(String),

    #[error("value does not match schema: {0}")]
    Mismatch(String),
}

/// Validate `value` against `schema`, collecting every violation.
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaError> {
    let compiled =
        JSONSchema::compile(schema).map_err(|e| SchemaError::Compile(e.to_string()))?;
    let result = compiled.validate(value);
    if let Err(errors) = result {
        let joined = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SchemaError::Mismatch(joined));
    }
    Ok(())
}
