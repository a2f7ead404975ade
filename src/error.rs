//! Unified error surface for the CLI.
//!
//! Each layer keeps its own thiserror enum ([`crate::expr::ExprError`],
//! [`crate::mapping::MappingError`], [`crate::resource::ResourceError`],
//! [`crate::engine::EngineError`], ...) because each has different
//! consumers; this module only wraps them for the binary entry point and
//! attaches a hint where one helps.

use thiserror::Error;

/// Top-level error for the `weft` binary.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error(transparent)]
    Loader(#[from] crate::loader::LoaderError),

    #[error(transparent)]
    Resource(#[from] crate::resource::ResourceError),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WeftError {
    pub fn other(message: impl Into<String>) -> Self {
        WeftError::Other(message.into())
    }

    /// A short fix hint for the terminal, when one exists.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            WeftError::Engine(crate::engine::EngineError::InvalidDefinition(_)) => {
                Some("run `weft validate <path>` for the full report")
            }
            WeftError::Engine(crate::engine::EngineError::Resource(_))
            | WeftError::Resource(_) => {
                Some("check the workspace directory covers every referenced id and version")
            }
            WeftError::Yaml(_) => Some("check YAML indentation and quoting"),
            WeftError::Json(_) => Some("--input expects inline JSON, e.g. --input '{\"x\":1}'"),
            WeftError::Io(_) => Some("check the path exists and is readable"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_cover_the_common_cases() {
        let yaml_err: WeftError = serde_yaml::from_str::<crate::loader::Bundle>("a: [")
            .unwrap_err()
            .into();
        assert!(yaml_err.hint().is_some());

        let missing: WeftError =
            crate::resource::ResourceError::not_found("task", "ghost").into();
        assert!(missing.hint().unwrap().contains("workspace"));

        assert!(WeftError::other("misc").hint().is_none());
    }
}
