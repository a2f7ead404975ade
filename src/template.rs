//! Single-pass prompt template renderer.
//!
//! The narrow interface the `llm` handler consumes: `render(template, ctx)`
//! substitutes `{{path}}` placeholders with values resolved from the action
//! input. This is the string-interpolation sub-language only; mapping and
//! condition expressions live in [`crate::expr`] and the two are never
//! conflated.

use serde_json::Value;
use thiserror::Error;

use crate::expr::{self, Seg};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("empty placeholder at byte {0}")]
    Empty(usize),
}

/// Render a template against a context value.
///
/// Placeholders resolve as dotted paths (`{{user.name}}`, `{{items.0}}`).
/// Absent paths render as the empty string; non-string values render as
/// compact JSON.
pub fn render(template: &str, ctx: &Value) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            let start = i;
            let rest = &template[i + 2..];
            match rest.find("}}") {
                Some(close) => {
                    let inner = rest[..close].trim();
                    if inner.is_empty() {
                        return Err(TemplateError::Empty(start));
                    }
                    out.push_str(&lookup(ctx, inner));
                    i += 2 + close + 2;
                }
                None => return Err(TemplateError::Unterminated(start)),
            }
        } else {
            let c = template[i..].chars().next().expect("in-bounds char");
            out.push(c);
            i += c.len_utf8();
        }
    }

    Ok(out)
}

fn lookup(ctx: &Value, path: &str) -> String {
    let segs: Vec<Seg> = path
        .split('.')
        .map(|part| match part.parse::<i64>() {
            Ok(idx) => Seg::Index(idx),
            Err(_) => Seg::Key(part.to_string()),
        })
        .collect();
    match expr::resolve_path(ctx, &segs) {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_paths() {
        let ctx = json!({ "user": { "name": "ada" }, "count": 3 });
        assert_eq!(
            render("Hello {{user.name}}, you have {{count}} items.", &ctx).unwrap(),
            "Hello ada, you have 3 items."
        );
    }

    #[test]
    fn absent_paths_render_empty() {
        assert_eq!(render("x={{missing.key}}!", &json!({})).unwrap(), "x=!");
    }

    #[test]
    fn non_strings_render_as_json() {
        let ctx = json!({ "items": [1, 2] });
        assert_eq!(render("{{items}}", &ctx).unwrap(), "[1,2]");
    }

    #[test]
    fn numeric_segments_index_arrays() {
        let ctx = json!({ "items": ["a", "b"] });
        assert_eq!(render("{{items.1}}", &ctx).unwrap(), "b");
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(matches!(
            render("oops {{name", &json!({})),
            Err(TemplateError::Unterminated(5))
        ));
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("no placeholders", &json!({})).unwrap(), "no placeholders");
    }
}
