//! Template Module
//!
//! The argument mini-language used by step `args`, `path`, `output` and
//! `condition` fields:
//! - `{{name}}` strict substitution, with dotted lookups into step results
//! - `{ a || b }` conditional alternatives, resolved before substitution
//! - `{var}`, `{!var}`, `{var==value}` simplified conditions, and a small
//!   boolean expression language for everything else
//!
//! Templates render against a [`RenderContext`], a JSON object holding
//! variables, globals and the results of completed steps.

mod alternatives;
mod condition;
mod substitute;

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::TemplateError;

pub use alternatives::resolve_alternatives;
pub use condition::{evaluate_condition, evaluate_expression};
pub use substitute::{referenced_names, substitute};

/// Values visible to templates, keyed by variable or step name.
pub type RenderContext = Map<String, Value>;

/// Placeholder expanded to the project directory in paths and values.
pub const PWD_MARKER: &str = "$(pwd)";

/// Renders a template: alternatives first, then `{{name}}` substitution.
///
/// ```
/// use reconflow::template::{render, RenderContext};
/// use serde_json::json;
///
/// let mut ctx = RenderContext::new();
/// ctx.insert("target".into(), json!("example.com"));
/// ctx.insert("service_scan".into(), json!("-sV"));
///
/// let args = render("{{service_scan}} {{target}}", &ctx).unwrap();
/// assert_eq!(args, "-sV example.com");
/// ```
pub fn render(template: &str, context: &RenderContext) -> Result<String, TemplateError> {
    let resolved = resolve_alternatives(template, context)?;
    substitute(&resolved, context)
}

/// Looks up `name` in the context, walking dotted paths into objects and
/// arrays when there is no exact key.
pub fn lookup<'a>(context: &'a RenderContext, name: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(name) {
        return Some(value);
    }

    let mut parts = name.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Truthiness of a context value: null, `false`, zero and empty
/// strings/lists/maps are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text form of a value as it appears in a rendered template.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Replaces every `$(pwd)` with the project directory.
pub fn expand_pwd(text: &str, project_path: &Path) -> String {
    if !text.contains(PWD_MARKER) {
        return text.to_string();
    }
    text.replace(PWD_MARKER, &project_path.display().to_string())
}
