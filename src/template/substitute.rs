//! Strict `{{name}}` substitution.

use crate::error::TemplateError;

use super::{lookup, value_to_string, RenderContext};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Replaces every `{{name}}` with its context value.
///
/// An undefined name is an error. An unterminated `{{` and everything after
/// it is copied unchanged.
pub fn substitute(template: &str, context: &RenderContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let Some(len) = rest[start + OPEN.len()..].find(CLOSE) else {
            break;
        };
        let name = rest[start + OPEN.len()..start + OPEN.len() + len].trim();

        let value = lookup(context, name).ok_or_else(|| TemplateError::UndefinedVariable {
            name: name.to_string(),
            template: template.to_string(),
        })?;

        out.push_str(&rest[..start]);
        out.push_str(&value_to_string(value));
        rest = &rest[start + OPEN.len() + len + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Names referenced by `{{name}}` placeholders, in order of appearance.
pub fn referenced_names(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let Some(len) = rest[start + OPEN.len()..].find(CLOSE) else {
            break;
        };
        names.push(rest[start + OPEN.len()..start + OPEN.len() + len].trim().to_string());
        rest = &rest[start + OPEN.len() + len + CLOSE.len()..];
    }

    names
}
