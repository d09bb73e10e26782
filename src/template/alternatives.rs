//! Conditional alternatives: `{ -w {{wordlist}} || -passive }`.
//!
//! A single-brace span containing a top-level `||` is replaced by its first
//! satisfiable alternative. An alternative is satisfiable when every
//! `{{name}}` it mentions is present in the context and truthy.

use crate::error::TemplateError;

use super::substitute::referenced_names;
use super::{is_truthy, lookup, RenderContext};

/// Resolves every alternatives block in `template`.
///
/// `{{ }}` placeholders are copied untouched. Unterminated spans are left
/// verbatim. Spans without a top-level `||` are kept, but blocks nested
/// inside them are still resolved.
pub fn resolve_alternatives(
    template: &str,
    context: &RenderContext,
) -> Result<String, TemplateError> {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(b"{{") {
            match placeholder_end(bytes, i) {
                Some(next) => {
                    i = next;
                    continue;
                }
                None => break,
            }
        }

        if bytes[i] != b'{' {
            i += 1;
            continue;
        }

        let Some(end) = block_end(bytes, i) else {
            i += 1;
            continue;
        };
        let inner = &template[i + 1..end];
        let alternatives = split_alternatives(inner);

        if alternatives.len() < 2 {
            i += 1;
            continue;
        }

        let chosen = alternatives
            .iter()
            .map(|alt| alt.trim())
            .find(|alt| is_satisfiable(alt, context))
            .ok_or_else(|| TemplateError::NoSatisfiableAlternative {
                block: inner.trim().to_string(),
            })?;
        out.push_str(&template[copied..i]);
        out.push_str(chosen);
        copied = end + 1;
        i = end + 1;
    }

    out.push_str(&template[copied..]);
    Ok(out)
}

/// Index just past the `}}` closing the placeholder opened at `start`.
fn placeholder_end(bytes: &[u8], start: usize) -> Option<usize> {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"}}")
        .map(|len| start + 2 + len + 2)
}

/// Index of the `}` closing the block opened at `start`.
fn block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut j = start;

    while j < bytes.len() {
        if j > start && bytes[j..].starts_with(b"{{") {
            j = placeholder_end(bytes, j)?;
            continue;
        }
        match bytes[j] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

/// Splits on `||` outside placeholders and nested braces.
fn split_alternatives(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut part_start = 0;
    let mut j = 0;

    while j < bytes.len() {
        if bytes[j..].starts_with(b"{{") {
            match placeholder_end(bytes, j) {
                Some(next) => {
                    j = next;
                    continue;
                }
                None => break,
            }
        }
        match bytes[j] {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b'|' if depth == 0 && bytes[j..].starts_with(b"||") => {
                parts.push(&inner[part_start..j]);
                j += 2;
                part_start = j;
                continue;
            }
            _ => {}
        }
        j += 1;
    }

    parts.push(&inner[part_start..]);
    parts
}

fn is_satisfiable(alternative: &str, context: &RenderContext) -> bool {
    referenced_names(alternative)
        .iter()
        .all(|name| lookup(context, name).map_or(false, is_truthy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> RenderContext {
        let mut ctx = RenderContext::new();
        ctx.insert("wordlist".into(), json!("/usr/share/words.txt"));
        ctx.insert("resolvers".into(), json!(""));
        ctx.insert("recursive".into(), json!(false));
        ctx
    }

    #[test]
    fn test_first_satisfiable_alternative_wins() {
        let out = resolve_alternatives("-d x { -w {{wordlist}} || -passive }", &context()).unwrap();
        assert_eq!(out, "-d x -w {{wordlist}}");
    }

    #[test]
    fn test_falls_through_missing_and_falsy() {
        let out = resolve_alternatives(
            "{ -r {{resolvers}} || -rec {{recursive}} || -ns {{nameserver}} || -default }",
            &context(),
        )
        .unwrap();
        assert_eq!(out, "-default");
    }

    #[test]
    fn test_empty_alternative_removes_block() {
        let out = resolve_alternatives("scan { -r {{resolvers}} || } -silent", &context()).unwrap();
        assert_eq!(out, "scan  -silent");
    }

    #[test]
    fn test_no_satisfiable_alternative() {
        let err = resolve_alternatives("{ {{resolvers}} || {{missing}} }", &context()).unwrap_err();
        assert!(matches!(err, TemplateError::NoSatisfiableAlternative { .. }));
    }

    #[test]
    fn test_spans_without_or_are_verbatim() {
        let template = "awk '{print $1}' | sort {{wordlist}}";
        assert_eq!(resolve_alternatives(template, &context()).unwrap(), template);
    }

    #[test]
    fn test_unterminated_block_passes_through() {
        let template = "echo { -w {{wordlist}} || -x";
        assert_eq!(resolve_alternatives(template, &context()).unwrap(), template);
    }

    #[test]
    fn test_nested_braces_are_not_split() {
        let out = resolve_alternatives("{ -f '{a||b}' {{missing}} || -g }", &context()).unwrap();
        assert_eq!(out, "-g");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let template = "{ -w {{wordlist}} || -passive } { -r {{resolvers}} || -x }";
        let first = resolve_alternatives(template, &context()).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_alternatives(template, &context()).unwrap(), first);
        }
    }

    #[test]
    fn test_non_ascii_text_is_scanned() {
        let mut ctx = context();
        ctx.insert("lang".into(), json!("fr"));

        let template = "echo café → {{wordlist}} { -l {{lang}} || -x } ünïcode";
        let out = resolve_alternatives(template, &ctx).unwrap();
        assert_eq!(out, "echo café → {{wordlist}} -l {{lang}} ünïcode");

        let out = resolve_alternatives("{ -q é || -r {{resolvers}} }", &ctx).unwrap();
        assert_eq!(out, "-q é");
    }

    #[test]
    fn test_block_nested_in_plain_span_is_resolved() {
        let out = resolve_alternatives("awk '{ {{wordlist}} { -x {{missing}} || -y } }'", &context()).unwrap();
        assert_eq!(out, "awk '{ {{wordlist}} -y }'");
    }
}
