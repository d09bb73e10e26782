//! Output path resolution for tool steps.

use std::path::{Path, PathBuf};

use crate::error::TemplateError;
use crate::module::StepDeclaration;
use crate::template::{expand_pwd, render, RenderContext};

/// Where a step's output goes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    /// `<project>/<module_id>/<step>.txt`, always written
    pub auto: PathBuf,
    /// Explicit `output.path` or `filename` target
    pub primary: Option<PathBuf>,
    /// Copy of an out-of-project primary target inside the project
    pub mirror: Option<PathBuf>,
}

impl OutputPaths {
    /// Directory holding the per-step artifacts.
    pub fn artifact_dir(&self) -> &Path {
        self.auto.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Path exposed to later steps as `<step>.output`.
    pub fn context_output(&self) -> &Path {
        self.primary.as_deref().unwrap_or(&self.auto)
    }
}

/// Resolves the output targets of `step`, in precedence order
/// `output.path`, then `output.filename`/`filename`.
pub fn resolve_output_paths(
    step: &StepDeclaration,
    context: &RenderContext,
    project_path: &Path,
    module_id: &str,
) -> Result<OutputPaths, TemplateError> {
    let auto = project_path
        .join(module_id)
        .join(format!("{}.txt", step.name));

    let explicit_path = step.output.as_ref().and_then(|o| o.path.as_deref());
    let explicit_name = step
        .output
        .as_ref()
        .and_then(|o| o.filename.as_deref())
        .or(step.filename.as_deref());

    let (primary, mirror) = if let Some(raw) = explicit_path {
        let path = render_path(raw, context, project_path)?;
        let mirror = if path.starts_with(project_path) {
            None
        } else {
            path.file_name().map(|name| project_path.join(name))
        };
        (Some(path), mirror)
    } else if let Some(raw) = explicit_name {
        (Some(render_path(raw, context, project_path)?), None)
    } else {
        (None, None)
    };

    Ok(OutputPaths {
        auto,
        primary,
        mirror,
    })
}

fn render_path(raw: &str, context: &RenderContext, project_path: &Path) -> Result<PathBuf, TemplateError> {
    let rendered = render(raw, context)?;
    let expanded = expand_pwd(rendered.trim(), project_path);
    let unquoted = expanded.trim_matches(|c| c == '"' || c == '\'');

    let path = PathBuf::from(unquoted);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(project_path.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::OutputTarget;
    use serde_json::json;

    fn context() -> RenderContext {
        let mut ctx = RenderContext::new();
        ctx.insert("target".into(), json!("example.com"));
        ctx
    }

    #[test]
    fn test_auto_path_only() {
        let step = StepDeclaration::tool("enum", "subfinder", "");
        let paths = resolve_output_paths(&step, &context(), Path::new("/p"), "subs").unwrap();
        assert_eq!(paths.auto, PathBuf::from("/p/subs/enum.txt"));
        assert_eq!(paths.primary, None);
        assert_eq!(paths.context_output(), Path::new("/p/subs/enum.txt"));
        assert_eq!(paths.artifact_dir(), Path::new("/p/subs"));
    }

    #[test]
    fn test_output_path_outside_project_is_mirrored() {
        let mut step = StepDeclaration::tool("ports", "naabu", "");
        step.output = Some(OutputTarget {
            path: Some("'/tmp/{{target}}-ports.txt'".into()),
            filename: None,
        });

        let paths = resolve_output_paths(&step, &context(), Path::new("/p"), "m").unwrap();
        assert_eq!(paths.primary, Some(PathBuf::from("/tmp/example.com-ports.txt")));
        assert_eq!(paths.mirror, Some(PathBuf::from("/p/example.com-ports.txt")));
    }

    #[test]
    fn test_output_path_inside_project() {
        let mut step = StepDeclaration::tool("ports", "naabu", "");
        step.output = Some(OutputTarget {
            path: Some("$(pwd)/scans/ports.txt".into()),
            filename: Some("ignored.txt".into()),
        });

        let paths = resolve_output_paths(&step, &context(), Path::new("/p"), "m").unwrap();
        assert_eq!(paths.primary, Some(PathBuf::from("/p/scans/ports.txt")));
        assert_eq!(paths.mirror, None);
    }

    #[test]
    fn test_filename_under_project() {
        let mut step = StepDeclaration::tool("probe", "httpx", "");
        step.filename = Some("{{target}}-live.txt".into());

        let paths = resolve_output_paths(&step, &context(), Path::new("/p"), "m").unwrap();
        assert_eq!(paths.primary, Some(PathBuf::from("/p/example.com-live.txt")));
        assert_eq!(paths.context_output(), Path::new("/p/example.com-live.txt"));
    }

    #[test]
    fn test_undefined_variable_in_path() {
        let mut step = StepDeclaration::tool("probe", "httpx", "");
        step.filename = Some("{{nope}}.txt".into());
        assert!(resolve_output_paths(&step, &context(), Path::new("/p"), "m").is_err());
    }
}
