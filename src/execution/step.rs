//! Individual Step Execution
//!
//! Handles the execution of a single module step including:
//! - Condition evaluation and argument rendering
//! - Executable resolution (aliases, `path` overrides)
//! - Stdin assembly from captured dependency output
//! - Timeouts, output targets and artifact persistence
//! - Recursive sub-module runs

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::module::{
    coerce_flag, ModuleDefinition, OptionValue, StepAction, StepDeclaration, VariableKind,
};
use crate::output::{
    copy_with_retry, resolve_output_paths, save_artifacts, write_with_retry, OutputParser,
    StepOutput,
};
use crate::template::{evaluate_condition, expand_pwd, lookup, render, value_to_string, RenderContext};

use super::engine::{ModuleEngine, RunContext};
use super::process::run_shell;

/// Maximum sub-module nesting depth.
pub const MAX_MODULE_DEPTH: usize = 8;

/// Tool names rewritten before execution.
static TOOL_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([("python", "python3"), ("pip", "pip3")])
});

/// Outcome of one completed (or skipped) step.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub output_file: Option<PathBuf>,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub command: Option<String>,
}

impl StepResult {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Entry stored in the render context under the step name.
    pub fn context_entry(&self) -> Value {
        json!({
            "output": self.output_file.as_ref().map(|p| p.display().to_string()),
            "stdout": self.stdout,
            "stderr": self.stderr,
            "return_code": self.return_code,
            "skipped": self.skipped,
        })
    }
}

/// Parses `<n>s`, `<n>m`, `<n>h` or plain seconds.
///
/// Returns `None` for empty, unparsable or non-positive values.
pub fn parse_timeout(text: &str) -> Option<Duration> {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return None;
    }

    let (number, unit) = match text.char_indices().last() {
        Some((i, c @ ('s' | 'm' | 'h'))) => (&text[..i], c),
        _ => (text.as_str(), 's'),
    };

    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let seconds = match unit {
        'h' => value * 3600.0,
        'm' => value * 60.0,
        _ => value,
    };
    Some(Duration::from_secs_f64(seconds))
}

/// Everything a worker needs to run steps of one module run.
pub(crate) struct StepExecutor {
    pub definition: Arc<ModuleDefinition>,
    /// Directory of the module file, for relative sub-module references
    pub module_dir: Option<PathBuf>,
    pub project_path: PathBuf,
    pub run: RunContext,
    pub parser: OutputParser,
}

impl StepExecutor {
    /// Executes `step` against a context snapshot taken at submission.
    pub fn execute(&self, step: &StepDeclaration, snapshot: &RenderContext) -> Result<StepResult, EngineError> {
        if let Some(condition) = &step.condition {
            let passed = evaluate_condition(condition, snapshot)
                .map_err(|e| EngineError::from_template(&step.name, e))?;
            if !passed {
                info!("Skipping step '{}': condition '{}' is false", step.name, condition);
                return Ok(StepResult::skipped(format!(
                    "condition '{}' evaluated to false",
                    condition
                )));
            }
        }

        match &step.action {
            StepAction::Tool(tool) => self.execute_tool(step, tool, snapshot),
            StepAction::Module(reference) => self.execute_module(step, reference, snapshot),
        }
    }

    fn execute_tool(&self, step: &StepDeclaration, tool: &str, snapshot: &RenderContext) -> Result<StepResult, EngineError> {
        let args = render(&step.args, snapshot).map_err(|e| EngineError::from_template(&step.name, e))?;
        let executable = self.resolve_executable(step, tool, snapshot)?;
        let command = if args.trim().is_empty() {
            executable
        } else {
            format!("{} {}", executable, args.trim())
        };

        let paths = resolve_output_paths(step, snapshot, &self.project_path, &self.definition.info.id)
            .map_err(|e| EngineError::from_template(&step.name, e))?;

        let timeout = match &step.timeout {
            Some(raw) => {
                let rendered = render(raw, snapshot).map_err(|e| EngineError::from_template(&step.name, e))?;
                let parsed = parse_timeout(&rendered);
                if parsed.is_none() {
                    warn!("Step '{}': ignoring invalid timeout '{}'", step.name, rendered);
                }
                parsed
            }
            None => None,
        };

        let stdin = step.stdin.then(|| build_stdin(&self.definition, step, snapshot));

        fs::create_dir_all(&self.project_path)?;
        let primary_before = paths.primary.as_deref().and_then(modified_time);

        info!("Running step '{}': {}", step.name, command);
        let output = run_shell(&command, &self.project_path, stdin, timeout).map_err(|source| {
            EngineError::Spawn {
                step: step.name.clone(),
                command: command.clone(),
                source,
            }
        })?;

        save_artifacts(
            paths.artifact_dir(),
            &StepOutput {
                step_name: &step.name,
                tool,
                module_id: &self.definition.info.id,
                module_name: &self.definition.info.name,
                command: &command,
                stdout: &output.stdout,
                stderr: &output.stderr,
                exit_code: output.code,
                duration: output.duration,
                timed_out: output.timed_out,
            },
            &self.parser,
        );

        if let Some(primary) = &paths.primary {
            let created_by_tool = modified_time(primary).map_or(false, |now| Some(now) != primary_before);
            if !created_by_tool {
                if let Err(e) = write_with_retry(primary, output.stdout.as_bytes()) {
                    warn!("{}", e);
                }
            }
            if let Some(mirror) = &paths.mirror {
                if let Err(e) = copy_with_retry(primary, mirror) {
                    warn!("{}", e);
                }
            }
        }

        if output.timed_out {
            let timeout = EngineError::Timeout {
                step: step.name.clone(),
                command: command.clone(),
                seconds: timeout.unwrap_or_default().as_secs(),
            };
            warn!("{}; continuing with partial output", timeout);
        } else if output.code != Some(0) {
            return Err(EngineError::CommandExecution {
                step: step.name.clone(),
                command,
                code: output.code,
                stderr: output.stderr,
            });
        }

        debug!("Step '{}' finished in {:?}", step.name, output.duration);
        Ok(StepResult {
            skipped: false,
            skip_reason: None,
            stdout: output.stdout,
            stderr: output.stderr,
            output_file: Some(paths.context_output().to_path_buf()),
            return_code: output.code,
            timed_out: output.timed_out,
            duration_ms: output.duration.as_millis() as u64,
            command: Some(command),
        })
    }

    fn resolve_executable(&self, step: &StepDeclaration, tool: &str, snapshot: &RenderContext) -> Result<String, EngineError> {
        if let Some(alias) = TOOL_ALIASES.get(tool) {
            return Ok(alias.to_string());
        }

        let Some(raw) = &step.path else {
            return Ok(tool.to_string());
        };

        let rendered = render(raw, snapshot).map_err(|e| EngineError::from_template(&step.name, e))?;
        let expanded = expand_pwd(rendered.trim(), &self.project_path);
        let mut path = PathBuf::from(expanded.trim_matches(|c| c == '"' || c == '\''));
        if path.is_relative() {
            path = self.project_path.join(path);
        }
        if path.is_dir() {
            path = path.join(tool);
        }
        if !path.exists() {
            return Err(EngineError::ToolNotFound {
                step: step.name.clone(),
                path,
            });
        }

        let display = path.display().to_string();
        if display.contains(char::is_whitespace) {
            Ok(format!("'{}'", display))
        } else {
            Ok(display)
        }
    }

    fn execute_module(&self, step: &StepDeclaration, reference: &str, snapshot: &RenderContext) -> Result<StepResult, EngineError> {
        let depth = self.run.depth() + 1;
        if depth > MAX_MODULE_DEPTH {
            return Err(EngineError::RecursionLimit {
                step: step.name.clone(),
                limit: MAX_MODULE_DEPTH,
            });
        }

        let reference = render(reference, snapshot).map_err(|e| EngineError::from_template(&step.name, e))?;
        let reference = reference.trim();
        let path = self
            .resolve_module(reference)
            .ok_or_else(|| EngineError::ModuleNotFound {
                step: step.name.clone(),
                reference: reference.to_string(),
            })?;

        info!("Step '{}': running sub-module {}", step.name, path.display());
        let mut child = ModuleEngine::load(&path)?;
        copy_matching_options(&mut child, snapshot);

        let child_run = self.run.nested(&self.project_path);
        let started = std::time::Instant::now();
        let results = child.run(&child_run)?;
        let stdout = serde_json::to_string(&results)?;

        Ok(StepResult {
            stdout,
            return_code: Some(0),
            duration_ms: started.elapsed().as_millis() as u64,
            command: Some(format!("module:{}", reference)),
            ..StepResult::default()
        })
    }

    /// Tries, in order: the reference as a path, relative to the parent
    /// module, `modules/<ref>.yml|.yaml` and `<ref>.yml|.yaml` beside the
    /// parent, then the caller's resolver.
    fn resolve_module(&self, reference: &str) -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from(reference)];
        if let Some(dir) = &self.module_dir {
            candidates.push(dir.join(reference));
            for ext in ["yml", "yaml"] {
                candidates.push(dir.join("modules").join(format!("{}.{}", reference, ext)));
            }
            for ext in ["yml", "yaml"] {
                candidates.push(dir.join(format!("{}.{}", reference, ext)));
            }
        }

        candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .or_else(|| {
                self.run
                    .resolver()
                    .and_then(|resolver| resolver.resolve(reference))
            })
    }
}

/// Copies render-context values whose names match the child's options.
fn copy_matching_options(child: &mut ModuleEngine, snapshot: &RenderContext) {
    let targets: Vec<(String, VariableKind)> = child
        .options()
        .iter()
        .map(|o| (o.name.clone(), o.kind))
        .collect();

    for (name, kind) in targets {
        let Some(value) = snapshot.get(&name) else {
            continue;
        };
        let option = match (kind, value) {
            (_, Value::Null) => continue,
            (VariableKind::Boolean, Value::Bool(b)) => OptionValue::Flag(*b),
            (VariableKind::Boolean, other) => OptionValue::Flag(coerce_flag(&value_to_string(other))),
            (VariableKind::String, other) => OptionValue::Text(value_to_string(other)),
        };
        debug!("Passing '{}' to sub-module", name);
        child.update_option(&name, option);
    }
}

/// Order-preserving union of lines from the captured stdout of the step's
/// dependencies.
fn build_stdin(definition: &ModuleDefinition, step: &StepDeclaration, snapshot: &RenderContext) -> String {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for dependency in &step.depends_on {
        let captured = definition.get_step(dependency).map_or(false, |d| d.capture);
        if !captured {
            continue;
        }
        let Some(stdout) = lookup(snapshot, &format!("{}.stdout", dependency)).and_then(Value::as_str) else {
            continue;
        };
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if seen.insert(line.to_string()) {
                lines.push(line);
            }
        }
    }

    let mut stdin = lines.join("\n");
    if !stdin.is_empty() {
        stdin.push('\n');
    }
    stdin
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
