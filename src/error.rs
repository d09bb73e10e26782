//! Engine Errors
//!
//! Every failure the engine can surface, from load-time schema problems to
//! per-step command failures and scheduler deadlocks.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::execution::StepResult;

/// Errors produced by the template and condition mini-languages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("undefined variable '{name}' in template '{template}'")]
    UndefinedVariable { name: String, template: String },

    #[error("no satisfiable alternative in '{{{block}}}'")]
    NoSatisfiableAlternative { block: String },

    #[error("invalid condition expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// A single step failure, kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step: String,
    pub kind: &'static str,
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.step, self.kind, self.message)
    }
}

fn join_failures(failures: &[StepFailure]) -> String {
    if failures.is_empty() {
        return "none".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while loading or running a module.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("schema error in '{path}': {message}")]
    Schema { path: String, message: String },

    #[error("missing required variables: {}", .0.join(", "))]
    MissingVariable(Vec<String>),

    #[error("step '{step}': {source}")]
    ConditionalArgument {
        step: String,
        #[source]
        source: TemplateError,
    },

    #[error("step '{step}': {source}")]
    Template {
        step: String,
        #[source]
        source: TemplateError,
    },

    #[error("step '{step}': executable not found at '{}'", .path.display())]
    ToolNotFound { step: String, path: PathBuf },

    #[error("step '{step}': module '{reference}' could not be resolved")]
    ModuleNotFound { step: String, reference: String },

    #[error("step '{step}': module nesting exceeds {limit} levels")]
    RecursionLimit { step: String, limit: usize },

    #[error("step '{step}': command `{command}` exited with {}{}", exit_label(.code), stderr_tail(.stderr))]
    CommandExecution {
        step: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("step '{step}': failed to start `{command}`: {source}")]
    Spawn {
        step: String,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("step '{step}': `{command}` timed out after {seconds}s")]
    Timeout {
        step: String,
        command: String,
        seconds: u64,
    },

    #[error("deadlock: failed steps [{}], blocked steps [{}]; failures: {}", .failed.join(", "), .blocked.join(", "), join_failures(.failures))]
    Deadlock {
        failed: Vec<String>,
        blocked: Vec<String>,
        failures: Vec<StepFailure>,
        /// Steps that finished before the run stalled
        results: BTreeMap<String, StepResult>,
    },

    #[error("{} step(s) failed: {}", .failures.len(), join_failures(.failures))]
    StepsFailed {
        failures: Vec<StepFailure>,
        results: BTreeMap<String, StepResult>,
    },

    #[error("failed to persist '{}': {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Short, stable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema",
            Self::MissingVariable(_) => "missing-variable",
            Self::ConditionalArgument { .. } => "conditional-argument",
            Self::Template { .. } => "template",
            Self::ToolNotFound { .. } => "tool-not-found",
            Self::ModuleNotFound { .. } => "module-not-found",
            Self::RecursionLimit { .. } => "recursion-limit",
            Self::CommandExecution { .. } | Self::Spawn { .. } => "command-execution",
            Self::Timeout { .. } => "timeout",
            Self::Deadlock { .. } => "deadlock",
            Self::StepsFailed { .. } => "steps-failed",
            Self::Persistence { .. } => "persistence",
            Self::Worker(_) => "worker",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Results of the steps that completed before a failed run ended.
    pub fn partial_results(&self) -> Option<&BTreeMap<String, StepResult>> {
        match self {
            Self::Deadlock { results, .. } | Self::StepsFailed { results, .. } => Some(results),
            _ => None,
        }
    }

    /// Wraps a template error for a step, keeping alternative failures distinct.
    pub fn from_template(step: &str, source: TemplateError) -> Self {
        match source {
            TemplateError::NoSatisfiableAlternative { .. } => Self::ConditionalArgument {
                step: step.to_string(),
                source,
            },
            _ => Self::Template {
                step: step.to_string(),
                source,
            },
        }
    }

    pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            path: path.into(),
            message: message.into(),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let last = trimmed.lines().last().unwrap_or_default();
    format!(": {}", last)
}
