//! Module Validation
//!
//! Turns the raw YAML shapes into validated declarations:
//! - Type discriminator and identity checks
//! - Variable kind/flag/default consistency
//! - Step action exclusivity (tool xor module)
//! - Unique step names and known dependency references
//!
//! Dependency cycles are deliberately left to the scheduler, which reports
//! them as a deadlock at run time.

use std::collections::HashSet;

use log::{debug, info};
use serde_json::Value;

use super::model::{
    ModuleDefinition, RawModule, RawStep, RawVariable, StepAction, StepDeclaration,
    VariableDeclaration, VariableKind,
};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingType,
    WrongType(String),
    MissingInfo,
    InvalidId(String),
    FlagOnNonBoolean(String),
    NonBooleanDefault(String),
    InvalidVariable { name: String, reason: String },
    EmptyStepName,
    DuplicateStepName(String),
    ToolAndModule(String),
    NoAction(String),
    UnknownDependency { step: String, dependency: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingType => write!(f, "Missing 'type' field"),
            Self::WrongType(t) => write!(f, "Unsupported type '{}' (expected 'module')", t),
            Self::MissingInfo => write!(f, "Missing 'info' block"),
            Self::InvalidId(id) => {
                write!(f, "Module id '{}' must be non-empty and contain no whitespace", id)
            }
            Self::FlagOnNonBoolean(name) => {
                write!(f, "Variable '{}' declares a flag but is not of type boolean", name)
            }
            Self::NonBooleanDefault(name) => {
                write!(f, "Boolean variable '{}' has a non-boolean default", name)
            }
            Self::InvalidVariable { name, reason } => {
                write!(f, "Variable '{}' is invalid: {}", name, reason)
            }
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::ToolAndModule(name) => {
                write!(f, "Step '{}' specifies both 'tool' and 'module'", name)
            }
            Self::NoAction(name) => {
                write!(f, "Step '{}' specifies neither 'tool' nor 'module'", name)
            }
            Self::UnknownDependency { step, dependency } => {
                write!(f, "Step '{}' depends on unknown step '{}'", step, dependency)
            }
        }
    }
}

/// Validates a raw module and converts it into a [`ModuleDefinition`].
///
/// All step-level problems are collected so a broken file reports every
/// issue at once.
pub(crate) fn validate_module(raw: RawModule) -> Result<ModuleDefinition, Vec<ValidationError>> {
    match raw.kind.as_deref().map(str::trim) {
        None => return Err(vec![ValidationError::MissingType]),
        Some("module") => {}
        Some(other) => return Err(vec![ValidationError::WrongType(other.to_string())]),
    }

    let info = raw.info.ok_or_else(|| vec![ValidationError::MissingInfo])?;
    if info.id.is_empty() || info.id.chars().any(char::is_whitespace) {
        return Err(vec![ValidationError::InvalidId(info.id)]);
    }

    let mut errors = Vec::new();

    let mut variables = Vec::new();
    for (key, value) in raw.vars {
        let Some(name) = key.as_str().map(str::to_string) else {
            errors.push(ValidationError::InvalidVariable {
                name: format!("{:?}", key),
                reason: "variable names must be strings".to_string(),
            });
            continue;
        };

        let parsed: RawVariable = if value.is_null() {
            RawVariable::default()
        } else {
            match serde_yaml::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    errors.push(ValidationError::InvalidVariable {
                        name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            }
        };

        match validate_variable(&name, parsed) {
            Ok(variable) => variables.push(variable),
            Err(e) => errors.push(e),
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut steps = Vec::new();
    for raw_step in raw.steps {
        match validate_step(raw_step) {
            Ok(step) => {
                if !seen.insert(step.name.clone()) {
                    errors.push(ValidationError::DuplicateStepName(step.name.clone()));
                }
                steps.push(step);
            }
            Err(e) => errors.push(e),
        }
    }

    for step in &steps {
        for dependency in &step.depends_on {
            if !seen.contains(dependency) {
                errors.push(ValidationError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        if step.depends_on.is_empty() {
            debug!("Step '{}' is a root step (no dependencies)", step.name);
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    info!(
        "Module '{}' validated: {} variables, {} steps",
        info.id,
        variables.len(),
        steps.len()
    );

    Ok(ModuleDefinition {
        info,
        variables,
        steps,
    })
}

fn validate_variable(name: &str, raw: RawVariable) -> Result<VariableDeclaration, ValidationError> {
    if raw.flag.is_some() && raw.kind != VariableKind::Boolean {
        return Err(ValidationError::FlagOnNonBoolean(name.to_string()));
    }

    let default = match (raw.kind, raw.default) {
        (_, None) | (_, Some(Value::Null)) => None,
        (VariableKind::Boolean, Some(Value::Bool(b))) => Some(Value::Bool(b)),
        (VariableKind::Boolean, Some(_)) => {
            return Err(ValidationError::NonBooleanDefault(name.to_string()))
        }
        (VariableKind::String, Some(Value::String(s))) => Some(Value::String(s)),
        (VariableKind::String, Some(Value::Number(n))) => Some(Value::String(n.to_string())),
        (VariableKind::String, Some(Value::Bool(b))) => Some(Value::String(b.to_string())),
        (VariableKind::String, Some(_)) => {
            return Err(ValidationError::InvalidVariable {
                name: name.to_string(),
                reason: "string default must be a scalar".to_string(),
            })
        }
    };

    Ok(VariableDeclaration {
        name: name.to_string(),
        kind: raw.kind,
        default,
        required: raw.required,
        flag: raw.flag,
        description: raw.description,
    })
}

fn validate_step(raw: RawStep) -> Result<StepDeclaration, ValidationError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(ValidationError::EmptyStepName);
    }

    let tool = raw.tool.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    let module = raw.module.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());

    let action = match (tool, module) {
        (Some(_), Some(_)) => return Err(ValidationError::ToolAndModule(name)),
        (None, None) => return Err(ValidationError::NoAction(name)),
        (Some(tool), None) => StepAction::Tool(tool),
        (None, Some(module)) => StepAction::Module(module),
    };

    Ok(StepDeclaration {
        name,
        action,
        args: raw.args,
        capture: raw.capture,
        stdin: raw.stdin,
        timeout: raw.timeout,
        condition: raw.condition.filter(|c| !c.trim().is_empty()),
        output: raw.output,
        filename: raw.filename.filter(|f| !f.trim().is_empty()),
        depends_on: raw.depends_on,
        parallel: raw.parallel,
        path: raw.path.filter(|p| !p.trim().is_empty()),
    })
}
