//! Runtime Options
//!
//! One [`RuntimeOption`] per declared variable. Options start from their
//! declared defaults, are changed by the caller through
//! [`OptionSet::update_option`], and are read once when a run starts.

use std::fmt;
use std::path::Path;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::template::expand_pwd;

use super::model::{ModuleDefinition, VariableKind};

/// A resolved option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Text(String),
    Flag(bool),
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// Parses the usual spellings of a boolean.
pub(crate) fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Like [`parse_bool`], but any other non-empty text counts as set.
pub(crate) fn coerce_flag(text: &str) -> bool {
    parse_bool(text).unwrap_or(true)
}

/// Runtime state of one declared variable.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOption {
    pub name: String,
    pub kind: VariableKind,
    pub value: Option<OptionValue>,
    pub required: bool,
    pub flag: Option<String>,
    pub description: String,
}

impl RuntimeOption {
    pub fn is_set(&self) -> bool {
        match &self.value {
            None => false,
            Some(OptionValue::Text(text)) => !text.is_empty(),
            Some(OptionValue::Flag(_)) => true,
        }
    }

    /// Value as placed in the render context, or `None` when unset.
    fn context_value(&self, project_path: &Path) -> Option<Value> {
        match (&self.value, self.kind) {
            (None, _) => None,
            (Some(OptionValue::Flag(b)), VariableKind::Boolean) => Some(match &self.flag {
                Some(flag) if *b => Value::String(flag.clone()),
                Some(_) => Value::String(String::new()),
                None => Value::Bool(*b),
            }),
            (Some(OptionValue::Text(text)), _) if text.is_empty() => None,
            (Some(value), _) => Some(Value::String(expand_pwd(&value.to_string(), project_path))),
        }
    }
}

/// The full set of runtime options for a module, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSet {
    options: Vec<RuntimeOption>,
}

impl OptionSet {
    /// Creates options from the declared variables and their defaults.
    pub fn from_definition(definition: &ModuleDefinition) -> Self {
        let options = definition
            .variables
            .iter()
            .map(|var| RuntimeOption {
                name: var.name.clone(),
                kind: var.kind,
                value: var.default.as_ref().and_then(|default| match (var.kind, default) {
                    (VariableKind::Boolean, Value::Bool(b)) => Some(OptionValue::Flag(*b)),
                    (_, Value::String(s)) => Some(OptionValue::Text(s.clone())),
                    _ => None,
                }),
                required: var.required,
                flag: var.flag.clone(),
                description: var.description.clone(),
            })
            .collect();

        Self { options }
    }

    /// Sets an option. Returns false only when the name is not declared.
    ///
    /// Boolean options accept `true/false/yes/no/1/0/on/off`; an empty
    /// text value clears a string option.
    pub fn update_option(&mut self, name: &str, value: impl Into<OptionValue>) -> bool {
        let Some(option) = self.options.iter_mut().find(|o| o.name == name) else {
            debug!("Ignoring unknown option '{}'", name);
            return false;
        };

        let value = value.into();
        option.value = match (option.kind, value) {
            (VariableKind::Boolean, OptionValue::Text(text)) => {
                let flag = parse_bool(&text).unwrap_or_else(|| {
                    warn!(
                        "Option '{}' expects a boolean, treating '{}' as true",
                        name, text
                    );
                    true
                });
                Some(OptionValue::Flag(flag))
            }
            (VariableKind::Boolean, flag) => Some(flag),
            (VariableKind::String, OptionValue::Text(text)) if text.is_empty() => None,
            (VariableKind::String, OptionValue::Flag(b)) => Some(OptionValue::Text(b.to_string())),
            (VariableKind::String, text) => Some(text),
        };

        debug!("Option '{}' set to {:?}", name, option.value);
        true
    }

    /// Names of required options that are still unset.
    pub fn validate_options(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|o| o.required && !o.is_set())
            .map(|o| o.name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeOption> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Writes every set option into the render context.
    ///
    /// Set options override same-named entries already present; unset
    /// options leave the context untouched.
    pub fn seed_context(&self, context: &mut Map<String, Value>, project_path: &Path) {
        for option in &self.options {
            if let Some(value) = option.context_value(project_path) {
                context.insert(option.name.clone(), value);
            }
        }
    }
}
