//! Module Data Model
//!
//! Typed declarations for a YAML module: metadata, declared variables and
//! the ordered step list.
//!
//! # Example YAML Format
//!
//! ```yaml
//! type: module
//! info:
//!   id: subdomain-enum
//!   name: Passive subdomain enumeration
//! vars:
//!   domain: { type: string, required: true }
//!   recursive: { type: boolean, default: false, flag: "-recursive" }
//! steps:
//!   - name: subfinder
//!     tool: subfinder
//!     args: "-d {{domain}} {{recursive}} -silent"
//!     capture: true
//!
//!   - name: probe
//!     tool: httpx
//!     args: "-silent -json"
//!     stdin: true
//!     depends_on: [subfinder]
//!     timeout: 10m
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Descriptive metadata from the `info` block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    /// Identity and lookup key; never contains whitespace
    pub id: String,

    #[serde(default = "default_unknown")]
    pub name: String,

    #[serde(default = "default_unknown")]
    pub author: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tag: String,
}

fn default_unknown() -> String {
    "Unknown".to_string()
}

/// Declared type of a module variable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    String,
    #[serde(alias = "bool")]
    Boolean,
}

/// A variable declared under `vars`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub name: String,
    pub kind: VariableKind,
    pub default: Option<Value>,
    pub required: bool,
    /// Text rendered in place of a `true` boolean (e.g. `-sV`)
    pub flag: Option<String>,
    pub description: String,
}

/// Explicit output target of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OutputTarget {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub filename: Option<String>,
}

/// What a step runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// An external command, by name
    Tool(String),
    /// Another module, by path, id or registry key
    Module(String),
}

/// A validated step declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDeclaration {
    pub name: String,
    pub action: StepAction,
    pub args: String,
    /// Keep stdout available for stdin piping into dependents
    pub capture: bool,
    /// Build stdin from the captured stdout of dependencies
    pub stdin: bool,
    pub timeout: Option<String>,
    pub condition: Option<String>,
    pub output: Option<OutputTarget>,
    pub filename: Option<String>,
    pub depends_on: Vec<String>,
    pub parallel: bool,
    /// Explicit location of the tool executable
    pub path: Option<String>,
}

impl StepDeclaration {
    /// Creates a tool step with default settings.
    ///
    /// ```
    /// use reconflow::module::StepDeclaration;
    ///
    /// let step = StepDeclaration::tool("ports", "naabu", "-host {{target}}")
    ///     .depends_on("resolve")
    ///     .with_timeout("5m");
    /// assert_eq!(step.depends_on, vec!["resolve"]);
    /// ```
    pub fn tool(name: impl Into<String>, tool: impl Into<String>, args: impl Into<String>) -> Self {
        Self::with_action(name, StepAction::Tool(tool.into().trim().to_string()), args)
    }

    /// Creates a step that runs another module.
    pub fn module(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::with_action(name, StepAction::Module(reference.into().trim().to_string()), "")
    }

    fn with_action(name: impl Into<String>, action: StepAction, args: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            action,
            args: args.into(),
            capture: false,
            stdin: false,
            timeout: None,
            condition: None,
            output: None,
            filename: None,
            depends_on: Vec::new(),
            parallel: true,
            path: None,
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Marks the step as requiring exclusive execution.
    pub fn exclusive(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Name of the tool, or the module reference, for display purposes.
    pub fn label(&self) -> String {
        match &self.action {
            StepAction::Tool(tool) => tool.clone(),
            StepAction::Module(reference) => format!("module:{}", reference),
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self.action, StepAction::Tool(_))
    }
}

/// A loaded, validated module definition. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDefinition {
    pub info: ModuleInfo,
    /// Declared variables, in declaration order
    pub variables: Vec<VariableDeclaration>,
    /// Steps, in declaration order
    pub steps: Vec<StepDeclaration>,
}

impl ModuleDefinition {
    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDeclaration> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Gets a variable declaration by name.
    pub fn get_variable(&self, name: &str) -> Option<&VariableDeclaration> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&StepDeclaration> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns the number of steps in the module.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the module has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Raw YAML shapes, converted into the validated types by the parser
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
pub(crate) struct RawModule {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(alias = "metadata")]
    pub info: Option<ModuleInfo>,

    #[serde(default, alias = "variables")]
    pub vars: serde_yaml::Mapping,

    #[serde(default)]
    pub steps: Vec<RawStep>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct RawVariable {
    #[serde(rename = "type", default)]
    pub kind: VariableKind,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub flag: Option<String>,

    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RawStep {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub tool: Option<String>,

    #[serde(default)]
    pub module: Option<String>,

    #[serde(default)]
    pub args: String,

    #[serde(default)]
    pub capture: bool,

    #[serde(default)]
    pub stdin: bool,

    #[serde(default, deserialize_with = "string_or_number")]
    pub timeout: Option<String>,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub output: Option<OutputTarget>,

    #[serde(default)]
    pub filename: Option<String>,

    #[serde(default, deserialize_with = "single_or_vec")]
    pub depends_on: Vec<String>,

    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default)]
    pub path: Option<String>,
}

fn default_parallel() -> bool {
    true
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.trim().to_string()]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Accepts `timeout: 30` as well as `timeout: "30s"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(de::Error::custom("Expected string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_step_defaults() {
        let step = StepDeclaration::tool(" scan ", "nmap", "-sV {{target}}");
        assert_eq!(step.name, "scan");
        assert_eq!(step.action, StepAction::Tool("nmap".into()));
        assert!(step.parallel);
        assert!(!step.capture);
        assert!(!step.stdin);
        assert!(step.depends_on.is_empty());
        assert!(step.is_tool());
    }

    #[test]
    fn test_module_step_label() {
        let step = StepDeclaration::module("nested", "recon/passive");
        assert_eq!(step.label(), "module:recon/passive");
        assert!(!step.is_tool());
    }

    #[test]
    fn test_builder_chain() {
        let step = StepDeclaration::tool("probe", "httpx", "-silent")
            .depends_on("enum")
            .with_stdin()
            .with_capture()
            .with_timeout("10m")
            .with_condition("{probe_enabled}")
            .exclusive();

        assert_eq!(step.depends_on, vec!["enum"]);
        assert!(step.stdin && step.capture);
        assert_eq!(step.timeout.as_deref(), Some("10m"));
        assert!(!step.parallel);
    }

    #[test]
    fn test_raw_step_single_dependency_string() {
        let yaml = "name: b\ntool: echo\ndepends_on: a\ntimeout: 30\n";
        let raw: RawStep = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(raw.depends_on, vec!["a"]);
        assert_eq!(raw.timeout.as_deref(), Some("30"));
        assert!(raw.parallel);
    }

    #[test]
    fn test_variable_kind_parsing() {
        let raw: RawVariable = serde_yaml::from_str("type: boolean\nflag: -v\n").unwrap();
        assert_eq!(raw.kind, VariableKind::Boolean);

        let raw: RawVariable = serde_yaml::from_str("default: x\n").unwrap();
        assert_eq!(raw.kind, VariableKind::String);
    }

    #[test]
    fn test_definition_lookups() {
        let definition = ModuleDefinition {
            info: ModuleInfo {
                id: "m".into(),
                name: "M".into(),
                author: "a".into(),
                description: String::new(),
                tag: String::new(),
            },
            variables: Vec::new(),
            steps: vec![
                StepDeclaration::tool("a", "echo", "1"),
                StepDeclaration::tool("b", "echo", "2").depends_on("a"),
            ],
        };

        assert_eq!(definition.len(), 2);
        assert!(definition.get_step("b").is_some());
        assert!(definition.get_step("z").is_none());
        assert_eq!(definition.root_steps().len(), 1);
    }
}
