//! Module Definition Module
//!
//! This module handles the schema side of a ReconFlow module:
//! - YAML parsing into typed declarations
//! - Validation of variables, steps and dependencies
//! - Runtime options seeded from declared defaults
//! - An explicit registry for sub-module lookup

mod model;
mod options;
mod parser;
mod registry;
mod validator;

pub use model::{
    ModuleDefinition, ModuleInfo, OutputTarget, StepAction, StepDeclaration, VariableDeclaration,
    VariableKind,
};
pub use options::{OptionSet, OptionValue, RuntimeOption};
pub use parser::{load_module, parse_module};
pub use registry::{ModuleRegistry, ModuleResolver, RegistryEntry};
pub use validator::ValidationError;

pub(crate) use options::coerce_flag;
