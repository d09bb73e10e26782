//! Module Parser
//!
//! Loads module definitions from YAML files or strings.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::EngineError;

use super::model::{ModuleDefinition, RawModule};
use super::validator::validate_module;

/// Loads and validates a module from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use reconflow::module::load_module;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let module = load_module("modules/recon/subdomains.yml")?;
///     println!("Loaded {} steps", module.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_module(path: impl AsRef<Path>) -> Result<ModuleDefinition, EngineError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    info!("Loading module from: {}", display);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::schema(
            &display,
            format!("failed to read file: {}. Check that the file exists and is readable.", e),
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_module(&yaml_content, &display)
}

/// Parses and validates a module from YAML text.
///
/// `origin` only labels error messages.
pub fn parse_module(yaml: &str, origin: &str) -> Result<ModuleDefinition, EngineError> {
    let raw: RawModule = serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::schema(origin, format!("failed to parse YAML: {}", e)))?;

    validate_module(raw).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        EngineError::schema(origin, messages.join("; "))
    })
}
