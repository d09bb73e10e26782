//! ReconFlow - Module Execution Engine
//!
//! Runs declarative YAML "modules" that wrap external reconnaissance tools.
//! A module declares variables and a graph of steps; the engine renders each
//! step's arguments, runs ready steps in parallel, pipes captured output
//! between them and persists every step's output under the project
//! directory.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`module`]: YAML schema, validation, runtime options and the registry
//! - [`template`]: `{{var}}` substitution, `{a || b}` alternatives, conditions
//! - [`execution`]: Run entry point, scheduler, step executor
//! - [`output`]: Output paths, artifact persistence and stdout parsing
//! - [`monitoring`]: Terminal progress line
//!
//! # Example
//!
//! ```rust,no_run
//! use reconflow::{ModuleEngine, RunContext};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a module from YAML
//!     let mut engine = ModuleEngine::load("modules/recon/ports.yml")?;
//!
//!     // Set variables
//!     engine.update_option("target", "example.com");
//!     engine.update_option("service_scan", true);
//!
//!     // Execute the module
//!     let results = engine.run(&RunContext::new().with_project_path("/data/acme"))?;
//!     println!("{} steps finished", results.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod module;
pub mod monitoring;
pub mod output;
pub mod template;

// Re-export commonly used types
pub use error::{EngineError, StepFailure, TemplateError};
pub use execution::{ModuleEngine, RunContext, StepResult};
pub use module::{load_module, ModuleDefinition, ModuleRegistry, ModuleResolver, StepDeclaration};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ReconFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ReconFlow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = StepDeclaration::tool("test", "echo", "hello");
        assert_eq!(step.name, "test");
        assert_eq!(step.label(), "echo");
    }

    #[test]
    fn test_module_exports_registry() {
        let registry = ModuleRegistry::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
