//! Module Execution
//!
//! Provides the engine that runs a module's steps, including dependency
//! scheduling, exclusive steps, process timeouts and sub-module recursion.
//!
//! # Architecture
//!
//! - [`engine`]: Run entry point, context seeding and the scheduling loop
//! - [`scheduler`]: Pending/running/completed bookkeeping and admission rules
//! - [`step`]: Individual step execution logic
//! - [`process`]: `bash -c` runner with stdin, capture and timeouts

pub mod engine;
pub mod process;
pub mod scheduler;
pub mod step;

pub use engine::{ModuleEngine, RunContext, DEFAULT_THREADS};
pub use process::{run_shell, ProcessOutput};
pub use scheduler::ExecutionState;
pub use step::{parse_timeout, StepResult, MAX_MODULE_DEPTH};
