//! Output Module
//!
//! Output handling for tool steps:
//! - Resolving explicit and automatic output paths
//! - Persisting raw output, metadata and parsed records
//! - Best-effort parsing of tool stdout

mod artifacts;
mod parser;
mod paths;

pub use artifacts::{
    copy_with_retry, raw_text, save_artifacts, write_with_retry, SavedArtifacts, StepMetadata,
    StepOutput,
};
pub use parser::{OutputParser, ParsedOutput, ToolParser};
pub use paths::{resolve_output_paths, OutputPaths};
