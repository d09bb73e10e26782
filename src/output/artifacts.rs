//! Step Artifacts
//!
//! Every executed tool step leaves three files in the module's artifact
//! directory: `<step>.txt` (raw output), `<step>.meta.json` (execution
//! metadata) and, when parsing yields records, `<step>.json`.
//!
//! Writes are retried once; a second failure is logged and never fails the
//! step.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;

use crate::error::EngineError;

use super::parser::OutputParser;

const RETRY_DELAY: Duration = Duration::from_millis(150);
const STDERR_MARKER: &str = "--- STDERR ---";

/// What a finished process produced, as needed for persistence.
#[derive(Debug, Clone)]
pub struct StepOutput<'a> {
    pub step_name: &'a str,
    pub tool: &'a str,
    pub module_id: &'a str,
    pub module_name: &'a str,
    pub command: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Contents of `<step>.meta.json`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepMetadata {
    pub step_name: String,
    pub tool: String,
    pub module_id: String,
    pub module_name: String,
    pub timestamp: String,
    pub duration_seconds: f64,
    pub line_count: usize,
    pub file_size: u64,
    pub command: String,
    pub exit_code: Option<i32>,
    pub parser: String,
    pub record_count: usize,
    pub timed_out: bool,
}

/// Paths written by [`save_artifacts`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedArtifacts {
    pub raw: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub records: Option<PathBuf>,
}

/// Writes `contents` to `path`, creating parent directories, retrying once.
pub fn write_with_retry(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    let attempt = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    };

    attempt().or_else(|first| {
        debug!("Write to {} failed ({}), retrying", path.display(), first);
        thread::sleep(RETRY_DELAY);
        attempt()
    })
    .map_err(|source| EngineError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

/// Copies `from` to `to`, retrying once.
pub fn copy_with_retry(from: &Path, to: &Path) -> Result<(), EngineError> {
    let attempt = || -> std::io::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    };

    attempt().or_else(|_| {
        thread::sleep(RETRY_DELAY);
        attempt()
    })
    .map_err(|source| EngineError::Persistence {
        path: to.to_path_buf(),
        source,
    })
}

fn keep_or_warn(result: Result<(), EngineError>, path: PathBuf) -> Option<PathBuf> {
    match result {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

/// Raw text artifact: stdout, then stderr under a marker line.
pub fn raw_text(stdout: &str, stderr: &str) -> String {
    if stderr.trim().is_empty() {
        return stdout.to_string();
    }
    let mut text = String::with_capacity(stdout.len() + stderr.len() + 32);
    text.push_str(stdout);
    if !stdout.is_empty() && !stdout.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(STDERR_MARKER);
    text.push('\n');
    text.push_str(stderr);
    text
}

/// Persists the raw output, metadata and parsed records of a step into `dir`.
///
/// Failures are logged; whatever was written is returned.
pub fn save_artifacts(dir: &Path, output: &StepOutput<'_>, parser: &OutputParser) -> SavedArtifacts {
    let mut saved = SavedArtifacts::default();

    let raw_path = dir.join(format!("{}.txt", output.step_name));
    let raw = raw_text(output.stdout, output.stderr);
    saved.raw = keep_or_warn(write_with_retry(&raw_path, raw.as_bytes()), raw_path);

    let parsed = parser.parse(output.tool, output.stdout);
    if !parsed.records.is_empty() {
        let records_path = dir.join(format!("{}.json", output.step_name));
        match serde_json::to_vec_pretty(&parsed.records) {
            Ok(bytes) => {
                saved.records = keep_or_warn(write_with_retry(&records_path, &bytes), records_path);
            }
            Err(e) => warn!("Failed to encode records for '{}': {}", output.step_name, e),
        }
    }

    let metadata = StepMetadata {
        step_name: output.step_name.to_string(),
        tool: output.tool.to_string(),
        module_id: output.module_id.to_string(),
        module_name: output.module_name.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        duration_seconds: output.duration.as_secs_f64(),
        line_count: output.stdout.lines().filter(|l| !l.trim().is_empty()).count(),
        file_size: raw.len() as u64,
        command: output.command.to_string(),
        exit_code: output.exit_code,
        parser: parsed.parser,
        record_count: parsed.records.len(),
        timed_out: output.timed_out,
    };

    let meta_path = dir.join(format!("{}.meta.json", output.step_name));
    match serde_json::to_vec_pretty(&metadata) {
        Ok(bytes) => saved.metadata = keep_or_warn(write_with_retry(&meta_path, &bytes), meta_path),
        Err(e) => warn!("Failed to encode metadata for '{}': {}", output.step_name, e),
    }

    debug!(
        "Saved artifacts for '{}' ({} records)",
        output.step_name, metadata.record_count
    );
    saved
}
