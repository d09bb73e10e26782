//! Progress Monitoring Module
//!
//! Provides the terminal status line shown while a module runs.
//!
//! # Components
//!
//! - [`ProgressReporter`]: spinner, step counter and block bar on a
//!   background thread

pub mod progress;

pub use progress::{render_line, ProgressReporter};
