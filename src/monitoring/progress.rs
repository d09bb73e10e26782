//! Progress Reporter
//!
//! A single status line animated on its own thread:
//!
//! ```text
//! [ →  ] Step 3/10  ▓▓▓░░░░░░░  Running httpx...
//! ```
//!
//! The scheduler only touches a mutex-guarded counter/tool pair, so drawing
//! never blocks scheduling. A disabled reporter prints nothing at all.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use colored::Colorize;
use log::debug;

const SPINNER_FRAMES: &[&str] = &["[→   ]", "[ →  ]", "[  → ]", "[   →]"];
const FILLED_BLOCK: char = '▓';
const EMPTY_BLOCK: char = '░';
const BAR_LENGTH: usize = 10;
const TICK: Duration = Duration::from_millis(300);
const CLEAR_WIDTH: usize = 120;

#[derive(Debug, Default, Clone, PartialEq)]
struct ProgressState {
    completed: usize,
    total: usize,
    tool: String,
}

/// Renders one status line without colors.
pub fn render_line(frame: usize, completed: usize, total: usize, tool: &str) -> String {
    let (spinner, step, bar, status) = line_parts(frame, completed, total, tool);
    format!("{} {}  {}  {}", spinner, step, bar, status)
}

fn line_parts(frame: usize, completed: usize, total: usize, tool: &str) -> (&'static str, String, String, String) {
    let spinner = SPINNER_FRAMES[frame % SPINNER_FRAMES.len()];
    let filled = if total == 0 {
        0
    } else {
        (completed.min(total) * BAR_LENGTH) / total
    };

    let bar: String = std::iter::repeat(FILLED_BLOCK)
        .take(filled)
        .chain(std::iter::repeat(EMPTY_BLOCK).take(BAR_LENGTH - filled))
        .collect();

    let status = if tool.is_empty() {
        "Processing...".to_string()
    } else {
        format!("Running {}...", tool)
    };

    (spinner, format!("Step {}/{}", completed, total), bar, status)
}

fn paint(frame: usize, state: &ProgressState) -> String {
    let (spinner, step, bar, status) = line_parts(frame, state.completed, state.total, &state.tool);
    let split = bar
        .char_indices()
        .find(|(_, c)| *c == EMPTY_BLOCK)
        .map_or(bar.len(), |(i, _)| i);
    let (filled, empty) = bar.split_at(split);

    format!(
        "{} {}  {}{}  {}",
        spinner.cyan(),
        step.cyan().bold(),
        filled.green(),
        empty.dimmed(),
        status.yellow()
    )
}

fn clear_line(out: &mut impl Write) {
    let _ = write!(out, "\r{}\r", " ".repeat(CLEAR_WIDTH));
    let _ = out.flush();
}

/// Terminal progress line for one module run.
pub struct ProgressReporter {
    enabled: bool,
    state: Arc<Mutex<ProgressState>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Creates a reporter for `total` steps. A disabled reporter never
    /// spawns a thread or writes output.
    pub fn new(total: usize, enabled: bool) -> Self {
        Self {
            enabled,
            state: Arc::new(Mutex::new(ProgressState {
                total,
                ..ProgressState::default()
            })),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Enabled only for foreground runs attached to a terminal.
    pub fn for_run(total: usize, background: bool) -> Self {
        Self::new(total, !background && io::stdout().is_terminal())
    }

    #[cfg(test)]
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the animation thread.
    pub fn start(&mut self) -> io::Result<()> {
        if !self.enabled || self.handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);

        let handle = thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                let mut frame = 0;
                let stdout = io::stdout();
                while running.load(Ordering::SeqCst) {
                    let snapshot = state
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    let mut out = stdout.lock();
                    clear_line(&mut out);
                    let _ = write!(out, "{}", paint(frame, &snapshot));
                    let _ = out.flush();
                    drop(out);

                    frame += 1;
                    thread::park_timeout(TICK);
                }
                clear_line(&mut stdout.lock());
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Records the number of finished steps.
    pub fn update(&self, completed: usize) {
        self.lock().completed = completed;
    }

    /// Records the most recently started tool.
    pub fn set_tool(&self, tool: &str) {
        self.lock().tool = tool.to_string();
    }

    /// Current counter values, as `(completed, total)`.
    #[cfg(test)]
    fn position(&self) -> (usize, usize) {
        let state = self.lock();
        (state.completed, state.total)
    }

    /// Stops the animation and clears its line. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                debug!("Progress thread panicked");
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_line_format() {
        let line = render_line(0, 3, 10, "httpx");
        assert_eq!(line, "[→   ] Step 3/10  ▓▓▓░░░░░░░  Running httpx...");
    }

    #[test]
    fn test_render_line_spinner_cycles() {
        assert!(render_line(1, 0, 4, "").starts_with("[ →  ]"));
        assert!(render_line(5, 0, 4, "").starts_with("[ →  ]"));
        assert!(render_line(0, 0, 4, "").ends_with("Processing..."));
    }

    #[test]
    fn test_render_line_bounds() {
        assert!(render_line(0, 0, 0, "x").contains("░░░░░░░░░░"));
        assert!(render_line(0, 12, 10, "x").contains("▓▓▓▓▓▓▓▓▓▓"));
    }

    #[test]
    fn test_disabled_reporter_is_inert() {
        let mut reporter = ProgressReporter::new(5, false);
        reporter.start().unwrap();
        assert!(reporter.handle.is_none());

        reporter.set_tool("nmap");
        reporter.update(2);
        assert_eq!(reporter.position(), (2, 5));
        reporter.stop();
    }

    #[test]
    fn test_background_run_is_disabled() {
        assert!(!ProgressReporter::for_run(3, true).is_enabled());
    }

    #[test]
    fn test_enabled_reporter_stops_promptly() {
        let mut reporter = ProgressReporter::new(2, true);
        reporter.start().unwrap();
        reporter.set_tool("echo");
        reporter.update(1);

        let started = std::time::Instant::now();
        reporter.stop();
        assert!(reporter.handle.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        reporter.stop();
    }
}
