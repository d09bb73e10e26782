//! Shell Process Runner
//!
//! Runs one command line through `bash -c` with captured output, optional
//! stdin and an optional timeout. On timeout the whole process group is
//! killed so pipelines started by the command die with it.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Interval between exit checks while a command runs.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("Pipe read ended early: {}", e);
        }
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // The child leads its own group (`process_group(0)`), so its pid is the pgid.
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        kill_child(child);
        return;
    };
    // SAFETY: killpg only sends a signal; pgid names the group spawned above.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        debug!("killpg({}) failed: {}", pgid, io::Error::last_os_error());
        kill_child(child);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    kill_child(child);
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill pid {}: {}", child.id(), e);
    }
}

/// Runs `command` with `bash -c` in `cwd`.
///
/// Returns an error only when the process cannot be started or waited on;
/// a non-zero exit or a timeout is reported through [`ProcessOutput`].
pub fn run_shell(
    command: &str,
    cwd: &Path,
    stdin: Option<String>,
    timeout: Option<Duration>,
) -> io::Result<ProcessOutput> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    debug!("Spawned pid {}: {}", child.id(), command);

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    debug!("Failed to write stdin: {}", e);
                }
            }
        })),
        _ => None,
    };

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if let Some(limit) = timeout {
                    if start.elapsed() >= limit {
                        warn!("Command exceeded {:?}, killing: {}", limit, command);
                        kill_process_group(&mut child);
                        timed_out = true;
                        break child.wait()?;
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }

    Ok(ProcessOutput {
        stdout: collect(stdout),
        stderr: collect(stderr),
        code: if timed_out { None } else { status.code() },
        timed_out,
        duration: start.elapsed(),
    })
}
