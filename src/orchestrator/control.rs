// Run control: stop/restart requests and operator decisions

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::VerificationPolicy;
use crate::error::{MigrateError, Result};
use crate::workdir::WorkPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    Restart,
}

/// Stop/restart requests, checked by the orchestrator between units.
/// Requests come from the in-process flags or from marker files dropped into
/// the working directory by `photo-migrator stop|restart`.
pub struct RunControl {
    stop: AtomicBool,
    restart: AtomicBool,
    stop_marker: PathBuf,
    restart_marker: PathBuf,
}

impl RunControl {
    pub fn new(paths: &WorkPaths) -> Self {
        Self {
            stop: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            stop_marker: paths.stop_marker(),
            restart_marker: paths.restart_marker(),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    /// Take the pending signal, if any. Restart wins over stop.
    pub fn poll(&self) -> Option<ControlSignal> {
        let restart = self.restart.swap(false, Ordering::SeqCst) | take_marker(&self.restart_marker);
        let stop = self.stop.swap(false, Ordering::SeqCst) | take_marker(&self.stop_marker);
        if restart {
            Some(ControlSignal::Restart)
        } else if stop {
            Some(ControlSignal::Stop)
        } else {
            None
        }
    }
}

fn take_marker(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Could not remove control marker {}: {}", path.display(), e);
    }
    true
}

/// Ask a running migration in `paths` to stop after its current unit
pub fn write_stop_marker(paths: &WorkPaths) -> Result<PathBuf> {
    write_marker(paths.stop_marker())
}

/// Ask a running migration in `paths` to wipe its state and start over
pub fn write_restart_marker(paths: &WorkPaths) -> Result<PathBuf> {
    write_marker(paths.restart_marker())
}

fn write_marker(path: PathBuf) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&path, chrono::Utc::now().to_rfc3339())?;
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationDecision {
    Stop,
    Continue,
    IgnoreAll,
}

/// Operator decisions the orchestrator cannot make on its own
pub trait DecisionHandler {
    fn on_verification_failure(&mut self, path: &Path, error: &MigrateError) -> VerificationDecision;

    /// Whether to fetch the remaining parts of a multi-part set
    fn confirm_part_downloads(&mut self, unit: &str, count: usize, bytes: u64) -> bool;
}

/// Non-interactive decisions taken from configuration
pub struct PolicyHandler {
    policy: VerificationPolicy,
    download_parts: bool,
}

impl PolicyHandler {
    pub fn new(policy: VerificationPolicy, download_parts: bool) -> Self {
        Self { policy, download_parts }
    }
}

impl DecisionHandler for PolicyHandler {
    fn on_verification_failure(&mut self, path: &Path, error: &MigrateError) -> VerificationDecision {
        let decision = match self.policy {
            VerificationPolicy::Stop => VerificationDecision::Stop,
            VerificationPolicy::IgnoreAll => VerificationDecision::IgnoreAll,
            VerificationPolicy::Continue | VerificationPolicy::Prompt => VerificationDecision::Continue,
        };
        log::info!("Verification failed for {} ({}); policy says {:?}", path.display(), error, decision);
        decision
    }

    fn confirm_part_downloads(&mut self, unit: &str, count: usize, _bytes: u64) -> bool {
        if !self.download_parts {
            log::warn!("Not downloading {} remaining parts of {}", count, unit);
        }
        self.download_parts
    }
}

/// Terminal prompts with a bounded wait; an unanswered prompt takes the default
pub struct PromptHandler {
    lines: Receiver<String>,
    out: Box<dyn Write>,
    timeout: Duration,
}

impl PromptHandler {
    /// Prompt on stdout, reading answers from stdin on a background thread
    pub fn stdin(timeout: Duration) -> Self {
        // stdin has no timed read; this thread only forwards lines and does no migration work
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::with_input(rx, Box::new(io::stdout()), timeout)
    }

    pub fn with_input(lines: Receiver<String>, out: Box<dyn Write>, timeout: Duration) -> Self {
        Self { lines, out, timeout }
    }

    fn ask(&mut self, question: &str) -> Option<String> {
        let _ = write!(self.out, "{} ", question);
        let _ = self.out.flush();
        match self.lines.recv_timeout(self.timeout) {
            Ok(line) => Some(line.trim().to_lowercase()),
            Err(RecvTimeoutError::Timeout) => {
                let _ = writeln!(self.out);
                log::warn!("No answer after {}s, using the default", self.timeout.as_secs());
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl DecisionHandler for PromptHandler {
    fn on_verification_failure(&mut self, path: &Path, error: &MigrateError) -> VerificationDecision {
        let _ = writeln!(self.out, "\nVerification failed for {}: {}", path.display(), error);
        loop {
            let answer = self.ask("[c]ontinue, [s]top, or [i]gnore all further failures? [c]");
            match answer.as_deref() {
                None | Some("") | Some("c") | Some("continue") => return VerificationDecision::Continue,
                Some("s") | Some("stop") => return VerificationDecision::Stop,
                Some("i") | Some("ignore") => return VerificationDecision::IgnoreAll,
                Some(other) => {
                    let _ = writeln!(self.out, "Unrecognized answer {:?}", other);
                }
            }
        }
    }

    fn confirm_part_downloads(&mut self, unit: &str, count: usize, bytes: u64) -> bool {
        let gb = bytes as f64 / crate::constants::BYTES_PER_GB;
        let question = format!("{} needs {} more parts (~{:.1} GB). Download them? [y/N]", unit, count, gb);
        matches!(self.ask(&question).as_deref(), Some("y") | Some("yes"))
    }
}
