//! Run lifecycle: `idle → running → idle`.
//!
//! [`RunState`] is owned by the session's control thread. Every transition
//! returns the notifications it produces instead of sending them, so the
//! state machine can be driven and checked without a process or a notifier.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::Notification;
use crate::target::RunHistory;
use crate::traceback::{ErrorMap, TracebackMode};

/// Whether saving a Python file triggers a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Manual,
    Auto,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

/// Progress characters pytest prints for failing (`F`) and xpassed (`X`)
/// tests.
const RED_PROGRESS: &[char] = &['F', 'X'];

#[derive(Debug, Clone, Default)]
pub struct RunState {
    mode: RunMode,
    target: Vec<String>,
    options: Vec<String>,
    running: bool,
    modified: bool,
    failures: bool,
    errors: ErrorMap,
    generation: u64,
    flashed_red: bool,
    errors_final: bool,
    summary: String,
    tb_mode: TracebackMode,
}

impl RunState {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    pub fn target(&self) -> &[String] {
        &self.target
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn has_failures(&self) -> bool {
        self.failures
    }

    pub fn errors(&self) -> &ErrorMap {
        &self.errors
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn tb_mode(&self) -> TracebackMode {
        self.tb_mode
    }

    /// What the target resolver gets to see of the previous run.
    pub fn history(&self) -> RunHistory<'_> {
        RunHistory {
            modified: self.modified,
            failures: self.failures,
            target: &self.target,
        }
    }

    /// Enter `running`. Supersedes any run still in flight: results carrying
    /// the returned generation are the only ones accepted from now on.
    pub fn start(
        &mut self,
        tb_mode: TracebackMode,
        cmd: Vec<String>,
        target: Vec<String>,
        options: Vec<String>,
    ) -> (u64, Notification) {
        if self.running {
            debug!(generation = self.generation, "superseding unfinished run");
        }
        self.generation += 1;
        self.running = true;
        self.modified = false;
        self.failures = false;
        self.flashed_red = false;
        self.errors.clear();
        self.errors_final = false;
        self.summary.clear();
        self.tb_mode = tb_mode;
        self.target = target;
        self.options = options;

        info!(generation = self.generation, mode = %tb_mode, "run started");
        (self.generation, Notification::RunStarted { mode: tb_mode, cmd })
    }

    /// A chunk of console output arrived.
    ///
    /// A chunk made only of `F`/`X` progress characters means the run is
    /// going red before it is over.
    pub fn progress(&mut self, chunk: &str) -> Option<Notification> {
        if !self.running || chunk.is_empty() {
            return None;
        }
        if chunk.chars().all(|c| RED_PROGRESS.contains(&c)) {
            return self.flash_red();
        }
        None
    }

    /// The test process exited. `None` means it was killed by a signal.
    pub fn process_exited(&mut self, code: Option<i32>) -> Option<Notification> {
        self.failures = code != Some(0);
        debug!(?code, failures = self.failures, "test process exited");
        if self.failures {
            self.flash_red()
        } else {
            None
        }
    }

    /// Leave `running` with the run's summary line.
    pub fn finish(&mut self, summary: String) -> Notification {
        self.running = false;
        self.summary = summary.clone();
        info!(failures = self.failures, summary = %summary, "run finished");
        Notification::RunFinished {
            summary,
            failures: self.failures,
        }
    }

    /// The process never started. The state goes back to idle, red.
    pub fn failed_to_start(&mut self, reason: String) -> Notification {
        self.running = false;
        self.failures = true;
        self.summary.clear();
        Notification::RunFailedToStart { reason }
    }

    /// Store extracted errors for `generation`.
    ///
    /// Results of a superseded run are dropped, and a provisional result
    /// never overwrites the final one of the same run.
    pub fn remember_errors(
        &mut self,
        generation: u64,
        errors: ErrorMap,
        intermediate: bool,
    ) -> Option<Notification> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping stale errors");
            return None;
        }
        if intermediate && self.errors_final {
            debug!(generation, "ignoring provisional errors after final result");
            return None;
        }
        self.errors = errors.clone();
        self.errors_final = !intermediate;
        Some(Notification::ErrorsUpdated {
            errors,
            intermediate,
        })
    }

    /// A file was saved. Returns whether the state now counts as modified.
    ///
    /// Edits made while a run is in flight don't count: that run may already
    /// have picked them up.
    pub fn file_modified(&mut self, path: &Path) -> bool {
        let is_python = path.extension().is_some_and(|ext| ext == "py");
        if !self.running && is_python {
            self.modified = true;
        }
        self.modified
    }

    fn flash_red(&mut self) -> Option<Notification> {
        if self.flashed_red {
            return None;
        }
        self.flashed_red = true;
        Some(Notification::WillFail)
    }
}
