//! Structured execution log: JSON lines per session.
//!
//! Every redgreen session appends to `<cache_dir>/session.jsonl`: session
//! start and end, each run's command, red/green outcome, and how many
//! tracebacks were found where. Each line is a self-contained JSON object
//! with a timestamp, so logs are easy to grep, stream, and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::events::{Notification, Notifier};
use crate::traceback;

/// Timestamp as an RFC 3339 string.
fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// A session (one `run` or one `watch`) started.
    SessionStarted { working_dir: String, mode: String },
    /// A test process was launched.
    RunStarted { mode: String, command: String },
    /// The current run will end red.
    WillFail,
    /// An expected failure passed.
    Xpassed,
    /// The test process exited.
    RunFinished { summary: String, failures: bool },
    /// The test process could not be spawned.
    RunFailed { reason: String },
    /// Tracebacks were extracted.
    ErrorsUpdated {
        files: usize,
        tracebacks: usize,
        intermediate: bool,
    },
    /// Session ended.
    SessionEnded { runs: u64 },
}

impl From<&Notification> for LogEvent {
    fn from(notification: &Notification) -> Self {
        match notification {
            Notification::RunStarted { mode, cmd } => LogEvent::RunStarted {
                mode: mode.to_string(),
                command: cmd.join(" "),
            },
            Notification::RunFinished { summary, failures } => LogEvent::RunFinished {
                summary: summary.clone(),
                failures: *failures,
            },
            Notification::WillFail => LogEvent::WillFail,
            Notification::Xpassed => LogEvent::Xpassed,
            Notification::ErrorsUpdated {
                errors,
                intermediate,
            } => LogEvent::ErrorsUpdated {
                files: errors.len(),
                tracebacks: traceback::count(errors),
                intermediate: *intermediate,
            },
            Notification::RunFailedToStart { reason } => LogEvent::RunFailed {
                reason: reason.clone(),
            },
        }
    }
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for ExecutionLog {
    fn notify(&mut self, notification: &Notification) -> Result<()> {
        self.log(LogEvent::from(notification))
    }
}

/// Lets a session own a handle while the caller keeps logging around it.
impl Notifier for Arc<ExecutionLog> {
    fn notify(&mut self, notification: &Notification) -> Result<()> {
        self.log(LogEvent::from(notification))
    }
}
