//! Terminal rendering of session notifications.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::annotate;
use crate::events::{Notification, Notifier};
use crate::paths::relative_filename;
use crate::traceback::{ErrorMap, TracebackMode};

/// How error locations are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// `file:line: message`, one per traceback.
    #[default]
    Plain,
    /// Display-ready HTML fragments, as an editor would render them.
    Html,
    /// One JSON object per notification.
    Json,
}

/// Prints notifications for a person at a terminal (or a program reading
/// JSON lines).
pub struct ConsoleNotifier<W: Write = io::Stdout> {
    out: W,
    format: OutputFormat,
    base_dir: PathBuf,
    mode: TracebackMode,
}

impl ConsoleNotifier {
    pub fn stdout(format: OutputFormat, base_dir: PathBuf) -> Self {
        Self::new(io::stdout(), format, base_dir)
    }
}

impl<W: Write> ConsoleNotifier<W> {
    pub fn new(out: W, format: OutputFormat, base_dir: PathBuf) -> Self {
        Self {
            out,
            format,
            base_dir,
            mode: TracebackMode::default(),
        }
    }

    /// Formatter to use before any run has started.
    pub fn with_mode(mut self, mode: TracebackMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_errors(&mut self, errors: &ErrorMap, intermediate: bool) -> Result<()> {
        if intermediate {
            return Ok(());
        }
        match self.format {
            OutputFormat::Plain => {
                for (file, tracebacks) in errors {
                    let shown = relative_filename(&self.base_dir, file);
                    for tb in tracebacks {
                        let first = tb.text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                        writeln!(self.out, "{}:{}: {}", shown.display(), tb.line, first.trim())?;
                    }
                }
            }
            OutputFormat::Html => {
                for annotation in annotate::annotations(errors, self.mode) {
                    let shown = relative_filename(&self.base_dir, &annotation.file);
                    writeln!(
                        self.out,
                        "<div data-file=\"{}\" data-line=\"{}\">{}</div>",
                        crate::traceback::format::escape(&shown.display().to_string()),
                        annotation.line,
                        annotation.html
                    )?;
                }
            }
            OutputFormat::Json => {}
        }
        Ok(())
    }
}

impl<W: Write> Notifier for ConsoleNotifier<W> {
    fn notify(&mut self, notification: &Notification) -> Result<()> {
        if let Notification::RunStarted { mode, .. } = notification {
            self.mode = *mode;
        }

        if self.format == OutputFormat::Json {
            let json =
                serde_json::to_string(notification).context("failed to serialize notification")?;
            writeln!(self.out, "{json}")?;
            return Ok(self.out.flush()?);
        }

        match notification {
            Notification::RunStarted { cmd, .. } => {
                writeln!(self.out, "[redgreen] running {}", cmd.join(" "))?;
            }
            Notification::WillFail => writeln!(self.out, "[redgreen] red")?,
            Notification::Xpassed => {
                writeln!(self.out, "[redgreen] a test marked xfail passed")?;
            }
            Notification::RunFinished { summary, failures } => {
                let status = if *failures { "red" } else { "green" };
                writeln!(self.out, "[redgreen] {status}: {summary}")?;
            }
            Notification::ErrorsUpdated {
                errors,
                intermediate,
            } => self.write_errors(errors, *intermediate)?,
            Notification::RunFailedToStart { reason } => {
                writeln!(self.out, "[redgreen] could not start tests: {reason}")?;
            }
        }
        Ok(self.out.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceback::{Traceback, group_by_file};

    fn printed(format: OutputFormat, notifications: &[Notification]) -> String {
        let mut console = ConsoleNotifier::new(Vec::new(), format, PathBuf::from("/work"));
        for notification in notifications {
            console.notify(notification).unwrap();
        }
        String::from_utf8(console.into_inner()).unwrap()
    }

    fn errors() -> ErrorMap {
        let mut errors = ErrorMap::new();
        group_by_file(
            &mut errors,
            [Traceback::new(
                "/work/tests/test_a.py",
                4,
                "\nE   assert 1 == 2\nE    +  where 1 = f()",
            )],
        );
        errors
    }

    #[test]
    fn plain_lists_relative_locations() {
        let out = printed(
            OutputFormat::Plain,
            &[
                Notification::RunStarted {
                    mode: TracebackMode::Short,
                    cmd: vec!["pytest".into(), "tests".into()],
                },
                Notification::WillFail,
                Notification::RunFinished {
                    summary: "Ran 1 tests. 1 failed".into(),
                    failures: true,
                },
                Notification::ErrorsUpdated {
                    errors: errors(),
                    intermediate: false,
                },
            ],
        );
        assert!(out.contains("[redgreen] running pytest tests\n"));
        assert!(out.contains("[redgreen] red\n"));
        assert!(out.contains("[redgreen] red: Ran 1 tests. 1 failed\n"));
        assert!(out.contains("tests/test_a.py:4: E   assert 1 == 2\n"));
    }

    #[test]
    fn provisional_errors_are_not_printed() {
        let out = printed(
            OutputFormat::Plain,
            &[Notification::ErrorsUpdated {
                errors: errors(),
                intermediate: true,
            }],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn html_uses_the_run_mode_formatter() {
        let out = printed(
            OutputFormat::Html,
            &[
                Notification::RunStarted {
                    mode: TracebackMode::Long,
                    cmd: vec!["pytest".into()],
                },
                Notification::ErrorsUpdated {
                    errors: errors(),
                    intermediate: false,
                },
            ],
        );
        assert!(out.contains("data-file=\"tests/test_a.py\" data-line=\"4\""));
        assert!(out.contains("E&nbsp;&nbsp;&nbsp;assert&nbsp;1&nbsp;==&nbsp;2"));
    }

    #[test]
    fn json_writes_one_object_per_notification() {
        let out = printed(
            OutputFormat::Json,
            &[
                Notification::WillFail,
                Notification::RunFailedToStart {
                    reason: "no pytest".into(),
                },
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "run_failed_to_start");
        assert_eq!(second["reason"], "no pytest");
    }
}
