//! One test session: the state machine, a process runner and whoever is
//! listening.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::events::{Notification, Notifier};
use crate::exec::{ProcessRunner, run_summary};
use crate::extract;
use crate::find_test;
use crate::paths::{relative_filename, report_file};
use crate::state::{RunMode, RunState};
use crate::target::{current_test_file, resolve_target};
use crate::traceback::{self, TracebackMode};

const JUNIT_XML_FLAG: &str = "--junit-xml";
const LEGACY_FAMILY: [&str; 2] = ["-o", "junit_family=legacy"];

/// Everything a session needs from the project configuration, with paths
/// already resolved against the project root.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub command: Vec<String>,
    pub options: Vec<String>,
    pub default_target: Vec<String>,
    pub working_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub mode: RunMode,
    pub intermediate_parse: bool,
    pub junit_family_legacy: bool,
}

impl SessionSettings {
    pub fn from_config(config: &ProjectConfig, root: &Path) -> Self {
        Self {
            command: config.runner.command.clone(),
            options: config.runner.options.clone(),
            default_target: config.default_target(),
            working_dir: config.working_dir(root),
            cache_dir: config.cache_dir(root),
            env: config.runner.env.clone(),
            mode: config.runner.mode,
            intermediate_parse: config.runner.intermediate_parse,
            junit_family_legacy: config.report.junit_family_legacy,
        }
    }

    pub fn report_file(&self) -> PathBuf {
        report_file(&self.cache_dir)
    }
}

/// How a call to [`Session::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing to run.
    Skipped,
    /// The process could not be spawned.
    FailedToStart,
    Green,
    Red { tracebacks: usize },
}

impl RunOutcome {
    pub fn is_green(self) -> bool {
        matches!(self, Self::Green | Self::Skipped)
    }
}

pub struct Session<R: ProcessRunner> {
    settings: SessionSettings,
    runner: R,
    state: RunState,
    notifiers: Vec<Box<dyn Notifier>>,
    echo: Option<Box<dyn Write>>,
    focused: Option<PathBuf>,
    runs: u64,
}

impl<R: ProcessRunner> Session<R> {
    pub fn new(settings: SessionSettings, runner: R) -> Self {
        let state = RunState::new(settings.mode);
        Self {
            settings,
            runner,
            state,
            notifiers: Vec::new(),
            echo: None,
            focused: None,
            runs: 0,
        }
    }

    pub fn add_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Mirror the test process's console output to `out`.
    pub fn echo_output(&mut self, out: Box<dyn Write>) {
        self.echo = Some(out);
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.state.set_mode(mode);
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// The file currently being edited, if any.
    pub fn focus(&mut self, file: Option<PathBuf>) {
        self.focused = file;
    }

    pub fn focused(&self) -> Option<&Path> {
        self.focused.as_deref()
    }

    /// Record a save. Returns whether it should trigger a run right away.
    pub fn file_modified(&mut self, path: &Path) -> bool {
        self.state.file_modified(path);
        self.state.mode() == RunMode::Auto
            && !self.state.is_running()
            && path.extension().is_some_and(|ext| ext == "py")
    }

    /// Target of the next run, from the previous run and the focused file.
    pub fn next_target(&self) -> Vec<String> {
        let focused = self
            .focused
            .as_deref()
            .map(|file| relative_filename(&self.settings.working_dir, file));
        let current = current_test_file(focused.as_deref());
        resolve_target(
            self.state.history(),
            current.as_deref(),
            &self.settings.default_target,
        )
    }

    /// `[command.., options.., target.., report flags..]`
    pub fn build_command(&self, target: &[String], options: &[String]) -> (Vec<String>, TracebackMode) {
        let mut cmd: Vec<String> = self.settings.command.clone();
        cmd.extend(options.iter().cloned());
        let mode = TracebackMode::detect(&cmd);
        cmd.extend(target.iter().cloned());
        if mode.uses_report() {
            cmd.push(format!(
                "{JUNIT_XML_FLAG}={}",
                self.settings.report_file().display()
            ));
            if self.settings.junit_family_legacy {
                cmd.extend(LEGACY_FAMILY.iter().map(|s| s.to_string()));
            }
        }
        (cmd, mode)
    }

    /// Resolve the next target and run it with the configured options.
    pub fn run_next(&mut self) -> Result<RunOutcome> {
        let target = self.next_target();
        let options = self.settings.options.clone();
        self.run(target, options)
    }

    /// Run the focused test file, or the node under `line` in it.
    pub fn run_focused(&mut self, file: &Path, node: Option<&str>) -> Result<RunOutcome> {
        let shown = relative_filename(&self.settings.working_dir, file);
        let mut target = shown.to_string_lossy().into_owned();
        if let Some(node) = node {
            target = format!("{target}::{node}");
        }
        self.focus(Some(file.to_path_buf()));
        let options = self.settings.options.clone();
        self.run(vec![target], options)
    }

    /// Run only the test enclosing `line` (1-based) of `file`. Nothing runs
    /// when the line isn't inside a test.
    pub fn run_at_line(&mut self, file: &Path, line: usize) -> Result<RunOutcome> {
        let source = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        match find_test::test_under_cursor(&source, line) {
            Some(node) => self.run_focused(file, Some(&node)),
            None => {
                info!(file = %file.display(), line, "no test under cursor");
                self.focus(Some(file.to_path_buf()));
                Ok(RunOutcome::Skipped)
            }
        }
    }

    /// Run pytest over `target` and publish everything that comes of it.
    pub fn run(&mut self, target: Vec<String>, options: Vec<String>) -> Result<RunOutcome> {
        if target.is_empty() {
            info!("nothing to run: empty target");
            return Ok(RunOutcome::Skipped);
        }

        let (cmd, tb_mode) = self.build_command(&target, &options);
        let report = self.settings.report_file();
        if tb_mode.uses_report() {
            prepare_report(&report)?;
        }

        let (generation, started) = self.state.start(tb_mode, cmd.clone(), target, options);
        self.runs += 1;
        broadcast(&mut self.notifiers, &started);

        let Self {
            settings,
            runner,
            state,
            notifiers,
            echo,
            ..
        } = self;

        let mut output = String::new();
        let mut partial = extract::PartialParser::new(tb_mode, &settings.working_dir);
        let mut on_chunk = |chunk: &str| {
            if let Some(out) = echo.as_mut() {
                if let Err(e) = out.write_all(chunk.as_bytes()).and_then(|()| out.flush()) {
                    debug!(error = %e, "failed to echo test output");
                }
            }
            output.push_str(chunk);
            if let Some(n) = state.progress(chunk) {
                broadcast(notifiers, &n);
            }
            if settings.intermediate_parse && chunk.contains('\n') {
                let parsed = partial.feed(&output);
                if let Some(n) = state.remember_errors(generation, parsed.errors, parsed.intermediate) {
                    broadcast(notifiers, &n);
                }
            }
        };

        let exit = runner.execute(&cmd, &settings.working_dir, &settings.env, &mut on_chunk);
        let code = match exit {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "test process failed to start");
                let n = state.failed_to_start(format!("{:#}", anyhow::Error::new(e)));
                broadcast(notifiers, &n);
                return Ok(RunOutcome::FailedToStart);
            }
        };

        if let Some(n) = state.process_exited(code) {
            broadcast(notifiers, &n);
        }
        let finished = state.finish(run_summary(&output));
        broadcast(notifiers, &finished);

        let extraction = extract::extract_run(&output, &report, tb_mode, &settings.working_dir)
            .with_context(|| format!("failed to extract tracebacks ({tb_mode} mode)"))?;
        if extraction.xpassed {
            broadcast(notifiers, &Notification::Xpassed);
        }
        let tracebacks = traceback::count(&extraction.errors);
        if let Some(n) = state.remember_errors(generation, extraction.errors, false) {
            broadcast(notifiers, &n);
        }

        if state.has_failures() {
            Ok(RunOutcome::Red { tracebacks })
        } else {
            Ok(RunOutcome::Green)
        }
    }
}

/// Make sure a stale report from an earlier run can't be mistaken for this
/// run's.
fn prepare_report(report: &Path) -> Result<()> {
    if let Some(dir) = report.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    }
    match std::fs::remove_file(report) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("failed to remove stale report {}", report.display()))
        }
    }
}

fn broadcast(notifiers: &mut [Box<dyn Notifier>], notification: &Notification) {
    for notifier in notifiers.iter_mut() {
        if let Err(e) = notifier.notify(notification) {
            warn!(event = notification.kind(), error = %e, "notifier failed");
        }
    }
}
