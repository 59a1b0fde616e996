//! `redgreen watch`: keep a session alive, run on saves and on request.
//!
//! File events, stdin commands and Ctrl-C all feed one channel; the control
//! thread drains it and drives the session one run at a time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::exec::ProcessRunner;
use crate::session::Session;
use crate::state::RunMode;

/// Quiet period that ends a burst of saves.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// What the user typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the resolved target, optionally after focusing a file.
    Run(Option<PathBuf>),
    /// Change the focused file without running.
    Focus(Option<PathBuf>),
    /// Switch between running on save and running on request.
    Mode(RunMode),
    Quit,
}

#[derive(Debug)]
pub enum Input {
    Saved { path: PathBuf, at: Instant },
    Command(Command),
}

/// Parse one stdin line. An empty line means "run".
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };
    match (word, rest) {
        ("" | "run" | "r", file) => Ok(Command::Run(file.map(PathBuf::from))),
        ("focus" | "f", file) => Ok(Command::Focus(file.map(PathBuf::from))),
        ("auto", None) => Ok(Command::Mode(RunMode::Auto)),
        ("manual", None) => Ok(Command::Mode(RunMode::Manual)),
        ("quit" | "q" | "exit", None) => Ok(Command::Quit),
        _ => Err(format!(
            "unknown command `{line}` (try: run [file], focus [file], auto, manual, quit)"
        )),
    }
}

/// Whether a file event should count as a save.
fn is_source_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
}

fn spawn_stdin_reader(tx: Sender<Input>) {
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Ok(command) => {
                    if tx.send(Input::Command(command)).is_err() {
                        return;
                    }
                }
                Err(message) => eprintln!("[redgreen] {message}"),
            }
        }
        debug!("stdin closed");
    });
}

fn start_watcher(root: &Path, tx: Sender<Input>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_source_event(&event) => {
            let at = Instant::now();
            for path in event.paths {
                let _ = tx.send(Input::Saved { path, at });
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "file watcher error"),
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    Ok(watcher)
}

/// Watch `root` and serve the session until `quit` or Ctrl-C.
pub fn watch<R: ProcessRunner>(session: &mut Session<R>, root: &Path) -> Result<()> {
    let (tx, rx) = mpsc::channel();

    let _watcher = start_watcher(root, tx.clone())?;
    spawn_stdin_reader(tx.clone());
    install_quit_handler(tx.clone());
    drop(tx);

    println!(
        "[redgreen] watching {} ({} mode)",
        root.display(),
        session.state().mode().as_str()
    );
    println!("[redgreen] enter: run, `focus <file>`, `auto`, `manual`, `quit`");

    serve(session, &rx)
}

/// Turn Ctrl-C into a `quit` command. Returns whether the handler is in
/// place; only one can be installed per process.
fn install_quit_handler(tx: Sender<Input>) -> bool {
    match ctrlc::set_handler(move || {
        let _ = tx.send(Input::Command(Command::Quit));
    }) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to install Ctrl-C handler; use `quit` to stop");
            false
        }
    }
}

/// The control loop. Returns when asked to quit or when every input source
/// has gone away.
pub fn serve<R: ProcessRunner>(session: &mut Session<R>, rx: &Receiver<Input>) -> Result<()> {
    let mut last_run_ended: Option<Instant> = None;
    let mut pending: VecDeque<Input> = VecDeque::new();
    let during_run = |ended: Option<Instant>, at: Instant| ended.is_some_and(|ended| at <= ended);

    while let Some(input) = pending.pop_front().or_else(|| rx.recv().ok()) {
        match input {
            Input::Saved { path, at } => {
                if during_run(last_run_ended, at) {
                    debug!(path = %path.display(), "ignoring save made during a run");
                    continue;
                }
                let mut should_run = session.file_modified(&path);
                for (path, at) in debounce(rx, &mut pending) {
                    if !during_run(last_run_ended, at) {
                        should_run |= session.file_modified(&path);
                    }
                }
                if should_run {
                    run_once(session);
                    last_run_ended = Some(Instant::now());
                }
            }
            Input::Command(Command::Run(file)) => {
                if let Some(file) = file {
                    session.focus(Some(absolute(&file)?));
                }
                run_once(session);
                last_run_ended = Some(Instant::now());
            }
            Input::Command(Command::Focus(file)) => {
                let file = file.map(|f| absolute(&f)).transpose()?;
                info!(file = ?file, "focus changed");
                session.focus(file);
            }
            Input::Command(Command::Mode(mode)) => {
                info!(mode = mode.as_str(), "run mode changed");
                session.set_mode(mode);
            }
            Input::Command(Command::Quit) => break,
        }
    }
    info!(runs = session.runs(), "watch ended");
    Ok(())
}

/// Collect the rest of a burst of saves. A command ends the burst and is
/// queued on `pending`.
fn debounce(rx: &Receiver<Input>, pending: &mut VecDeque<Input>) -> Vec<(PathBuf, Instant)> {
    let mut saved = Vec::new();
    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(Input::Saved { path, at }) => saved.push((path, at)),
            Ok(command @ Input::Command(_)) => {
                pending.push_back(command);
                return saved;
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return saved,
        }
    }
}

fn run_once<R: ProcessRunner>(session: &mut Session<R>) {
    match session.run_next() {
        Ok(outcome) => debug!(?outcome, "run complete"),
        Err(e) => warn!(error = %format!("{e:#}"), "run failed"),
    }
}

fn absolute(file: &Path) -> Result<PathBuf> {
    if file.is_absolute() {
        return Ok(file.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(file))
}
