use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use redgreen::cli::{Cli, Command};
use redgreen::config::{self, ProjectConfig};
use redgreen::console::{ConsoleNotifier, OutputFormat};
use redgreen::events::{Notification, Notifier};
use redgreen::exec::SystemRunner;
use redgreen::extract::{self, Extraction};
use redgreen::find_test;
use redgreen::log::{ExecutionLog, LogEvent};
use redgreen::paths::session_log_file;
use redgreen::report::JunitReport;
use redgreen::session::{RunOutcome, Session, SessionSettings};
use redgreen::shell_completion;
use redgreen::state::RunMode;
use redgreen::target::{RunHistory, current_test_file, resolve_target};
use redgreen::traceback::TracebackMode;
use redgreen::watch;

fn absolute(cwd: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        cwd.join(file)
    }
}

fn open_log(config: &ProjectConfig, settings: &SessionSettings) -> Result<Option<Arc<ExecutionLog>>> {
    if !config.log.enabled {
        return Ok(None);
    }
    let log = Arc::new(ExecutionLog::new(&session_log_file(&settings.cache_dir))?);
    log.log(LogEvent::SessionStarted {
        working_dir: settings.working_dir.display().to_string(),
        mode: settings.mode.as_str().to_string(),
    })?;
    Ok(Some(log))
}

fn close_log(log: Option<&Arc<ExecutionLog>>, runs: u64) {
    if let Some(log) = log {
        if let Err(e) = log.log(LogEvent::SessionEnded { runs }) {
            warn!(error = %e, "failed to write session end");
        }
    }
}

fn read_input(input: &Path) -> Result<String> {
    if input == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(input).with_context(|| format!("failed to read {}", input.display()))
}

/// Console output goes through the line grammar of `mode`; anything that
/// looks like XML is treated as a JUnit report.
fn parse_saved(text: &str, mode: TracebackMode, base_dir: &Path) -> Result<Extraction> {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") || trimmed.starts_with("<testsuite") {
        let report = JunitReport::parse(text).context("failed to parse JUnit report")?;
        return Ok(extract::extract_report(&report, mode, base_dir));
    }
    Ok(Extraction {
        errors: extract::parse_output(text, mode, base_dir),
        ..Extraction::default()
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(
        &cli.command,
        Command::Config { .. }
            | Command::Completions { .. }
            | Command::FindTest { .. }
            | Command::Target { .. }
            | Command::Parse { .. }
    );

    let filter = match cli.verbose {
        0 if is_quiet_command => "redgreen=warn",
        0 => "redgreen=info",
        1 => "redgreen=debug",
        _ => "redgreen=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .redgreen/config.toml found, using defaults"),
        }
    }

    let root = ProjectConfig::project_root(config_path.as_deref(), &cwd);
    let settings = SessionSettings::from_config(&config, &root);

    match cli.command {
        Command::Run {
            file,
            at_line,
            targets,
            format,
            quiet,
            options,
        } => {
            let options = if options.is_empty() {
                settings.options.clone()
            } else {
                options
            };
            let log = open_log(&config, &settings)?;
            let mut session = Session::new(settings.clone(), SystemRunner);
            session.add_notifier(Box::new(ConsoleNotifier::stdout(
                format,
                settings.working_dir.clone(),
            )));
            if let Some(log) = &log {
                session.add_notifier(Box::new(Arc::clone(log)));
            }
            if !quiet && format != OutputFormat::Json {
                session.echo_output(Box::new(io::stdout()));
            }

            let outcome = if !targets.is_empty() {
                session.run(targets, options)
            } else if let Some(file) = file {
                let file = absolute(&cwd, &file);
                match at_line {
                    Some(line) => session.run_at_line(&file, line),
                    None => {
                        session.focus(Some(file));
                        let target = session.next_target();
                        session.run(target, options)
                    }
                }
            } else {
                let target = session.next_target();
                session.run(target, options)
            };

            close_log(log.as_ref(), session.runs());
            let outcome = outcome?;
            if !outcome.is_green() {
                std::process::exit(1);
            }
            if outcome == RunOutcome::Skipped {
                match at_line {
                    Some(line) => eprintln!("[redgreen] no test at line {line}, nothing to run"),
                    None => eprintln!("[redgreen] nothing to run"),
                }
            }
        }

        Command::Watch {
            focus,
            auto,
            format,
        } => {
            let log = open_log(&config, &settings)?;
            let mut session = Session::new(settings.clone(), SystemRunner);
            if auto {
                session.set_mode(RunMode::Auto);
            }
            session.focus(focus.map(|f| absolute(&cwd, &f)));
            session.add_notifier(Box::new(ConsoleNotifier::stdout(
                format,
                settings.working_dir.clone(),
            )));
            if let Some(log) = &log {
                session.add_notifier(Box::new(Arc::clone(log)));
            }
            if format != OutputFormat::Json {
                session.echo_output(Box::new(io::stdout()));
            }

            let result = watch::watch(&mut session, &root);
            close_log(log.as_ref(), session.runs());
            result?;
        }

        Command::Parse {
            input,
            mode,
            base_dir,
            format,
        } => {
            let text = read_input(&input)?;
            let base_dir = base_dir.map_or_else(|| cwd.clone(), |dir| absolute(&cwd, &dir));
            let extraction = parse_saved(&text, mode, &base_dir)?;

            let mut console = ConsoleNotifier::stdout(format, base_dir).with_mode(mode);
            if extraction.xpassed {
                console.notify(&Notification::Xpassed)?;
            }
            console.notify(&Notification::ErrorsUpdated {
                errors: extraction.errors,
                intermediate: false,
            })?;
        }

        Command::Target {
            focused,
            previous,
            modified,
            failures,
        } => {
            let history = RunHistory {
                modified,
                failures,
                target: &previous,
            };
            let current = current_test_file(focused.as_deref().map(Path::new));
            for entry in resolve_target(history, current.as_deref(), &settings.default_target) {
                println!("{entry}");
            }
        }

        Command::FindTest { file, line } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let node = match line {
                Some(line) => find_test::test_under_cursor(&source, line),
                None => find_test::last_test(&source),
            };
            match node {
                Some(node) => println!("{}::{node}", file.display()),
                None => anyhow::bail!("no test found in {}", file.display()),
            }
        }

        Command::Config { json } => {
            if json {
                println!("{}", config::render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", config::render_config_human(&config, config_path.as_deref()));
            }
        }

        Command::Completions { shell } => shell_completion::print(shell)?,
    }

    Ok(())
}
