use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::console::OutputFormat;
use crate::traceback::TracebackMode;

#[derive(Parser, Debug)]
#[command(
    name = "redgreen",
    about = "Run pytest, pick what to run next, and point at the lines that failed",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the tests once
    Run {
        /// File being edited; picks the target when --target isn't given
        #[arg(long)]
        file: Option<PathBuf>,

        /// Run only the test under this line of --file (1-based)
        #[arg(long, requires = "file")]
        at_line: Option<usize>,

        /// Explicit targets (files or node ids), bypassing target resolution
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// How to print error locations
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,

        /// Don't mirror pytest's output
        #[arg(short, long)]
        quiet: bool,

        /// Extra pytest options, replacing the configured ones
        #[arg(last = true)]
        options: Vec<String>,
    },

    /// Watch the project and run on saves or on request
    Watch {
        /// Initially focused file
        #[arg(long)]
        focus: Option<PathBuf>,

        /// Run on every save of a Python file
        #[arg(long)]
        auto: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Extract tracebacks from saved pytest output or a JUnit report
    Parse {
        /// Console output (line mode) or JUnit XML report; `-` reads stdin
        input: PathBuf,

        /// Traceback style the output was produced with
        #[arg(long, value_parser = parse_mode, default_value = "auto")]
        mode: TracebackMode,

        /// Directory the file names in the output are relative to
        #[arg(long)]
        base_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Print the target the next run would use
    Target {
        /// File being edited
        #[arg(long)]
        focused: Option<String>,

        /// Target of the previous run
        #[arg(long = "previous")]
        previous: Vec<String>,

        /// Files changed since the previous run
        #[arg(long)]
        modified: bool,

        /// The previous run was red
        #[arg(long)]
        failures: bool,
    },

    /// Print the node id of the test enclosing a line
    FindTest {
        file: PathBuf,

        /// 1-based line; defaults to the end of the file
        #[arg(long)]
        line: Option<usize>,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

fn parse_mode(raw: &str) -> Result<TracebackMode, String> {
    raw.parse()
}
