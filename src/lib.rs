//! redgreen: run pytest, choose what to run next and turn its tracebacks
//! into per-line error annotations.

pub mod annotate;
pub mod cli;
pub mod config;
pub mod console;
pub mod errors;
pub mod events;
pub mod exec;
pub mod extract;
pub mod log;
pub mod paths;
pub mod report;
pub mod session;
pub mod shell_completion;
pub mod state;
pub mod target;
pub mod traceback;
pub mod watch;
