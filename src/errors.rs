//! Typed errors raised by the extraction and process layers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A report-level failure while turning a run's output into tracebacks.
///
/// These are fatal to the annotation step of a run: an empty error map
/// would be indistinguishable from a green run.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("JUnit report not found at {}", path.display())]
    ReportMissing { path: PathBuf },

    #[error("failed to read JUnit report {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed JUnit XML report")]
    Xml(#[from] quick_xml::Error),

    #[error("JUnit XML report is truncated ({open} element(s) left open)")]
    Truncated { open: usize },

    #[error("no <testsuite> element found in JUnit report")]
    NotAReport,
}

/// Failure to get the test process going at all.
///
/// Distinct from a non-zero exit, which just means tests failed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("test command is empty")]
    EmptyCommand,

    #[error("failed to start `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for `{program}`")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}
