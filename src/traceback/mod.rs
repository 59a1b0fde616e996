//! Normalized failure locations and the pytest traceback styles that
//! produce them.

pub mod format;
pub mod matchers;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use matchers::Frame;

/// Tracebacks grouped by resolved file, in discovery order within a file.
pub type ErrorMap = BTreeMap<PathBuf, Vec<Traceback>>;

/// One failure or error location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traceback {
    pub file: PathBuf,
    /// 1-based source line.
    pub line: u32,
    pub text: String,
    /// Node id (`path::Class::method`) of the test this belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcase: Option<String>,
}

impl Traceback {
    pub fn new(file: impl Into<PathBuf>, line: u32, text: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: line.max(1),
            text: text.into(),
            testcase: None,
        }
    }

    pub fn with_testcase(mut self, testcase: Option<String>) -> Self {
        self.testcase = testcase;
        self
    }
}

/// Append tracebacks to `errors`, keeping discovery order per file.
pub fn group_by_file(errors: &mut ErrorMap, tracebacks: impl IntoIterator<Item = Traceback>) {
    for traceback in tracebacks {
        errors
            .entry(traceback.file.clone())
            .or_default()
            .push(traceback);
    }
}

/// Total number of tracebacks in an error map.
pub fn count(errors: &ErrorMap) -> usize {
    errors.values().map(Vec::len).sum()
}

static TB_OPTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\btb[= ](\S+)").unwrap());

/// Traceback style pytest was asked to print (`--tb=<mode>`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TracebackMode {
    Line,
    Short,
    Long,
    #[default]
    Auto,
}

impl TracebackMode {
    pub const ALL: [TracebackMode; 4] = [Self::Line, Self::Short, Self::Long, Self::Auto];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Short => "short",
            Self::Long => "long",
            Self::Auto => "auto",
        }
    }

    /// Scan a command line for `tb=<mode>` / `tb <mode>`.
    ///
    /// Falls back to [`TracebackMode::Auto`] when the option is missing or
    /// names a style we have no grammar for (`native`, `no`, ...).
    pub fn detect(cmd: &[String]) -> Self {
        let joined = cmd.join(" ");
        TB_OPTION
            .captures(&joined)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or_default()
    }

    /// Line mode has no useful JUnit report and is parsed from the console.
    pub fn uses_report(self) -> bool {
        self != Self::Line
    }

    /// Run this mode's grammar over raw traceback text.
    pub fn frames(self, text: &str) -> Vec<Frame> {
        match self {
            Self::Line => matchers::line_frames(text),
            Self::Short => matchers::short_frames(text),
            Self::Long | Self::Auto => matchers::long_frames(text),
        }
    }

    pub fn format_text(self, text: &str, indentation: usize) -> String {
        format::format_text(self, text, indentation)
    }
}

impl fmt::Display for TracebackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TracebackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                format!("unknown traceback mode '{s}' (expected line, short, long or auto)")
            })
    }
}
