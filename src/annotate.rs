//! Display-ready annotations for an error map.

use std::path::PathBuf;

use serde::Serialize;

use crate::traceback::{ErrorMap, TracebackMode};

/// One traceback rendered for display next to its source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub file: PathBuf,
    pub line: u32,
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcase: Option<String>,
}

/// Leading spaces of the 1-based `line` in `source`, 0 when out of range.
pub fn indentation_at(source: &str, line: u32) -> usize {
    let Some(index) = (line as usize).checked_sub(1) else {
        return 0;
    };
    source
        .lines()
        .nth(index)
        .map(|text| text.len() - text.trim_start_matches(' ').len())
        .unwrap_or(0)
}

/// Render every traceback with text through `mode`'s formatter, indented to
/// match the line it points at.
pub fn annotations(errors: &ErrorMap, mode: TracebackMode) -> Vec<Annotation> {
    let mut out = Vec::new();
    for (file, tracebacks) in errors {
        let source = std::fs::read_to_string(file).ok();
        for tb in tracebacks.iter().filter(|tb| !tb.text.is_empty()) {
            let indentation = source
                .as_deref()
                .map_or(0, |source| indentation_at(source, tb.line));
            out.push(Annotation {
                file: file.clone(),
                line: tb.line,
                html: mode.format_text(&tb.text, indentation),
                testcase: tb.testcase.clone(),
            });
        }
    }
    out
}
