//! Display formatting of traceback text for rich-text annotations.
//!
//! Formatting happens once, at display time. Extracted tracebacks always
//! carry the raw text.

use super::TracebackMode;

const LINE_BREAK: &str = "<br />";

/// Format `text` for display next to a source line indented by
/// `indentation` spaces.
pub fn format_text(mode: TracebackMode, text: &str, indentation: usize) -> String {
    text.trim_end_matches('\n')
        .split('\n')
        .map(|line| format_line(mode, line, indentation))
        .collect::<Vec<_>>()
        .join(LINE_BREAK)
}

fn format_line(mode: TracebackMode, line: &str, indentation: usize) -> String {
    let line = match mode {
        TracebackMode::Line => indent(line, indentation),
        TracebackMode::Short => indent(&replace_leading_marker(line), reduced(indentation)),
        // The source block already carries its own indentation.
        TracebackMode::Long | TracebackMode::Auto => line.to_string(),
    };
    replace_spaces(&escape(&line))
}

fn indent(line: &str, level: usize) -> String {
    format!("{}{line}", " ".repeat(level))
}

fn reduced(level: usize) -> usize {
    if level > 4 { level - 4 } else { level }
}

fn replace_leading_marker(line: &str) -> String {
    match line.strip_prefix('E') {
        Some(rest) => format!(" {rest}"),
        None => line.to_string(),
    }
}

/// Escape the characters that are significant in HTML text content.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn replace_spaces(text: &str) -> String {
    text.replace(' ', "&nbsp;")
}
