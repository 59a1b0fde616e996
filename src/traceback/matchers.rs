//! Regex grammars for the three pytest traceback styles.
//!
//! Each grammar pulls `(file, line, text)` frames out of raw text. The file is
//! left exactly as pytest printed it; resolving it against a base directory is
//! the caller's job.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// `--tb=line`: one frame per output line, `<file>:<lineno>:<marker><message>`.
static LINE_TB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(.*):([0-9]+):(.)(.*)").unwrap());

/// `--tb=short`: a header line, one or more 4-space indented source lines,
/// then the `E` block.
static SHORT_TB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(.*):([0-9]+):(.)(?:.*)\n(?:\s{4}.+)+\n((?:E.+\n?)*)").unwrap()
});

/// `--tb=long` / `--tb=auto`: an optional `>` source-context block followed by
/// the `<file>:<lineno>: <ExceptionName>` trailer.
static LONG_TB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:^>.*\n((?:.*?\n)*?))?\n(.*):(\d+):(.?)([\w ]*)$").unwrap()
});

/// A raw match before path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub text: String,
}

/// Capture group indices for one grammar.
struct Groups {
    file: usize,
    line: usize,
    text: usize,
}

fn collect(regex: &Regex, groups: Groups, text: &str) -> Vec<Frame> {
    regex
        .captures_iter(text)
        .filter_map(|caps| frame_from(&caps, &groups))
        .collect()
}

fn frame_from(caps: &Captures, groups: &Groups) -> Option<Frame> {
    let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
    // A line number that doesn't fit is not a location we can point at.
    let line = group(groups.line).parse().ok()?;
    Some(Frame {
        file: group(groups.file).to_string(),
        line,
        text: group(groups.text).to_string(),
    })
}

pub fn line_frames(text: &str) -> Vec<Frame> {
    collect(
        &LINE_TB,
        Groups {
            file: 1,
            line: 2,
            text: 4,
        },
        text,
    )
}

pub fn short_frames(text: &str) -> Vec<Frame> {
    collect(
        &SHORT_TB,
        Groups {
            file: 1,
            line: 2,
            text: 4,
        },
        text,
    )
}

pub fn long_frames(text: &str) -> Vec<Frame> {
    collect(
        &LONG_TB,
        Groups {
            file: 2,
            line: 3,
            text: 1,
        },
        text,
    )
}

fn is_assertion_line(line: &str) -> bool {
    line.len() > 1 && line.starts_with('E')
}

/// The trailing run of `E`-prefixed lines of a frame's text.
///
/// Trailing blank lines are ignored. Returns an empty string when the text
/// does not end in an assertion block.
pub fn culprit(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end_matches(['\n', '\r']).lines().collect();
    let start = lines
        .iter()
        .rposition(|line| !is_assertion_line(line))
        .map_or(0, |i| i + 1);
    lines[start..].join("\n")
}
