//! Choosing what to run next.
//!
//! The decision is a pure function of the previous run (target, red/green,
//! edits since) and the file currently in focus:
//!
//! ```text
//! 1. focused test file not in previous target  → [focused]
//! 2. modified since last run                   → previous | focused | default
//! 3. last run red                              → focused | default
//! 4. otherwise                                 → default
//! ```

use std::path::Path;

const TEST_EXTENSION: &str = "py";
const NODE_SEPARATOR: &str = "::";
const NOT_A_TEST: &str = "conftest";

/// What the resolver needs to know about the previous run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunHistory<'a> {
    pub modified: bool,
    pub failures: bool,
    /// Empty when nothing has run yet.
    pub target: &'a [String],
}

/// Whether `path` names a pytest test module.
pub fn is_test_file(path: &Path) -> bool {
    let is_python = path
        .extension()
        .is_some_and(|ext| ext == TEST_EXTENSION);
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    is_python && stem != NOT_A_TEST && (stem.starts_with("test") || stem.ends_with("test"))
}

/// The focused file as a target, if it is a test file.
pub fn current_test_file(focused: Option<&Path>) -> Option<String> {
    focused
        .filter(|path| is_test_file(path))
        .map(|path| path.to_string_lossy().into_owned())
}

/// Whether `target` already covers `file`, either as the file itself or as
/// one of its node ids.
pub fn target_includes(target: &[String], file: &str) -> bool {
    target.iter().any(|entry| {
        entry == file
            || entry
                .strip_prefix(file)
                .is_some_and(|rest| rest.starts_with(NODE_SEPARATOR))
    })
}

pub fn resolve_target(
    history: RunHistory<'_>,
    current_file: Option<&str>,
    default_target: &[String],
) -> Vec<String> {
    let previous = (!history.target.is_empty()).then_some(history.target);

    if let Some(current) = current_file {
        if previous.is_none_or(|target| !target_includes(target, current)) {
            return vec![current.to_string()];
        }
    }

    if history.modified {
        if let Some(target) = previous {
            return target.to_vec();
        }
        if let Some(current) = current_file {
            return vec![current.to_string()];
        }
        return default_target.to_vec();
    }

    if history.failures {
        if let Some(current) = current_file {
            return vec![current.to_string()];
        }
    }

    default_target.to_vec()
}
