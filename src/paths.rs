use std::path::{Path, PathBuf};

use tracing::debug;

const REPORT_FILENAME: &str = "last-run.xml";
const SESSION_LOG_FILENAME: &str = "session.jsonl";

type Strategy = fn(&Path, &Path) -> Option<PathBuf>;

/// Ways of locating a traceback's file, tried in order.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("base", joined),
    ("canonical base", canonical_base),
    ("ancestor", ancestor_of_base),
];

fn joined(base: &Path, file: &Path) -> Option<PathBuf> {
    let candidate = base.join(file);
    candidate.exists().then_some(candidate)
}

fn canonical_base(base: &Path, file: &Path) -> Option<PathBuf> {
    let candidate = base.canonicalize().ok()?.join(file);
    candidate.exists().then_some(candidate)
}

/// pytest reports paths relative to its rootdir, which may sit above the
/// directory we ran it from.
fn ancestor_of_base(base: &Path, file: &Path) -> Option<PathBuf> {
    if file.is_absolute() {
        return None;
    }
    base.ancestors()
        .skip(1)
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.exists())
}

/// Resolve a file name printed by pytest against `base`.
///
/// Falls back to the literal join when nothing on disk matches, so a frame is
/// never dropped just because its file can't be found.
pub fn resolve_frame_path(base: &Path, file: &str) -> PathBuf {
    let file = Path::new(file);
    for (name, strategy) in STRATEGIES {
        if let Some(resolved) = strategy(base, file) {
            return resolved;
        }
        debug!(strategy = name, file = %file.display(), "path strategy did not match");
    }
    debug!(
        base = %base.display(),
        file = %file.display(),
        "unresolved traceback path, using it literally"
    );
    base.join(file)
}

/// Express `file` relative to `base` where possible.
///
/// Tries the literal `base` first, then the real paths of both, so a file
/// found through a symlinked base still comes back relative. Relative paths
/// come back unchanged, as do absolute paths outside `base`.
pub fn relative_filename(base: &Path, file: &Path) -> PathBuf {
    if file.is_relative() {
        return file.to_path_buf();
    }
    if let Ok(rel) = file.strip_prefix(base) {
        return rel.to_path_buf();
    }
    let real_base = base.canonicalize().ok();
    let real_file = file.canonicalize().ok();
    let candidates = [
        (real_base.as_deref(), Some(file)),
        (real_base.as_deref(), real_file.as_deref()),
        (Some(base), real_file.as_deref()),
    ];
    candidates
        .into_iter()
        .find_map(|(base, file)| file?.strip_prefix(base?).ok())
        .map_or_else(|| file.to_path_buf(), Path::to_path_buf)
}

/// Where pytest is told to write its JUnit report.
pub fn report_file(cache_dir: &Path) -> PathBuf {
    cache_dir.join(REPORT_FILENAME)
}

pub fn session_log_file(cache_dir: &Path) -> PathBuf {
    cache_dir.join(SESSION_LOG_FILENAME)
}
