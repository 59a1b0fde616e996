use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::state::RunMode;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".redgreen";

/// A string or a list of strings. `tests_dir = "tests"` and
/// `tests_dir = ["tests/unit", "tests/api"]` are both accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(item) => vec![item.clone()],
            Self::Many(items) => items.clone(),
        }
    }
}

/// How pytest gets invoked.
///
/// ```toml
/// [runner]
/// command = ["python", "-m", "pytest"]
/// options = ["--tb=short", "-q"]
/// tests_dir = "tests"
/// mode = "auto"
///
/// [runner.env]
/// PYTHONDONTWRITEBYTECODE = "1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
    /// Target used when nothing more specific applies.
    #[serde(default = "default_tests_dir")]
    pub tests_dir: OneOrMany,
    /// Relative paths are taken from the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: RunMode,
    /// Re-parse console output while the run is still going.
    #[serde(default)]
    pub intermediate_parse: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Ask for the legacy JUnit family, which carries `file` and `line`.
    #[serde(default = "default_junit_family_legacy")]
    pub junit_family_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
}

fn default_command() -> Vec<String> {
    vec!["pytest".to_string()]
}

fn default_tests_dir() -> OneOrMany {
    OneOrMany::One(".".to_string())
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("cache")
}

fn default_junit_family_legacy() -> bool {
    true
}

fn default_log_enabled() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            options: Vec::new(),
            tests_dir: default_tests_dir(),
            working_dir: None,
            mode: RunMode::default(),
            intermediate_parse: false,
            env: BTreeMap::new(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            junit_family_legacy: default_junit_family_legacy(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.redgreen/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Directory holding `.redgreen/`, or `fallback` without a config file.
    pub fn project_root(config_path: Option<&Path>, fallback: &Path) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    /// Where pytest runs and tracebacks are resolved from.
    pub fn working_dir(&self, root: &Path) -> PathBuf {
        match &self.runner.working_dir {
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        }
    }

    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.report.cache_dir)
    }

    pub fn default_target(&self) -> Vec<String> {
        self.runner.tests_dir.to_vec()
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .redgreen/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(" ")
    }
}

/// Human-readable dump of the effective configuration.
pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Runner\n");
    push_kv(&mut output, "command", config.runner.command.join(" "));
    push_kv(&mut output, "options", list_or_none(&config.runner.options));
    push_kv(&mut output, "tests_dir", config.default_target().join(", "));
    push_kv(
        &mut output,
        "working_dir",
        config
            .runner
            .working_dir
            .as_deref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(project root)".to_string()),
    );
    push_kv(&mut output, "mode", config.runner.mode.as_str());
    push_kv(&mut output, "intermediate_parse", config.runner.intermediate_parse);
    if config.runner.env.is_empty() {
        push_kv(&mut output, "env", "(none)");
    } else {
        for (key, value) in &config.runner.env {
            output.push_str(&format!("  - {key}={value}\n"));
        }
    }
    output.push('\n');

    output.push_str("Report\n");
    push_kv(&mut output, "cache_dir", config.report.cache_dir.display());
    push_kv(&mut output, "junit_family_legacy", config.report.junit_family_legacy);
    output.push('\n');

    output.push_str("Log\n");
    push_kv(&mut output, "enabled", config.log.enabled);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "runner": {
            "command": &config.runner.command,
            "options": &config.runner.options,
            "tests_dir": config.default_target(),
            "working_dir": &config.runner.working_dir,
            "mode": config.runner.mode.as_str(),
            "intermediate_parse": config.runner.intermediate_parse,
            "env": &config.runner.env
        },
        "report": {
            "cache_dir": &config.report.cache_dir,
            "junit_family_legacy": config.report.junit_family_legacy
        },
        "log": {
            "enabled": config.log.enabled
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
