//! TOML configuration for a source/target pairing.
//!
//! The core never reads globals: everything the engine and the adapters need
//! is carried by [`Config`] or values derived from it
//! ([`Config::replay_options`], [`Config::retry_policy`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,

    pub source: SourceConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Display name used in logs and the status table.
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Shared working directory: an upstream checkout that is also the
    /// target repository's work tree.
    pub root: PathBuf,

    /// SQLite state store. Relative paths are resolved against `root`.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_project_name() -> String {
    "vcsmirror".into()
}
fn default_state_file() -> PathBuf {
    PathBuf::from(".vcsmirror.db")
}
fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Upstream backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Svn,
    Darcs,
    Cvs,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Svn => write!(f, "svn"),
            SourceKind::Darcs => write!(f, "darcs"),
            SourceKind::Cvs => write!(f, "cvs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// Repository URL (svn), repository path (darcs) or CVSROOT (cvs).
    pub repository: String,

    /// Path prefix inside the repository: `/trunk` for svn, the module
    /// name for cvs. Unused by darcs.
    #[serde(default)]
    pub module: String,

    /// Revision to bootstrap from: `INITIAL`, `HEAD` or a backend token.
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Skip `svn:externals` on checkout and update.
    #[serde(default)]
    pub ignore_externals: bool,

    /// Replace XML-illegal control characters in svn logs before parsing.
    #[serde(default)]
    pub filter_badchars: bool,
}

fn default_revision() -> String {
    "INITIAL".into()
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Git,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub kind: TargetKind,

    /// Registered as the `origin` remote when the repository is created.
    #[serde(default)]
    pub repository: Option<String>,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Template for the first line of each target commit.
    #[serde(default = "default_patch_name_format")]
    pub patch_name_format: String,

    /// Drop the first log line from the commit body.
    #[serde(default)]
    pub remove_first_log_line: bool,

    /// Re-wrap upstream log messages.
    #[serde(default = "default_true")]
    pub refill_changelogs: bool,

    /// Glob patterns of boring files that are never replayed.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Per-file histories closer than this coalesce into one changeset.
    #[serde(default = "default_coalesce_threshold")]
    pub coalesce_threshold_secs: u64,

    /// Fold every changeset of a run into one target commit.
    #[serde(default)]
    pub delayed_commit: bool,

    /// In a folded commit, keep every log in full instead of a summary list.
    #[serde(default = "default_true")]
    pub concatenate_logs: bool,
}

fn default_patch_name_format() -> String {
    "{module}: changeset {revision}".into()
}
fn default_true() -> bool {
    true
}
fn default_coalesce_threshold() -> u64 {
    180
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            patch_name_format: default_patch_name_format(),
            remove_first_log_line: false,
            refill_changelogs: true,
            exclude: Vec::new(),
            coalesce_threshold_secs: default_coalesce_threshold(),
            delayed_commit: false,
            concatenate_logs: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First delay; each further attempt doubles it.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Engine-facing subset of the configuration.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub module: String,
    pub repository: String,
    pub patch_name_format: String,
    pub remove_first_log_line: bool,
    pub exclude: Vec<String>,
    pub delayed_commit: bool,
    pub concatenate_logs: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        let replay = ReplayConfig::default();
        Self {
            module: String::new(),
            repository: String::new(),
            patch_name_format: replay.patch_name_format,
            remove_first_log_line: replay.remove_first_log_line,
            exclude: replay.exclude,
            delayed_commit: replay.delayed_commit,
            concatenate_logs: replay.concatenate_logs,
        }
    }
}

/// Written by `vcsmirror init`.
pub const SAMPLE_CONFIG: &str = r#"[project]
name = "myproject"
root = "~/mirrors/myproject"
# state_file = ".vcsmirror.db"
log_level = "info"

[source]
kind = "svn"
repository = "https://svn.example.com/repos/myproject"
module = "/trunk"
revision = "INITIAL"
ignore_externals = false
filter_badchars = false

[target]
kind = "git"

[replay]
patch_name_format = "{module}: changeset {revision}"
refill_changelogs = true
exclude = ["*.pyc", "build/**"]
coalesce_threshold_secs = 180
delayed_commit = false

[retry]
max_attempts = 3
base_delay_ms = 1000
"#;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from a TOML file, expanding `~` in paths.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.project.root = expand_tilde(&config.project.root);
        config.project.state_file = expand_tilde(&config.project.state_file);

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate the configuration for obvious errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.root.as_os_str().is_empty() {
            return Err(invalid("project.root", "working directory must be set"));
        }
        if !LOG_LEVELS.contains(&self.project.log_level.as_str()) {
            return Err(invalid(
                "project.log_level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if self.source.repository.is_empty() {
            return Err(invalid("source.repository", "must not be empty"));
        }
        match self.source.kind {
            SourceKind::Svn if !self.source.module.starts_with('/') => {
                return Err(invalid(
                    "source.module",
                    "svn module must be an absolute repository path such as /trunk",
                ));
            }
            SourceKind::Cvs if self.source.module.is_empty() => {
                return Err(invalid("source.module", "cvs module must not be empty"));
            }
            _ => {}
        }
        if self.source.revision.trim().is_empty() {
            return Err(invalid("source.revision", "must not be empty"));
        }
        if self.source.kind == SourceKind::Cvs && self.source.revision == "INITIAL" {
            return Err(invalid(
                "source.revision",
                "cvs has no first revision; use HEAD or a date such as 2004-06-10 00:00:00",
            ));
        }
        if self.replay.patch_name_format.trim().is_empty() {
            return Err(invalid("replay.patch_name_format", "must not be empty"));
        }
        if let Some(pattern) = self.replay.exclude.iter().find(|p| p.trim().is_empty()) {
            return Err(invalid(
                "replay.exclude",
                format!("empty pattern '{pattern}'"),
            ));
        }
        if self.replay.coalesce_threshold_secs == 0 {
            return Err(invalid("replay.coalesce_threshold_secs", "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }

    /// Load, then validate.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute location of the state store.
    pub fn state_path(&self) -> PathBuf {
        if self.project.state_file.is_absolute() {
            self.project.state_file.clone()
        } else {
            self.project.root.join(&self.project.state_file)
        }
    }

    pub fn coalesce_threshold(&self) -> Duration {
        Duration::from_secs(self.replay.coalesce_threshold_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
        )
    }

    pub fn replay_options(&self) -> ReplayOptions {
        ReplayOptions {
            module: self.source.module.clone(),
            repository: self.source.repository.clone(),
            patch_name_format: self.replay.patch_name_format.clone(),
            remove_first_log_line: self.replay.remove_first_log_line,
            exclude: self.replay.exclude.clone(),
            delayed_commit: self.replay.delayed_commit,
            concatenate_logs: self.replay.concatenate_logs,
        }
    }
}

fn invalid(field: &str, detail: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
