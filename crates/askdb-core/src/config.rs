use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AskError, Result};

/// Top-level configuration for askdb.
///
/// Loaded from `~/.askdb/config.toml` by default. Every section is optional
/// in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AskConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AskConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AskError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.context.max_turns == 0 {
            return Err(AskError::Config("context.max_turns must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.context.recency_decay) {
            return Err(AskError::Config(
                "context.recency_decay must be within 0.0..=1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.generator.similarity_threshold) {
            return Err(AskError::Config(
                "generator.similarity_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.limits.max_utterance_length == 0 {
            return Err(AskError::Config(
                "limits.max_utterance_length must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the session database, resolved against `general.data_dir`.
    pub fn sessions_path(&self) -> PathBuf {
        let file = Path::new(&self.storage.sessions_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            expand_home(&self.general.data_dir).join(file)
        }
    }
}

/// Expand a leading `~` using `HOME` (or `USERPROFILE`).
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        let rest = rest.trim_start_matches(['/', '\\']);
        if rest.is_empty() {
            return PathBuf::from(home);
        }
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the session database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.askdb".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Target database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Dialect family: "sqlite", "postgresql", "mysql". Unknown names use ANSI SQL.
    pub family: String,
    /// Path to the SQLite database file. Empty means none configured.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            family: "sqlite".to_string(),
            path: String::new(),
        }
    }
}

/// Context window and relevance scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Most recent successful turns considered for the window.
    pub max_turns: usize,
    /// Minimum decayed relevance score for a turn to enter the window.
    pub relevance_threshold: f64,
    /// Multiplier applied per step of age (most recent turn has age 0).
    pub recency_decay: f64,
    /// Weight of a matching table or column name.
    pub identifier_weight: f64,
    /// Weight of a matching literal (number, year, quoted value).
    pub literal_weight: f64,
    /// Weight of any other matching word.
    pub term_weight: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: 6,
            relevance_threshold: 0.25,
            recency_decay: 0.85,
            identifier_weight: 3.0,
            literal_weight: 2.0,
            term_weight: 1.0,
        }
    }
}

/// SQL synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Jaro-Winkler similarity needed for a fuzzy identifier match.
    pub similarity_threshold: f64,
    /// LIMIT applied to row queries that do not ask for one. `None` leaves them unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_row_limit: Option<u64>,
    /// Upper bound on any requested LIMIT.
    pub max_row_limit: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.88,
            default_row_limit: None,
            max_row_limit: 10_000,
        }
    }
}

/// Timeouts and input limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub query_timeout_secs: u64,
    pub model_timeout_secs: u64,
    /// Longest accepted utterance, in characters.
    pub max_utterance_length: usize,
    /// Model completions below this confidence are ignored.
    pub model_min_confidence: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 30,
            model_timeout_secs: 20,
            max_utterance_length: 1000,
            model_min_confidence: 0.5,
        }
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Session database file, relative to `general.data_dir` unless absolute.
    pub sessions_file: String,
    /// Sessions inactive for longer than this are purged at startup.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_file: "sessions.db".to_string(),
            retention_days: 7,
        }
    }
}
