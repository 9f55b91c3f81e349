//! Command-line arguments for the askdb binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use askdb_core::config::{expand_home, AskConfig};
use askdb_core::types::SessionId;
use clap::Parser;

pub const CONFIG_ENV: &str = "ASKDB_CONFIG";
pub const DATABASE_ENV: &str = "ASKDB_DATABASE";

/// askdb - ask questions about a SQLite database in plain English.
#[derive(Parser, Debug)]
#[command(name = "askdb", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// SQLite database file to query.
    #[arg(short = 'D', long = "database")]
    pub database: Option<PathBuf>,

    /// Directory holding the session store.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Resume an existing session instead of starting a new one.
    #[arg(short = 's', long = "session")]
    pub session: Option<SessionId>,

    /// Print each outcome as JSON instead of a text table.
    #[arg(long = "json")]
    pub json: bool,

    /// Keep sessions in memory only.
    #[arg(long = "ephemeral")]
    pub ephemeral: bool,
}

impl CliArgs {
    /// Priority: --config flag > ASKDB_CONFIG env var > ~/.askdb/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_ref(), std::env::var(CONFIG_ENV).ok())
    }

    /// Fold flag and environment overrides into a loaded config.
    pub fn apply(&self, config: &mut AskConfig) {
        apply_overrides(self, std::env::var(DATABASE_ENV).ok(), config);
    }
}

fn resolve_config_path(flag: Option<&PathBuf>, env: Option<String>) -> PathBuf {
    if let Some(p) = flag {
        return p.clone();
    }
    if let Some(p) = env.filter(|p| !p.is_empty()) {
        return PathBuf::from(p);
    }
    expand_home("~/.askdb/config.toml")
}

fn apply_overrides(args: &CliArgs, database_env: Option<String>, config: &mut AskConfig) {
    if let Some(ref db) = args.database {
        config.database.path = db.to_string_lossy().into_owned();
    } else if let Some(db) = database_env.filter(|p| !p.is_empty()) {
        config.database.path = db;
    }
    if let Some(ref dir) = args.data_dir {
        config.general.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(ref level) = args.log_level {
        config.general.log_level = level.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(argv: &[&str]) -> CliArgs {
        let mut full = vec!["askdb"];
        full.extend_from_slice(argv);
        CliArgs::parse_from(full)
    }

    #[test]
    fn test_config_path_priority() {
        let flag = PathBuf::from("/etc/askdb.toml");
        assert_eq!(
            resolve_config_path(Some(&flag), Some("/env.toml".into())),
            flag
        );
        assert_eq!(
            resolve_config_path(None, Some("/env.toml".into())),
            PathBuf::from("/env.toml")
        );
        assert!(resolve_config_path(None, None).ends_with(".askdb/config.toml"));
    }

    #[test]
    fn test_database_flag_beats_env_and_config() {
        let args = make_args(&["--database", "/data/flag.db"]);
        let mut config = AskConfig::default();
        config.database.path = "/data/config.db".into();
        apply_overrides(&args, Some("/data/env.db".into()), &mut config);
        assert_eq!(config.database.path, "/data/flag.db");
    }

    #[test]
    fn test_database_env_beats_config() {
        let args = make_args(&[]);
        let mut config = AskConfig::default();
        config.database.path = "/data/config.db".into();
        apply_overrides(&args, Some("/data/env.db".into()), &mut config);
        assert_eq!(config.database.path, "/data/env.db");

        apply_overrides(&args, None, &mut config);
        assert_eq!(config.database.path, "/data/env.db");
    }

    #[test]
    fn test_log_level_and_data_dir_overrides() {
        let args = make_args(&["-l", "debug", "-d", "/tmp/askdb"]);
        let mut config = AskConfig::default();
        apply_overrides(&args, None, &mut config);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.data_dir, "/tmp/askdb");
    }

    #[test]
    fn test_session_flag_parses_uuid() {
        let id = SessionId::new();
        let args = make_args(&["--session", &id.to_string()]);
        assert_eq!(args.session, Some(id));
        assert!(CliArgs::try_parse_from(["askdb", "--session", "nope"]).is_err());
    }
}
