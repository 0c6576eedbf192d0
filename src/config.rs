//! Configuration loader and validator for the Notion → case study sync.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub notion: Notion,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Notion API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notion {
    pub token: String,
    pub version: String,
    pub database_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// What to do with a stored case study whose Notion page changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Write the Notion version and report the conflict for visibility.
    #[default]
    AutoOverwrite,
    /// Report the conflict and leave the stored record alone.
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Append the restored payload as a new version.
    #[default]
    NewVersion,
    /// Point the current document at the old version without appending.
    PointerOnly,
}

/// Sync run tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub restore_mode: RestoreMode,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_attempts: default_fetch_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_seconds: default_max_backoff_seconds(),
            concurrency: default_concurrency(),
            conflict_policy: ConflictPolicy::default(),
            restore_mode: RestoreMode::default(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_backoff_seconds() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => Path::new(&home).join(rest),
                Err(_) => PathBuf::from(&self.data_dir),
            },
            None => PathBuf::from(&self.data_dir),
        }
    }

    pub fn content_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("content")
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/studio.db", self.resolved_data_dir().display())
        })
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.content_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `NOTION_TOKEN` in the environment replaces `notion.token`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(token) = std::env::var("NOTION_TOKEN") {
        if !token.trim().is_empty() {
            cfg.notion.token = token;
        }
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.notion.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.token must be non-empty"));
    }
    if cfg.notion.version.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.version must be non-empty"));
    }
    if cfg.notion.database_id.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.database_id must be non-empty"));
    }
    if cfg.notion.page_size == 0 || cfg.notion.page_size > 100 {
        return Err(ConfigError::Invalid("notion.page_size must be within 1..=100"));
    }

    if cfg.sync.fetch_attempts == 0 {
        return Err(ConfigError::Invalid("sync.fetch_attempts must be >= 1"));
    }
    if cfg.sync.backoff_base_ms == 0 {
        return Err(ConfigError::Invalid("sync.backoff_base_ms must be > 0"));
    }
    if cfg.sync.concurrency == 0 {
        return Err(ConfigError::Invalid("sync.concurrency must be >= 1"));
    }

    Ok(())
}

/// Example configuration, also used by the test suite.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"
  database_id: "NOTION_CASE_STUDIES_DATABASE_ID"
  page_size: 100

sync:
  fetch_attempts: 3
  backoff_base_ms: 500
  max_backoff_seconds: 30
  concurrency: 4
  conflict_policy: auto_overwrite
  restore_mode: new_version
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync.conflict_policy, ConflictPolicy::AutoOverwrite);
        assert_eq!(cfg.sync.restore_mode, RestoreMode::NewVersion);
    }

    #[test]
    fn sync_section_is_optional() {
        let raw = r#"app:
  data_dir: "./data"
notion:
  token: "t"
  version: "2022-06-28"
  database_id: "db"
"#;
        let cfg: Config = serde_yaml::from_str(raw).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync, SyncSettings::default());
        assert_eq!(cfg.notion.page_size, 100);
    }

    #[test]
    fn invalid_notion_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notion.token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("notion.token")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notion.database_id = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("database_id")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notion.page_size = 101;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_sync_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.fetch_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn manual_policy_parses() {
        let raw = example().replace("auto_overwrite", "manual");
        let cfg: Config = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(cfg.sync.conflict_policy, ConflictPolicy::Manual);
    }

    #[test]
    fn ensure_dirs_creates_content_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("content").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.notion.database_id, "NOTION_CASE_STUDIES_DATABASE_ID");
    }
}
