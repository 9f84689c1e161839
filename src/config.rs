//! Configuration loader and validator for the background sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
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
    pub homeserver: Homeserver,
    pub login: Login,
    pub publish: Publish,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Period of the queue-drain alarm, independent of any UI being open.
    pub drain_interval_secs: u64,
    /// Period of the background feed-refresh timer.
    pub feed_refresh_secs: u64,
}

/// Remote gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Homeserver {
    pub origin: String,
}

/// Ring-session login handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    pub poll_interval_ms: u64,
    /// Wall-clock deadline after which a pending login expires.
    pub deadline_secs: u64,
}

/// In-line publish retry settings. Queued entries are paced by the drain
/// alarm instead and are never auto-discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publish {
    pub immediate_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.drain_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.drain_interval_secs must be > 0"));
    }
    if cfg.app.feed_refresh_secs == 0 {
        return Err(ConfigError::Invalid("app.feed_refresh_secs must be > 0"));
    }

    if cfg.homeserver.origin.trim().is_empty() {
        return Err(ConfigError::Invalid("homeserver.origin must be non-empty"));
    }
    if url::Url::parse(&cfg.homeserver.origin).is_err() {
        return Err(ConfigError::Invalid("homeserver.origin must be a valid URL"));
    }

    if cfg.login.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("login.poll_interval_ms must be > 0"));
    }
    if cfg.login.deadline_secs == 0 {
        return Err(ConfigError::Invalid("login.deadline_secs must be > 0"));
    }

    if cfg.publish.immediate_attempts == 0 {
        return Err(ConfigError::Invalid("publish.immediate_attempts must be > 0"));
    }
    if cfg.publish.backoff_base_ms == 0 {
        return Err(ConfigError::Invalid("publish.backoff_base_ms must be > 0"));
    }

    Ok(())
}

/// Example YAML content with every supported key.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  drain_interval_secs: 60
  feed_refresh_secs: 300

homeserver:
  origin: "https://homeserver.example"

login:
  poll_interval_ms: 2000
  deadline_secs: 120

publish:
  immediate_attempts: 3
  backoff_base_ms: 500
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_homeserver_origin() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.homeserver.origin = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("homeserver.origin")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.homeserver.origin = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_timer_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.drain_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.login.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.login.deadline_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_publish_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publish.immediate_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publish.backoff_base_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.login.poll_interval_ms, 2000);
    }
}
