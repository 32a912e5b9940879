use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kcal_core::models::UserId;
use kcal_core::retention::RetentionPolicy;
use kcal_core::steps::{StepServiceConfig, StepSourceKind, WatchdogConfig};

const DEFAULT_USER: &str = "local";

/// Contents of `config.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub user_id: Option<String>,
    pub step_source: StepSourceKind,
    pub step_service: StepServiceConfig,
    pub retention: RetentionPolicy,
    pub watchdog: WatchdogConfig,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub port: u16,
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "127.0.0.1".to_string(),
        }
    }
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "kcal").context("Could not determine home directory")?;
        Self::from_dirs(proj_dirs.data_dir(), &proj_dirs.config_dir().join("config.toml"))
    }

    pub fn from_dirs(data_dir: &Path, config_file: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let settings = match std::fs::read_to_string(config_file) {
            Ok(text) => toml::from_str(&text)
                .with_context(|| format!("Invalid config file: {}", config_file.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", config_file.display()));
            }
        };

        Ok(Config {
            db_path: data_dir.join("kcal.db"),
            data_dir: data_dir.to_path_buf(),
            settings,
        })
    }

    pub fn step_cache_path(&self) -> PathBuf {
        self.data_dir.join("step_cache.json")
    }

    /// `--user` wins over `user_id` in the config file.
    pub fn resolve_user(&self, flag: Option<&str>) -> Result<UserId> {
        let id = flag
            .or(self.settings.user_id.as_deref())
            .unwrap_or(DEFAULT_USER);
        UserId::new(id).context("Invalid user id")
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        tracing::info!(event = "api_key_generated", path = %path.display());
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_dirs(dir.path(), &dir.path().join("none.toml")).unwrap();
        assert_eq!(config.db_path, dir.path().join("kcal.db"));
        assert_eq!(config.settings.step_source, StepSourceKind::Simulated);
        assert_eq!(config.settings.step_service.persist_interval_ms, 30_000);
        assert_eq!(config.settings.server.port, 8080);
        assert_eq!(config.resolve_user(None).unwrap().as_str(), "local");
    }

    #[test]
    fn test_config_file_sections() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(
            &file,
            r#"
user_id = "alice"
step_source = "channel"

[step_service]
persist_interval_ms = 5000

[retention]
synced_days = 30

[watchdog]
max_silence_secs = 60
"#,
        )
        .unwrap();

        let config = Config::from_dirs(dir.path(), &file).unwrap();
        assert_eq!(config.settings.step_source, StepSourceKind::Channel);
        assert_eq!(config.settings.step_service.persist_interval_ms, 5000);
        assert_eq!(config.settings.step_service.failure_threshold, 3);
        assert_eq!(config.settings.retention.synced_days, 30);
        assert_eq!(config.settings.retention.onboarding_days, 7);
        assert_eq!(config.settings.watchdog.max_silence_secs, 60);
        assert_eq!(config.resolve_user(None).unwrap().as_str(), "alice");
        assert_eq!(config.resolve_user(Some("bob")).unwrap().as_str(), "bob");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "stepsource = \"channel\"\n").unwrap();
        assert!(Config::from_dirs(dir.path(), &file).is_err());
    }

    #[test]
    fn test_api_key_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_dirs(dir.path(), &dir.path().join("none.toml")).unwrap();
        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);
        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }
}
