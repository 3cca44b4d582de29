use crate::error::{CdsError, Result};
use crate::executor::{ExecutorSettings, JoinedFailurePolicy};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PluginConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Unset means a plugin `run` may take as long as it likes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_callback_bind")]
    pub callback_bind: String,
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_callback_bind() -> String {
    "127.0.0.1:0".to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            run_timeout_secs: None,
            callback_bind: default_callback_bind(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub joined_failure: JoinedFailurePolicy,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_version() -> u32 {
    1
}

fn default_database() -> PathBuf {
    PathBuf::from(paths::DEFAULT_DATABASE)
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_PLUGINS_DIR)
}

fn default_workspaces_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_WORKSPACES_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: default_database(),
            plugins_dir: default_plugins_dir(),
            workspaces_dir: default_workspaces_dir(),
            plugin: PluginConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CdsError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn database_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.database)
    }

    pub fn plugins_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.plugins_dir)
    }

    pub fn workspaces_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.workspaces_dir)
    }

    pub fn executor_settings(&self, root: &Path) -> ExecutorSettings {
        ExecutorSettings {
            plugins_dir: self.plugins_path(root),
            handshake_timeout: Duration::from_secs(self.plugin.handshake_timeout_secs),
            run_timeout: self.plugin.run_timeout_secs.map(Duration::from_secs),
            callback_bind: self.plugin.callback_bind.clone(),
            joined_failure: self.executor.joined_failure,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self, root: &Path) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.plugin.handshake_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "plugin.handshake_timeout_secs is 0: every plugin would time out".into(),
            });
        }
        if self.plugin.run_timeout_secs == Some(0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "plugin.run_timeout_secs is 0: every plugin run would be killed".into(),
            });
        }
        if self.plugin.callback_bind.parse::<SocketAddr>().is_err() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "plugin.callback_bind '{}' is not a socket address",
                    self.plugin.callback_bind
                ),
            });
        }
        if !self.plugins_path(root).is_dir() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "plugins directory '{}' does not exist",
                    self.plugins_dir.display()
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(CdsError::NotInitialized)));
    }

    #[test]
    fn empty_file_gets_every_default() {
        let dir = TempDir::new().unwrap();
        crate::io::atomic_write(&paths::config_path(dir.path()), b"{}\n").unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.database, PathBuf::from(".cds/cds.redb"));
        assert_eq!(cfg.plugin.handshake_timeout_secs, 10);
        assert_eq!(cfg.plugin.run_timeout_secs, None);
        assert_eq!(cfg.executor.joined_failure, JoinedFailurePolicy::Abort);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.executor.joined_failure = JoinedFailurePolicy::Continue;
        cfg.plugin.run_timeout_secs = Some(600);
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.executor.joined_failure, JoinedFailurePolicy::Continue);

        let settings = loaded.executor_settings(dir.path());
        assert_eq!(settings.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(settings.plugins_dir, dir.path().join(".cds/plugins"));
    }

    #[test]
    fn joined_failure_parses_snake_case() {
        let cfg: Config = serde_yaml::from_str("executor:\n  joined_failure: continue\n").unwrap();
        assert_eq!(cfg.executor.joined_failure, JoinedFailurePolicy::Continue);
        assert!(serde_yaml::from_str::<Config>("executor:\n  joined_failure: maybe\n").is_err());
    }

    #[test]
    fn validate_flags_bad_values() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        std::fs::create_dir_all(cfg.plugins_path(dir.path())).unwrap();
        assert!(cfg.validate(dir.path()).is_empty());

        cfg.plugin.handshake_timeout_secs = 0;
        cfg.plugin.callback_bind = "localhost".into();
        let warnings = cfg.validate(dir.path());
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.level == WarnLevel::Error));
    }
}
