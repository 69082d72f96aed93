//! Configuration management for mirrorkeep

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local partition store
    pub store: StoreConfig,
    /// Remote mirror object store
    pub remote: RemoteConfig,
    /// Token acquisition
    pub auth: AuthConfig,
    /// Sync status and scheduling
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Ask the host to keep our data across storage pressure
    pub request_persistence: bool,
    /// Run memory-only when the database cannot be opened
    pub memory_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Object store API base URL
    pub api_base_url: String,
    /// Well-known name of the mirror object
    pub mirror_name: String,
    /// App-private folder the mirror lives in
    pub folder: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound for a silent grant; boot never waits longer than this
    pub silent_timeout_secs: u64,
    /// Upper bound for an interactive consent flow
    pub interactive_timeout_secs: u64,
    /// OAuth scope requested from the identity provider
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Boolean field inside the `settings` partition that toggles sync
    pub enabled_setting: String,
    /// Quiet period before a burst of mutations becomes one upload
    pub debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: data_dir.join("mirrorkeep").join("store.sqlite3"),
            request_persistence: true,
            memory_fallback: true,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://www.googleapis.com".to_string(),
            mirror_name: "mirrorkeep_backup.json".to_string(),
            folder: "appDataFolder".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            silent_timeout_secs: 10,
            interactive_timeout_secs: 120,
            scope: "https://www.googleapis.com/auth/drive.appdata".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled_setting: "cloudSyncEnabled".to_string(),
            debounce_ms: 1500,
        }
    }
}

impl AuthConfig {
    pub fn silent_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_timeout_secs)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// `mirrorkeep/config.toml` under the platform config dir, or under the working
    /// directory on platforms without one.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mirrorkeep")
            .join("config.toml")
    }

    /// Read the config at `path` (or [`default_path`](Self::default_path)).
    ///
    /// A missing file means every section takes its defaults, and so does any section
    /// or field the file leaves out. A file that does not parse is a `Config` error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = toml::from_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the full config as TOML. The file is written beside its final name and
    /// renamed into place, so a reader never sees half a file.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, &path)?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.remote.folder, "appDataFolder");
        assert_eq!(config.auth.silent_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.debounce(), Duration::from_millis(1500));
        assert!(config.store.memory_fallback);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.remote.mirror_name, "mirrorkeep_backup.json");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\ndebounce_ms = 200\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.sync.debounce_ms, 200);
        assert_eq!(config.sync.enabled_setting, "cloudSyncEnabled");
        assert_eq!(config.remote.timeout_secs, 30);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.remote.mirror_name = "other.json".into();
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.remote.mirror_name, "other.json");
        assert!(!dir.path().join("nested").join("config.toml.tmp").exists());
    }

    #[test]
    fn test_unreadable_path_is_not_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Config::load(Some(dir.path())), Err(MirrorError::Io(_))));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync\n").unwrap();

        assert!(matches!(Config::load(Some(&path)), Err(MirrorError::Config(_))));
    }
}
