// Mount Configuration Module
// Persistent storage for 123 Cloud mount settings and tokens

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::providers::{Open123Config, ProviderError};

/// Where a mount's configuration lives.
///
/// Token refreshes write through `persist_tokens`, so the store must accept
/// writes for the lifetime of the mount.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Open123Config, ProviderError>;

    fn save(&self, config: &Open123Config) -> Result<(), ProviderError>;

    /// Replace the stored token pair, leaving the rest of the config as is.
    fn persist_tokens(&self, refresh_token: &str, access_token: &str) -> Result<(), ProviderError> {
        let mut config = self.load()?;
        config.refresh_token = refresh_token.to_string();
        config.access_token = access_token.to_string();
        self.save(&config)
    }
}

/// Get the default config path for a named mount
pub fn default_config_path(mount: &str) -> Result<PathBuf, ProviderError> {
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| ProviderError::InvalidConfig("Could not find config directory".to_string()))?;
    Ok(base.join("open123").join(format!("{}.json", mount)))
}

/// JSON file on disk, readable by the owner only
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Open123Config, ProviderError> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            ProviderError::InvalidConfig(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let config: Open123Config = serde_json::from_str(&content).map_err(|e| {
            ProviderError::InvalidConfig(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        Ok(config)
    }

    fn save(&self, config: &Open123Config) -> Result<(), ProviderError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| ProviderError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        fs::write(&self.path, content)?;
        ensure_secure_permissions(&self.path)?;

        tracing::debug!("Mount config saved to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store for hosts that keep configuration elsewhere
pub struct MemoryConfigStore {
    config: Mutex<Open123Config>,
}

impl MemoryConfigStore {
    pub fn new(config: Open123Config) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn snapshot(&self) -> Open123Config {
        match self.config.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Open123Config, ProviderError> {
        Ok(self.snapshot())
    }

    fn save(&self, config: &Open123Config) -> Result<(), ProviderError> {
        let mut guard = self
            .config
            .lock()
            .map_err(|_| ProviderError::InvalidConfig("config store lock poisoned".to_string()))?;
        *guard = config.clone();
        Ok(())
    }
}

/// Restrict a config file to its owner
fn ensure_secure_permissions(path: &Path) -> Result<(), ProviderError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::DriveType;

    #[test]
    fn test_file_store_round_trip_and_token_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("mounts").join("main.json"));

        let mut config = Open123Config::new("id", "secret");
        config.drive_type = DriveType::Backup;
        store.save(&config).unwrap();

        store.persist_tokens("r2", "a2").unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.refresh_token, "r2");
        assert_eq!(loaded.access_token, "a2");
        assert_eq!(loaded.drive_type, DriveType::Backup);
        assert_eq!(loaded.client_id, "id");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("main.json"));
        store.save(&Open123Config::new("id", "secret")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(ProviderError::InvalidConfig(_))));
    }

    #[test]
    fn test_memory_store_persists_tokens() {
        let store = MemoryConfigStore::new(Open123Config::new("id", "secret"));
        store.persist_tokens("r", "a").unwrap();
        assert_eq!(store.snapshot().refresh_token, "r");
    }

    #[test]
    fn test_default_config_path_names_mount() {
        if let Ok(path) = default_config_path("work") {
            assert!(path.ends_with("open123/work.json"));
        }
    }
}
