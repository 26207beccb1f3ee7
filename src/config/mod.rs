//! Configuration storage

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::calling::dedup::DEFAULT_CAPACITY;
use crate::calling::CallOptions;
use crate::store::firestore::FirestoreConfig;

/// Which document store backs signaling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only useful for the demo and local testing.
    #[default]
    Memory,
    Firestore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub project_id: Option<String>,
    /// Firestore database id
    pub database: String,
    /// Web API key (sent as `key` query parameter)
    pub api_key: Option<String>,
    /// Firebase ID token of the signed-in user
    pub id_token: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            project_id: None,
            database: "(default)".to_string(),
            api_key: None,
            id_token: None,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// Number of handled call ids remembered for duplicate suppression
    pub dedup_capacity: usize,
    /// Give up on unanswered calls after this many seconds (unset: never)
    pub ring_timeout_secs: Option<u64>,
    /// Treat the microphone as granted without prompting
    pub auto_grant_microphone: bool,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_CAPACITY,
            ring_timeout_secs: None,
            auto_grant_microphone: true,
        }
    }
}

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local participant id
    pub identity: Option<String>,
    pub store: StoreConfig,
    pub calls: CallsConfig,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (may contain tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Configured identity, or an error telling the user to run `init`.
    pub fn require_identity(&self) -> Result<&str> {
        match self.identity.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => bail!("No identity configured. Run `peercall init --identity <id>` first."),
        }
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            dedup_capacity: self.calls.dedup_capacity,
            ring_timeout: self.calls.ring_timeout_secs.map(Duration::from_secs),
            ..CallOptions::default()
        }
    }

    pub fn firestore(&self) -> Result<FirestoreConfig> {
        let project = self
            .store
            .project_id
            .as_deref()
            .context("store.project_id is required for the firestore backend")?;
        let mut config = FirestoreConfig::new(project);
        config.database = self.store.database.clone();
        config.api_key = self.store.api_key.clone();
        config.id_token = self.store.id_token.clone();
        config.poll_interval = Duration::from_millis(self.store.poll_interval_ms.max(100));
        Ok(config)
    }
}
