use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Minimum interval between two progress notifications (the final one always fires).
pub const PROGRESS_THROTTLE_MS: u64 = 500;

/// Connect timeout for every transfer.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total timeout for a file transfer (10 GB at 10 Mbps stays well under this).
pub const FILE_TRANSFER_TIMEOUT_SECS: u64 = 7200;

/// Total timeout for a text transfer.
pub const TEXT_TRANSFER_TIMEOUT_SECS: u64 = 60;

/// Number of full fetch-and-verify cycles when the caller does not say otherwise.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 2;

/// Separator between group names in a hierarchical parameter key.
pub const GROUP_SEPARATOR: char = '.';

/// Characters allowed in strict keys and filtered values.
pub const SAFE_KEY_CHARS: &str =
    "0123456789_-abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Port probed when a session does not configure one.
pub const DEFAULT_API_PORT: u16 = 80;

/// First host port handed out for remote display of graphical sessions.
pub const RDP_BASE_PORT: u16 = 39_000;

/// CernVM version used for new sessions.
pub const DEFAULT_CERNVM_VERSION: &str = "latest";

/// CernVM flavor used for new sessions.
pub const DEFAULT_CERNVM_FLAVOR: &str = "prod";

/// Where CernVM micro-images and the version index are published.
pub const DEFAULT_RELEASE_URL: &str = "http://cernvm.cern.ch/releases/";

/// Size of the generated contextualization CD-ROM (350 KB).
pub const CONTEXT_IMAGE_SIZE: usize = 358_400;

/// Top-level configuration for the session engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistent per-session data (configs, context images).
    pub data_dir: PathBuf,
    /// Downloaded and verified disk images.
    pub cache_dir: PathBuf,
    /// Base URL of the CernVM release area, with trailing slash.
    pub release_url: String,
    /// Fetch-and-verify cycles per provisioning call.
    pub download_retries: u32,
    /// Privileged helper started by the daemon reconciliation loop.
    pub daemon_bin_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("cvm-session-engine");
        Self {
            data_dir: base.join("data"),
            cache_dir: base.join("cache"),
            release_url: DEFAULT_RELEASE_URL.to_string(),
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            daemon_bin_path: None,
        }
    }
}

impl EngineConfig {
    /// Build a config rooted at `base` (`base/data`, `base/cache`).
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            data_dir: base.join("data"),
            cache_dir: base.join("cache"),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Directory holding one persisted JSON file per session.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "download_retries": 5, "cache_dir": "/var/cache/cvm" }"#)
            .unwrap();

        let cfg = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.download_retries, 5);
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/cvm"));
        assert_eq!(cfg.release_url, DEFAULT_RELEASE_URL);
        assert!(cfg.daemon_bin_path.is_none());
    }
}
