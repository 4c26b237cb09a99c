//! Node configuration
//!
//! Read from `<data_dir>/config.json` when the file exists; every field has
//! a default so a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// File name of the config inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Tunables of a trustweave node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Seconds between two presence announcements
    pub presence_interval_secs: u64,
    /// Seconds a device stays online after its last announcement.
    /// Three intervals when unset.
    pub online_window_secs: Option<u64>,
    /// Seconds without change before a search rebalances its depth
    pub search_debounce_secs: u64,
    /// Network depth used when none is requested
    pub default_depth: usize,
    /// Where local state lives. `None` means [`default_data_dir`].
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            presence_interval_secs: 10,
            online_window_secs: None,
            search_debounce_secs: 3,
            default_depth: 2,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Load `<data_dir>/config.json`, falling back to defaults if it is missing
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            debug!(?path, "Loaded node config");
            serde_json::from_str::<NodeConfig>(&text)?
        } else {
            NodeConfig::default()
        };
        if config.data_dir.is_none() {
            config.data_dir = Some(data_dir.to_path_buf());
        }
        Ok(config)
    }

    /// Write the config to `<data_dir>/config.json`
    pub fn save(&self, data_dir: impl AsRef<Path>) -> Result<()> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join(CONFIG_FILE), text)?;
        Ok(())
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs.max(1))
    }

    pub fn online_window(&self) -> Duration {
        match self.online_window_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.presence_interval() * 3,
        }
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_secs(self.search_debounce_secs)
    }

    /// Configured data dir or the default one
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// `~/.trustweave/data`, or `./.trustweave/data` without a home directory
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trustweave")
        .join("data")
}
