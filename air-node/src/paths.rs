//! Filesystem locations, following the XDG base directory layout.

use std::path::{Path, PathBuf};

use air_p2p::discovery::MANUAL_PEERS_FILE;

use crate::env::EnvVars;

/// Application subdirectory under each base directory.
pub const APP_DIR: &str = "air";

/// Where the node keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirPaths {
    /// `$XDG_CONFIG_HOME/air`
    pub config_dir: PathBuf,
    /// `$XDG_STATE_HOME/air`
    pub state_dir: PathBuf,
    /// `$XDG_DATA_HOME/air`
    pub data_dir: PathBuf,
}

impl AirPaths {
    /// Resolve from `XDG_*` variables, falling back to the usual locations
    /// under the home directory.
    pub fn from_env(env: &EnvVars) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let base = |key: &str, fallback: &[&str]| -> PathBuf {
            match env.get(key) {
                Some(dir) => PathBuf::from(dir),
                None => fallback.iter().fold(home.clone(), |p, part| p.join(part)),
            }
        };

        Self {
            config_dir: base("XDG_CONFIG_HOME", &[".config"]).join(APP_DIR),
            state_dir: base("XDG_STATE_HOME", &[".local", "state"]).join(APP_DIR),
            data_dir: base("XDG_DATA_HOME", &[".local", "share"]).join(APP_DIR),
        }
    }

    /// Everything under one root directory.
    pub fn in_dir(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            data_dir: root.join("data"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn manual_peers_file(&self) -> PathBuf {
        self.config_dir.join(MANUAL_PEERS_FILE)
    }

    pub fn ddns_file(&self) -> PathBuf {
        self.config_dir.join("ddns.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("air.lock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("air.pid")
    }

    /// Graph store snapshot directory.
    pub fn shared_dir(&self) -> PathBuf {
        self.data_dir.join("shared")
    }
}
