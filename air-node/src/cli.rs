//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::env::EnvVars;
use crate::paths::AirPaths;

/// Air peer-to-peer node.
#[derive(Parser, Debug, Clone)]
#[command(name = "air")]
#[command(about = "Air peer-to-peer node")]
#[command(version)]
pub struct Cli {
    /// Root directory for config, state and data. Defaults to the XDG
    /// locations.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Configuration environment to use (overrides AIR_ENV).
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the node as a server (default).
    Start,
    /// Join existing peers as a client, without a listener or lock.
    Connect {
        /// Peer addresses. Defaults to the local server.
        peers: Vec<String>,
    },
    /// Start as a server, or as a client when a local server is running.
    Auto,
    /// Show configuration and lock state.
    Status,
    /// Inspect or reset the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Peer discovery.
    Discovery {
        #[command(subcommand)]
        action: DiscoveryCommand,
    },
    /// Singleton lock maintenance.
    Lock {
        #[command(subcommand)]
        action: LockCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Overwrite the configuration file with defaults.
    Reset,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryCommand {
    /// Print discovery settings and known peers.
    Status,
    /// Run discovery in the foreground.
    Start,
    /// Add a peer address to the configuration.
    Add {
        /// Peer address, e.g. `host:8765`.
        addr: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    /// Remove the lock and PID files.
    Clean,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The subcommand to run.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Start)
    }

    /// Expand the home directory path (handle ~ for home).
    pub fn expanded_home(&self) -> Option<PathBuf> {
        let home = self.home.as_ref()?;
        let path_str = home.to_string_lossy();
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(dir) = dirs::home_dir() {
                return Some(dir.join(stripped));
            }
        }
        Some(home.clone())
    }

    /// Process environment with the flags applied on top.
    pub fn env_vars(&self, env: EnvVars) -> EnvVars {
        match &self.env {
            Some(name) => env.with("AIR_ENV", name.as_str()),
            None => env,
        }
    }

    /// File locations for this invocation.
    pub fn paths(&self, env: &EnvVars) -> AirPaths {
        match self.expanded_home() {
            Some(root) => AirPaths::in_dir(&root),
            None => AirPaths::from_env(env),
        }
    }
}
