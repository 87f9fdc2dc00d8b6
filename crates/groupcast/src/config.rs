// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// TCP port to listen on (default: 51511)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding each group's backing file and the reset marker
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Cold-start reset window in seconds
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,

    /// Maximum accepted frame body size (anti-OOM bound on the codec)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_port() -> u16 {
    51511
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/.groups")
}

fn default_reset_window_secs() -> u64 {
    300
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            state_dir: default_state_dir(),
            reset_window_secs: default_reset_window_secs(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

/// Errors loading or saving a [`BrokerConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
