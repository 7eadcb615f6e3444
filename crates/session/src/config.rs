// Client configuration at `~/.cowrite/config.toml`.

use std::path::{Path, PathBuf};

use cowrite_common::identity::resolve_color;
use cowrite_common::UserProfile;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::throttle::ThrottleConfig;
use crate::transport::ReconnectPolicy;

/// Root directory for client state: `~/.cowrite/`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cowrite"))
}

/// `~/.cowrite/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay host, e.g. `relay.example` or `ws://localhost:1999`.
    pub relay_host: Option<String>,
    pub user: UserConfig,
    pub session: SessionTuning,
    pub transport: TransportTuning,
}

/// Preferred identity. Unset fields are generated per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    pub name: Option<String>,
    /// Palette key (`"blue"`) or `#rrggbb`.
    pub color: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionTuning {
    pub roster_throttle_ms: u64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self { roster_throttle_ms: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportTuning {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self { reconnect_base_ms: 250, reconnect_max_ms: 30_000 }
    }
}

impl ClientConfig {
    /// Load from `~/.cowrite/config.toml`. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The configured identity with every missing piece generated.
    /// An unrecognised color falls back to a generated one.
    pub fn profile(&self) -> UserProfile {
        let generated = UserProfile::random();
        UserProfile {
            name: self
                .user
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(generated.name),
            color: self.user.color.as_deref().and_then(resolve_color).unwrap_or(generated.color),
            avatar: self.user.avatar.clone().or(generated.avatar),
        }
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig::with_millis(self.session.roster_throttle_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_millis(
            self.transport.reconnect_base_ms,
            self.transport.reconnect_max_ms,
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine home directory")]
    NoHome,
}
