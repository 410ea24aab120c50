// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime configuration (spec.md §6.4).
//!
//! Mirrors `hdds-discovery-server::config::ServerConfig`'s shape: a
//! `serde`-derived struct with per-field `#[serde(default = "...")]`
//! functions, a `from_file`/`to_file` JSON pair gated behind the
//! `config-file` feature, and a `validate()` returning a `ConfigError`.

#[cfg(feature = "config-file")]
use std::path::Path;

/// Default filesystem path to the QM initializer's socket.
pub const DEFAULT_QM_SOCKET_PATH: &str = "/run/lap/registry_qm.sock";
/// Default filesystem path to the ASIL initializer's socket.
pub const DEFAULT_ASIL_SOCKET_PATH: &str = "/run/lap/registry_asil.sock";
/// QM socket permission bits: world read/write (spec.md §4.3).
pub const QM_SOCKET_MODE: u32 = 0o666;
/// ASIL socket permission bits: group-restricted (spec.md §4.3).
pub const ASIL_SOCKET_MODE: u32 = 0o640;
/// Default owner-side heartbeat cadence, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 100;
/// Default multiple of the heartbeat interval after which an owner is
/// considered stale by the reaper.
pub const DEFAULT_REAPER_STALE_MULTIPLIER: u32 = 3;

/// Per-process `Runtime` configuration (spec.md §6.4 option table).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-file", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeConfig {
    /// Filesystem path to the QM initializer socket.
    #[cfg_attr(feature = "config-file", serde(default = "default_qm_socket_path"))]
    pub qm_socket_path: String,
    /// Filesystem path to the ASIL initializer socket.
    #[cfg_attr(feature = "config-file", serde(default = "default_asil_socket_path"))]
    pub asil_socket_path: String,
    /// Cadence of the owner-side heartbeat task, in milliseconds.
    #[cfg_attr(feature = "config-file", serde(default = "default_heartbeat_interval_ms"))]
    pub heartbeat_interval_ms: u32,
    /// Whether the runtime performs stale-slot reaping.
    #[cfg_attr(feature = "config-file", serde(default))]
    pub enable_reaper: bool,
    /// Multiple of `heartbeat_interval_ms` after which an owner is
    /// considered stale.
    #[cfg_attr(
        feature = "config-file",
        serde(default = "default_reaper_stale_multiplier")
    )]
    pub reaper_stale_multiplier: u32,
    /// If the ASIL attach fails, continue with QM-only degraded mode
    /// instead of failing `initialize()` outright (spec.md §7,
    /// `PermissionDenied` policy). Off by default — ASIL attach failures
    /// are surfaced unless explicitly opted into degraded mode.
    #[cfg_attr(feature = "config-file", serde(default))]
    pub allow_qm_only_degraded_mode: bool,
}

#[cfg(feature = "config-file")]
fn default_qm_socket_path() -> String {
    DEFAULT_QM_SOCKET_PATH.to_string()
}

#[cfg(feature = "config-file")]
fn default_asil_socket_path() -> String {
    DEFAULT_ASIL_SOCKET_PATH.to_string()
}

#[cfg(feature = "config-file")]
fn default_heartbeat_interval_ms() -> u32 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

#[cfg(feature = "config-file")]
fn default_reaper_stale_multiplier() -> u32 {
    DEFAULT_REAPER_STALE_MULTIPLIER
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            qm_socket_path: DEFAULT_QM_SOCKET_PATH.to_string(),
            asil_socket_path: DEFAULT_ASIL_SOCKET_PATH.to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            enable_reaper: false,
            reaper_stale_multiplier: DEFAULT_REAPER_STALE_MULTIPLIER,
            allow_qm_only_degraded_mode: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file.
    #[cfg(feature = "config-file")]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    #[cfg(feature = "config-file")]
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Reaper staleness threshold as a duration.
    #[must_use]
    pub fn reaper_stale_threshold_ms(&self) -> u64 {
        u64::from(self.heartbeat_interval_ms) * u64::from(self.reaper_stale_multiplier)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_ms cannot be 0".into(),
            ));
        }
        if self.reaper_stale_multiplier == 0 {
            return Err(ConfigError::InvalidValue(
                "reaper_stale_multiplier cannot be 0".into(),
            ));
        }
        if self.qm_socket_path.is_empty() {
            return Err(ConfigError::InvalidValue("qm_socket_path cannot be empty".into()));
        }
        if self.asil_socket_path.is_empty() {
            return Err(ConfigError::InvalidValue(
                "asil_socket_path cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {s}"),
            Self::Parse(s) => write!(f, "parse error: {s}"),
            Self::Serialize(s) => write!(f, "serialize error: {s}"),
            Self::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
