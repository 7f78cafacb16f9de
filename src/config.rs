//! Optional on-disk settings for the `rget` binary.
//!
//! Settings are read from the TOML file named by `RGET_CONFIG`, falling back
//! to `rget.toml` in the working directory. Every field is optional; command
//! line flags take precedence over anything set here.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable pointing at an alternative settings file.
pub const CONFIG_ENV: &str = "RGET_CONFIG";

/// Default range request size (5 MiB).
pub const DEFAULT_CHUNK_SIZE_KB: u64 = 5 * 1024;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Size of each range request in KiB.
    pub chunk_size_kb: Option<u64>,
    /// Directory downloads are saved into.
    pub default_dir: Option<String>,
    pub user_agent: Option<String>,
    /// Longest a response may stall between two reads, in seconds. A slow but
    /// steady range transfer is never cut off.
    pub read_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

impl Settings {
    /// Loads settings from the configured path.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("rget.toml"));

        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse(&raw)
                .with_context(|| format!("invalid settings in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_kb.unwrap_or(DEFAULT_CHUNK_SIZE_KB).max(1) * 1024
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("rget/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn read_timeout_secs(&self) -> u64 {
        self.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
    }
}
