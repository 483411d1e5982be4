//! Gateway configuration loading.
//!
//! Priority: environment variables > TOML file > built-in defaults.
//! Environment variables are applied on top of whatever the file provided.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, Result};

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lwm2m.toml";

/// Environment variable names
pub mod env_vars {
    pub const TIMEOUT_MS: &str = "NEOMIND_LWM2M_TIMEOUT_MS";
    pub const CREDENTIALS_TIMEOUT_MS: &str = "NEOMIND_LWM2M_CREDENTIALS_TIMEOUT_MS";
    pub const SESSION_REPORT_MS: &str = "NEOMIND_LWM2M_SESSION_REPORT_MS";
    pub const FIRMWARE_CHUNK_SIZE: &str = "NEOMIND_LWM2M_FIRMWARE_CHUNK_SIZE";
    pub const LOG_MAX_LENGTH: &str = "NEOMIND_LWM2M_LOG_MAX_LENGTH";
}

/// Runtime configuration of the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Default timeout of a downlink request in milliseconds
    pub timeout_ms: u64,
    /// Bounded wait for the backend credential check in milliseconds
    pub credentials_timeout_ms: u64,
    /// Worker permits for registration events
    pub registered_pool_size: usize,
    /// Worker permits for registration update events
    pub update_registered_pool_size: usize,
    /// Worker permits for deregistration events
    pub unregistered_pool_size: usize,
    /// Worker permits for downlink response processing
    pub response_pool_size: usize,
    /// Period of the session liveness sweep in milliseconds
    pub session_report_timeout_ms: u64,
    /// Maximum length of a device diagnostic message
    pub log_max_length: usize,
    /// Bytes written to the firmware package resource per request
    pub firmware_chunk_size: usize,
    /// Serve security info for bootstrap connections
    pub bootstrap_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            credentials_timeout_ms: 10_000,
            registered_pool_size: 10,
            update_registered_pool_size: 10,
            unregistered_pool_size: 10,
            response_pool_size: 100,
            session_report_timeout_ms: 30_000,
            log_max_length: 1024,
            firmware_chunk_size: 1024,
            bootstrap_enabled: true,
        }
    }
}

impl GatewayConfig {
    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`]) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(category = "config", "Loading config from: {}", path.display());
                toml::from_str(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(category = "config", "No config file, using defaults");
                GatewayConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `NEOMIND_LWM2M_*` variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_number(env_vars::TIMEOUT_MS) {
            self.timeout_ms = v;
        }
        if let Some(v) = env_number(env_vars::CREDENTIALS_TIMEOUT_MS) {
            self.credentials_timeout_ms = v;
        }
        if let Some(v) = env_number(env_vars::SESSION_REPORT_MS) {
            self.session_report_timeout_ms = v;
        }
        if let Some(v) = env_number(env_vars::FIRMWARE_CHUNK_SIZE) {
            self.firmware_chunk_size = v as usize;
        }
        if let Some(v) = env_number(env_vars::LOG_MAX_LENGTH) {
            self.log_max_length = v as usize;
        }
    }

    /// Reject values that would stall the gateway.
    pub fn validate(&self) -> Result<()> {
        let pools = [
            ("registered_pool_size", self.registered_pool_size),
            ("update_registered_pool_size", self.update_registered_pool_size),
            ("unregistered_pool_size", self.unregistered_pool_size),
            ("response_pool_size", self.response_pool_size),
            ("firmware_chunk_size", self.firmware_chunk_size),
            ("log_max_length", self.log_max_length),
        ];
        if let Some((name, _)) = pools.iter().find(|(_, v)| *v == 0) {
            return Err(GatewayError::Config(format!("{} must be positive", name)));
        }
        let timeouts = [
            ("timeout_ms", self.timeout_ms),
            ("credentials_timeout_ms", self.credentials_timeout_ms),
            ("session_report_timeout_ms", self.session_report_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(GatewayError::Config(format!("{} must be positive", name)));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn credentials_timeout(&self) -> Duration {
        Duration::from_millis(self.credentials_timeout_ms)
    }

    pub fn session_report_interval(&self) -> Duration {
        Duration::from_millis(self.session_report_timeout_ms)
    }
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => {
            info!(category = "config", var = name, value = v, "Env override");
            Some(v)
        }
        Err(_) => {
            tracing::warn!(category = "config", var = name, value = %raw, "Ignoring non-numeric env override");
            None
        }
    }
}
