//! Bootstrap security store.
//!
//! For a device in the bootstrap phase the gateway merges the server layout
//! declared in the device profile with the security material from the device
//! credentials, injects the result into the engine's bootstrap config store and
//! answers with the security info the connection must use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::backend::{CredentialsKind, SessionInfo};
use crate::credentials::{CredentialResolver, ResolvedCredentials, SecurityInfo, SecurityMode};
use crate::diagnostics::{DeviceLogger, LogLevel};
use crate::engine::BootstrapConfigStore;
use crate::error::{GatewayError, Result};
use crate::profile::ProfileConfig;

/// Security material of one server entry in the credentials body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCredentials {
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub client_public_key_or_id: Option<String>,
    /// Hex encoded
    #[serde(default)]
    pub client_secret_key: Option<String>,
}

/// Bootstrap section of the credentials body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapCredentials {
    pub bootstrap_server: ServerCredentials,
    pub lwm2m_server: ServerCredentials,
}

fn default_short_id() -> u16 {
    123
}

fn default_lifetime() -> u64 {
    300
}

fn default_min_period() -> u64 {
    1
}

fn default_binding() -> String {
    "U".to_string()
}

fn default_true() -> bool {
    true
}

/// Server object settings written during bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_short_id")]
    pub short_id: u16,
    #[serde(default = "default_lifetime")]
    pub lifetime: u64,
    #[serde(default = "default_min_period")]
    pub default_min_period: u64,
    #[serde(default = "default_true")]
    pub notif_if_disabled: bool,
    #[serde(default = "default_binding")]
    pub binding: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            short_id: default_short_id(),
            lifetime: default_lifetime(),
            default_min_period: default_min_period(),
            notif_if_disabled: true,
            binding: default_binding(),
        }
    }
}

/// Server endpoint as declared in the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoint {
    pub security_mode: SecurityMode,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub server_id: u16,
    /// Hex encoded
    #[serde(default)]
    pub server_public_key: Option<String>,
    #[serde(default)]
    pub client_hold_off_time: u32,
    #[serde(default)]
    pub bootstrap_server_account_timeout: u32,
}

/// Bootstrap section of the profile document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapProfile {
    #[serde(default)]
    pub servers: ServerSettings,
    pub bootstrap_server: ServerEndpoint,
    pub lwm2m_server: ServerEndpoint,
}

/// One security object instance of a bootstrap configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEntry {
    pub uri: String,
    pub bootstrap_server: bool,
    pub security_mode: SecurityMode,
    pub public_key_or_id: Vec<u8>,
    pub secret_key: Vec<u8>,
    pub server_public_key: Vec<u8>,
    pub server_id: u16,
    pub client_hold_off_time: u32,
    pub bootstrap_server_account_timeout: u32,
}

/// Configuration pushed to a device during bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub servers: ServerSettings,
    pub bootstrap_server: SecurityEntry,
    pub lwm2m_server: SecurityEntry,
}

impl BootstrapConfig {
    /// Merge profile layout and credential material for `endpoint`.
    pub fn merge(
        endpoint: &str,
        profile: &BootstrapProfile,
        credentials: &BootstrapCredentials,
    ) -> Result<Self> {
        let conflict = |server: &str, profile_mode: SecurityMode, credential_mode: SecurityMode| {
            GatewayError::BootstrapConflict {
                endpoint: endpoint.to_string(),
                reason: format!(
                    "{} security mode is {:?} in profile but {:?} in credentials",
                    server, profile_mode, credential_mode
                ),
            }
        };
        if profile.bootstrap_server.security_mode != credentials.bootstrap_server.security_mode {
            return Err(conflict(
                "bootstrap server",
                profile.bootstrap_server.security_mode,
                credentials.bootstrap_server.security_mode,
            ));
        }
        if profile.lwm2m_server.security_mode != credentials.lwm2m_server.security_mode {
            return Err(conflict(
                "LwM2M server",
                profile.lwm2m_server.security_mode,
                credentials.lwm2m_server.security_mode,
            ));
        }

        Ok(Self {
            servers: profile.servers.clone(),
            bootstrap_server: security_entry(
                endpoint,
                &profile.bootstrap_server,
                &credentials.bootstrap_server,
                true,
            )?,
            lwm2m_server: security_entry(
                endpoint,
                &profile.lwm2m_server,
                &credentials.lwm2m_server,
                false,
            )?,
        })
    }
}

fn security_entry(
    endpoint: &str,
    server: &ServerEndpoint,
    credentials: &ServerCredentials,
    bootstrap_server: bool,
) -> Result<SecurityEntry> {
    let scheme = match server.security_mode {
        SecurityMode::NoSec => "coap",
        _ => "coaps",
    };
    let decode = |value: &Option<String>| -> Result<Vec<u8>> {
        match value.as_deref().filter(|v| !v.is_empty()) {
            None => Ok(Vec::new()),
            Some(v) => hex::decode(v.trim()).map_err(|e| GatewayError::BootstrapConflict {
                endpoint: endpoint.to_string(),
                reason: format!("invalid key material: {}", e),
            }),
        }
    };
    // PSK identities are plain text, keys and certificates are hex.
    let public_key_or_id = match server.security_mode {
        SecurityMode::Psk => credentials
            .client_public_key_or_id
            .clone()
            .unwrap_or_default()
            .into_bytes(),
        _ => decode(&credentials.client_public_key_or_id)?,
    };
    Ok(SecurityEntry {
        uri: format!("{}://{}:{}", scheme, server.host, server.port),
        bootstrap_server,
        security_mode: server.security_mode,
        public_key_or_id,
        secret_key: decode(&credentials.client_secret_key)?,
        server_public_key: decode(&server.server_public_key)?,
        server_id: server.server_id,
        client_hold_off_time: server.client_hold_off_time,
        bootstrap_server_account_timeout: server.bootstrap_server_account_timeout,
    })
}

/// Security store serving bootstrap connections.
pub struct BootstrapSecurityStore {
    resolver: Arc<CredentialResolver>,
    config_store: Arc<dyn BootstrapConfigStore>,
    logger: Arc<DeviceLogger>,
}

impl BootstrapSecurityStore {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        config_store: Arc<dyn BootstrapConfigStore>,
        logger: Arc<DeviceLogger>,
    ) -> Self {
        Self {
            resolver,
            config_store,
            logger,
        }
    }

    /// Security info for a bootstrap connection announced by endpoint name.
    /// Unknown endpoints yield an empty list.
    pub async fn get_all_by_endpoint(&self, endpoint: &str) -> Result<Vec<SecurityInfo>> {
        Ok(self.lookup(endpoint).await?.into_iter().collect())
    }

    /// Security info for a bootstrap connection presenting a PSK identity.
    pub async fn get_by_identity(&self, identity: &str) -> Result<Option<SecurityInfo>> {
        let info = self.lookup(identity).await?;
        Ok(info.filter(|info| matches!(info, SecurityInfo::Psk { .. })))
    }

    async fn lookup(&self, identity: &str) -> Result<Option<SecurityInfo>> {
        let Some(resolved) = self.resolver.resolve(identity, CredentialsKind::Bootstrap).await else {
            return Ok(None);
        };
        let endpoint = resolved.endpoint.clone();
        match self.install(&resolved).await {
            Ok(()) => {
                info!(endpoint = %endpoint, mode = ?resolved.security_mode, "Bootstrap config installed");
                Ok(resolved.security_info)
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Bootstrap aborted");
                if let Some(device) = &resolved.device {
                    let session = SessionInfo::new(Uuid::new_v4(), device);
                    self.logger
                        .log(&session, LogLevel::Error, &format!("Bootstrap aborted: {}", e))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn install(&self, resolved: &ResolvedCredentials) -> Result<()> {
        let credentials = resolved.bootstrap.as_ref().ok_or_else(|| {
            GatewayError::MalformedPayload("credentials carry no bootstrap section".into())
        })?;
        let profile = resolved.profile.as_ref().ok_or_else(|| GatewayError::NotFound(format!(
            "device profile of {}",
            resolved.endpoint
        )))?;
        let bootstrap = ProfileConfig::from_profile(profile)?
            .bootstrap
            .ok_or_else(|| {
                GatewayError::MalformedPayload(format!("profile {} has no bootstrap section", profile.id))
            })?;

        let config = BootstrapConfig::merge(&resolved.endpoint, &bootstrap, credentials)?;
        self.config_store.remove(&resolved.endpoint).await;
        self.config_store.add(&resolved.endpoint, config).await
    }
}
