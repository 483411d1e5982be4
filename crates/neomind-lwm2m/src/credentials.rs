//! Credential resolution.
//!
//! Validates a connecting identity against backend-issued credentials. The
//! backend call is awaited for at most `credentials_timeout`; a timeout or a
//! backend failure resolves to `None`, which callers treat as unknown
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{CredentialsKind, DeviceInfo, DeviceProfile, TransportService};
use crate::bootstrap::BootstrapCredentials;
use crate::error::{GatewayError, Result};

/// Security mode of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityMode {
    NoSec,
    Psk,
    Rpk,
    X509,
}

/// Decoded security material handed to the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityInfo {
    Psk {
        endpoint: String,
        identity: String,
        key: Vec<u8>,
    },
    Rpk {
        endpoint: String,
        public_key: Vec<u8>,
    },
    X509 {
        endpoint: String,
    },
}

impl SecurityInfo {
    pub fn endpoint(&self) -> &str {
        match self {
            SecurityInfo::Psk { endpoint, .. }
            | SecurityInfo::Rpk { endpoint, .. }
            | SecurityInfo::X509 { endpoint } => endpoint,
        }
    }

    pub fn mode(&self) -> SecurityMode {
        match self {
            SecurityInfo::Psk { .. } => SecurityMode::Psk,
            SecurityInfo::Rpk { .. } => SecurityMode::Rpk,
            SecurityInfo::X509 { .. } => SecurityMode::X509,
        }
    }
}

/// Credential document stored by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsBody {
    #[serde(default)]
    pub client: Option<ClientCredentials>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCredentials {
    pub security_config_client_mode: SecurityMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    /// Hex encoded PSK or RPK public key
    #[serde(default)]
    pub key: Option<String>,
}

/// Successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCredentials {
    /// Endpoint the session binds to
    pub endpoint: String,
    pub security_mode: SecurityMode,
    /// `None` for NO_SEC
    pub security_info: Option<SecurityInfo>,
    pub device: Option<DeviceInfo>,
    pub profile: Option<DeviceProfile>,
    pub bootstrap: Option<BootstrapCredentials>,
}

/// Resolves identities through the backend with a bounded wait.
pub struct CredentialResolver {
    backend: Arc<dyn TransportService>,
    timeout: Duration,
}

impl CredentialResolver {
    pub fn new(backend: Arc<dyn TransportService>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `identity` for the given server kind.
    pub async fn resolve(&self, identity: &str, kind: CredentialsKind) -> Option<ResolvedCredentials> {
        let response = match tokio::time::timeout(
            self.timeout,
            self.backend.validate_credentials(identity, kind),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(identity, error = %e, "Credential validation failed");
                return None;
            }
            Err(_) => {
                warn!(
                    identity,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Credential validation timed out"
                );
                return None;
            }
        };

        let Some(raw) = response.credentials_body.as_deref() else {
            debug!(identity, "No credentials registered");
            return None;
        };
        let body: CredentialsBody = match serde_json::from_str(raw) {
            Ok(body) => body,
            Err(e) => {
                warn!(identity, error = %e, "Unparsable credentials body");
                return None;
            }
        };

        match security_from_body(identity, kind, &body) {
            Ok((endpoint, security_mode, security_info)) => Some(ResolvedCredentials {
                endpoint,
                security_mode,
                security_info,
                device: response.device,
                profile: response.profile,
                bootstrap: body.bootstrap,
            }),
            Err(e) => {
                warn!(identity, error = %e, "Credentials rejected");
                None
            }
        }
    }
}

/// Endpoint, mode and security info derived from a credential document.
pub fn security_from_body(
    identity: &str,
    kind: CredentialsKind,
    body: &CredentialsBody,
) -> Result<(String, SecurityMode, Option<SecurityInfo>)> {
    let declared_endpoint = body
        .client
        .as_ref()
        .and_then(|client| client.endpoint.clone())
        .filter(|endpoint| !endpoint.is_empty());
    let endpoint = declared_endpoint.unwrap_or_else(|| identity.to_string());

    let (mode, key_id, key) = match kind {
        CredentialsKind::Client => {
            let client = body
                .client
                .as_ref()
                .ok_or_else(|| GatewayError::MalformedPayload("missing client section".into()))?;
            (
                client.security_config_client_mode,
                client.identity.clone(),
                client.key.clone(),
            )
        }
        CredentialsKind::Bootstrap => {
            let server = &body
                .bootstrap
                .as_ref()
                .ok_or_else(|| GatewayError::MalformedPayload("missing bootstrap section".into()))?
                .bootstrap_server;
            (
                server.security_mode,
                server.client_public_key_or_id.clone(),
                server.client_secret_key.clone(),
            )
        }
    };

    let decode = |name: &str, value: Option<String>| -> Result<Vec<u8>> {
        let value = value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::MalformedPayload(format!("missing {}", name)))?;
        hex::decode(value.trim())
            .map_err(|e| GatewayError::MalformedPayload(format!("{} is not hex: {}", name, e)))
    };

    let info = match mode {
        SecurityMode::NoSec => None,
        SecurityMode::Psk => {
            let psk_identity = key_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| GatewayError::MalformedPayload("missing PSK identity".into()))?;
            Some(SecurityInfo::Psk {
                endpoint: endpoint.clone(),
                identity: psk_identity,
                key: decode("PSK key", key)?,
            })
        }
        SecurityMode::Rpk => {
            let public_key = match kind {
                CredentialsKind::Client => decode("RPK public key", key)?,
                CredentialsKind::Bootstrap => decode("RPK public key", key_id)?,
            };
            Some(SecurityInfo::Rpk {
                endpoint: endpoint.clone(),
                public_key,
            })
        }
        SecurityMode::X509 => Some(SecurityInfo::X509 {
            endpoint: endpoint.clone(),
        }),
    };

    Ok((endpoint, mode, info))
}
