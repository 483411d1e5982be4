//! Error types for the LwM2M gateway

use thiserror::Error;

use crate::model::ResponseCode;

/// Gateway result type
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised while admitting, synchronizing and commanding devices
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Credentials could not be resolved, so the registration is refused
    #[error("Admission refused for {endpoint}: {reason}")]
    Admission { endpoint: String, reason: String },

    /// Device answered with a non-success response code
    #[error("Device responded {code}: {message}")]
    Protocol { code: ResponseCode, message: String },

    /// Network failure while talking to the device
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request or backend call did not finish in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Object version of a path is not the one the device supports
    #[error("Path {0} not found in object version")]
    VersionMismatch(String),

    /// Credential and profile disagree on bootstrap security
    #[error("Bootstrap conflict for {endpoint}: {reason}")]
    BootstrapConflict { endpoint: String, reason: String },

    /// Backend document could not be decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Value does not fit the declared resource type
    #[error("Conversion failed: {0}")]
    Conversion(String),

    /// Resource does not allow the requested operation
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Session, path or resource is unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend bus call failed
    #[error("Backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    /// Response code reported to an RPC caller for this error.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            GatewayError::Protocol { code, .. } => *code,
            GatewayError::VersionMismatch(_) | GatewayError::NotFound(_) => ResponseCode::NotFound,
            GatewayError::MalformedPayload(_) | GatewayError::Conversion(_) => {
                ResponseCode::BadRequest
            }
            GatewayError::MethodNotAllowed(_) => ResponseCode::MethodNotAllowed,
            GatewayError::Timeout(_) => ResponseCode::GatewayTimeout,
            GatewayError::Admission { .. } => ResponseCode::Unauthorized,
            _ => ResponseCode::InternalServerError,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::MalformedPayload(e.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(e: toml::de::Error) -> Self {
        GatewayError::Config(e.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Config(e.to_string())
    }
}
