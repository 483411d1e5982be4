//! Device-scoped diagnostics, published as backend telemetry.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::backend::{SessionInfo, TransportService};
use crate::convert::{KeyValue, KvValue};

/// Telemetry key carrying device diagnostics.
pub const LOG_TELEMETRY_KEY: &str = "logLwm2m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

pub struct DeviceLogger {
    backend: Arc<dyn TransportService>,
    max_length: usize,
}

impl DeviceLogger {
    pub fn new(backend: Arc<dyn TransportService>, max_length: usize) -> Self {
        Self {
            backend,
            max_length,
        }
    }

    /// Publish `message` for the device behind `session`.
    pub async fn log(&self, session: &SessionInfo, level: LogLevel, message: &str) {
        let line = truncate(&format!("{}: {}", level, message), self.max_length);
        let value = vec![KeyValue::new(LOG_TELEMETRY_KEY, KvValue::String(line))];
        if let Err(e) = self.backend.publish_telemetry(session, value).await {
            warn!(device = %session.device_name, error = %e, "Failed to publish device log");
        }
    }
}

/// Cut `text` to at most `max` characters.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
