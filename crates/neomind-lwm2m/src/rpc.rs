//! Backend RPC requests and their exactly-once completion.

use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{RpcResponse, SessionInfo, ToDeviceRpcRequest, TransportService};
use crate::dispatcher::Operation;
use crate::error::{GatewayError, Result};
use crate::model::{ContentFormat, ResponseCode};
use crate::path::VersionedPath;
use crate::profile::ProfileConfig;

/// Correlation of an in-flight RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcKey {
    pub session_id: Uuid,
    pub request_id: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcParams {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content_format: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    params: Option<Map<String, Value>>,
}

/// Validated device operation requested by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub request_id: i32,
    pub operation: Operation,
    pub target: Option<VersionedPath>,
    pub key_name: Option<String>,
    pub content_format: Option<ContentFormat>,
    pub timeout: Option<Duration>,
    pub value: Option<Value>,
    pub params: Option<Map<String, Value>>,
}

impl RpcRequest {
    /// Parse and validate a backend request. A `key` is resolved to its path
    /// through the profile key-name map.
    pub fn parse(request: &ToDeviceRpcRequest, profile: Option<&ProfileConfig>) -> Result<Self> {
        let operation: Operation = request.method.parse()?;
        let params: RpcParams = if request.params.trim().is_empty() {
            RpcParams::default()
        } else {
            serde_json::from_str(&request.params)
                .map_err(|e| GatewayError::MalformedPayload(format!("RPC params: {}", e)))?
        };

        let target = match (&params.id, &params.key) {
            (Some(id), _) => Some(id.parse::<VersionedPath>()?),
            (None, Some(key)) => Some(
                profile
                    .and_then(|p| p.path_for_key(key))
                    .cloned()
                    .ok_or_else(|| GatewayError::MalformedPayload(format!("key {} is not mapped to a path", key)))?,
            ),
            (None, None) => None,
        };
        let content_format = params
            .content_format
            .as_deref()
            .map(str::parse::<ContentFormat>)
            .transpose()?;

        let rpc = Self {
            request_id: request.request_id,
            operation,
            target,
            key_name: params.key,
            content_format,
            timeout: params.timeout.filter(|t| *t > 0).map(Duration::from_millis),
            value: params.value,
            params: params.params,
        };
        rpc.validate()?;
        Ok(rpc)
    }

    fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(GatewayError::MalformedPayload(msg));
        let needs_path = !matches!(self.operation, Operation::ObserveReadAll | Operation::ObserveCancel);
        let Some(target) = &self.target else {
            if needs_path {
                return bad(format!("{} requires a target path", self.operation));
            }
            return Ok(());
        };
        match self.operation {
            Operation::Execute | Operation::WriteReplace
                if !(target.path.is_resource() || target.path.is_resource_instance()) =>
            {
                bad(format!("{} is only allowed on a resource, not {}", self.operation, target))
            }
            Operation::WriteReplace if self.value.is_none() => bad("WriteReplace requires a value".into()),
            Operation::WriteUpdate if !target.path.is_object_instance() => {
                bad(format!("WriteUpdate requires an object instance path, not {}", target))
            }
            Operation::WriteUpdate | Operation::WriteAttributes if self.params.is_none() => {
                bad(format!("{} requires params", self.operation))
            }
            _ => Ok(()),
        }
    }

    pub fn key(&self, session_id: Uuid) -> RpcKey {
        RpcKey {
            session_id,
            request_id: self.request_id,
        }
    }
}

/// Terminal result of an RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcOutcome {
    pub code: ResponseCode,
    pub error: Option<String>,
    pub info: Option<String>,
    pub value: Option<String>,
}

impl RpcOutcome {
    pub fn success(code: ResponseCode) -> Self {
        Self {
            code,
            error: None,
            info: None,
            value: None,
        }
    }

    pub fn error(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::success(code)
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({ "result": self.code.name() });
        if let Some(error) = &self.error {
            payload["error"] = json!(error);
        }
        if let Some(info) = &self.info {
            payload["info"] = json!(info);
        }
        if let Some(value) = &self.value {
            payload["value"] = json!(value);
        }
        payload
    }
}

impl From<&GatewayError> for RpcOutcome {
    fn from(e: &GatewayError) -> Self {
        RpcOutcome::error(e.response_code(), e.to_string())
    }
}

/// In-flight RPCs. Each is reported to the backend exactly once.
pub struct RpcTracker {
    in_flight: DashMap<RpcKey, SessionInfo>,
    backend: Arc<dyn TransportService>,
}

impl RpcTracker {
    pub fn new(backend: Arc<dyn TransportService>) -> Self {
        Self {
            in_flight: DashMap::new(),
            backend,
        }
    }

    /// Start tracking. Returns false when the same request is already in flight.
    pub fn begin(&self, session: &SessionInfo, request_id: i32) -> bool {
        let key = RpcKey {
            session_id: session.session_id,
            request_id,
        };
        let mut inserted = false;
        self.in_flight.entry(key).or_insert_with(|| {
            inserted = true;
            session.clone()
        });
        inserted
    }

    /// Report the outcome. Later completions of the same key are ignored.
    pub async fn complete(&self, key: RpcKey, outcome: RpcOutcome) -> bool {
        let Some((_, session)) = self.in_flight.remove(&key) else {
            debug!(request_id = key.request_id, "RPC already completed");
            return false;
        };
        let response = RpcResponse {
            request_id: key.request_id,
            payload: outcome.to_payload(),
        };
        if let Err(e) = self.backend.publish_rpc_response(&session, response).await {
            warn!(request_id = key.request_id, error = %e, "Failed to publish RPC response");
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: &str) -> ToDeviceRpcRequest {
        ToDeviceRpcRequest {
            request_id: 7,
            method: method.into(),
            params: params.into(),
        }
    }

    #[test]
    fn test_parse_read_by_id() {
        let rpc = RpcRequest::parse(&request("Read", r#"{"id": "/3_1.0/0/9", "timeout": 500}"#), None).unwrap();
        assert_eq!(rpc.operation, Operation::Read);
        assert_eq!(rpc.target.unwrap().to_string(), "/3_1.0/0/9");
        assert_eq!(rpc.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_by_key_name() {
        let mut profile = ProfileConfig::default();
        profile
            .key_names
            .insert("/3_1.0/0/9".parse().unwrap(), "battery".into());
        let rpc = RpcRequest::parse(&request("Observe", r#"{"key": "battery"}"#), Some(&profile)).unwrap();
        assert_eq!(rpc.target.unwrap().path.to_string(), "/3/0/9");

        let err = RpcRequest::parse(&request("Observe", r#"{"key": "missing"}"#), Some(&profile)).unwrap_err();
        assert_eq!(err.response_code(), ResponseCode::BadRequest);
    }

    #[test]
    fn test_validation_rules() {
        assert!(RpcRequest::parse(&request("Execute", r#"{"id": "/3/0"}"#), None).is_err());
        assert!(RpcRequest::parse(&request("Execute", r#"{"id": "/3/0/4"}"#), None).is_ok());
        assert!(RpcRequest::parse(&request("WriteReplace", r#"{"id": "/3/0/14"}"#), None).is_err());
        assert!(RpcRequest::parse(&request("WriteUpdate", r#"{"id": "/3/0/14", "params": {}}"#), None).is_err());
        assert!(RpcRequest::parse(&request("Read", "{}"), None).is_err());
        assert!(RpcRequest::parse(&request("ObserveCancel", ""), None).is_ok());
        assert!(RpcRequest::parse(&request("Reboot", "{}"), None).is_err());
        assert!(RpcRequest::parse(&request("Read", "{not json"), None).is_err());
    }

    #[test]
    fn test_outcome_payload() {
        let payload = RpcOutcome::success(ResponseCode::Content).with_value("87").to_payload();
        assert_eq!(payload, json!({"result": "CONTENT", "value": "87"}));
        let payload = RpcOutcome::error(ResponseCode::NotFound, "nope").to_payload();
        assert_eq!(payload, json!({"result": "NOT_FOUND", "error": "nope"}));
    }
}
