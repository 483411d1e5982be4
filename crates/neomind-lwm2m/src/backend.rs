//! Backend bus collaborator.
//!
//! The gateway talks to the platform through [`TransportService`]. Events the
//! platform pushes for a particular device arrive on the [`SessionListener`]
//! registered with that device's session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::convert::KeyValue;
use crate::error::Result;

/// Which server a credential lookup is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialsKind {
    Client,
    Bootstrap,
}

/// Device record as known to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub profile_id: Uuid,
    pub tenant_id: Uuid,
}

/// Device profile snapshot carrying the LwM2M transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: Uuid,
    pub name: String,
    /// Raw LwM2M transport configuration
    pub transport_configuration: Value,
}

/// Answer to a credential validation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateCredentialsResponse {
    /// Credential document (JSON), absent when the identity is unknown
    pub credentials_body: Option<String>,
    pub device: Option<DeviceInfo>,
    pub profile: Option<DeviceProfile>,
}

/// Firmware currently assigned to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareAssignment {
    pub firmware_id: Uuid,
    pub title: String,
    pub version: String,
}

/// Identity of an open backend session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub profile_id: Uuid,
    pub tenant_id: Uuid,
}

impl SessionInfo {
    pub fn new(session_id: Uuid, device: &DeviceInfo) -> Self {
        Self {
            session_id,
            device_id: device.device_id,
            device_name: device.device_name.clone(),
            device_type: device.device_type.clone(),
            profile_id: device.profile_id,
            tenant_id: device.tenant_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Open,
    Closed,
}

/// Key-value with the backend timestamp (ms) it was produced at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsKeyValue {
    pub ts: i64,
    pub kv: KeyValue,
}

/// Shared attribute change pushed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub updated: Vec<TsKeyValue>,
    pub deleted: Vec<String>,
}

/// RPC request addressed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRpcRequest {
    pub request_id: i32,
    pub method: String,
    /// Params document (JSON text)
    pub params: String,
}

/// Terminal answer to a [`ToDeviceRpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: i32,
    pub payload: Value,
}

/// Platform side of the gateway.
#[async_trait]
pub trait TransportService: Send + Sync {
    async fn validate_credentials(
        &self,
        identity: &str,
        kind: CredentialsKind,
    ) -> Result<ValidateCredentialsResponse>;

    async fn get_firmware(&self, session: &SessionInfo) -> Result<Option<FirmwareAssignment>>;

    async fn get_shared_attributes(
        &self,
        session: &SessionInfo,
        keys: Vec<String>,
    ) -> Result<Vec<TsKeyValue>>;

    async fn publish_attributes(&self, session: &SessionInfo, values: Vec<KeyValue>) -> Result<()>;

    async fn publish_telemetry(&self, session: &SessionInfo, values: Vec<KeyValue>) -> Result<()>;

    async fn publish_rpc_response(&self, session: &SessionInfo, response: RpcResponse) -> Result<()>;

    async fn register_session(
        &self,
        session: &SessionInfo,
        listener: Arc<dyn SessionListener>,
    ) -> Result<()>;

    async fn deregister_session(&self, session: &SessionInfo) -> Result<()>;

    async fn process_session_event(&self, session: &SessionInfo, event: SessionEvent) -> Result<()>;

    async fn subscribe_attribute_updates(&self, session: &SessionInfo) -> Result<()>;

    async fn subscribe_rpc(&self, session: &SessionInfo) -> Result<()>;

    /// Returns false when the backend no longer knows the session.
    async fn report_activity(&self, session: &SessionInfo) -> bool;
}

/// Backend events bound to one device session.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_attribute_update(&self, update: AttributeUpdate);

    async fn on_profile_update(&self, profile: DeviceProfile);

    async fn on_device_update(&self, device: DeviceInfo, profile: Option<DeviceProfile>);

    async fn on_rpc_request(&self, request: ToDeviceRpcRequest);

    async fn on_credentials_update(&self);
}
