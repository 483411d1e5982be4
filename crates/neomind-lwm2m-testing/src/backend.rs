//! Recording backend bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use neomind_lwm2m::{
    CredentialsKind, DeviceInfo, DeviceProfile, FirmwareAssignment, KeyValue, KvValue, Result, RpcResponse,
    SessionEvent, SessionInfo, SessionListener, TransportService, TsKeyValue, ValidateCredentialsResponse,
    LOG_TELEMETRY_KEY,
};

use crate::fixtures::no_sec_credentials;

/// One publish call.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub session_id: Uuid,
    pub device_name: String,
    pub values: Vec<KeyValue>,
}

/// Backend that answers from tables filled by the test and records every
/// outbound call.
#[derive(Default)]
pub struct RecordingBackend {
    credentials: DashMap<String, ValidateCredentialsResponse>,
    firmware: DashMap<Uuid, FirmwareAssignment>,
    shared: DashMap<Uuid, Vec<TsKeyValue>>,
    listeners: DashMap<Uuid, Arc<dyn SessionListener>>,
    sessions: DashMap<Uuid, SessionInfo>,
    active: DashSet<Uuid>,
    subscriptions: Mutex<Vec<(Uuid, &'static str)>>,
    session_events: Mutex<Vec<(Uuid, SessionEvent)>>,
    attributes: Mutex<Vec<Published>>,
    telemetry: Mutex<Vec<Published>>,
    rpc_responses: Mutex<Vec<RpcResponse>>,
    never_reply: AtomicBool,
    credential_calls: AtomicUsize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential document for `identity`.
    pub fn add_credentials(
        &self,
        identity: &str,
        body: Value,
        device: Option<DeviceInfo>,
        profile: Option<DeviceProfile>,
    ) {
        self.credentials.insert(
            identity.to_string(),
            ValidateCredentialsResponse {
                credentials_body: Some(body.to_string()),
                device,
                profile,
            },
        );
    }

    /// NO_SEC device named after its endpoint.
    pub fn add_device(&self, endpoint: &str, profile: &DeviceProfile) -> DeviceInfo {
        let device = DeviceInfo {
            device_id: Uuid::new_v4(),
            device_name: endpoint.to_string(),
            device_type: "lwm2m".into(),
            profile_id: profile.id,
            tenant_id: Uuid::new_v4(),
        };
        self.add_credentials(
            endpoint,
            no_sec_credentials(endpoint),
            Some(device.clone()),
            Some(profile.clone()),
        );
        device
    }

    /// Stop answering credential checks.
    pub fn set_never_reply(&self, never: bool) {
        self.never_reply.store(never, Ordering::SeqCst);
    }

    pub fn assign_firmware(&self, device_id: Uuid, assignment: FirmwareAssignment) {
        self.firmware.insert(device_id, assignment);
    }

    pub fn set_shared_attributes(&self, device_id: Uuid, values: Vec<TsKeyValue>) {
        self.shared.insert(device_id, values);
    }

    /// Pretend the backend lost the session.
    pub fn forget_session(&self, session_id: Uuid) {
        self.active.remove(&session_id);
    }

    pub fn credential_calls(&self) -> usize {
        self.credential_calls.load(Ordering::SeqCst)
    }

    pub fn listener(&self, session_id: Uuid) -> Option<Arc<dyn SessionListener>> {
        self.listeners.get(&session_id).map(|l| l.value().clone())
    }

    /// Open backend session of a device.
    pub fn session_for(&self, device_name: &str) -> Option<SessionInfo> {
        self.sessions
            .iter()
            .find(|s| s.value().device_name == device_name)
            .map(|s| s.value().clone())
    }

    pub fn is_active(&self, session_id: Uuid) -> bool {
        self.active.contains(&session_id)
    }

    pub fn attributes(&self) -> Vec<Published> {
        self.attributes.lock().clone()
    }

    pub fn telemetry(&self) -> Vec<Published> {
        self.telemetry.lock().clone()
    }

    /// Values published under `key`, attributes and telemetry alike.
    pub fn values_of(&self, key: &str) -> Vec<KvValue> {
        let attributes = self.attributes.lock();
        let telemetry = self.telemetry.lock();
        attributes
            .iter()
            .chain(telemetry.iter())
            .flat_map(|p| p.values.iter())
            .filter(|kv| kv.key == key)
            .map(|kv| kv.value.clone())
            .collect()
    }

    /// Diagnostic lines published for a device.
    pub fn device_logs(&self, device_name: &str) -> Vec<String> {
        self.telemetry
            .lock()
            .iter()
            .filter(|p| p.device_name == device_name)
            .flat_map(|p| p.values.iter())
            .filter(|kv| kv.key == LOG_TELEMETRY_KEY)
            .map(|kv| kv.value.to_string())
            .collect()
    }

    pub fn rpc_responses(&self) -> Vec<RpcResponse> {
        self.rpc_responses.lock().clone()
    }

    pub fn session_events(&self) -> Vec<(Uuid, SessionEvent)> {
        self.session_events.lock().clone()
    }

    pub fn subscriptions(&self, session_id: Uuid) -> Vec<&'static str> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, kind)| *kind)
            .collect()
    }
}

#[async_trait]
impl TransportService for RecordingBackend {
    async fn validate_credentials(
        &self,
        identity: &str,
        _kind: CredentialsKind,
    ) -> Result<ValidateCredentialsResponse> {
        self.credential_calls.fetch_add(1, Ordering::SeqCst);
        if self.never_reply.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .credentials
            .get(identity)
            .map(|c| c.value().clone())
            .unwrap_or_default())
    }

    async fn get_firmware(&self, session: &SessionInfo) -> Result<Option<FirmwareAssignment>> {
        Ok(self.firmware.get(&session.device_id).map(|f| f.value().clone()))
    }

    async fn get_shared_attributes(&self, session: &SessionInfo, keys: Vec<String>) -> Result<Vec<TsKeyValue>> {
        Ok(self
            .shared
            .get(&session.device_id)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| keys.contains(&v.kv.key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish_attributes(&self, session: &SessionInfo, values: Vec<KeyValue>) -> Result<()> {
        self.attributes.lock().push(Published {
            session_id: session.session_id,
            device_name: session.device_name.clone(),
            values,
        });
        Ok(())
    }

    async fn publish_telemetry(&self, session: &SessionInfo, values: Vec<KeyValue>) -> Result<()> {
        self.telemetry.lock().push(Published {
            session_id: session.session_id,
            device_name: session.device_name.clone(),
            values,
        });
        Ok(())
    }

    async fn publish_rpc_response(&self, _session: &SessionInfo, response: RpcResponse) -> Result<()> {
        self.rpc_responses.lock().push(response);
        Ok(())
    }

    async fn register_session(&self, session: &SessionInfo, listener: Arc<dyn SessionListener>) -> Result<()> {
        self.listeners.insert(session.session_id, listener);
        self.sessions.insert(session.session_id, session.clone());
        self.active.insert(session.session_id);
        Ok(())
    }

    async fn deregister_session(&self, session: &SessionInfo) -> Result<()> {
        self.listeners.remove(&session.session_id);
        self.sessions.remove(&session.session_id);
        self.active.remove(&session.session_id);
        Ok(())
    }

    async fn process_session_event(&self, session: &SessionInfo, event: SessionEvent) -> Result<()> {
        self.session_events.lock().push((session.session_id, event));
        Ok(())
    }

    async fn subscribe_attribute_updates(&self, session: &SessionInfo) -> Result<()> {
        self.subscriptions.lock().push((session.session_id, "attributes"));
        Ok(())
    }

    async fn subscribe_rpc(&self, session: &SessionInfo) -> Result<()> {
        self.subscriptions.lock().push((session.session_id, "rpc"));
        Ok(())
    }

    async fn report_activity(&self, session: &SessionInfo) -> bool {
        self.active.contains(&session.session_id)
    }
}
