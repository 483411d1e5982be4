//! Backend listener bound to one device session.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{AttributeUpdate, DeviceInfo, DeviceProfile, SessionListener, ToDeviceRpcRequest};
use crate::gateway::Lwm2mGateway;
use crate::session::ClientSession;

/// Forwards backend events for a session to the gateway. Holds the gateway
/// weakly so a registered listener does not keep it alive.
pub struct SessionMsgListener {
    gateway: Weak<Lwm2mGateway>,
    session_id: Uuid,
}

impl SessionMsgListener {
    pub fn new(gateway: Weak<Lwm2mGateway>, session_id: Uuid) -> Self {
        Self { gateway, session_id }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn resolve(&self) -> Option<(Arc<Lwm2mGateway>, Arc<ClientSession>)> {
        let gateway = self.gateway.upgrade()?;
        let session = gateway.registry().by_session_id(self.session_id);
        if session.is_none() {
            debug!(session_id = %self.session_id, "Event for closed session dropped");
        }
        Some((gateway, session?))
    }
}

#[async_trait]
impl SessionListener for SessionMsgListener {
    async fn on_attribute_update(&self, update: AttributeUpdate) {
        if let Some((gateway, session)) = self.resolve() {
            gateway.handle_attribute_update(&session, update).await;
        }
    }

    async fn on_profile_update(&self, profile: DeviceProfile) {
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.handle_profile_update(profile).await;
        }
    }

    async fn on_device_update(&self, device: DeviceInfo, profile: Option<DeviceProfile>) {
        if let Some((gateway, session)) = self.resolve() {
            gateway.handle_device_update(&session, device, profile).await;
        }
    }

    async fn on_rpc_request(&self, request: ToDeviceRpcRequest) {
        if let Some((gateway, session)) = self.resolve() {
            gateway.handle_rpc_request(&session, request).await;
        }
    }

    async fn on_credentials_update(&self) {
        if let Some((gateway, session)) = self.resolve() {
            gateway.handle_credentials_update(&session).await;
        }
    }
}
