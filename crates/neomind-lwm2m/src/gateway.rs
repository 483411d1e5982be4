//! LwM2M gateway.
//!
//! Wires the registry, dispatcher, reconciler, cache sync and firmware loop
//! together and serves the two event sources: registration lifecycle events
//! from the protocol engine and per-session events from the backend. Each
//! lifecycle phase and downlink response processing run on their own bounded
//! worker pool.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    AttributeUpdate, DeviceInfo, DeviceProfile, SessionEvent, SessionInfo, ToDeviceRpcRequest, TransportService, TsKeyValue,
};
use crate::bootstrap::BootstrapSecurityStore;
use crate::config::GatewayConfig;
use crate::convert::{kv_to_value, resource_to_kv, KvValue};
use crate::credentials::CredentialResolver;
use crate::diagnostics::{DeviceLogger, LogLevel};
use crate::dispatcher::{DownlinkCommand, DownlinkDispatcher, DownlinkEvent, Operation, Payload};
use crate::engine::{BootstrapConfigStore, DownlinkRequest, DownlinkResponse, ProtocolEngine, Registration, SendError};
use crate::error::{GatewayError, Result};
use crate::firmware::{is_firmware_path, FirmwareStore, FirmwareUpdater, FIRMWARE_VERSION_KEY};
use crate::listener::SessionMsgListener;
use crate::model::Node;
use crate::path::{LwM2mPath, VersionedPath};
use crate::profile::{ObserveStrategy, ProfileConfig};
use crate::reconcile::{ProfileDelta, ProfileReconciler};
use crate::registry::SessionRegistry;
use crate::rpc::{RpcKey, RpcOutcome, RpcRequest, RpcTracker};
use crate::session::{ClientSession, DelayedAttribute};
use crate::sync::ResourceSync;

/// Bounded pool of tasks for one kind of event.
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` once a permit is free.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(pool = name, "Worker pool closed");
                return;
            };
            task.await;
        })
    }
}

struct WorkerPools {
    registered: WorkerPool,
    updated: WorkerPool,
    unregistered: WorkerPool,
    responses: WorkerPool,
}

pub struct Lwm2mGateway {
    config: GatewayConfig,
    engine: Arc<dyn ProtocolEngine>,
    backend: Arc<dyn TransportService>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<DownlinkDispatcher>,
    reconciler: ProfileReconciler,
    sync: ResourceSync,
    firmware: Arc<FirmwareUpdater>,
    rpcs: Arc<RpcTracker>,
    logger: Arc<DeviceLogger>,
    bootstrap: Option<BootstrapSecurityStore>,
    pools: WorkerPools,
    events: Mutex<Option<mpsc::UnboundedReceiver<DownlinkEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<Lwm2mGateway>,
}

impl Lwm2mGateway {
    /// Build a gateway. Call [`Lwm2mGateway::start`] to begin processing
    /// downlink responses.
    pub fn new(
        config: GatewayConfig,
        engine: Arc<dyn ProtocolEngine>,
        backend: Arc<dyn TransportService>,
        firmware_store: Arc<dyn FirmwareStore>,
        bootstrap_store: Option<Arc<dyn BootstrapConfigStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let resolver = Arc::new(CredentialResolver::new(backend.clone(), config.credentials_timeout()));
        let registry = Arc::new(SessionRegistry::new(resolver.clone(), engine.clone(), backend.clone()));
        let rpcs = Arc::new(RpcTracker::new(backend.clone()));
        let logger = Arc::new(DeviceLogger::new(backend.clone(), config.log_max_length));
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(DownlinkDispatcher::new(
            engine.clone(),
            rpcs.clone(),
            tx,
            config.timeout(),
        ));
        let firmware = Arc::new(FirmwareUpdater::new(
            backend.clone(),
            firmware_store,
            dispatcher.clone(),
            logger.clone(),
            config.firmware_chunk_size,
        ));
        let sync = ResourceSync::new(registry.clone(), engine.clone(), backend.clone(), firmware.clone());
        let bootstrap = match bootstrap_store {
            Some(store) if config.bootstrap_enabled => {
                Some(BootstrapSecurityStore::new(resolver, store, logger.clone()))
            }
            _ => None,
        };
        let pools = WorkerPools {
            registered: WorkerPool::new("registered", config.registered_pool_size),
            updated: WorkerPool::new("update_registered", config.update_registered_pool_size),
            unregistered: WorkerPool::new("unregistered", config.unregistered_pool_size),
            responses: WorkerPool::new("response", config.response_pool_size),
        };

        Ok(Arc::new_cyclic(|this| Self {
            config,
            engine,
            backend,
            registry,
            reconciler: ProfileReconciler::new(dispatcher.clone()),
            dispatcher,
            sync,
            firmware,
            rpcs,
            logger,
            bootstrap,
            pools,
            events: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        }))
    }

    /// Spawn the response router and the liveness sweep.
    pub fn start(&self) {
        let Some(mut rx) = self.events.lock().take() else {
            warn!("Gateway already started");
            return;
        };

        let this = self.this.clone();
        let router = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(gateway) = this.upgrade() else {
                    break;
                };
                let worker = gateway.clone();
                gateway.pools.responses.spawn(async move {
                    worker.handle_event(event).await;
                });
            }
            debug!("Response router stopped");
        });

        let this = self.this.clone();
        let period = self.config.session_report_interval();
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gateway) = this.upgrade() else {
                    break;
                };
                gateway.report_sessions().await;
            }
        });

        self.tasks.lock().extend([router, sweep]);
        info!(
            timeout_ms = self.config.timeout_ms,
            report_ms = self.config.session_report_timeout_ms,
            "LwM2M gateway started"
        );
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("LwM2M gateway stopped");
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<DownlinkDispatcher> {
        &self.dispatcher
    }

    pub fn rpcs(&self) -> &Arc<RpcTracker> {
        &self.rpcs
    }

    pub fn firmware(&self) -> &Arc<FirmwareUpdater> {
        &self.firmware
    }

    /// Security store for bootstrap connections, when enabled.
    pub fn bootstrap(&self) -> Option<&BootstrapSecurityStore> {
        self.bootstrap.as_ref()
    }

    // ========== Engine events (pooled) ==========

    pub fn registered(self: &Arc<Self>, registration: Registration) -> JoinHandle<()> {
        let gateway = self.clone();
        self.pools.registered.spawn(async move {
            // Refusals are logged by the handler.
            let _ = gateway.on_registered(registration).await;
        })
    }

    pub fn updated(self: &Arc<Self>, registration: Registration) -> JoinHandle<()> {
        let gateway = self.clone();
        self.pools.updated.spawn(async move {
            // Refusals are logged by the handler.
            let _ = gateway.on_updated(registration).await;
        })
    }

    pub fn unregistered(self: &Arc<Self>, registration_id: String) -> JoinHandle<()> {
        let gateway = self.clone();
        self.pools.unregistered.spawn(async move {
            gateway.on_unregistered(&registration_id).await;
        })
    }

    // ========== Engine events ==========

    /// Admit a registration and initialize its session.
    pub async fn on_registered(&self, registration: Registration) -> Result<Arc<ClientSession>> {
        let endpoint = registration.endpoint.clone();
        let admission = match self.registry.resolve_or_create(Arc::new(registration)).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Registration refused");
                return Err(e);
            }
        };
        let session = admission.session;
        info!(endpoint = %endpoint, session_id = %session.session_id(), "Client registered");

        if let Some(profile) = admission.changed_profile {
            self.adopt_profile(&session, profile).await;
        }

        self.open_backend_session(&session).await;
        self.check_firmware(&session).await;
        self.init_client(&session).await;
        Ok(session)
    }

    /// Refresh the registration, replay queued requests and retry firmware.
    pub async fn on_updated(&self, registration: Registration) -> Result<Arc<ClientSession>> {
        if self.registry.by_registration_id(&registration.id).is_none() {
            warn!(endpoint = %registration.endpoint, registration_id = %registration.id, "Update for unknown registration");
        }
        let endpoint = registration.endpoint.clone();
        let session = match self.registry.resolve_or_create(Arc::new(registration)).await {
            Ok(admission) => admission.session,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Registration update refused");
                return Err(e);
            }
        };
        let replayed = self.dispatcher.replay_queued(&session).await;
        if replayed > 0 {
            info!(endpoint = %session.endpoint(), replayed, "Queued requests replayed");
        }
        self.check_firmware(&session).await;
        Ok(session)
    }

    pub async fn on_unregistered(&self, registration_id: &str) -> Option<Arc<ClientSession>> {
        if let Some(session) = self.registry.by_registration_id(registration_id) {
            if let Some(registration) = session.registration().filter(|r| r.id == registration_id) {
                self.engine.cancel_observations(&registration, None);
            }
        }
        self.registry.evict(registration_id).await
    }

    pub async fn on_sleeping(&self, endpoint: &str) {
        self.device_log_by_endpoint(endpoint, LogLevel::Info, "Client is sleeping").await;
    }

    pub async fn on_awake(&self, endpoint: &str) {
        self.device_log_by_endpoint(endpoint, LogLevel::Info, "Client is awake").await;
    }

    /// Notification for an observed path.
    pub async fn on_observation(&self, registration_id: &str, path: &LwM2mPath, content: &Node) {
        let Some(session) = self.registry.by_registration_id(registration_id) else {
            debug!(registration_id, path = %path, "Notification for unknown registration");
            return;
        };
        self.sync.on_content(&session, path, content).await;
    }

    // ========== Session setup ==========

    async fn open_backend_session(&self, session: &Arc<ClientSession>) {
        let Some(info) = session.session_info() else {
            warn!(endpoint = %session.endpoint(), "Session has no device, backend session not opened");
            return;
        };
        if let Err(e) = self.register_backend_session(&info).await {
            error!(endpoint = %session.endpoint(), error = %e, "Failed to open backend session");
        }
    }

    async fn register_backend_session(&self, info: &SessionInfo) -> Result<()> {
        let listener = Arc::new(SessionMsgListener::new(self.this.clone(), info.session_id));
        self.backend.register_session(info, listener).await?;
        self.backend.process_session_event(info, SessionEvent::Open).await?;
        self.backend.subscribe_attribute_updates(info).await?;
        self.backend.subscribe_rpc(info).await
    }

    async fn check_firmware(&self, session: &Arc<ClientSession>) {
        if let Err(e) = self.firmware.check(session).await {
            warn!(endpoint = %session.endpoint(), error = %e, "Firmware check failed");
        }
    }

    async fn init_client(&self, session: &Arc<ClientSession>) {
        let Some(profile) = self.registry.profile_for(session) else {
            warn!(endpoint = %session.endpoint(), "No profile for session, skipping initialization");
            return;
        };
        let Some(registration) = session.registration() else {
            return;
        };

        let mut reads: BTreeSet<VersionedPath> = BTreeSet::new();
        if profile.strategy == ObserveStrategy::ReadAllThenObserve {
            reads.extend(
                registration
                    .supported_objects
                    .keys()
                    .map(|id| session.versioned(LwM2mPath::object(*id))),
            );
        }
        reads.extend(
            profile
                .published_paths()
                .into_iter()
                .filter(|p| session.supports_object(p.object_id())),
        );

        let initializing = !session.is_initialized();
        if initializing {
            for path in &reads {
                session.add_pending_read(path.path);
            }
        }
        for path in reads {
            let target = path.path;
            if let Err(e) = self.dispatcher.send(session, DownlinkCommand::at(Operation::Read, path)).await {
                debug!(endpoint = %session.endpoint(), path = %target, error = %e, "Initial read rejected");
                if initializing && session.finish_read(Some(&target)) {
                    self.on_initialized(session).await;
                }
            }
        }

        for path in profile.observe_eligible() {
            if session.supports_object(path.object_id()) {
                self.send_logged(session, DownlinkCommand::at(Operation::Observe, path)).await;
            }
        }
        for (path, params) in &profile.write_attributes {
            let query = params.to_query();
            if query.is_empty() || !session.supports_object(path.object_id()) {
                continue;
            }
            let command = DownlinkCommand::at(Operation::WriteAttributes, path.clone())
                .with_payload(Payload::Attributes(query));
            self.send_logged(session, command).await;
        }

        if session.finish_read(None) {
            self.on_initialized(session).await;
        }
    }

    /// Pull the shared attributes named in the profile once every initial
    /// read has answered.
    async fn on_initialized(&self, session: &Arc<ClientSession>) {
        info!(endpoint = %session.endpoint(), cached = session.cached_paths().len(), "Client initialized");
        let (Some(info), Some(profile)) = (session.session_info(), self.registry.profile_for(session)) else {
            return;
        };
        let keys: Vec<String> = profile.key_names.values().cloned().collect();
        if keys.is_empty() {
            return;
        }
        match self.backend.get_shared_attributes(&info, keys).await {
            Ok(updated) if !updated.is_empty() => {
                let update = AttributeUpdate {
                    updated,
                    deleted: Vec::new(),
                };
                self.handle_attribute_update(session, update).await;
            }
            Ok(_) => {}
            Err(e) => warn!(endpoint = %session.endpoint(), error = %e, "Failed to fetch shared attributes"),
        }
    }

    async fn send_logged(&self, session: &Arc<ClientSession>, command: DownlinkCommand) {
        let operation = command.operation;
        if let Err(e) = self.dispatcher.send(session, command).await {
            debug!(endpoint = %session.endpoint(), op = %operation, error = %e, "Downlink not sent");
        }
    }

    // ========== Downlink responses ==========

    /// Route a finished downlink request.
    pub async fn handle_event(&self, event: DownlinkEvent) {
        let DownlinkEvent { session, action, result } = event;
        let path = *action.request.path();

        match result {
            Ok(response) if response.is_success() => {
                let value = match &response {
                    DownlinkResponse::Read { content: Some(node), .. }
                    | DownlinkResponse::Observe { content: Some(node), .. } => {
                        self.sync.on_content(&session, &path, node).await;
                        Some(node_value(&path, node))
                    }
                    DownlinkResponse::Discover { links, .. } => Some(links.join(",")),
                    DownlinkResponse::Write { .. } => {
                        self.sync.on_write_success(&session, &action.request).await;
                        None
                    }
                    DownlinkResponse::Delete { .. } => {
                        self.sync.on_delete(&session, &path);
                        None
                    }
                    _ => None,
                };
                if let Some(key) = action.rpc {
                    let mut outcome = RpcOutcome::success(response.code());
                    if let Some(value) = value {
                        outcome = outcome.with_value(value);
                    }
                    self.rpcs.complete(key, outcome).await;
                }
            }
            Ok(response) => {
                let error = GatewayError::Protocol {
                    code: response.code(),
                    message: format!("{} {}", action.request.name(), action.path),
                };
                self.on_downlink_failure(&session, &path, action.rpc, error).await;
            }
            Err(e) => {
                let error = match e {
                    SendError::Timeout => GatewayError::Timeout(action.timeout.as_millis() as u64),
                    other => GatewayError::Transport(other.to_string()),
                };
                self.on_downlink_failure(&session, &path, action.rpc, error).await;
            }
        }

        if matches!(action.request, DownlinkRequest::Read { .. }) && session.finish_read(Some(&path)) {
            self.on_initialized(&session).await;
        }
    }

    async fn on_downlink_failure(
        &self,
        session: &Arc<ClientSession>,
        path: &LwM2mPath,
        rpc: Option<RpcKey>,
        error: GatewayError,
    ) {
        warn!(endpoint = %session.endpoint(), path = %path, error = %error, "Downlink failed");
        if let Some(key) = rpc {
            self.rpcs.complete(key, RpcOutcome::from(&error)).await;
        }
        if is_firmware_path(path) {
            self.firmware.on_failure(session, &error.to_string()).await;
            return;
        }
        if let Some(info) = session.session_info() {
            self.logger.log(&info, LogLevel::Error, &error.to_string()).await;
        }
    }

    // ========== Backend events ==========

    /// Write changed shared attributes to the device.
    pub async fn handle_attribute_update(&self, session: &Arc<ClientSession>, update: AttributeUpdate) {
        let Some(profile) = self.registry.profile_for(session) else {
            return;
        };
        for TsKeyValue { ts, kv } in update.updated {
            if kv.key == FIRMWARE_VERSION_KEY {
                self.check_firmware(session).await;
                continue;
            }
            let Some(path) = profile.path_for_key(&kv.key).cloned() else {
                debug!(endpoint = %session.endpoint(), key = %kv.key, "Shared attribute not mapped to a path");
                continue;
            };
            self.write_shared_attribute(session, &kv.key, path, ts, kv.value).await;
        }
        if !update.deleted.is_empty() {
            debug!(endpoint = %session.endpoint(), deleted = ?update.deleted, "Shared attributes deleted");
        }
    }

    async fn write_shared_attribute(
        &self,
        session: &Arc<ClientSession>,
        key: &str,
        path: VersionedPath,
        ts: i64,
        value: KvValue,
    ) {
        let model = session.registration().and_then(|registration| {
            let resource_id = path.path.resource_id?;
            self.engine
                .object_model(&registration, path.object_id())?
                .resource(resource_id)
                .cloned()
        });
        let Some(model) = model.filter(|m| m.operations.is_writable()) else {
            self.device_log(
                session,
                LogLevel::Warn,
                &format!("Resource {} for key {} is not writable or not in the device model", path, key),
            )
            .await;
            return;
        };

        let target = path.path;
        let update = DelayedAttribute {
            ts,
            value: value.clone(),
        };
        if !session.offer_delayed(target, update) {
            debug!(endpoint = %session.endpoint(), key, ts, "Stale shared attribute ignored");
            return;
        }
        if let (Some(cached), Ok(typed)) = (session.resource(&target), kv_to_value(&value, model.kind)) {
            if cached.resource.value() == Some(&typed) {
                session.take_delayed(&target);
                return;
            }
        }

        let command =
            DownlinkCommand::at(Operation::WriteReplace, path).with_payload(Payload::Value(value.to_json()));
        if let Err(e) = self.dispatcher.send(session, command).await {
            session.take_delayed(&target);
            self.device_log(session, LogLevel::Error, &format!("Failed to write {}: {}", key, e))
                .await;
        }
    }

    /// Swap the profile snapshot and reconcile every bound session.
    /// A newly admitted device brought a profile newer than the cached one.
    /// Sessions already bound to the profile are moved onto it; the new
    /// session is initialized from it directly.
    async fn adopt_profile(&self, admitted: &Arc<ClientSession>, profile: DeviceProfile) {
        match self.registry.update_profile(&profile) {
            Ok(Some((old, new))) => {
                let sessions: Vec<_> = self
                    .registry
                    .clients_by_profile(profile.id)
                    .into_iter()
                    .filter(|s| !Arc::ptr_eq(s, admitted))
                    .collect();
                info!(profile_id = %profile.id, sessions = sessions.len(), "Profile changed on admission");
                self.reconciler.reconcile(&old, &new, &sessions).await;
            }
            Ok(None) => {}
            Err(e) => warn!(profile_id = %profile.id, error = %e, "Rejected device profile"),
        }
    }

    pub async fn handle_profile_update(&self, profile: DeviceProfile) -> Option<ProfileDelta> {
        match self.registry.update_profile(&profile) {
            Ok(Some((old, new))) => {
                let sessions = self.registry.clients_by_profile(profile.id);
                Some(self.reconciler.reconcile(&old, &new, &sessions).await)
            }
            Ok(None) => {
                debug!(profile_id = %profile.id, "Profile unchanged or unused");
                None
            }
            Err(e) => {
                warn!(profile_id = %profile.id, error = %e, "Rejected profile update");
                None
            }
        }
    }

    /// Refresh the device record; a profile switch reconciles the session.
    pub async fn handle_device_update(
        &self,
        session: &Arc<ClientSession>,
        device: DeviceInfo,
        profile: Option<DeviceProfile>,
    ) {
        let old_profile = self.registry.profile_for(session);
        if let Some(profile) = &profile {
            if self.registry.profile(profile.id).is_some() {
                self.handle_profile_update(profile.clone()).await;
            } else if let Err(e) = self.registry.put_profile(profile) {
                warn!(profile_id = %profile.id, error = %e, "Rejected device profile");
            }
        }

        let new_profile_id = device.profile_id;
        session.set_device(device);
        info!(endpoint = %session.endpoint(), "Device updated");

        let Some(old) = old_profile.filter(|old| old.profile_id != new_profile_id) else {
            return;
        };
        let Some(new) = self.registry.profile(new_profile_id) else {
            warn!(endpoint = %session.endpoint(), profile_id = %new_profile_id, "New profile not cached");
            return;
        };
        let delta = ProfileDelta::compute(&old, &new);
        self.reconciler.apply(session, &delta).await;
    }

    /// Validate and dispatch a backend RPC.
    pub async fn handle_rpc_request(&self, session: &Arc<ClientSession>, request: ToDeviceRpcRequest) {
        let Some(info) = session.session_info() else {
            return;
        };
        let key = RpcKey {
            session_id: info.session_id,
            request_id: request.request_id,
        };
        if !self.rpcs.begin(&info, request.request_id) {
            warn!(endpoint = %session.endpoint(), request_id = request.request_id, "Duplicate RPC ignored");
            return;
        }

        let profile = self.registry.profile_for(session);
        let rpc = match RpcRequest::parse(&request, profile.as_deref()) {
            Ok(rpc) => rpc,
            Err(e) => {
                debug!(endpoint = %session.endpoint(), method = %request.method, error = %e, "Invalid RPC");
                self.rpcs.complete(key, RpcOutcome::from(&e)).await;
                return;
            }
        };

        let payload = match (rpc.operation, rpc.params, rpc.value) {
            (Operation::WriteUpdate | Operation::WriteAttributes, Some(params), _) => Payload::Params(params),
            (_, _, Some(value)) => Payload::Value(value),
            _ => Payload::None,
        };
        let command = DownlinkCommand::new(rpc.operation, rpc.target)
            .with_format(rpc.content_format)
            .with_timeout(rpc.timeout)
            .with_payload(payload)
            .with_rpc(key);
        if let Err(e) = self.dispatcher.send(session, command).await {
            debug!(endpoint = %session.endpoint(), request_id = key.request_id, error = %e, "RPC rejected");
        }
    }

    pub async fn handle_credentials_update(&self, session: &Arc<ClientSession>) {
        info!(endpoint = %session.endpoint(), "Credentials updated, applied at next registration");
    }

    // ========== Liveness ==========

    /// Report activity for every linked session, re-registering those the
    /// backend lost. Returns the number re-registered.
    pub async fn report_sessions(&self) -> usize {
        let mut restored = 0;
        for session in self.registry.sessions() {
            let Some(info) = session.session_info() else {
                continue;
            };
            if self.backend.report_activity(&info).await {
                continue;
            }
            info!(endpoint = %session.endpoint(), "Backend lost session, re-registering");
            self.open_backend_session(&session).await;
            restored += 1;
        }
        restored
    }

    async fn device_log(&self, session: &ClientSession, level: LogLevel, message: &str) {
        if let Some(info) = session.session_info() {
            self.logger.log(&info, level, message).await;
        }
    }

    async fn device_log_by_endpoint(&self, endpoint: &str, level: LogLevel, message: &str) {
        match self.registry.by_endpoint(endpoint) {
            Some(session) => self.device_log(&session, level, message).await,
            None => debug!(endpoint, "No session for device log"),
        }
    }

    /// Cached profile of a session (used by tests and the CLI).
    pub fn profile_of(&self, session: &ClientSession) -> Option<Arc<ProfileConfig>> {
        self.registry.profile_for(session)
    }
}

impl Drop for Lwm2mGateway {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Text form of read content returned to an RPC caller.
fn node_value(base: &LwM2mPath, node: &Node) -> String {
    if let Node::Resource(resource) = node {
        if resource.value().is_some() {
            return resource_to_kv(resource).to_string();
        }
    }
    let values: Map<String, Value> = node
        .resources(base)
        .into_iter()
        .map(|(path, resource)| (path.to_string(), resource_to_kv(&resource).to_json()))
        .collect();
    Value::Object(values).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, ResourceValue};

    #[test]
    fn test_node_value() {
        let base = LwM2mPath::resource(3, 0, 9);
        let node = Node::Resource(Resource::single(9, ResourceValue::Integer(87)));
        assert_eq!(node_value(&base, &node), "87");

        let node = Node::Resource(Resource::single(0, ResourceValue::String("Acme".into())));
        assert_eq!(node_value(&LwM2mPath::resource(3, 0, 0), &node), "Acme");
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new("test", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(tokio::sync::Notify::new());

        let first = {
            let (tx, gate) = (tx.clone(), gate.clone());
            pool.spawn(async move {
                tx.send(1).ok();
                gate.notified().await;
            })
        };
        let second = pool.spawn(async move {
            tx.send(2).ok();
        });

        assert_eq!(rx.recv().await, Some(1));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }
}
