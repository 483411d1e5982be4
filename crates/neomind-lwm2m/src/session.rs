//! Per-device client session.
//!
//! A session is keyed by endpoint and survives re-registration: only the
//! registration handle is rebound, while cached values, firmware progress and
//! queued requests carry over. All mutable state is safe to touch from several
//! response handlers of the same device at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::backend::{DeviceInfo, SessionInfo};
use crate::convert::KvValue;
use crate::credentials::SecurityInfo;
use crate::dispatcher::SendAction;
use crate::engine::Registration;
use crate::model::{Resource, ResourceModel};
use crate::path::{LwM2mPath, VersionedPath};

/// Last known value of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResource {
    pub path: VersionedPath,
    pub resource: Resource,
    pub model: Option<ResourceModel>,
    pub updated_at: DateTime<Utc>,
}

/// Backend value waiting to be confirmed by a device write.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedAttribute {
    /// Backend timestamp (ms) of the update
    pub ts: i64,
    pub value: KvValue,
}

/// Requests held back while the device sleeps.
#[derive(Default)]
struct DownlinkQueue {
    sleeping: bool,
    actions: VecDeque<SendAction>,
}

impl DownlinkQueue {
    fn insert(&mut self, action: SendAction) {
        let at = self
            .actions
            .iter()
            .position(|queued| queued.seq > action.seq)
            .unwrap_or(self.actions.len());
        self.actions.insert(at, action);
    }
}

/// Firmware delivery progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareState {
    pub target_id: Option<Uuid>,
    pub target_title: Option<String>,
    pub target_version: Option<String>,
    /// Last version reported by the device, empty after a failed cycle
    pub device_version: Option<String>,
    /// Waiting for a version read before writing the next chunk
    pub pending: bool,
    /// Bytes already written to the device
    pub offset: usize,
}

impl FirmwareState {
    pub fn is_converged(&self) -> bool {
        match (&self.target_version, &self.device_version) {
            (Some(target), Some(device)) => target == device,
            _ => false,
        }
    }

    /// Forget the device version so the next registration re-evaluates.
    pub fn reset(&mut self) {
        self.pending = false;
        self.device_version = Some(String::new());
        self.offset = 0;
    }
}

pub struct ClientSession {
    endpoint: String,
    identity: String,
    security: Option<SecurityInfo>,
    session_id: Uuid,
    device: RwLock<Option<DeviceInfo>>,
    registration: RwLock<Option<Arc<Registration>>>,
    resources: DashMap<LwM2mPath, CachedResource>,
    pending_reads: DashSet<LwM2mPath>,
    delayed: DashMap<LwM2mPath, DelayedAttribute>,
    queue: Mutex<DownlinkQueue>,
    next_seq: AtomicU64,
    firmware: Mutex<FirmwareState>,
    initialized: AtomicBool,
}

impl ClientSession {
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        security: Option<SecurityInfo>,
        device: Option<DeviceInfo>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            security,
            session_id: Uuid::new_v4(),
            device: RwLock::new(device),
            registration: RwLock::new(None),
            resources: DashMap::new(),
            pending_reads: DashSet::new(),
            delayed: DashMap::new(),
            queue: Mutex::new(DownlinkQueue::default()),
            next_seq: AtomicU64::new(0),
            firmware: Mutex::new(FirmwareState::default()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn security_info(&self) -> Option<&SecurityInfo> {
        self.security.as_ref()
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        self.device.read().clone()
    }

    pub fn set_device(&self, device: DeviceInfo) -> Option<DeviceInfo> {
        self.device.write().replace(device)
    }

    pub fn profile_id(&self) -> Option<Uuid> {
        self.device.read().as_ref().map(|d| d.profile_id)
    }

    /// Backend session identity, available once the device is linked.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.device
            .read()
            .as_ref()
            .map(|device| SessionInfo::new(self.session_id, device))
    }

    pub fn registration(&self) -> Option<Arc<Registration>> {
        self.registration.read().clone()
    }

    /// Rebind to a new registration, returning the previous one.
    pub fn bind_registration(&self, registration: Arc<Registration>) -> Option<Arc<Registration>> {
        self.registration.write().replace(registration)
    }

    pub fn supports_object(&self, object_id: u16) -> bool {
        self.registration()
            .map(|r| r.supports_object(object_id))
            .unwrap_or(false)
    }

    /// A path without a version is only valid for objects at the default version.
    pub fn is_valid_object_version(&self, path: &VersionedPath) -> bool {
        let Some(registration) = self.registration() else {
            return false;
        };
        match registration.supported_version(path.object_id()) {
            Some(supported) => supported == path.version_or_default(),
            None => false,
        }
    }

    /// Qualify a plain path with the object version the device advertises.
    pub fn versioned(&self, path: LwM2mPath) -> VersionedPath {
        match self.registration() {
            Some(registration) => path.versioned(registration.version_of(path.object_id)),
            None => path.into(),
        }
    }

    /// Store a value. Returns true when it differs from what was cached.
    pub fn save_resource(&self, path: LwM2mPath, resource: Resource, model: Option<ResourceModel>) -> bool {
        let versioned = self.versioned(path);
        let mut changed = true;
        self.resources
            .entry(path)
            .and_modify(|cached| {
                changed = cached.resource != resource;
                cached.resource = resource.clone();
                cached.path = versioned.clone();
                if model.is_some() {
                    cached.model = model.clone();
                }
                cached.updated_at = Utc::now();
            })
            .or_insert_with(|| CachedResource {
                path: versioned.clone(),
                resource: resource.clone(),
                model: model.clone(),
                updated_at: Utc::now(),
            });
        changed
    }

    pub fn resource(&self, path: &LwM2mPath) -> Option<CachedResource> {
        self.resources.get(path).map(|entry| entry.value().clone())
    }

    pub fn remove_resource(&self, path: &LwM2mPath) -> Option<CachedResource> {
        self.resources.remove(path).map(|(_, cached)| cached)
    }

    pub fn cached_paths(&self) -> Vec<LwM2mPath> {
        let mut paths: Vec<LwM2mPath> = self.resources.iter().map(|e| *e.key()).collect();
        paths.sort();
        paths
    }

    pub fn add_pending_read(&self, path: LwM2mPath) {
        self.pending_reads.insert(path);
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads.len()
    }

    /// Record completion of an initial read (or of the whole pass when `None`).
    /// A path that is not a pending initial read changes nothing. Returns true
    /// exactly once, when the session becomes initialized.
    pub fn finish_read(&self, path: Option<&LwM2mPath>) -> bool {
        if self.is_initialized() {
            return false;
        }
        if let Some(path) = path {
            if self.pending_reads.remove(path).is_none() {
                return false;
            }
        }
        if !self.pending_reads.is_empty() {
            return false;
        }
        self.initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Keep the newest backend update per path. Returns false when an update
    /// with a newer timestamp is already waiting.
    pub fn offer_delayed(&self, path: LwM2mPath, update: DelayedAttribute) -> bool {
        let mut accepted = true;
        self.delayed
            .entry(path)
            .and_modify(|current| {
                if current.ts > update.ts {
                    accepted = false;
                } else {
                    *current = update.clone();
                }
            })
            .or_insert_with(|| update.clone());
        accepted
    }

    pub fn delayed(&self, path: &LwM2mPath) -> Option<DelayedAttribute> {
        self.delayed.get(path).map(|entry| entry.value().clone())
    }

    pub fn take_delayed(&self, path: &LwM2mPath) -> Option<DelayedAttribute> {
        self.delayed.remove(path).map(|(_, update)| update)
    }

    /// Order stamp for the next downlink built for this device.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `action` behind earlier requests when the device is known to
    /// sleep or a backlog is still waiting. Returns the action when it may be
    /// sent right away.
    pub fn hold_if_queued(&self, action: SendAction) -> Option<SendAction> {
        let mut queue = self.queue.lock();
        if queue.sleeping || !queue.actions.is_empty() {
            queue.insert(action);
            return None;
        }
        Some(action)
    }

    /// The device refused `action` because it sleeps.
    pub fn enqueue(&self, action: SendAction) {
        let mut queue = self.queue.lock();
        queue.sleeping = true;
        queue.insert(action);
    }

    pub fn is_sleeping(&self) -> bool {
        self.queue.lock().sleeping
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().actions.len()
    }

    pub fn drain_queued(&self) -> Vec<SendAction> {
        self.queue.lock().actions.drain(..).collect()
    }

    /// Put unsent actions back in front of anything queued meanwhile.
    pub fn requeue_front(&self, actions: Vec<SendAction>) {
        let mut queue = self.queue.lock();
        queue.sleeping = true;
        for action in actions.into_iter().rev() {
            queue.actions.push_front(action);
        }
    }

    /// Mark the device awake once nothing is left to replay. Returns false
    /// when requests were queued in the meantime.
    pub fn release_queue(&self) -> bool {
        let mut queue = self.queue.lock();
        if !queue.actions.is_empty() {
            return false;
        }
        queue.sleeping = false;
        true
    }

    pub fn firmware(&self) -> FirmwareState {
        self.firmware.lock().clone()
    }

    pub fn update_firmware<R>(&self, f: impl FnOnce(&mut FirmwareState) -> R) -> R {
        f(&mut self.firmware.lock())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceValue;

    fn session() -> ClientSession {
        let session = ClientSession::new("dev1", "dev1", None, None);
        session.bind_registration(Arc::new(
            Registration::new("reg-1", "dev1")
                .with_object(3, "1.0", 0)
                .with_object(19, "1.1", 0),
        ));
        session
    }

    #[test]
    fn test_object_version_validation() {
        let session = session();
        assert!(session.is_valid_object_version(&"/3/0/9".parse().unwrap()));
        assert!(session.is_valid_object_version(&"/3_1.0/0/9".parse().unwrap()));
        assert!(!session.is_valid_object_version(&"/3_1.1/0/9".parse().unwrap()));
        assert!(!session.is_valid_object_version(&"/19/0/0".parse().unwrap()));
        assert!(session.is_valid_object_version(&"/19_1.1/0/0".parse().unwrap()));
        assert!(!session.is_valid_object_version(&"/5/0/7".parse().unwrap()));
    }

    #[test]
    fn test_save_resource_reports_change() {
        let session = session();
        let path = LwM2mPath::resource(3, 0, 9);
        assert!(session.save_resource(path, Resource::single(9, ResourceValue::Integer(87)), None));
        assert!(!session.save_resource(path, Resource::single(9, ResourceValue::Integer(87)), None));
        assert!(session.save_resource(path, Resource::single(9, ResourceValue::Integer(86)), None));
        assert_eq!(session.resource(&path).unwrap().path.to_string(), "/3_1.0/0/9");
    }

    #[test]
    fn test_initialized_once_pending_reads_drain() {
        let session = session();
        let a = LwM2mPath::resource(3, 0, 9);
        let b = LwM2mPath::resource(3, 0, 0);
        session.add_pending_read(a);
        session.add_pending_read(b);
        assert!(!session.finish_read(Some(&a)));
        assert!(session.finish_read(Some(&b)));
        assert!(session.is_initialized());
        assert!(!session.finish_read(None));
    }

    #[test]
    fn test_unrelated_read_does_not_initialize() {
        let session = session();
        assert!(!session.finish_read(Some(&LwM2mPath::firmware_version())));
        assert!(!session.is_initialized());

        let battery = LwM2mPath::resource(3, 0, 9);
        session.add_pending_read(battery);
        assert!(!session.finish_read(Some(&LwM2mPath::resource(3, 0, 15))));
        assert!(!session.finish_read(None));
        assert_eq!(session.pending_reads(), 1);
        assert!(session.finish_read(Some(&battery)));
    }

    #[test]
    fn test_delayed_keeps_newest() {
        let session = session();
        let path = LwM2mPath::resource(3, 0, 14);
        let update = |ts, v: &str| DelayedAttribute {
            ts,
            value: KvValue::String(v.into()),
        };
        assert!(session.offer_delayed(path, update(10, "a")));
        assert!(!session.offer_delayed(path, update(5, "old")));
        assert!(session.offer_delayed(path, update(12, "b")));
        assert_eq!(session.take_delayed(&path).unwrap().value, KvValue::String("b".into()));
        assert!(session.delayed(&path).is_none());
    }
}
