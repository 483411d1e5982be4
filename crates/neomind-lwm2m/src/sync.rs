//! Resource cache synchronization.
//!
//! Successful reads, notifications and writes update the session cache and
//! publish the affected values to the backend under their profile key names.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::TransportService;
use crate::convert::{resource_to_kv, KeyValue};
use crate::engine::{DownlinkRequest, ProtocolEngine};
use crate::firmware::FirmwareUpdater;
use crate::model::{Node, Resource, ResourceValue};
use crate::path::LwM2mPath;
use crate::registry::SessionRegistry;
use crate::session::ClientSession;

pub struct ResourceSync {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn ProtocolEngine>,
    backend: Arc<dyn TransportService>,
    firmware: Arc<FirmwareUpdater>,
}

impl ResourceSync {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn ProtocolEngine>,
        backend: Arc<dyn TransportService>,
        firmware: Arc<FirmwareUpdater>,
    ) -> Self {
        Self {
            registry,
            engine,
            backend,
            firmware,
        }
    }

    /// Cache the content of a read or notification rooted at `base` and
    /// publish it. Returns the number of resources stored.
    pub async fn on_content(&self, session: &Arc<ClientSession>, base: &LwM2mPath, node: &Node) -> usize {
        let registration = session.registration();
        let mut paths = Vec::new();
        for (path, resource) in node.resources(base) {
            let model = registration
                .as_ref()
                .and_then(|r| self.engine.object_model(r, path.object_id))
                .and_then(|object| object.resource(resource.id).cloned());
            let version = (path == LwM2mPath::firmware_version())
                .then(|| resource.value().map(ToString::to_string))
                .flatten();

            session.save_resource(path, resource, model);
            paths.push(path);

            if let Some(version) = version {
                if let Err(e) = self.firmware.on_version_report(session, &version).await {
                    warn!(endpoint = %session.endpoint(), error = %e, "Firmware step failed");
                }
            }
        }
        self.publish(session, &paths).await;
        paths.len()
    }

    /// Record values the device accepted.
    pub async fn on_write_success(&self, session: &Arc<ClientSession>, request: &DownlinkRequest) {
        let mut paths = Vec::new();
        match request {
            DownlinkRequest::WriteReplace { path, resource, .. } => {
                if *path == LwM2mPath::firmware_package() {
                    let len = match resource.value() {
                        Some(ResourceValue::Opaque(bytes)) => bytes.len(),
                        _ => 0,
                    };
                    if let Err(e) = self.firmware.on_chunk_written(session, len).await {
                        warn!(endpoint = %session.endpoint(), error = %e, "Firmware step failed");
                    }
                    return;
                }
                self.store_written(session, *path, resource.clone());
                paths.push(*path);
            }
            DownlinkRequest::WriteUpdate { path, resources, .. } => {
                let Some(instance) = path.instance_id else {
                    return;
                };
                for resource in resources {
                    let target = LwM2mPath::resource(path.object_id, instance, resource.id);
                    self.store_written(session, target, resource.clone());
                    paths.push(target);
                }
            }
            _ => return,
        }
        self.publish(session, &paths).await;
    }

    fn store_written(&self, session: &ClientSession, path: LwM2mPath, resource: Resource) {
        session.save_resource(path, resource, None);
        if session.take_delayed(&path).is_some() {
            debug!(endpoint = %session.endpoint(), path = %path, "Shared attribute applied");
        }
    }

    /// Drop cached values at or below a deleted path.
    pub fn on_delete(&self, session: &ClientSession, path: &LwM2mPath) -> usize {
        session
            .cached_paths()
            .into_iter()
            .filter(|cached| path.contains(cached))
            .filter(|cached| session.remove_resource(cached).is_some())
            .count()
    }

    /// Publish cached values of `paths` as attributes and telemetry. Paths
    /// without a key name stay cache-only.
    pub async fn publish(&self, session: &ClientSession, paths: &[LwM2mPath]) {
        let Some(info) = session.session_info() else {
            return;
        };
        let Some(profile) = self.registry.profile_for(session) else {
            return;
        };

        let mut attributes = Vec::new();
        let mut telemetry = Vec::new();
        for path in paths {
            let Some(key) = profile.key_name(path) else {
                continue;
            };
            let Some(cached) = session.resource(path) else {
                continue;
            };
            let value = KeyValue::new(key, resource_to_kv(&cached.resource));
            if profile.is_attribute(path) {
                attributes.push(value.clone());
            }
            if profile.is_telemetry(path) {
                telemetry.push(value);
            }
        }

        if !attributes.is_empty() {
            if let Err(e) = self.backend.publish_attributes(&info, attributes).await {
                warn!(endpoint = %session.endpoint(), error = %e, "Failed to publish attributes");
            }
        }
        if !telemetry.is_empty() {
            if let Err(e) = self.backend.publish_telemetry(&info, telemetry).await {
                warn!(endpoint = %session.endpoint(), error = %e, "Failed to publish telemetry");
            }
        }
    }
}
