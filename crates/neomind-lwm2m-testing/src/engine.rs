//! In-process protocol engine backed by [`SimulatedDevice`]s.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use neomind_lwm2m::profile::AttributeQuery;
use neomind_lwm2m::{
    DownlinkRequest, DownlinkResponse, LwM2mPath, ObjectModel, ProtocolEngine, Registration, ResourceValue,
    SendError,
};

use crate::device::SimulatedDevice;

/// Protocol engine that answers from simulated devices.
#[derive(Default)]
pub struct SimulatedEngine {
    devices: DashMap<String, SimulatedDevice>,
    observations: DashMap<String, BTreeSet<LwM2mPath>>,
    delivered: Mutex<Vec<(String, DownlinkRequest)>>,
    removed_security: Mutex<Vec<String>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device and return its first registration.
    pub fn add_device(&self, device: SimulatedDevice) -> Registration {
        let registration = device.registration(format!("reg-{}-1", device.endpoint));
        self.devices.insert(device.endpoint.clone(), device);
        registration
    }

    /// Fresh registration for a known device.
    pub fn registration(&self, endpoint: &str, id: &str) -> Option<Registration> {
        self.devices.get(endpoint).map(|d| d.registration(id))
    }

    pub fn set_sleeping(&self, endpoint: &str, sleeping: bool) {
        if let Some(mut device) = self.devices.get_mut(endpoint) {
            device.sleeping = sleeping;
        }
    }

    pub fn set_delay(&self, endpoint: &str, delay: Option<Duration>) {
        if let Some(mut device) = self.devices.get_mut(endpoint) {
            device.delay = delay;
        }
    }

    pub fn set_value(&self, endpoint: &str, path: &LwM2mPath, value: ResourceValue) -> bool {
        self.devices
            .get_mut(endpoint)
            .map(|mut d| d.set_value(path, value))
            .unwrap_or(false)
    }

    pub fn value(&self, endpoint: &str, path: &LwM2mPath) -> Option<ResourceValue> {
        self.devices.get(endpoint)?.value().value(path)
    }

    pub fn firmware_received(&self, endpoint: &str) -> usize {
        self.devices.get(endpoint).map_or(0, |d| d.firmware_received())
    }

    pub fn written_attributes(&self, endpoint: &str, path: &LwM2mPath) -> Option<AttributeQuery> {
        self.devices.get(endpoint)?.written_attributes(path)
    }

    pub fn executed(&self, endpoint: &str) -> Vec<(LwM2mPath, Option<String>)> {
        self.devices
            .get(endpoint)
            .map(|d| d.executed().to_vec())
            .unwrap_or_default()
    }

    /// Requests the device actually received, in order.
    pub fn requests(&self, endpoint: &str) -> Vec<DownlinkRequest> {
        self.delivered
            .lock()
            .iter()
            .filter(|(ep, _)| ep == endpoint)
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// Delivered requests of one kind targeting `path`.
    pub fn count(&self, endpoint: &str, name: &str, path: &LwM2mPath) -> usize {
        self.requests(endpoint)
            .iter()
            .filter(|r| r.name() == name && r.path() == path)
            .count()
    }

    pub fn removed_security(&self) -> Vec<String> {
        self.removed_security.lock().clone()
    }
}

#[async_trait]
impl ProtocolEngine for SimulatedEngine {
    async fn send(
        &self,
        registration: &Registration,
        request: DownlinkRequest,
        _timeout: Duration,
    ) -> Result<DownlinkResponse, SendError> {
        let delay = {
            let device = self
                .devices
                .get(&registration.endpoint)
                .ok_or_else(|| SendError::Transport(format!("unknown endpoint {}", registration.endpoint)))?;
            if device.sleeping {
                return Err(SendError::Sleeping);
            }
            device.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.delivered
            .lock()
            .push((registration.endpoint.clone(), request.clone()));
        let response = {
            let mut device = self
                .devices
                .get_mut(&registration.endpoint)
                .ok_or_else(|| SendError::Transport(format!("unknown endpoint {}", registration.endpoint)))?;
            device.handle(&request)
        };

        if let (DownlinkRequest::Observe { path, .. }, true) = (&request, response.is_success()) {
            self.observations
                .entry(registration.id.clone())
                .or_default()
                .insert(*path);
        }
        tracing::debug!(endpoint = %registration.endpoint, request = request.name(), code = %response.code(), "Simulated response");
        Ok(response)
    }

    fn observations(&self, registration: &Registration) -> Vec<LwM2mPath> {
        self.observations
            .get(&registration.id)
            .map(|paths| paths.iter().copied().collect())
            .unwrap_or_default()
    }

    fn cancel_observations(&self, registration: &Registration, path: Option<&LwM2mPath>) -> usize {
        let Some(mut observed) = self.observations.get_mut(&registration.id) else {
            return 0;
        };
        let before = observed.len();
        match path {
            Some(path) => observed.retain(|p| !path.contains(p)),
            None => observed.clear(),
        }
        before - observed.len()
    }

    fn object_model(&self, registration: &Registration, object_id: u16) -> Option<ObjectModel> {
        let device = self.devices.get(&registration.endpoint)?;
        let model = device.model(object_id)?;
        (registration.supported_version(object_id) == Some(model.version.as_str())).then(|| model.clone())
    }

    fn remove_security_info(&self, endpoint: &str) {
        self.removed_security.lock().push(endpoint.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_tracks_writes() {
        let engine = SimulatedEngine::new();
        let registration = engine.add_device(SimulatedDevice::new("dev1").with_device_object(87));
        let battery = LwM2mPath::resource(3, 0, 9);

        assert_eq!(engine.value("dev1", &battery), Some(ResourceValue::Integer(87)));
        assert!(engine.value("nobody", &battery).is_none());

        assert!(engine.set_value("dev1", &battery, ResourceValue::Integer(12)));
        assert_eq!(engine.value("dev1", &battery), Some(ResourceValue::Integer(12)));

        engine.set_sleeping("dev1", true);
        let request = DownlinkRequest::Read {
            path: battery,
            format: None,
        };
        let err = engine.send(&registration, request, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SendError::Sleeping));
        assert!(engine.requests("dev1").is_empty());
    }
}
