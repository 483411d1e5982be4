//! Shared gateway harness for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use neomind_lwm2m::{
    ClientSession, DeviceInfo, DeviceProfile, GatewayConfig, Lwm2mGateway, MemoryFirmwareStore, Registration,
};
use neomind_lwm2m_testing::{MemoryBootstrapStore, RecordingBackend, SimulatedDevice, SimulatedEngine};

/// Upper bound for asynchronous effects to show up.
pub const WAIT: Duration = Duration::from_secs(2);

pub struct Harness {
    pub gateway: Arc<Lwm2mGateway>,
    pub engine: Arc<SimulatedEngine>,
    pub backend: Arc<RecordingBackend>,
    pub firmware: Arc<MemoryFirmwareStore>,
    pub bootstrap: Arc<MemoryBootstrapStore>,
}

/// Configuration with short timeouts.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        timeout_ms: 1_000,
        credentials_timeout_ms: 200,
        session_report_timeout_ms: 60_000,
        ..GatewayConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let engine = Arc::new(SimulatedEngine::new());
        let backend = Arc::new(RecordingBackend::new());
        let firmware = Arc::new(MemoryFirmwareStore::new());
        let bootstrap = Arc::new(MemoryBootstrapStore::new());
        let gateway = Lwm2mGateway::new(
            config,
            engine.clone(),
            backend.clone(),
            firmware.clone(),
            Some(bootstrap.clone()),
        )
        .expect("valid config");
        gateway.start();
        Self {
            gateway,
            engine,
            backend,
            firmware,
            bootstrap,
        }
    }

    /// Add a device to both sides and return its device record and first
    /// registration.
    pub fn add_device(&self, device: SimulatedDevice, profile: &DeviceProfile) -> (DeviceInfo, Registration) {
        let info = self.backend.add_device(&device.endpoint, profile);
        let registration = self.engine.add_device(device);
        (info, registration)
    }

    pub async fn register(&self, registration: Registration) -> Arc<ClientSession> {
        self.gateway
            .on_registered(registration)
            .await
            .expect("registration admitted")
    }
}

/// Wait until `condition` holds, failing the test otherwise.
pub async fn wait_for(what: &str, condition: impl FnMut() -> bool) {
    assert!(
        neomind_lwm2m_testing::eventually(WAIT, condition).await,
        "timed out waiting for {}",
        what
    );
}
