//! Firmware store and delivery loop tests.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use neomind_lwm2m::firmware::{ChecksumAlgorithm, FirmwareFilter, FirmwareUsage};
use neomind_lwm2m::{
    FirmwareAssignment, FirmwareCatalog, FirmwareError, FirmwareStore, LwM2mPath, NewFirmware, RedbFirmwareStore,
};
use neomind_lwm2m_testing::{ProfileBuilder, SimulatedDevice};

use common::{test_config, wait_for, Harness};

#[derive(Default)]
struct PinnedFirmware(Mutex<HashSet<Uuid>>);

#[async_trait]
impl FirmwareUsage for PinnedFirmware {
    async fn is_referenced(&self, firmware_id: Uuid) -> bool {
        self.0.lock().contains(&firmware_id)
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[tokio::test]
async fn test_firmware_converges_in_chunks() {
    let mut config = test_config();
    config.firmware_chunk_size = 4;
    let h = Harness::with_config(config);
    let profile = ProfileBuilder::new("fw").build();
    let device = SimulatedDevice::new("fw-dev")
        .with_device_object(70)
        .with_firmware("1.0", 10, "2.0");
    let (info, registration) = h.add_device(device, &profile);

    let stored = h
        .firmware
        .save(NewFirmware::new(info.tenant_id, "sensor-fw", "2.0", image(10)))
        .await
        .unwrap();
    h.backend.assign_firmware(
        info.device_id,
        FirmwareAssignment {
            firmware_id: stored.id,
            title: "sensor-fw".into(),
            version: "2.0".into(),
        },
    );

    let session = h.register(registration).await;
    wait_for("firmware convergence", || session.firmware().is_converged()).await;

    let package = LwM2mPath::firmware_package();
    assert_eq!(h.engine.firmware_received("fw-dev"), 10);
    assert_eq!(h.engine.count("fw-dev", "WriteReplace", &package), 3);
    assert!(!session.firmware().pending);
    wait_for("convergence log", || {
        h.backend
            .device_logs("fw-dev")
            .iter()
            .any(|l| l.contains("Firmware updated to version 2.0"))
    })
    .await;

    // Once converged, further updates write nothing.
    let update = h.engine.registration("fw-dev", "reg-fw-dev-2").unwrap();
    h.gateway.on_updated(update).await.unwrap();
    assert!(!h.gateway.firmware().check(&session).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.count("fw-dev", "WriteReplace", &package), 3);
}

#[tokio::test]
async fn test_device_already_on_target_is_left_alone() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("fw").build();
    let device = SimulatedDevice::new("current")
        .with_device_object(70)
        .with_firmware("2.0", 10, "2.0");
    let (info, registration) = h.add_device(device, &profile);
    let stored = h
        .firmware
        .save(NewFirmware::new(info.tenant_id, "fw", "2.0", image(10)))
        .await
        .unwrap();
    h.backend.assign_firmware(
        info.device_id,
        FirmwareAssignment {
            firmware_id: stored.id,
            title: "fw".into(),
            version: "2.0".into(),
        },
    );

    let session = h.register(registration).await;
    wait_for("version report", || {
        session.firmware().device_version.as_deref() == Some("2.0")
    })
    .await;

    let update = h.engine.registration("current", "reg-current-2").unwrap();
    h.gateway.on_updated(update).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = session.firmware();
    assert!(state.is_converged());
    assert!(!state.pending);
    assert_eq!(h.engine.count("current", "WriteReplace", &LwM2mPath::firmware_package()), 0);
    assert_eq!(h.engine.firmware_received("current"), 0);
    assert!(!h
        .backend
        .device_logs("current")
        .iter()
        .any(|l| l.contains("Firmware updated")));
}

#[tokio::test]
async fn test_firmware_stops_when_image_exhausted() {
    let mut config = test_config();
    config.firmware_chunk_size = 8;
    let h = Harness::with_config(config);
    let profile = ProfileBuilder::new("fw").build();
    // The device never reports the target version.
    let device = SimulatedDevice::new("stubborn")
        .with_device_object(70)
        .with_firmware("1.0", usize::MAX, "2.0");
    let (info, registration) = h.add_device(device, &profile);
    let stored = h
        .firmware
        .save(NewFirmware::new(info.tenant_id, "fw", "2.0", image(12)))
        .await
        .unwrap();
    h.backend.assign_firmware(
        info.device_id,
        FirmwareAssignment {
            firmware_id: stored.id,
            title: "fw".into(),
            version: "2.0".into(),
        },
    );

    let session = h.register(registration).await;
    wait_for("image delivered", || h.engine.firmware_received("stubborn") == 12).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = session.firmware();
    assert!(!state.is_converged());
    assert!(!state.pending);
    assert_eq!(state.offset, 0);
    assert_eq!(h.engine.count("stubborn", "WriteReplace", &LwM2mPath::firmware_package()), 2);
}

#[tokio::test]
async fn test_firmware_failure_resets_state() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("fw").build();
    let device = SimulatedDevice::new("broken")
        .with_device_object(70)
        .with_firmware("1.0", 4, "2.0")
        .failing(LwM2mPath::firmware_version(), neomind_lwm2m::ResponseCode::InternalServerError);
    let (info, registration) = h.add_device(device, &profile);
    let stored = h
        .firmware
        .save(NewFirmware::new(info.tenant_id, "fw", "2.0", image(4)))
        .await
        .unwrap();
    h.backend.assign_firmware(
        info.device_id,
        FirmwareAssignment {
            firmware_id: stored.id,
            title: "fw".into(),
            version: "2.0".into(),
        },
    );

    let session = h.register(registration).await;
    wait_for("failure log", || {
        h.backend
            .device_logs("broken")
            .iter()
            .any(|l| l.starts_with("error: Firmware update failed"))
    })
    .await;
    let state = session.firmware();
    assert!(!state.pending);
    assert_eq!(state.device_version.as_deref(), Some(""));
    assert_eq!(h.engine.firmware_received("broken"), 0);
}

#[tokio::test]
async fn test_redb_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("firmware.redb");
    let tenant = Uuid::new_v4();

    let id = {
        let store = RedbFirmwareStore::open(&path).unwrap();
        let info = store
            .save(NewFirmware::new(tenant, "gateway-fw", "1.2.0", image(100)))
            .await
            .unwrap();
        assert_eq!(info.data_size, 100);
        assert_eq!(info.checksum, ChecksumAlgorithm::Sha256.digest(&image(100)));
        info.id
    };

    let store = RedbFirmwareStore::open(&path).unwrap();
    let info = store.info(id).await.unwrap().unwrap();
    assert_eq!(info.version, "1.2.0");
    assert_eq!(store.chunk(id, 96, 10).await.unwrap(), image(100)[96..].to_vec());
    assert!(store.chunk(id, 100, 10).await.unwrap().is_empty());

    let listed = store
        .list(&FirmwareFilter {
            tenant_id: Some(tenant),
            ..FirmwareFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(store.delete(id).await.unwrap());
    assert!(store.info(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_catalog_refuses_referenced_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FirmwareStore> = Arc::new(RedbFirmwareStore::open(dir.path().join("fw.redb")).unwrap());
    let usage = Arc::new(PinnedFirmware::default());
    let catalog = FirmwareCatalog::new(store, usage.clone());

    let info = catalog
        .upload(NewFirmware::new(Uuid::new_v4(), "fw", "3.0", image(16)))
        .await
        .unwrap();
    usage.0.lock().insert(info.id);
    assert!(matches!(catalog.delete(info.id).await, Err(FirmwareError::InUse(id)) if id == info.id));

    usage.0.lock().clear();
    catalog.delete(info.id).await.unwrap();
    assert!(matches!(catalog.info(info.id).await, Err(FirmwareError::NotFound(_))));
    assert!(matches!(catalog.delete(info.id).await, Err(FirmwareError::NotFound(_))));
}

#[tokio::test]
async fn test_catalog_rejects_bad_checksum() {
    let store: Arc<dyn FirmwareStore> = Arc::new(neomind_lwm2m::MemoryFirmwareStore::new());
    let catalog = FirmwareCatalog::new(store, Arc::new(PinnedFirmware::default()));

    let mut firmware = NewFirmware::new(Uuid::new_v4(), "fw", "1.0", image(8));
    firmware.checksum = Some("00".repeat(32));
    let err = catalog.upload(firmware).await.unwrap_err();
    assert!(matches!(err, FirmwareError::ChecksumMismatch { .. }));
}
