//! Profile reconciliation and shared attribute tests.

mod common;

use std::time::Duration;

use uuid::Uuid;

use neomind_lwm2m::{
    AttributeUpdate, DeviceInfo, KeyValue, KvValue, LwM2mPath, ObserveStrategy, ProtocolEngine, ResourceValue,
    SessionListener, TsKeyValue, WriteAttributes,
};
use neomind_lwm2m_testing::{ProfileBuilder, SimulatedDevice};

use common::{wait_for, Harness};

fn shared(ts: i64, key: &str, value: &str) -> TsKeyValue {
    TsKeyValue {
        ts,
        kv: KeyValue::new(key, KvValue::String(value.into())),
    }
}

#[tokio::test]
async fn test_profile_update_reconciles_sessions() {
    let h = Harness::new();
    let v1 = ProfileBuilder::new("sensors").attribute("/3_1.0/0/9", "battery").build();
    let (_, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(60), &v1);
    let session = h.register(registration.clone()).await;
    wait_for("initialization", || session.is_initialized()).await;

    let v2 = ProfileBuilder::new("sensors")
        .with_id(v1.id)
        .attribute("/3_1.0/0/9", "battery")
        .telemetry("/3_1.0/0/15", "tz")
        .observe("/3_1.0/0/15")
        .build();
    let delta = h.gateway.handle_profile_update(v2.clone()).await.unwrap();
    let tz: neomind_lwm2m::VersionedPath = "/3_1.0/0/15".parse().unwrap();
    assert!(delta.read.contains(&tz));
    assert!(delta.observe.added.contains(&tz));

    wait_for("tz telemetry", || {
        h.backend
            .values_of("tz")
            .contains(&KvValue::String("Europe/Berlin".into()))
    })
    .await;
    wait_for("observation", || {
        h.engine.observations(&registration) == vec![LwM2mPath::resource(3, 0, 15)]
    })
    .await;
    assert_eq!(h.gateway.profile_of(&session).unwrap().key_name(&tz.path), Some("tz"));

    // Same document again is a no-op.
    assert!(h.gateway.handle_profile_update(v2).await.is_none());

    let v3 = ProfileBuilder::new("sensors")
        .with_id(v1.id)
        .attribute("/3_1.0/0/9", "battery")
        .telemetry("/3_1.0/0/15", "tz")
        .write_attributes(
            "/3_1.0/0/9",
            WriteAttributes {
                pmin: Some(5),
                ..WriteAttributes::default()
            },
        )
        .build();
    let delta = h.gateway.handle_profile_update(v3).await.unwrap();
    assert!(delta.observe.removed.contains(&tz));
    wait_for("observation cancelled", || h.engine.observations(&registration).is_empty()).await;
    wait_for("write attributes", || {
        h.engine
            .written_attributes("dev1", &LwM2mPath::resource(3, 0, 9))
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn test_newer_profile_on_admission_reconciles_bound_sessions() {
    let h = Harness::new();
    let v1 = ProfileBuilder::new("shared").attribute("/3/0/9", "battery").build();
    let (_, first) = h.add_device(SimulatedDevice::new("dev1").with_device_object(40), &v1);
    let dev1 = h.register(first).await;
    wait_for("dev1 initialization", || dev1.is_initialized()).await;

    let v2 = ProfileBuilder::new("shared")
        .with_id(v1.id)
        .attribute("/3/0/9", "battery")
        .telemetry("/3/0/15", "tz")
        .build();
    let (_, second) = h.add_device(SimulatedDevice::new("dev2").with_device_object(41), &v2);
    let dev2 = h.register(second).await;
    wait_for("dev2 initialization", || dev2.is_initialized()).await;

    let tz = LwM2mPath::resource(3, 0, 15);
    wait_for("dev1 reads the added path", || h.engine.count("dev1", "Read", &tz) == 1).await;
    assert_eq!(h.engine.count("dev2", "Read", &tz), 1);
    assert_eq!(h.gateway.profile_of(&dev1).unwrap().key_name(&tz), Some("tz"));

    // The backend event for the same document finds nothing left to do.
    assert!(h.gateway.handle_profile_update(v2).await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.count("dev1", "Read", &tz), 1);
}

#[tokio::test]
async fn test_unused_profile_update_ignored() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("orphan").attribute("/3/0/9", "battery").build();
    assert!(h.gateway.handle_profile_update(profile).await.is_none());
}

#[tokio::test]
async fn test_read_all_strategy_reads_every_object() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("all")
        .strategy(ObserveStrategy::ReadAllThenObserve)
        .attribute("/3_1.0/0/9", "battery")
        .observe("/3_1.0/0/9")
        .build();
    let device = SimulatedDevice::new("dev1")
        .with_device_object(33)
        .with_firmware("1.0", 8, "2.0");
    let (_, registration) = h.add_device(device, &profile);
    let session = h.register(registration.clone()).await;

    wait_for("initialization", || session.is_initialized()).await;
    assert_eq!(h.engine.count("dev1", "Read", &LwM2mPath::object(3)), 1);
    assert_eq!(h.engine.count("dev1", "Read", &LwM2mPath::object(5)), 1);
    assert!(session.resource(&LwM2mPath::resource(3, 0, 15)).is_some());
    wait_for("observation", || !h.engine.observations(&registration).is_empty()).await;
}

#[tokio::test]
async fn test_device_profile_switch_reconciles() {
    let h = Harness::new();
    let old = ProfileBuilder::new("old").attribute("/3/0/9", "battery").build();
    let new = ProfileBuilder::new("new")
        .attribute("/3/0/9", "battery")
        .telemetry("/3/0/14", "offset")
        .build();
    let (device, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(5), &old);
    let session = h.register(registration).await;
    wait_for("initialization", || session.is_initialized()).await;

    let switched = DeviceInfo {
        profile_id: new.id,
        ..device
    };
    let listener = h.backend.listener(session.session_id()).unwrap();
    listener.on_device_update(switched, Some(new.clone())).await;

    assert_eq!(session.profile_id(), Some(new.id));
    wait_for("offset telemetry", || !h.backend.values_of("offset").is_empty()).await;
}

#[tokio::test]
async fn test_shared_attribute_written_to_device() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("dev")
        .attribute("/3_1.0/0/15", "timezone")
        .attribute("/3_1.0/0/9", "battery")
        .build();
    let (_, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(9), &profile);
    let session = h.register(registration).await;
    wait_for("initialization", || session.is_initialized()).await;
    let listener = h.backend.listener(session.session_id()).unwrap();

    let update = AttributeUpdate {
        updated: vec![shared(10, "timezone", "Asia/Tokyo")],
        deleted: Vec::new(),
    };
    listener.on_attribute_update(update).await;
    wait_for("timezone write", || {
        h.engine.value("dev1", &LwM2mPath::resource(3, 0, 15)) == Some(ResourceValue::String("Asia/Tokyo".into()))
    })
    .await;
    wait_for("timezone publish", || {
        h.backend
            .values_of("timezone")
            .contains(&KvValue::String("Asia/Tokyo".into()))
    })
    .await;
    wait_for("delayed update applied", || {
        session.delayed(&LwM2mPath::resource(3, 0, 15)).is_none()
    })
    .await;

    // Equal to the cached value: nothing is sent.
    let writes = h.engine.count("dev1", "WriteReplace", &LwM2mPath::resource(3, 0, 15));
    h.gateway
        .handle_attribute_update(
            &session,
            AttributeUpdate {
                updated: vec![shared(11, "timezone", "Asia/Tokyo")],
                deleted: Vec::new(),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.count("dev1", "WriteReplace", &LwM2mPath::resource(3, 0, 15)), writes);

    // Read-only resource is refused with a device log.
    h.gateway
        .handle_attribute_update(
            &session,
            AttributeUpdate {
                updated: vec![TsKeyValue {
                    ts: 12,
                    kv: KeyValue::new("battery", KvValue::Long(1)),
                }],
                deleted: Vec::new(),
            },
        )
        .await;
    assert!(h
        .backend
        .device_logs("dev1")
        .iter()
        .any(|l| l.starts_with("warn:") && l.contains("battery")));
}

#[tokio::test]
async fn test_stale_shared_attribute_ignored() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("dev").attribute("/3_1.0/0/15", "timezone").build();
    let (_, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(9), &profile);
    let session = h.register(registration).await;
    wait_for("initialization", || session.is_initialized()).await;
    h.engine.set_sleeping("dev1", true);

    let newer = AttributeUpdate {
        updated: vec![shared(20, "timezone", "UTC")],
        deleted: Vec::new(),
    };
    h.gateway.handle_attribute_update(&session, newer).await;
    let older = AttributeUpdate {
        updated: vec![shared(10, "timezone", "Europe/Paris")],
        deleted: Vec::new(),
    };
    h.gateway.handle_attribute_update(&session, older).await;

    wait_for("queued write", || session.queued_len() == 1).await;
    let delayed = session.delayed(&LwM2mPath::resource(3, 0, 15)).unwrap();
    assert_eq!(delayed.ts, 20);
}

#[tokio::test]
async fn test_shared_attributes_pulled_after_initialization() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("dev").attribute("/3_1.0/0/14", "utcOffset").build();
    let (device, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(9), &profile);
    h.backend
        .set_shared_attributes(device.device_id, vec![shared(1, "utcOffset", "+09")]);

    h.register(registration).await;
    wait_for("offset write", || {
        h.engine.value("dev1", &LwM2mPath::resource(3, 0, 14)) == Some(ResourceValue::String("+09".into()))
    })
    .await;
}

#[tokio::test]
async fn test_notification_updates_cache() {
    let h = Harness::new();
    let profile = ProfileBuilder::new("dev").telemetry("/3/0/9", "battery").build();
    let (_, registration) = h.add_device(SimulatedDevice::new("dev1").with_device_object(80), &profile);
    let session = h.register(registration.clone()).await;
    wait_for("initialization", || session.is_initialized()).await;

    let node = neomind_lwm2m::Node::Resource(neomind_lwm2m::Resource::single(9, ResourceValue::Integer(79)));
    h.gateway
        .on_observation(&registration.id, &LwM2mPath::resource(3, 0, 9), &node)
        .await;
    assert!(h.backend.values_of("battery").contains(&KvValue::Long(79)));
    assert_eq!(
        session
            .resource(&LwM2mPath::resource(3, 0, 9))
            .and_then(|c| c.resource.value().cloned()),
        Some(ResourceValue::Integer(79))
    );

    // Unknown registration is ignored.
    h.gateway
        .on_observation(&Uuid::new_v4().to_string(), &LwM2mPath::resource(3, 0, 9), &node)
        .await;
}
