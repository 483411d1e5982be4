//! Downlink dispatch, queued replay and RPC tests.

mod common;

use std::time::Duration;

use serde_json::Value;

use neomind_lwm2m::{
    DownlinkCommand, DownlinkRequest, LwM2mPath, Operation, Payload, ProtocolEngine, ResourceValue, RpcResponse,
    SessionListener, ToDeviceRpcRequest,
};
use neomind_lwm2m_testing::{ProfileBuilder, RecordingBackend, SimulatedDevice};

use common::{wait_for, Harness};

fn rpc(request_id: i32, method: &str, params: &str) -> ToDeviceRpcRequest {
    ToDeviceRpcRequest {
        request_id,
        method: method.to_string(),
        params: params.to_string(),
    }
}

fn response(backend: &RecordingBackend, request_id: i32) -> Option<RpcResponse> {
    backend
        .rpc_responses()
        .into_iter()
        .find(|r| r.request_id == request_id)
}

async fn wait_response(h: &Harness, request_id: i32) -> Value {
    wait_for("rpc response", || response(&h.backend, request_id).is_some()).await;
    response(&h.backend, request_id).map(|r| r.payload).unwrap()
}

async fn registered(h: &Harness, device: SimulatedDevice) -> std::sync::Arc<neomind_lwm2m::ClientSession> {
    let profile = ProfileBuilder::new("dev")
        .attribute("/3_1.0/0/9", "battery")
        .attribute("/3_1.0/0/14", "utcOffset")
        .build();
    let (_, registration) = h.add_device(device, &profile);
    let session = h.register(registration).await;
    wait_for("initialization", || session.is_initialized()).await;
    session
}

#[tokio::test]
async fn test_rpc_read_returns_value() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(87)).await;
    let listener = h.backend.listener(session.session_id()).unwrap();

    listener.on_rpc_request(rpc(1, "Read", r#"{"id": "/3_1.0/0/9"}"#)).await;
    let payload = wait_response(&h, 1).await;
    assert_eq!(payload["result"], "CONTENT");
    assert_eq!(payload["value"], "87");
    assert_eq!(h.gateway.rpcs().in_flight(), 0);
}

#[tokio::test]
async fn test_rpc_by_key_name() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(42)).await;

    h.gateway
        .handle_rpc_request(&session, rpc(2, "Read", r#"{"key": "battery"}"#))
        .await;
    let payload = wait_response(&h, 2).await;
    assert_eq!(payload["value"], "42");

    h.gateway
        .handle_rpc_request(&session, rpc(3, "Read", r#"{"key": "unknown"}"#))
        .await;
    assert_eq!(wait_response(&h, 3).await["result"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_rpc_validation_errors() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    let before = h.engine.requests("dev1").len();

    h.gateway.handle_rpc_request(&session, rpc(10, "Read", "{}")).await;
    assert_eq!(wait_response(&h, 10).await["result"], "BAD_REQUEST");

    h.gateway
        .handle_rpc_request(&session, rpc(11, "Reboot", r#"{"id": "/3/0/4"}"#))
        .await;
    assert_eq!(wait_response(&h, 11).await["result"], "BAD_REQUEST");

    h.gateway
        .handle_rpc_request(&session, rpc(12, "Execute", r#"{"id": "/3/0"}"#))
        .await;
    assert_eq!(wait_response(&h, 12).await["result"], "BAD_REQUEST");

    h.gateway
        .handle_rpc_request(&session, rpc(13, "WriteReplace", r#"{"id": "/3/0/9", "value": 5}"#))
        .await;
    assert_eq!(wait_response(&h, 13).await["result"], "METHOD_NOT_ALLOWED");

    assert_eq!(h.engine.requests("dev1").len(), before);
}

#[tokio::test]
async fn test_rpc_version_mismatch_is_not_found() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    let before = h.engine.requests("dev1").len();

    h.gateway
        .handle_rpc_request(&session, rpc(20, "Read", r#"{"id": "/3_1.1/0/9"}"#))
        .await;
    let payload = wait_response(&h, 20).await;
    assert_eq!(payload["result"], "NOT_FOUND");
    assert!(payload["error"].as_str().unwrap().contains("/3_1.1/0/9"));
    assert_eq!(h.engine.requests("dev1").len(), before);
}

#[tokio::test]
async fn test_rpc_timeout() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    h.engine.set_delay("dev1", Some(Duration::from_millis(500)));

    h.gateway
        .handle_rpc_request(&session, rpc(30, "Read", r#"{"id": "/3/0/9", "timeout": 50}"#))
        .await;
    let payload = wait_response(&h, 30).await;
    assert_eq!(payload["result"], "GATEWAY_TIMEOUT");
}

#[tokio::test]
async fn test_rpc_device_error_code() {
    let h = Harness::new();
    let device = SimulatedDevice::new("dev1")
        .with_device_object(1)
        .failing(LwM2mPath::resource(3, 0, 15), neomind_lwm2m::ResponseCode::Unauthorized);
    let session = registered(&h, device).await;

    h.gateway
        .handle_rpc_request(&session, rpc(31, "Read", r#"{"id": "/3/0/15"}"#))
        .await;
    assert_eq!(wait_response(&h, 31).await["result"], "UNAUTHORIZED");
    wait_for("device log", || !h.backend.device_logs("dev1").is_empty()).await;
}

#[tokio::test]
async fn test_rpc_duplicate_answered_once() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    h.engine.set_delay("dev1", Some(Duration::from_millis(100)));

    h.gateway
        .handle_rpc_request(&session, rpc(40, "Read", r#"{"id": "/3/0/9"}"#))
        .await;
    h.gateway
        .handle_rpc_request(&session, rpc(40, "Read", r#"{"id": "/3/0/9"}"#))
        .await;
    wait_response(&h, 40).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let answers = h
        .backend
        .rpc_responses()
        .iter()
        .filter(|r| r.request_id == 40)
        .count();
    assert_eq!(answers, 1);
}

#[tokio::test]
async fn test_rpc_execute_and_writes() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;

    h.gateway
        .handle_rpc_request(&session, rpc(50, "Execute", r#"{"id": "/3/0/4", "value": "now"}"#))
        .await;
    assert_eq!(wait_response(&h, 50).await["result"], "CHANGED");
    assert_eq!(
        h.engine.executed("dev1"),
        vec![(LwM2mPath::resource(3, 0, 4), Some("now".to_string()))]
    );

    h.gateway
        .handle_rpc_request(&session, rpc(51, "WriteReplace", r#"{"key": "utcOffset", "value": "+05"}"#))
        .await;
    assert_eq!(wait_response(&h, 51).await["result"], "CHANGED");
    assert_eq!(
        h.engine.value("dev1", &LwM2mPath::resource(3, 0, 14)),
        Some(ResourceValue::String("+05".into()))
    );
    wait_for("utcOffset publish", || {
        h.backend
            .values_of("utcOffset")
            .iter()
            .any(|v| v.to_string() == "+05")
    })
    .await;

    h.gateway
        .handle_rpc_request(
            &session,
            rpc(52, "WriteUpdate", r#"{"id": "/3/0", "params": {"14": "+06", "15": "UTC"}}"#),
        )
        .await;
    assert_eq!(wait_response(&h, 52).await["result"], "CHANGED");
    assert_eq!(
        h.engine.value("dev1", &LwM2mPath::resource(3, 0, 15)),
        Some(ResourceValue::String("UTC".into()))
    );

    h.gateway
        .handle_rpc_request(
            &session,
            rpc(53, "WriteAttributes", r#"{"id": "/3/0/9", "params": {"pmin": 10, "pmax": 60}}"#),
        )
        .await;
    assert_eq!(wait_response(&h, 53).await["result"], "CHANGED");
    let query = h
        .engine
        .written_attributes("dev1", &LwM2mPath::resource(3, 0, 9))
        .unwrap();
    assert_eq!(query.get("pmin"), Some(Some("10")));
    assert_eq!(query.get("pmax"), Some(Some("60")));
}

#[tokio::test]
async fn test_rpc_observe_and_cancel() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    let registration = session.registration().unwrap();

    h.gateway
        .handle_rpc_request(&session, rpc(60, "Observe", r#"{"id": "/3/0/9"}"#))
        .await;
    assert_eq!(wait_response(&h, 60).await["result"], "CONTENT");
    assert_eq!(h.engine.observations(&registration), vec![LwM2mPath::resource(3, 0, 9)]);

    h.gateway.handle_rpc_request(&session, rpc(61, "ObserveReadAll", "")).await;
    let payload = wait_response(&h, 61).await;
    assert!(payload["info"].as_str().unwrap().contains("/3/0/9"));

    h.gateway
        .handle_rpc_request(&session, rpc(62, "ObserveCancel", r#"{"id": "/3/0/9"}"#))
        .await;
    let payload = wait_response(&h, 62).await;
    assert_eq!(payload["result"], "CONTENT");
    assert_eq!(payload["info"], "Count of cancelled observations: 1");
    assert!(h.engine.observations(&registration).is_empty());
}

#[tokio::test]
async fn test_rpc_discover() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;

    h.gateway
        .handle_rpc_request(&session, rpc(70, "Discover", r#"{"id": "/3/0"}"#))
        .await;
    let payload = wait_response(&h, 70).await;
    assert_eq!(payload["result"], "CONTENT");
    assert!(payload["value"].as_str().unwrap().contains("</3/0/9>"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sleeping_device_replays_in_order() {
    let h = Harness::new();
    let session = registered(&h, SimulatedDevice::new("dev1").with_device_object(1)).await;
    h.engine.set_sleeping("dev1", true);

    let dispatcher = h.gateway.dispatcher().clone();
    for offset in ["+02", "+03", "+04", "+05", "+06"] {
        let command = DownlinkCommand::at(Operation::WriteReplace, "/3/0/14".parse().unwrap())
            .with_payload(Payload::Value(Value::String(offset.into())));
        dispatcher.send(&session, command).await.unwrap();
    }
    wait_for("queued requests", || session.queued_len() == 5).await;
    assert!(session.is_sleeping());

    // Once the device is known to sleep, sends queue without a round trip.
    let command = DownlinkCommand::at(Operation::WriteReplace, "/3/0/14".parse().unwrap())
        .with_payload(Payload::Value(Value::String("+07".into())));
    dispatcher.send(&session, command).await.unwrap();
    assert_eq!(session.queued_len(), 6);
    assert!(h
        .engine
        .requests("dev1")
        .iter()
        .all(|r| !matches!(r, DownlinkRequest::WriteReplace { .. })));

    h.engine.set_sleeping("dev1", false);
    let update = h.engine.registration("dev1", "reg-dev1-2").unwrap();
    h.gateway.on_updated(update).await.unwrap();
    assert_eq!(session.queued_len(), 0);
    assert!(!session.is_sleeping());

    let written: Vec<String> = h
        .engine
        .requests("dev1")
        .into_iter()
        .filter_map(|r| match r {
            DownlinkRequest::WriteReplace { resource, .. } => resource.value().map(|v| v.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(written, vec!["+02", "+03", "+04", "+05", "+06", "+07"]);
    assert_eq!(
        h.engine.value("dev1", &LwM2mPath::resource(3, 0, 14)),
        Some(ResourceValue::String("+07".into()))
    );
}
