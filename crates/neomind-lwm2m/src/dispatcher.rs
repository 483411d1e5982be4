//! Downlink dispatcher.
//!
//! Turns an abstract [`DownlinkCommand`] into a typed [`DownlinkRequest`],
//! validates it against the device's object versions and models, and runs it
//! through the protocol engine with an explicit timeout. Requests to a sleeping
//! device are parked on the session and replayed in order on its next update.
//! Finished requests are handed to the response pool as [`DownlinkEvent`]s.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::convert::{json_to_instances, json_to_value};
use crate::engine::{DownlinkRequest, DownlinkResponse, ProtocolEngine, Registration, SendError};
use crate::error::{GatewayError, Result};
use crate::model::{ContentFormat, Resource, ResourceModel, ResourceType, ResourceValue, ResponseCode};
use crate::path::VersionedPath;
use crate::profile::{AttributeQuery, WriteAttributes};
use crate::rpc::{RpcKey, RpcOutcome, RpcTracker};
use crate::session::ClientSession;

/// Abstract device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Discover,
    ObserveReadAll,
    Observe,
    ObserveCancel,
    Execute,
    WriteReplace,
    WriteUpdate,
    WriteAttributes,
    Delete,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Read => "Read",
            Operation::Discover => "Discover",
            Operation::ObserveReadAll => "ObserveReadAll",
            Operation::Observe => "Observe",
            Operation::ObserveCancel => "ObserveCancel",
            Operation::Execute => "Execute",
            Operation::WriteReplace => "WriteReplace",
            Operation::WriteUpdate => "WriteUpdate",
            Operation::WriteAttributes => "WriteAttributes",
            Operation::Delete => "Delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let all = [
            Operation::Read,
            Operation::Discover,
            Operation::ObserveReadAll,
            Operation::Observe,
            Operation::ObserveCancel,
            Operation::Execute,
            Operation::WriteReplace,
            Operation::WriteUpdate,
            Operation::WriteAttributes,
            Operation::Delete,
        ];
        all.into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GatewayError::MalformedPayload(format!("unsupported operation {:?}", s)))
    }
}

/// Value carried by a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Value(Value),
    Bytes(Vec<u8>),
    Attributes(AttributeQuery),
    Params(Map<String, Value>),
}

/// Operation request before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkCommand {
    pub operation: Operation,
    pub path: Option<VersionedPath>,
    pub content_format: Option<ContentFormat>,
    pub payload: Payload,
    pub timeout: Option<Duration>,
    pub rpc: Option<RpcKey>,
}

impl DownlinkCommand {
    pub fn new(operation: Operation, path: Option<VersionedPath>) -> Self {
        Self {
            operation,
            path,
            content_format: None,
            payload: Payload::None,
            timeout: None,
            rpc: None,
        }
    }

    pub fn at(operation: Operation, path: VersionedPath) -> Self {
        Self::new(operation, Some(path))
    }

    pub fn with_format(mut self, format: Option<ContentFormat>) -> Self {
        self.content_format = format;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rpc(mut self, rpc: RpcKey) -> Self {
        self.rpc = Some(rpc);
        self
    }
}

/// Fully built request, ready to run or to wait in a session queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SendAction {
    pub request: DownlinkRequest,
    pub path: VersionedPath,
    pub timeout: Duration,
    pub rpc: Option<RpcKey>,
    pub created_at: DateTime<Utc>,
    /// Per-session send order, kept when the action waits in a queue
    pub seq: u64,
}

/// Completed (or failed) request delivered to the response pool.
pub struct DownlinkEvent {
    pub session: Arc<ClientSession>,
    pub action: SendAction,
    pub result: std::result::Result<DownlinkResponse, SendError>,
}

enum RunOutcome {
    Delivered,
    Sleeping(SendAction),
}

pub struct DownlinkDispatcher {
    engine: Arc<dyn ProtocolEngine>,
    rpcs: Arc<RpcTracker>,
    events: mpsc::UnboundedSender<DownlinkEvent>,
    default_timeout: Duration,
}

impl DownlinkDispatcher {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        rpcs: Arc<RpcTracker>,
        events: mpsc::UnboundedSender<DownlinkEvent>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            rpcs,
            events,
            default_timeout,
        }
    }

    /// Validate, build and start a command.
    ///
    /// Errors found before sending are returned and, for RPC-correlated
    /// commands, reported to the caller. The device response arrives later as
    /// a [`DownlinkEvent`].
    pub async fn send(self: &Arc<Self>, session: &Arc<ClientSession>, command: DownlinkCommand) -> Result<()> {
        let rpc = command.rpc;
        match self.prepare(session, command).await {
            Ok(Some(action)) => {
                let Some(action) = session.hold_if_queued(action) else {
                    info!(endpoint = %session.endpoint(), queued = session.queued_len(), "Device sleeping, request queued");
                    return Ok(());
                };
                let dispatcher = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    if let RunOutcome::Sleeping(action) = dispatcher.run(&session, action).await {
                        info!(endpoint = %session.endpoint(), path = %action.path, request = action.request.name(), "Device sleeping, request queued");
                        session.enqueue(action);
                    }
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(endpoint = %session.endpoint(), error = %e, "Downlink rejected");
                if let Some(key) = rpc {
                    self.rpcs.complete(key, RpcOutcome::from(&e)).await;
                }
                Err(e)
            }
        }
    }

    /// Replay queued requests in send order. Requests sent while the replay
    /// runs join the queue and are replayed too. Stops and keeps the rest
    /// queued if the device falls asleep again. Returns the number delivered.
    pub async fn replay_queued(&self, session: &Arc<ClientSession>) -> usize {
        let mut delivered = 0;
        loop {
            let mut pending = session.drain_queued().into_iter().peekable();
            if pending.peek().is_none() {
                if session.release_queue() {
                    return delivered;
                }
                continue;
            }
            while let Some(action) = pending.next() {
                match self.run(session, action).await {
                    RunOutcome::Delivered => delivered += 1,
                    RunOutcome::Sleeping(action) => {
                        let mut rest = vec![action];
                        rest.extend(pending);
                        debug!(endpoint = %session.endpoint(), remaining = rest.len(), "Replay interrupted");
                        session.requeue_front(rest);
                        return delivered;
                    }
                }
            }
        }
    }

    async fn run(&self, session: &Arc<ClientSession>, action: SendAction) -> RunOutcome {
        let result = match session.registration() {
            Some(registration) => {
                match tokio::time::timeout(
                    action.timeout,
                    self.engine.send(&registration, action.request.clone(), action.timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Timeout),
                }
            }
            None => Err(SendError::Transport("no active registration".into())),
        };
        if matches!(result, Err(SendError::Sleeping)) {
            return RunOutcome::Sleeping(action);
        }
        let event = DownlinkEvent {
            session: session.clone(),
            action,
            result,
        };
        if self.events.send(event).is_err() {
            warn!(endpoint = %session.endpoint(), "Response pool closed, dropping response");
        }
        RunOutcome::Delivered
    }

    /// Build the action for a command. Operations served from engine state
    /// finish here and return `None`.
    async fn prepare(&self, session: &Arc<ClientSession>, command: DownlinkCommand) -> Result<Option<SendAction>> {
        let registration = session
            .registration()
            .ok_or_else(|| GatewayError::NotFound(format!("registration of {}", session.endpoint())))?;

        match command.operation {
            Operation::ObserveReadAll => {
                let paths = self.observed_paths(&registration);
                self.finish_local(command.rpc, format!("Observation paths - {:?}", paths)).await;
                return Ok(None);
            }
            Operation::ObserveCancel => {
                let info = match &command.path {
                    Some(path) => {
                        let count = self.engine.cancel_observations(&registration, Some(&path.path));
                        format!("Count of cancelled observations: {}", count)
                    }
                    None => {
                        let paths = self.observed_paths(&registration);
                        self.engine.cancel_observations(&registration, None);
                        format!("Observation paths - {:?}", paths)
                    }
                };
                info!(endpoint = %session.endpoint(), info = %info, "Observations cancelled");
                self.finish_local(command.rpc, info).await;
                return Ok(None);
            }
            _ => {}
        }

        let path = command
            .path
            .clone()
            .ok_or_else(|| GatewayError::MalformedPayload(format!("{} requires a path", command.operation)))?;
        if !session.is_valid_object_version(&path) {
            return Err(GatewayError::VersionMismatch(path.to_string()));
        }

        let request = self.build_request(&registration, &path, &command)?;
        Ok(Some(SendAction {
            request,
            path,
            timeout: command.timeout.unwrap_or(self.default_timeout),
            rpc: command.rpc,
            created_at: Utc::now(),
            seq: session.next_sequence(),
        }))
    }

    fn observed_paths(&self, registration: &Registration) -> Vec<String> {
        let mut paths: Vec<String> = self
            .engine
            .observations(registration)
            .iter()
            .map(|p| p.to_string())
            .collect();
        paths.sort();
        paths
    }

    async fn finish_local(&self, rpc: Option<RpcKey>, info: String) {
        if let Some(key) = rpc {
            self.rpcs
                .complete(key, RpcOutcome::success(ResponseCode::Content).with_info(info))
                .await;
        }
    }

    fn resource_model(&self, registration: &Registration, path: &VersionedPath) -> Result<ResourceModel> {
        let resource_id = path
            .path
            .resource_id
            .ok_or_else(|| GatewayError::MalformedPayload(format!("{} is not a resource path", path)))?;
        self.engine
            .object_model(registration, path.object_id())
            .and_then(|object| object.resource(resource_id).cloned())
            .ok_or_else(|| GatewayError::NotFound(format!("resource model for {}", path)))
    }

    fn build_request(
        &self,
        registration: &Registration,
        path: &VersionedPath,
        command: &DownlinkCommand,
    ) -> Result<DownlinkRequest> {
        let target = path.path;
        let format = command.content_format;
        let request = match command.operation {
            Operation::Read => DownlinkRequest::Read { path: target, format },
            Operation::Discover => DownlinkRequest::Discover { path: target },
            Operation::Observe => DownlinkRequest::Observe { path: target, format },
            Operation::Delete => DownlinkRequest::Delete { path: target },
            Operation::Execute => {
                let arguments = match &command.payload {
                    Payload::None => None,
                    Payload::Value(Value::String(s)) if s.is_empty() => None,
                    Payload::Value(Value::String(s)) => Some(s.clone()),
                    Payload::Value(Value::Null) => None,
                    Payload::Value(other) => Some(other.to_string()),
                    other => {
                        return Err(GatewayError::Conversion(format!(
                            "execute arguments must be text, got {:?}",
                            other
                        )))
                    }
                };
                DownlinkRequest::Execute { path: target, arguments }
            }
            Operation::WriteReplace => {
                let model = self.resource_model(registration, path)?;
                if !model.operations.is_writable() {
                    return Err(GatewayError::MethodNotAllowed(format!("{} is not writable", path)));
                }
                let resource = build_resource(&model, target.is_resource_instance(), &command.payload)?;
                DownlinkRequest::WriteReplace {
                    path: target,
                    format,
                    resource,
                }
            }
            Operation::WriteUpdate => {
                let Payload::Params(params) = &command.payload else {
                    return Err(GatewayError::Conversion("WriteUpdate requires params".into()));
                };
                let object = self
                    .engine
                    .object_model(registration, path.object_id())
                    .ok_or_else(|| GatewayError::NotFound(format!("object model for {}", path)))?;
                let mut resources = Vec::with_capacity(params.len());
                for (id, value) in params {
                    let model = id
                        .parse::<u16>()
                        .ok()
                        .and_then(|id| object.resource(id))
                        .ok_or_else(|| GatewayError::NotFound(format!("resource {} in {}", id, path)))?;
                    resources.push(build_resource(model, false, &Payload::Value(value.clone()))?);
                }
                DownlinkRequest::WriteUpdate {
                    path: target,
                    format,
                    resources,
                }
            }
            Operation::WriteAttributes => {
                let attributes = match &command.payload {
                    Payload::Attributes(query) => query.clone(),
                    Payload::Params(params) => {
                        serde_json::from_value::<WriteAttributes>(Value::Object(params.clone()))
                            .map_err(|e| GatewayError::Conversion(format!("write attributes: {}", e)))?
                            .to_query()
                    }
                    _ => AttributeQuery::default(),
                };
                if attributes.is_empty() {
                    return Err(GatewayError::MalformedPayload(format!(
                        "no attributes to write for {}",
                        path
                    )));
                }
                DownlinkRequest::WriteAttributes { path: target, attributes }
            }
            Operation::ObserveReadAll | Operation::ObserveCancel => {
                return Err(GatewayError::MalformedPayload(format!(
                    "{} is not sent to the device",
                    command.operation
                )))
            }
        };
        Ok(request)
    }
}

/// Typed resource for a write, converted to the model's declared type.
fn build_resource(model: &ResourceModel, instance_write: bool, payload: &Payload) -> Result<Resource> {
    match payload {
        Payload::Bytes(bytes) if model.kind == ResourceType::Opaque => {
            Ok(Resource::single(model.id, ResourceValue::Opaque(bytes.clone())))
        }
        Payload::Value(value) if model.multiple && !instance_write && value.is_object() => {
            Ok(Resource::multiple(model.id, model.kind, json_to_instances(value, model.kind)?))
        }
        Payload::Value(value) => Ok(Resource::single(model.id, json_to_value(value, model.kind)?)),
        other => Err(GatewayError::Conversion(format!(
            "cannot write {:?} to {:?} resource {}",
            other, model.kind, model.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operations;
    use serde_json::json;

    #[test]
    fn test_operation_names() {
        assert_eq!("writereplace".parse::<Operation>().unwrap(), Operation::WriteReplace);
        assert_eq!(Operation::ObserveReadAll.to_string(), "ObserveReadAll");
        assert!("Reboot".parse::<Operation>().is_err());
    }

    #[test]
    fn test_build_resource_converts() {
        let model = ResourceModel::new(14, "UTC Offset", Operations::RW, ResourceType::Integer);
        let resource = build_resource(&model, false, &Payload::Value(json!("42"))).unwrap();
        assert_eq!(resource.value(), Some(&ResourceValue::Integer(42)));

        let err = build_resource(&model, false, &Payload::Value(json!("forty"))).unwrap_err();
        assert!(matches!(err, GatewayError::Conversion(_)));
    }

    #[test]
    fn test_build_resource_opaque_bytes() {
        let model = ResourceModel::new(0, "Package", Operations::W, ResourceType::Opaque);
        let resource = build_resource(&model, false, &Payload::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(resource.value(), Some(&ResourceValue::Opaque(vec![1, 2, 3])));
    }

    #[test]
    fn test_build_resource_multi_instance() {
        let model = ResourceModel::new(6, "Power", Operations::RW, ResourceType::Integer).multiple();
        let resource = build_resource(&model, false, &Payload::Value(json!({"0": 1, "1": "5"}))).unwrap();
        assert!(resource.value().is_none());
        assert_eq!(resource.kind, ResourceType::Integer);
    }
}
