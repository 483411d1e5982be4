//! Protocol engine collaborator.
//!
//! The CoAP/LwM2M stack itself lives outside this crate. It reports
//! registrations and notifications to the gateway and executes the typed
//! downlink requests defined here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bootstrap::BootstrapConfig;
use crate::error::Result;
use crate::model::{ContentFormat, Node, ObjectModel, Resource, ResponseCode};
use crate::path::{LwM2mPath, DEFAULT_OBJECT_VERSION};
use crate::profile::AttributeQuery;

/// Engine record of a connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub endpoint: String,
    /// Security identity presented on the connection
    pub identity: Option<String>,
    pub lifetime_secs: u64,
    /// Queue binding: requests are only deliverable after an update
    pub queue_mode: bool,
    /// Object id to supported object version
    pub supported_objects: BTreeMap<u16, String>,
    /// Advertised object and instance links
    pub object_links: Vec<LwM2mPath>,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            identity: None,
            lifetime_secs: 300,
            queue_mode: false,
            supported_objects: BTreeMap::new(),
            object_links: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    /// Advertise an object version and an instance link for it.
    pub fn with_object(mut self, object_id: u16, version: impl Into<String>, instance: u16) -> Self {
        self.supported_objects.insert(object_id, version.into());
        self.object_links.push(LwM2mPath::instance(object_id, instance));
        self
    }

    pub fn with_queue_mode(mut self, queue_mode: bool) -> Self {
        self.queue_mode = queue_mode;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn supported_version(&self, object_id: u16) -> Option<&str> {
        self.supported_objects.get(&object_id).map(String::as_str)
    }

    pub fn supports_object(&self, object_id: u16) -> bool {
        self.supported_objects.contains_key(&object_id)
    }

    /// Object version used when building a versioned path.
    pub fn version_of(&self, object_id: u16) -> &str {
        self.supported_version(object_id)
            .unwrap_or(DEFAULT_OBJECT_VERSION)
    }
}

/// Request sent to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkRequest {
    Read {
        path: LwM2mPath,
        format: Option<ContentFormat>,
    },
    Discover {
        path: LwM2mPath,
    },
    Observe {
        path: LwM2mPath,
        format: Option<ContentFormat>,
    },
    Execute {
        path: LwM2mPath,
        arguments: Option<String>,
    },
    WriteReplace {
        path: LwM2mPath,
        format: Option<ContentFormat>,
        resource: Resource,
    },
    WriteUpdate {
        path: LwM2mPath,
        format: Option<ContentFormat>,
        resources: Vec<Resource>,
    },
    WriteAttributes {
        path: LwM2mPath,
        attributes: AttributeQuery,
    },
    Delete {
        path: LwM2mPath,
    },
}

impl DownlinkRequest {
    pub fn path(&self) -> &LwM2mPath {
        match self {
            DownlinkRequest::Read { path, .. }
            | DownlinkRequest::Discover { path }
            | DownlinkRequest::Observe { path, .. }
            | DownlinkRequest::Execute { path, .. }
            | DownlinkRequest::WriteReplace { path, .. }
            | DownlinkRequest::WriteUpdate { path, .. }
            | DownlinkRequest::WriteAttributes { path, .. }
            | DownlinkRequest::Delete { path } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownlinkRequest::Read { .. } => "Read",
            DownlinkRequest::Discover { .. } => "Discover",
            DownlinkRequest::Observe { .. } => "Observe",
            DownlinkRequest::Execute { .. } => "Execute",
            DownlinkRequest::WriteReplace { .. } => "WriteReplace",
            DownlinkRequest::WriteUpdate { .. } => "WriteUpdate",
            DownlinkRequest::WriteAttributes { .. } => "WriteAttributes",
            DownlinkRequest::Delete { .. } => "Delete",
        }
    }
}

/// Response of a device, one variant per request family.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkResponse {
    Read {
        code: ResponseCode,
        content: Option<Node>,
    },
    Discover {
        code: ResponseCode,
        links: Vec<String>,
    },
    Observe {
        code: ResponseCode,
        content: Option<Node>,
    },
    /// Produced locally, observations are held by the engine
    ObserveCancel {
        code: ResponseCode,
        paths: Vec<LwM2mPath>,
    },
    Execute {
        code: ResponseCode,
    },
    WriteAttributes {
        code: ResponseCode,
    },
    Write {
        code: ResponseCode,
    },
    Delete {
        code: ResponseCode,
    },
}

impl DownlinkResponse {
    pub fn code(&self) -> ResponseCode {
        match self {
            DownlinkResponse::Read { code, .. }
            | DownlinkResponse::Discover { code, .. }
            | DownlinkResponse::Observe { code, .. }
            | DownlinkResponse::ObserveCancel { code, .. }
            | DownlinkResponse::Execute { code }
            | DownlinkResponse::WriteAttributes { code }
            | DownlinkResponse::Write { code }
            | DownlinkResponse::Delete { code } => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code().is_success()
    }
}

/// Failure to obtain a response at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Device is in queue mode and currently unreachable
    #[error("device is sleeping")]
    Sleeping,
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Request execution and model lookup offered by the protocol stack.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn send(
        &self,
        registration: &Registration,
        request: DownlinkRequest,
        timeout: Duration,
    ) -> std::result::Result<DownlinkResponse, SendError>;

    /// Paths currently observed on the device.
    fn observations(&self, registration: &Registration) -> Vec<LwM2mPath>;

    /// Cancel observations at or below `path`, or all when `None`. Returns the count.
    fn cancel_observations(&self, registration: &Registration, path: Option<&LwM2mPath>) -> usize;

    /// Object model at the version the registration advertises.
    fn object_model(&self, registration: &Registration, object_id: u16) -> Option<ObjectModel>;

    /// Forget security info cached for an endpoint.
    fn remove_security_info(&self, endpoint: &str);
}

/// Editable bootstrap configuration store of the engine.
#[async_trait]
pub trait BootstrapConfigStore: Send + Sync {
    async fn get(&self, endpoint: &str) -> Option<BootstrapConfig>;

    async fn add(&self, endpoint: &str, config: BootstrapConfig) -> Result<()>;

    async fn remove(&self, endpoint: &str) -> Option<BootstrapConfig>;
}
