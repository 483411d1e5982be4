//! NeoMind LwM2M gateway
//!
//! Session and synchronization engine that sits between an LwM2M protocol
//! stack and the NeoMind backend bus.
//!
//! ## Features
//!
//! - **Admission**: credential resolution with a bounded wait, bootstrap
//!   configuration merged from profile and credentials
//! - **Sessions**: one session per endpoint, surviving re-registration
//! - **Downlink**: typed device operations with version checks, explicit
//!   timeouts and FIFO replay for sleeping devices
//! - **Profiles**: immutable profile snapshots diffed into device operations
//! - **Sync**: resource cache published as attributes and telemetry
//! - **Firmware**: chunked over-the-air delivery from a firmware store
//!
//! ## Example
//!
//! ```rust,no_run,ignore
//! use neomind_lwm2m::{GatewayConfig, Lwm2mGateway, MemoryFirmwareStore};
//!
//! let gateway = Lwm2mGateway::new(config, engine, backend, Arc::new(MemoryFirmwareStore::new()), None)?;
//! gateway.start();
//! gateway.registered(registration);
//! ```

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod convert;
pub mod credentials;
pub mod diagnostics;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod firmware;
pub mod gateway;
pub mod listener;
pub mod model;
pub mod path;
pub mod profile;
pub mod reconcile;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod sync;

pub use backend::{
    AttributeUpdate, CredentialsKind, DeviceInfo, DeviceProfile, FirmwareAssignment, RpcResponse,
    SessionEvent, SessionInfo, SessionListener, ToDeviceRpcRequest, TransportService, TsKeyValue,
    ValidateCredentialsResponse,
};
pub use bootstrap::{BootstrapConfig, BootstrapCredentials, BootstrapProfile, BootstrapSecurityStore};
pub use config::GatewayConfig;
pub use convert::{KeyValue, KvValue};
pub use credentials::{CredentialResolver, ResolvedCredentials, SecurityInfo, SecurityMode};
pub use diagnostics::{DeviceLogger, LogLevel, LOG_TELEMETRY_KEY};
pub use dispatcher::{DownlinkCommand, DownlinkDispatcher, DownlinkEvent, Operation, Payload, SendAction};
pub use engine::{
    BootstrapConfigStore, DownlinkRequest, DownlinkResponse, ProtocolEngine, Registration, SendError,
};
pub use error::{GatewayError, Result};
pub use firmware::{
    FirmwareCatalog, FirmwareError, FirmwareInfo, FirmwareStore, FirmwareUpdater, MemoryFirmwareStore,
    NewFirmware, RedbFirmwareStore, FIRMWARE_VERSION_KEY,
};
pub use gateway::{Lwm2mGateway, WorkerPool};
pub use listener::SessionMsgListener;
pub use model::{
    ContentFormat, InstanceNode, Node, ObjectModel, Operations, Resource, ResourceModel, ResourceType,
    ResourceValue, ResponseCode,
};
pub use path::{LwM2mPath, VersionedPath};
pub use profile::{ObserveStrategy, ProfileConfig, WriteAttributes};
pub use reconcile::{ProfileDelta, ProfileReconciler};
pub use registry::{Admission, SessionRegistry};
pub use rpc::{RpcOutcome, RpcRequest, RpcTracker};
pub use session::{ClientSession, FirmwareState};
pub use sync::ResourceSync;
