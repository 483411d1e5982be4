//! NeoMind LwM2M testing utilities
//!
//! In-process doubles for the collaborators of the gateway:
//!
//! - [`SimulatedEngine`] answers downlink requests from [`SimulatedDevice`]s
//! - [`RecordingBackend`] serves credentials and records every publish
//! - [`fixtures`] builds profile and credential documents

pub mod backend;
pub mod device;
pub mod engine;
pub mod fixtures;

pub use backend::{Published, RecordingBackend};
pub use device::{models, SimulatedDevice};
pub use engine::SimulatedEngine;
pub use fixtures::{
    bootstrap_credentials, eventually, no_sec_credentials, psk_credentials, random_psk_key, MemoryBootstrapStore,
    ProfileBuilder,
};
