//! Device profile configuration.
//!
//! The backend stores the LwM2M part of a device profile as a JSON document.
//! It is decoded once into an immutable [`ProfileConfig`]; every profile update
//! produces a new snapshot that the reconciler diffs against the previous one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::DeviceProfile;
use crate::bootstrap::BootstrapProfile;
use crate::error::{GatewayError, Result};
use crate::path::{LwM2mPath, VersionedPath};

/// What the gateway does right after a device registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ObserveStrategy {
    /// Read and observe only the configured paths
    #[default]
    ObserveOnly,
    /// Read every advertised object first, then observe
    ReadAllThenObserve,
}

impl TryFrom<u8> for ObserveStrategy {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ObserveStrategy::ObserveOnly),
            2 => Ok(ObserveStrategy::ReadAllThenObserve),
            other => Err(format!("unknown observe strategy {}", other)),
        }
    }
}

impl From<ObserveStrategy> for u8 {
    fn from(value: ObserveStrategy) -> Self {
        match value {
            ObserveStrategy::ObserveOnly => 1,
            ObserveStrategy::ReadAllThenObserve => 2,
        }
    }
}

/// Notification attributes of one path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmin: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmax: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub st: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
}

impl WriteAttributes {
    fn entries(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("pmin", self.pmin.map(|v| v.to_string())),
            ("pmax", self.pmax.map(|v| v.to_string())),
            ("gt", self.gt.map(|v| v.to_string())),
            ("lt", self.lt.map(|v| v.to_string())),
            ("st", self.st.map(|v| v.to_string())),
            ("dim", self.dim.map(|v| v.to_string())),
            ("ver", self.ver.clone().filter(|v| !v.is_empty())),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, value)| value.is_none())
    }

    /// Query setting every present parameter.
    pub fn to_query(&self) -> AttributeQuery {
        AttributeQuery(
            self.entries()
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name.to_string(), Some(v))))
                .collect(),
        )
    }

    /// Query unsetting every parameter present in `self`.
    pub fn reset_query(&self) -> AttributeQuery {
        AttributeQuery(
            self.entries()
                .into_iter()
                .filter(|(_, value)| value.is_some())
                .map(|(name, _)| (name.to_string(), None))
                .collect(),
        )
    }
}

/// Write-attributes parameters as sent to the device. A name without a value
/// removes that attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeQuery(pub Vec<(String, Option<String>)>);

impl AttributeQuery {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_deref())
    }
}

impl fmt::Display for AttributeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| match value {
                Some(value) => format!("{}={}", name, value),
                None => name.clone(),
            })
            .collect();
        f.write_str(&parts.join("&"))
    }
}

/// Typed LwM2M configuration of one device profile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileConfig {
    pub profile_id: Uuid,
    pub attributes: BTreeSet<VersionedPath>,
    pub telemetry: BTreeSet<VersionedPath>,
    pub observe: BTreeSet<VersionedPath>,
    pub key_names: BTreeMap<VersionedPath, String>,
    pub write_attributes: BTreeMap<VersionedPath, WriteAttributes>,
    pub strategy: ObserveStrategy,
    pub bootstrap: Option<BootstrapProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileDocument {
    #[serde(default)]
    client_lw_m2m_settings: ClientSettings,
    #[serde(default)]
    observe_attr: ObserveAttrDocument,
    #[serde(default)]
    bootstrap: Option<BootstrapProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientSettings {
    #[serde(default)]
    client_only_observe_after_connect: ObserveStrategy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObserveAttrDocument {
    #[serde(default)]
    key_name: BTreeMap<VersionedPath, String>,
    #[serde(default)]
    attribute: BTreeSet<VersionedPath>,
    #[serde(default)]
    telemetry: BTreeSet<VersionedPath>,
    #[serde(default)]
    observe: BTreeSet<VersionedPath>,
    #[serde(default)]
    attribute_lwm2m: BTreeMap<VersionedPath, WriteAttributes>,
}

impl ProfileConfig {
    /// Decode the transport configuration of a backend profile.
    pub fn from_profile(profile: &DeviceProfile) -> Result<Self> {
        let document: ProfileDocument = serde_json::from_value(profile.transport_configuration.clone())
            .map_err(|e| {
                GatewayError::MalformedPayload(format!("profile {}: {}", profile.id, e))
            })?;
        let observe_attr = document.observe_attr;
        Ok(Self {
            profile_id: profile.id,
            attributes: observe_attr.attribute,
            telemetry: observe_attr.telemetry,
            observe: observe_attr.observe,
            key_names: observe_attr.key_name,
            write_attributes: observe_attr.attribute_lwm2m,
            strategy: document.client_lw_m2m_settings.client_only_observe_after_connect,
            bootstrap: document.bootstrap,
        })
    }

    /// Attribute and telemetry paths.
    pub fn published_paths(&self) -> BTreeSet<VersionedPath> {
        self.attributes.union(&self.telemetry).cloned().collect()
    }

    /// Observe paths that are also published.
    pub fn observe_eligible(&self) -> BTreeSet<VersionedPath> {
        let published = self.published_paths();
        self.observe.intersection(&published).cloned().collect()
    }

    pub fn key_name(&self, path: &LwM2mPath) -> Option<&str> {
        self.key_names
            .iter()
            .find(|(p, _)| p.path == *path)
            .map(|(_, name)| name.as_str())
    }

    pub fn path_for_key(&self, key: &str) -> Option<&VersionedPath> {
        self.key_names
            .iter()
            .find(|(_, name)| name.as_str() == key)
            .map(|(path, _)| path)
    }

    pub fn is_attribute(&self, path: &LwM2mPath) -> bool {
        self.attributes.iter().any(|p| p.path == *path)
    }

    pub fn is_telemetry(&self, path: &LwM2mPath) -> bool {
        self.telemetry.iter().any(|p| p.path == *path)
    }
}
