//! Resource paths.
//!
//! The protocol engine addresses nodes with plain paths (`/3/0/9`). Profiles and
//! RPC requests use versioned paths where the object segment carries the object
//! model version (`/3_1.0/0/9`). A missing version means [`DEFAULT_OBJECT_VERSION`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GatewayError;

/// Object version assumed when a path does not name one.
pub const DEFAULT_OBJECT_VERSION: &str = "1.0";

/// Firmware update object id.
pub const FIRMWARE_OBJECT_ID: u16 = 5;
/// Firmware package resource (`/5/0/0`).
pub const FIRMWARE_PACKAGE_RESOURCE: u16 = 0;
/// Firmware version resource (`/5/0/7`).
pub const FIRMWARE_VERSION_RESOURCE: u16 = 7;

/// Plain path into a device object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LwM2mPath {
    pub object_id: u16,
    pub instance_id: Option<u16>,
    pub resource_id: Option<u16>,
    pub resource_instance_id: Option<u16>,
}

impl LwM2mPath {
    pub fn object(object_id: u16) -> Self {
        Self {
            object_id,
            instance_id: None,
            resource_id: None,
            resource_instance_id: None,
        }
    }

    pub fn instance(object_id: u16, instance_id: u16) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Self::object(object_id)
        }
    }

    pub fn resource(object_id: u16, instance_id: u16, resource_id: u16) -> Self {
        Self {
            resource_id: Some(resource_id),
            ..Self::instance(object_id, instance_id)
        }
    }

    pub fn resource_instance(object_id: u16, instance_id: u16, resource_id: u16, ri: u16) -> Self {
        Self {
            resource_instance_id: Some(ri),
            ..Self::resource(object_id, instance_id, resource_id)
        }
    }

    /// `/5/0/7`
    pub fn firmware_version() -> Self {
        Self::resource(FIRMWARE_OBJECT_ID, 0, FIRMWARE_VERSION_RESOURCE)
    }

    /// `/5/0/0`
    pub fn firmware_package() -> Self {
        Self::resource(FIRMWARE_OBJECT_ID, 0, FIRMWARE_PACKAGE_RESOURCE)
    }

    pub fn is_object(&self) -> bool {
        self.instance_id.is_none()
    }

    pub fn is_object_instance(&self) -> bool {
        self.instance_id.is_some() && self.resource_id.is_none()
    }

    pub fn is_resource(&self) -> bool {
        self.resource_id.is_some() && self.resource_instance_id.is_none()
    }

    pub fn is_resource_instance(&self) -> bool {
        self.resource_instance_id.is_some()
    }

    /// Path of the enclosing resource (itself for a resource path).
    pub fn resource_path(&self) -> Option<LwM2mPath> {
        let resource_id = self.resource_id?;
        Some(Self::resource(self.object_id, self.instance_id?, resource_id))
    }

    /// True when `other` is this node or lies below it.
    pub fn contains(&self, other: &LwM2mPath) -> bool {
        if self.object_id != other.object_id {
            return false;
        }
        let segments = [
            (self.instance_id, other.instance_id),
            (self.resource_id, other.resource_id),
            (self.resource_instance_id, other.resource_instance_id),
        ];
        segments
            .iter()
            .all(|(mine, theirs)| mine.is_none() || mine == theirs)
    }

    /// Attach an object version.
    pub fn versioned(self, version: impl Into<String>) -> VersionedPath {
        VersionedPath {
            path: self,
            version: Some(version.into()),
        }
    }
}

impl fmt::Display for LwM2mPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object_id)?;
        for segment in [self.instance_id, self.resource_id, self.resource_instance_id]
            .into_iter()
            .flatten()
        {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for LwM2mPath {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let versioned: VersionedPath = s.parse()?;
        if versioned.version.is_some() {
            return Err(GatewayError::MalformedPayload(format!(
                "unexpected object version in {}",
                s
            )));
        }
        Ok(versioned.path)
    }
}

/// Path whose object segment may carry an object model version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionedPath {
    pub path: LwM2mPath,
    pub version: Option<String>,
}

impl VersionedPath {
    pub fn new(path: LwM2mPath, version: Option<String>) -> Self {
        Self { path, version }
    }

    pub fn object_id(&self) -> u16 {
        self.path.object_id
    }

    /// Version named in the path, or the default object version.
    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_OBJECT_VERSION)
    }
}

impl From<LwM2mPath> for VersionedPath {
    fn from(path: LwM2mPath) -> Self {
        Self {
            path,
            version: None,
        }
    }
}

impl fmt::Display for VersionedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            None => write!(f, "{}", self.path),
            Some(version) => {
                write!(f, "/{}_{}", self.path.object_id, version)?;
                for segment in [
                    self.path.instance_id,
                    self.path.resource_id,
                    self.path.resource_instance_id,
                ]
                .into_iter()
                .flatten()
                {
                    write!(f, "/{}", segment)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for VersionedPath {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || GatewayError::MalformedPayload(format!("invalid path: {:?}", s));
        let trimmed = s.trim();
        let rest = trimmed.strip_prefix('/').ok_or_else(malformed)?;
        let mut segments = rest.split('/');

        let first = segments.next().filter(|seg| !seg.is_empty()).ok_or_else(malformed)?;
        let (object, version) = match first.split_once('_') {
            Some((object, version)) if !version.is_empty() => (object, Some(version.to_string())),
            Some(_) => return Err(malformed()),
            None => (first, None),
        };
        let object_id = object.parse::<u16>().map_err(|_| malformed())?;

        let mut ids = Vec::with_capacity(3);
        for segment in segments {
            if ids.len() == 3 {
                return Err(malformed());
            }
            ids.push(segment.parse::<u16>().map_err(|_| malformed())?);
        }

        let path = LwM2mPath {
            object_id,
            instance_id: ids.first().copied(),
            resource_id: ids.get(1).copied(),
            resource_instance_id: ids.get(2).copied(),
        };
        Ok(Self { path, version })
    }
}

impl Serialize for LwM2mPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LwM2mPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for VersionedPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionedPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versioned() {
        let path: VersionedPath = "/3_1.1/0/9".parse().unwrap();
        assert_eq!(path.path, LwM2mPath::resource(3, 0, 9));
        assert_eq!(path.version.as_deref(), Some("1.1"));
        assert_eq!(path.to_string(), "/3_1.1/0/9");
    }

    #[test]
    fn test_parse_plain() {
        let path: VersionedPath = "/3/0/9".parse().unwrap();
        assert_eq!(path.version, None);
        assert_eq!(path.version_or_default(), "1.0");
        assert_eq!(path.path.to_string(), "/3/0/9");
    }

    #[test]
    fn test_parse_depths() {
        assert!(LwM2mPath::from_str("/3").unwrap().is_object());
        assert!(LwM2mPath::from_str("/3/0").unwrap().is_object_instance());
        assert!(LwM2mPath::from_str("/3/0/7/1").unwrap().is_resource_instance());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "3/0/9", "/x/0", "/3_/0", "/3/0/9/1/2", "/3//9"] {
            assert!(bad.parse::<VersionedPath>().is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn test_contains() {
        let object = LwM2mPath::object(3);
        assert!(object.contains(&LwM2mPath::resource(3, 0, 9)));
        assert!(!object.contains(&LwM2mPath::resource(5, 0, 7)));
        assert!(!LwM2mPath::resource(3, 0, 9).contains(&LwM2mPath::object(3)));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&LwM2mPath::firmware_version().versioned("1.0")).unwrap();
        assert_eq!(json, "\"/5_1.0/0/7\"");

        let plain: LwM2mPath = serde_json::from_str("\"/3/0\"").unwrap();
        assert_eq!(plain, LwM2mPath::instance(3, 0));
        assert_eq!(serde_json::to_string(&plain).unwrap(), "\"/3/0\"");
        assert!(serde_json::from_str::<LwM2mPath>("\"/3_1.0/0\"").is_err());
    }

    #[test]
    fn test_registration_serde() {
        let registration = crate::engine::Registration::new("reg-1", "dev1").with_object(3, "1.0", 0);
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["object_links"], serde_json::json!(["/3/0"]));
        let back: crate::engine::Registration = serde_json::from_value(json).unwrap();
        assert_eq!(back, registration);
    }
}
