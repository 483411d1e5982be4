//! Object models, decoded resource content and protocol response codes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::path::LwM2mPath;

/// Declared data type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    String,
    Integer,
    Float,
    Boolean,
    Opaque,
    Time,
    #[serde(rename = "OBJLNK")]
    ObjectLink,
    None,
}

/// Operations a resource allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operations {
    #[default]
    None,
    R,
    W,
    RW,
    E,
    RE,
    WE,
    RWE,
}

impl Operations {
    pub fn is_readable(self) -> bool {
        matches!(self, Operations::R | Operations::RW | Operations::RE | Operations::RWE)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Operations::W | Operations::RW | Operations::WE | Operations::RWE)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Operations::E | Operations::RE | Operations::WE | Operations::RWE)
    }
}

/// Resource definition inside an object model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceModel {
    pub id: u16,
    pub name: String,
    pub operations: Operations,
    /// Multi-instance resource
    #[serde(default)]
    pub multiple: bool,
    #[serde(rename = "type")]
    pub kind: ResourceType,
}

impl ResourceModel {
    pub fn new(id: u16, name: impl Into<String>, operations: Operations, kind: ResourceType) -> Self {
        Self {
            id,
            name: name.into(),
            operations,
            multiple: false,
            kind,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
}

/// Object definition at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectModel {
    pub id: u16,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub multiple: bool,
    pub resources: BTreeMap<u16, ResourceModel>,
}

impl ObjectModel {
    pub fn new(id: u16, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: version.into(),
            multiple: false,
            resources: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, resource: ResourceModel) -> Self {
        self.resources.insert(resource.id, resource);
        self
    }

    pub fn resource(&self, id: u16) -> Option<&ResourceModel> {
        self.resources.get(&id)
    }
}

/// Object link value (`objectId:instanceId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLink {
    pub object_id: u16,
    pub instance_id: u16,
}

impl fmt::Display for ObjectLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_id, self.instance_id)
    }
}

impl FromStr for ObjectLink {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object, instance) = s
            .split_once(':')
            .ok_or_else(|| GatewayError::Conversion(format!("object link {:?}", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| GatewayError::Conversion(format!("object link {:?}", s)))
        };
        Ok(Self {
            object_id: parse(object)?,
            instance_id: parse(instance)?,
        })
    }
}

/// Typed resource value.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Time(DateTime<Utc>),
    Opaque(Vec<u8>),
    ObjectLink(ObjectLink),
}

impl ResourceValue {
    pub fn kind(&self) -> ResourceType {
        match self {
            ResourceValue::String(_) => ResourceType::String,
            ResourceValue::Integer(_) => ResourceType::Integer,
            ResourceValue::Float(_) => ResourceType::Float,
            ResourceValue::Boolean(_) => ResourceType::Boolean,
            ResourceValue::Time(_) => ResourceType::Time,
            ResourceValue::Opaque(_) => ResourceType::Opaque,
            ResourceValue::ObjectLink(_) => ResourceType::ObjectLink,
        }
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::String(s) => write!(f, "{}", s),
            ResourceValue::Integer(v) => write!(f, "{}", v),
            ResourceValue::Float(v) => write!(f, "{}", v),
            ResourceValue::Boolean(v) => write!(f, "{}", v),
            ResourceValue::Time(t) => write!(f, "{}", t.timestamp_millis()),
            ResourceValue::Opaque(bytes) => write!(f, "{}", hex::encode(bytes)),
            ResourceValue::ObjectLink(link) => write!(f, "{}", link),
        }
    }
}

/// Value of a single or multi-instance resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceContent {
    Single(ResourceValue),
    Multiple(BTreeMap<u16, ResourceValue>),
}

/// Decoded resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: u16,
    pub kind: ResourceType,
    pub content: ResourceContent,
}

impl Resource {
    pub fn single(id: u16, value: ResourceValue) -> Self {
        Self {
            id,
            kind: value.kind(),
            content: ResourceContent::Single(value),
        }
    }

    pub fn multiple(id: u16, kind: ResourceType, values: BTreeMap<u16, ResourceValue>) -> Self {
        Self {
            id,
            kind,
            content: ResourceContent::Multiple(values),
        }
    }

    pub fn value(&self) -> Option<&ResourceValue> {
        match &self.content {
            ResourceContent::Single(value) => Some(value),
            ResourceContent::Multiple(_) => None,
        }
    }
}

/// Object instance content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceNode {
    pub id: u16,
    pub resources: BTreeMap<u16, Resource>,
}

impl InstanceNode {
    pub fn new(id: u16, resources: impl IntoIterator<Item = Resource>) -> Self {
        Self {
            id,
            resources: resources.into_iter().map(|r| (r.id, r)).collect(),
        }
    }
}

/// Object content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectNode {
    pub id: u16,
    pub instances: BTreeMap<u16, InstanceNode>,
}

/// Content tree returned by a read or carried by a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Object(ObjectNode),
    Instance(InstanceNode),
    Resource(Resource),
    /// Single instance of a multi-instance resource
    ResourceInstance { id: u16, value: ResourceValue },
}

impl Node {
    /// Flatten the tree rooted at `base` into resource paths.
    ///
    /// A resource instance is reported under its own path.
    pub fn resources(&self, base: &LwM2mPath) -> Vec<(LwM2mPath, Resource)> {
        match self {
            Node::Resource(resource) => {
                let path = match base.instance_id {
                    Some(instance) => LwM2mPath::resource(base.object_id, instance, resource.id),
                    None => *base,
                };
                vec![(path, resource.clone())]
            }
            Node::ResourceInstance { id, value } => {
                let path = match (base.instance_id, base.resource_id) {
                    (Some(i), Some(r)) => LwM2mPath::resource_instance(base.object_id, i, r, *id),
                    _ => *base,
                };
                let resource_id = base.resource_id.unwrap_or_default();
                vec![(path, Resource::single(resource_id, value.clone()))]
            }
            Node::Instance(instance) => instance
                .resources
                .values()
                .map(|r| (LwM2mPath::resource(base.object_id, instance.id, r.id), r.clone()))
                .collect(),
            Node::Object(object) => object
                .instances
                .values()
                .flat_map(|instance| {
                    instance.resources.values().map(move |r| {
                        (LwM2mPath::resource(object.id, instance.id, r.id), r.clone())
                    })
                })
                .collect(),
        }
    }
}

/// Content format hint of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentFormat {
    Text,
    Tlv,
    Json,
    SenmlJson,
    SenmlCbor,
    Cbor,
    Opaque,
    Link,
}

impl FromStr for ContentFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "TEXT" => Ok(ContentFormat::Text),
            "TLV" => Ok(ContentFormat::Tlv),
            "JSON" => Ok(ContentFormat::Json),
            "SENML_JSON" => Ok(ContentFormat::SenmlJson),
            "SENML_CBOR" => Ok(ContentFormat::SenmlCbor),
            "CBOR" => Ok(ContentFormat::Cbor),
            "OPAQUE" => Ok(ContentFormat::Opaque),
            "LINK" => Ok(ContentFormat::Link),
            other => Err(GatewayError::MalformedPayload(format!(
                "unknown content format {}",
                other
            ))),
        }
    }
}

/// Device or gateway response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Created,
    Deleted,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    UnsupportedContentFormat,
    InternalServerError,
    ServiceUnavailable,
    GatewayTimeout,
}

impl ResponseCode {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResponseCode::Created | ResponseCode::Deleted | ResponseCode::Changed | ResponseCode::Content
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ResponseCode::Created => "CREATED",
            ResponseCode::Deleted => "DELETED",
            ResponseCode::Changed => "CHANGED",
            ResponseCode::Content => "CONTENT",
            ResponseCode::BadRequest => "BAD_REQUEST",
            ResponseCode::Unauthorized => "UNAUTHORIZED",
            ResponseCode::Forbidden => "FORBIDDEN",
            ResponseCode::NotFound => "NOT_FOUND",
            ResponseCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ResponseCode::NotAcceptable => "NOT_ACCEPTABLE",
            ResponseCode::UnsupportedContentFormat => "UNSUPPORTED_CONTENT_FORMAT",
            ResponseCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ResponseCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ResponseCode::GatewayTimeout => "GATEWAY_TIMEOUT",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceNode {
        InstanceNode::new(
            0,
            [
                Resource::single(9, ResourceValue::Integer(87)),
                Resource::single(0, ResourceValue::String("acme".into())),
            ],
        )
    }

    #[test]
    fn test_flatten_instance() {
        let flat = Node::Instance(instance()).resources(&LwM2mPath::instance(3, 0));
        let paths: Vec<String> = flat.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["/3/0/0", "/3/0/9"]);
    }

    #[test]
    fn test_flatten_object() {
        let mut object = ObjectNode { id: 3, ..Default::default() };
        object.instances.insert(0, instance());
        let flat = Node::Object(object).resources(&LwM2mPath::object(3));
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[1].0, LwM2mPath::resource(3, 0, 9));
    }

    #[test]
    fn test_object_link_parse() {
        let link: ObjectLink = "3:1".parse().unwrap();
        assert_eq!(link, ObjectLink { object_id: 3, instance_id: 1 });
        assert!("3".parse::<ObjectLink>().is_err());
    }

    #[test]
    fn test_operations() {
        assert!(Operations::RW.is_writable());
        assert!(!Operations::R.is_writable());
        assert!(Operations::E.is_executable());
    }

    #[test]
    fn test_content_format_names() {
        assert_eq!("senml-json".parse::<ContentFormat>().unwrap(), ContentFormat::SenmlJson);
        assert_eq!("OPAQUE".parse::<ContentFormat>().unwrap(), ContentFormat::Opaque);
        assert!("xml".parse::<ContentFormat>().is_err());
    }
}
