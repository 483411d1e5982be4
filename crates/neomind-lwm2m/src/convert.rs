//! Conversion between typed resource values, backend values and request text.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::model::{ObjectLink, Resource, ResourceContent, ResourceType, ResourceValue};

/// Value representation on the backend bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KvValue {
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    Json(Value),
}

impl KvValue {
    /// Plain JSON form, used when a value is written to a device.
    pub fn to_json(&self) -> Value {
        match self {
            KvValue::Bool(v) => Value::Bool(*v),
            KvValue::Long(v) => Value::from(*v),
            KvValue::Double(v) => Value::from(*v),
            KvValue::String(v) => Value::String(v.clone()),
            KvValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for KvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Named backend value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: KvValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: KvValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Backend representation of a single value.
pub fn value_to_kv(value: &ResourceValue) -> KvValue {
    match value {
        ResourceValue::String(s) => KvValue::String(s.clone()),
        ResourceValue::Integer(v) => KvValue::Long(*v),
        ResourceValue::Float(v) => KvValue::Double(*v),
        ResourceValue::Boolean(v) => KvValue::Bool(*v),
        ResourceValue::Time(t) => KvValue::Long(t.timestamp_millis()),
        ResourceValue::Opaque(bytes) => KvValue::String(hex::encode(bytes)),
        ResourceValue::ObjectLink(link) => KvValue::String(link.to_string()),
    }
}

/// Backend representation of a resource; multi-instance resources become
/// a JSON object keyed by instance id.
pub fn resource_to_kv(resource: &Resource) -> KvValue {
    match &resource.content {
        ResourceContent::Single(value) => value_to_kv(value),
        ResourceContent::Multiple(values) => {
            let object = values
                .iter()
                .map(|(id, value)| (id.to_string(), value_to_kv(value).to_json()))
                .collect::<serde_json::Map<_, _>>();
            KvValue::Json(Value::Object(object))
        }
    }
}

/// Typed value from a backend value.
pub fn kv_to_value(kv: &KvValue, kind: ResourceType) -> Result<ResourceValue> {
    json_to_value(&kv.to_json(), kind)
}

/// Typed value from request JSON. Strings are parsed according to `kind`.
pub fn json_to_value(value: &Value, kind: ResourceType) -> Result<ResourceValue> {
    let mismatch = || GatewayError::Conversion(format!("{} is not a valid {:?}", value, kind));
    match kind {
        ResourceType::String => Ok(ResourceValue::String(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ResourceType::Integer => match value {
            Value::Number(n) => n.as_i64().map(ResourceValue::Integer).ok_or_else(mismatch),
            Value::String(s) => s.trim().parse().map(ResourceValue::Integer).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ResourceType::Float => match value {
            Value::Number(n) => n.as_f64().map(ResourceValue::Float).ok_or_else(mismatch),
            Value::String(s) => s.trim().parse().map(ResourceValue::Float).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ResourceType::Boolean => match value {
            Value::Bool(b) => Ok(ResourceValue::Boolean(*b)),
            Value::String(s) => s.trim().parse().map(ResourceValue::Boolean).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ResourceType::Time => {
            let millis = match value {
                Value::Number(n) => n.as_i64().ok_or_else(mismatch)?,
                Value::String(s) => s.trim().parse::<i64>().map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            };
            DateTime::<Utc>::from_timestamp_millis(millis)
                .map(ResourceValue::Time)
                .ok_or_else(mismatch)
        }
        ResourceType::Opaque => match value {
            Value::String(s) => hex::decode(s.trim())
                .map(ResourceValue::Opaque)
                .map_err(|_| mismatch()),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(ResourceValue::Opaque)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        ResourceType::ObjectLink => match value {
            Value::String(s) => s.parse::<ObjectLink>().map(ResourceValue::ObjectLink),
            _ => Err(mismatch()),
        },
        ResourceType::None => Err(GatewayError::Conversion(format!(
            "resource has no declared type, cannot convert {}",
            value
        ))),
    }
}

/// Typed values for a multi-instance write, from a JSON object keyed by instance id.
pub fn json_to_instances(value: &Value, kind: ResourceType) -> Result<BTreeMap<u16, ResourceValue>> {
    let object = value
        .as_object()
        .ok_or_else(|| GatewayError::Conversion(format!("{} is not an instance map", value)))?;
    object
        .iter()
        .map(|(id, item)| {
            let id = id
                .parse::<u16>()
                .map_err(|_| GatewayError::Conversion(format!("instance id {:?}", id)))?;
            Ok((id, json_to_value(item, kind)?))
        })
        .collect()
}
