//! Simulated LwM2M devices.
//!
//! A [`SimulatedDevice`] keeps an object tree per advertised object model and
//! answers downlink requests the way a well-behaved client would. Devices can
//! be put to sleep, slowed down or told to fail a path.

use std::collections::BTreeMap;
use std::time::Duration;

use neomind_lwm2m::model::{ObjectNode, ResourceContent};
use neomind_lwm2m::path::FIRMWARE_OBJECT_ID;
use neomind_lwm2m::profile::AttributeQuery;
use neomind_lwm2m::{
    DownlinkRequest, DownlinkResponse, InstanceNode, LwM2mPath, Node, ObjectModel, Operations, Registration,
    Resource, ResourceModel, ResourceType, ResourceValue, ResponseCode,
};

/// Standard object models used by the simulator.
pub mod models {
    use super::*;

    /// Device object (3) at version 1.0.
    pub fn device_object() -> ObjectModel {
        ObjectModel::new(3, "Device", "1.0")
            .with_resource(ResourceModel::new(0, "Manufacturer", Operations::R, ResourceType::String))
            .with_resource(ResourceModel::new(1, "Model Number", Operations::R, ResourceType::String))
            .with_resource(ResourceModel::new(3, "Firmware Version", Operations::R, ResourceType::String))
            .with_resource(ResourceModel::new(4, "Reboot", Operations::E, ResourceType::None))
            .with_resource(
                ResourceModel::new(6, "Available Power Sources", Operations::R, ResourceType::Integer).multiple(),
            )
            .with_resource(ResourceModel::new(9, "Battery Level", Operations::R, ResourceType::Integer))
            .with_resource(ResourceModel::new(13, "Current Time", Operations::RW, ResourceType::Time))
            .with_resource(ResourceModel::new(14, "UTC Offset", Operations::RW, ResourceType::String))
            .with_resource(ResourceModel::new(15, "Timezone", Operations::RW, ResourceType::String))
    }

    /// Firmware update object (5) at version 1.0.
    pub fn firmware_object() -> ObjectModel {
        ObjectModel::new(FIRMWARE_OBJECT_ID, "Firmware Update", "1.0")
            .with_resource(ResourceModel::new(0, "Package", Operations::W, ResourceType::Opaque))
            .with_resource(ResourceModel::new(1, "Package URI", Operations::RW, ResourceType::String))
            .with_resource(ResourceModel::new(2, "Update", Operations::E, ResourceType::None))
            .with_resource(ResourceModel::new(3, "State", Operations::R, ResourceType::Integer))
            .with_resource(ResourceModel::new(5, "Update Result", Operations::R, ResourceType::Integer))
            .with_resource(ResourceModel::new(7, "PkgVersion", Operations::R, ResourceType::String))
    }

    /// Instance 0 of the device object.
    pub fn device_resources(battery: i64) -> Vec<Resource> {
        vec![
            Resource::single(0, ResourceValue::String("NeoMind".into())),
            Resource::single(1, ResourceValue::String("SIM-1".into())),
            Resource::single(3, ResourceValue::String("1.0.0".into())),
            Resource::multiple(
                6,
                ResourceType::Integer,
                BTreeMap::from([(0, ResourceValue::Integer(1)), (1, ResourceValue::Integer(5))]),
            ),
            Resource::single(9, ResourceValue::Integer(battery)),
            Resource::single(14, ResourceValue::String("+01".into())),
            Resource::single(15, ResourceValue::String("Europe/Berlin".into())),
        ]
    }
}

#[derive(Debug, Clone)]
struct FirmwareImage {
    size: usize,
    next_version: String,
    received: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SimulatedObject {
    model: ObjectModel,
    instances: BTreeMap<u16, InstanceNode>,
}

/// Scriptable LwM2M client.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub endpoint: String,
    objects: BTreeMap<u16, SimulatedObject>,
    pub(crate) sleeping: bool,
    pub(crate) delay: Option<Duration>,
    failures: BTreeMap<LwM2mPath, ResponseCode>,
    firmware: Option<FirmwareImage>,
    attributes: BTreeMap<LwM2mPath, AttributeQuery>,
    executed: Vec<(LwM2mPath, Option<String>)>,
}

impl SimulatedDevice {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            objects: BTreeMap::new(),
            sleeping: false,
            delay: None,
            failures: BTreeMap::new(),
            firmware: None,
            attributes: BTreeMap::new(),
            executed: Vec::new(),
        }
    }

    /// Add an object instance.
    pub fn with_object(mut self, model: ObjectModel, instance: u16, resources: Vec<Resource>) -> Self {
        let object = self.objects.entry(model.id).or_insert_with(|| SimulatedObject {
            model,
            instances: BTreeMap::new(),
        });
        object.instances.insert(instance, InstanceNode::new(instance, resources));
        self
    }

    /// Device object with the given battery level.
    pub fn with_device_object(self, battery: i64) -> Self {
        self.with_object(models::device_object(), 0, models::device_resources(battery))
    }

    /// Firmware object reporting `current`. Once `image_size` bytes have been
    /// written to the package resource the device reports `next_version`.
    pub fn with_firmware(mut self, current: &str, image_size: usize, next_version: &str) -> Self {
        self.firmware = Some(FirmwareImage {
            size: image_size,
            next_version: next_version.into(),
            received: Vec::new(),
        });
        self.with_object(
            models::firmware_object(),
            0,
            vec![
                Resource::single(3, ResourceValue::Integer(0)),
                Resource::single(7, ResourceValue::String(current.into())),
            ],
        )
    }

    pub fn sleeping(mut self, sleeping: bool) -> Self {
        self.sleeping = sleeping;
        self
    }

    /// Delay every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer requests at or below `path` with `code`.
    pub fn failing(mut self, path: LwM2mPath, code: ResponseCode) -> Self {
        self.failures.insert(path, code);
        self
    }

    /// Registration advertising every object instance of the device.
    pub fn registration(&self, id: impl Into<String>) -> Registration {
        let mut registration = Registration::new(id, self.endpoint.clone()).with_queue_mode(self.sleeping);
        for (object_id, object) in &self.objects {
            for instance in object.instances.keys() {
                registration = registration.with_object(*object_id, object.model.version.clone(), *instance);
            }
        }
        registration
    }

    pub fn model(&self, object_id: u16) -> Option<&ObjectModel> {
        self.objects.get(&object_id).map(|o| &o.model)
    }

    pub fn value(&self, path: &LwM2mPath) -> Option<ResourceValue> {
        match self.read(path)? {
            Node::Resource(resource) => resource.value().cloned(),
            Node::ResourceInstance { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn set_value(&mut self, path: &LwM2mPath, value: ResourceValue) -> bool {
        let Some(resource_id) = path.resource_id else {
            return false;
        };
        self.write(path, Resource::single(resource_id, value))
    }

    pub fn firmware_received(&self) -> usize {
        self.firmware.as_ref().map_or(0, |f| f.received.len())
    }

    pub fn written_attributes(&self, path: &LwM2mPath) -> Option<AttributeQuery> {
        self.attributes.get(path).cloned()
    }

    pub fn executed(&self) -> &[(LwM2mPath, Option<String>)] {
        &self.executed
    }

    fn failure_for(&self, path: &LwM2mPath) -> Option<ResponseCode> {
        self.failures
            .iter()
            .find(|(failing, _)| failing.contains(path))
            .map(|(_, code)| *code)
    }

    fn resource_model(&self, path: &LwM2mPath) -> Option<&ResourceModel> {
        self.model(path.object_id)?.resource(path.resource_id?)
    }

    fn read(&self, path: &LwM2mPath) -> Option<Node> {
        let object = self.objects.get(&path.object_id)?;
        let Some(instance_id) = path.instance_id else {
            return Some(Node::Object(ObjectNode {
                id: path.object_id,
                instances: object.instances.clone(),
            }));
        };
        let instance = object.instances.get(&instance_id)?;
        let Some(resource_id) = path.resource_id else {
            return Some(Node::Instance(instance.clone()));
        };
        let resource = instance.resources.get(&resource_id)?;
        match (path.resource_instance_id, &resource.content) {
            (None, _) => Some(Node::Resource(resource.clone())),
            (Some(id), ResourceContent::Multiple(values)) => values
                .get(&id)
                .cloned()
                .map(|value| Node::ResourceInstance { id, value }),
            (Some(_), ResourceContent::Single(_)) => None,
        }
    }

    fn write(&mut self, path: &LwM2mPath, resource: Resource) -> bool {
        let (Some(instance_id), Some(resource_id)) = (path.instance_id, path.resource_id) else {
            return false;
        };
        let Some(instance) = self
            .objects
            .get_mut(&path.object_id)
            .and_then(|o| o.instances.get_mut(&instance_id))
        else {
            return false;
        };
        match (path.resource_instance_id, resource.value()) {
            (Some(ri), Some(value)) => {
                let entry = instance
                    .resources
                    .entry(resource_id)
                    .or_insert_with(|| Resource::multiple(resource_id, value.kind(), BTreeMap::new()));
                if let ResourceContent::Multiple(values) = &mut entry.content {
                    values.insert(ri, value.clone());
                }
            }
            _ => {
                let mut resource = resource;
                resource.id = resource_id;
                instance.resources.insert(resource_id, resource);
            }
        }
        true
    }

    fn write_package(&mut self, resource: &Resource) {
        let Some(ResourceValue::Opaque(bytes)) = resource.value() else {
            return;
        };
        let Some(image) = self.firmware.as_mut() else {
            return;
        };
        image.received.extend_from_slice(bytes);
        if image.received.len() >= image.size {
            let version = ResourceValue::String(image.next_version.clone());
            self.set_value(&LwM2mPath::firmware_version(), version);
        }
    }

    /// Execute a request against the object tree.
    pub fn handle(&mut self, request: &DownlinkRequest) -> DownlinkResponse {
        if let Some(code) = self.failure_for(request.path()) {
            return failure_response(request, code);
        }
        match request {
            DownlinkRequest::Read { path, .. } => match self.read(path) {
                Some(node) => DownlinkResponse::Read {
                    code: ResponseCode::Content,
                    content: Some(node),
                },
                None => DownlinkResponse::Read {
                    code: ResponseCode::NotFound,
                    content: None,
                },
            },
            DownlinkRequest::Observe { path, .. } => match self.read(path) {
                Some(node) => DownlinkResponse::Observe {
                    code: ResponseCode::Content,
                    content: Some(node),
                },
                None => DownlinkResponse::Observe {
                    code: ResponseCode::NotFound,
                    content: None,
                },
            },
            DownlinkRequest::Discover { path } => {
                let links = match self.read(path) {
                    Some(node) => node
                        .resources(path)
                        .into_iter()
                        .map(|(p, _)| format!("<{}>", p))
                        .collect(),
                    None => Vec::new(),
                };
                DownlinkResponse::Discover {
                    code: ResponseCode::Content,
                    links,
                }
            }
            DownlinkRequest::Execute { path, arguments } => {
                let allowed = self
                    .resource_model(path)
                    .map(|m| m.operations.is_executable())
                    .unwrap_or(false);
                if !allowed {
                    return DownlinkResponse::Execute {
                        code: ResponseCode::MethodNotAllowed,
                    };
                }
                self.executed.push((*path, arguments.clone()));
                DownlinkResponse::Execute {
                    code: ResponseCode::Changed,
                }
            }
            DownlinkRequest::WriteReplace { path, resource, .. } => {
                if *path == LwM2mPath::firmware_package() {
                    self.write_package(resource);
                    return DownlinkResponse::Write {
                        code: ResponseCode::Changed,
                    };
                }
                let code = if self.write(path, resource.clone()) {
                    ResponseCode::Changed
                } else {
                    ResponseCode::NotFound
                };
                DownlinkResponse::Write { code }
            }
            DownlinkRequest::WriteUpdate { path, resources, .. } => {
                let Some(instance) = path.instance_id else {
                    return DownlinkResponse::Write {
                        code: ResponseCode::BadRequest,
                    };
                };
                for resource in resources {
                    let target = LwM2mPath::resource(path.object_id, instance, resource.id);
                    if !self.write(&target, resource.clone()) {
                        return DownlinkResponse::Write {
                            code: ResponseCode::NotFound,
                        };
                    }
                }
                DownlinkResponse::Write {
                    code: ResponseCode::Changed,
                }
            }
            DownlinkRequest::WriteAttributes { path, attributes } => {
                self.attributes.insert(*path, attributes.clone());
                DownlinkResponse::WriteAttributes {
                    code: ResponseCode::Changed,
                }
            }
            DownlinkRequest::Delete { path } => {
                let removed = match (path.instance_id, path.resource_id) {
                    (Some(instance), None) => self
                        .objects
                        .get_mut(&path.object_id)
                        .and_then(|o| o.instances.remove(&instance))
                        .is_some(),
                    _ => false,
                };
                DownlinkResponse::Delete {
                    code: if removed {
                        ResponseCode::Deleted
                    } else {
                        ResponseCode::NotFound
                    },
                }
            }
        }
    }
}

fn failure_response(request: &DownlinkRequest, code: ResponseCode) -> DownlinkResponse {
    match request {
        DownlinkRequest::Read { .. } => DownlinkResponse::Read { code, content: None },
        DownlinkRequest::Observe { .. } => DownlinkResponse::Observe { code, content: None },
        DownlinkRequest::Discover { .. } => DownlinkResponse::Discover {
            code,
            links: Vec::new(),
        },
        DownlinkRequest::Execute { .. } => DownlinkResponse::Execute { code },
        DownlinkRequest::WriteReplace { .. } | DownlinkRequest::WriteUpdate { .. } => {
            DownlinkResponse::Write { code }
        }
        DownlinkRequest::WriteAttributes { .. } => DownlinkResponse::WriteAttributes { code },
        DownlinkRequest::Delete { .. } => DownlinkResponse::Delete { code },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_levels() {
        let device = SimulatedDevice::new("dev1").with_device_object(87);
        assert_eq!(device.value(&LwM2mPath::resource(3, 0, 9)), Some(ResourceValue::Integer(87)));
        assert_eq!(
            device.value(&LwM2mPath::resource_instance(3, 0, 6, 1)),
            Some(ResourceValue::Integer(5))
        );
        assert!(matches!(device.read(&LwM2mPath::object(3)), Some(Node::Object(_))));
        assert!(device.read(&LwM2mPath::resource(3, 1, 9)).is_none());
    }

    #[test]
    fn test_firmware_echo() {
        let mut device = SimulatedDevice::new("dev1").with_firmware("1.0", 4, "2.0");
        let write = |bytes: Vec<u8>| DownlinkRequest::WriteReplace {
            path: LwM2mPath::firmware_package(),
            format: None,
            resource: Resource::single(0, ResourceValue::Opaque(bytes)),
        };
        device.handle(&write(vec![1, 2]));
        assert_eq!(
            device.value(&LwM2mPath::firmware_version()),
            Some(ResourceValue::String("1.0".into()))
        );
        device.handle(&write(vec![3, 4]));
        assert_eq!(
            device.value(&LwM2mPath::firmware_version()),
            Some(ResourceValue::String("2.0".into()))
        );
    }

    #[test]
    fn test_registration_lists_objects() {
        let device = SimulatedDevice::new("dev1")
            .with_device_object(50)
            .with_firmware("1.0", 1, "1.1");
        let registration = device.registration("reg-1");
        assert_eq!(registration.supported_version(3), Some("1.0"));
        assert!(registration.supports_object(5));
        assert_eq!(registration.object_links.len(), 2);
    }
}
