//! Profile and credential documents, plus small async helpers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use neomind_lwm2m::{BootstrapConfig, BootstrapConfigStore, DeviceProfile, ObserveStrategy, Result, WriteAttributes};

/// Builds a [`DeviceProfile`] whose transport configuration uses the backend
/// document layout.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    id: Uuid,
    name: String,
    key_names: Map<String, Value>,
    attributes: Vec<String>,
    telemetry: Vec<String>,
    observe: Vec<String>,
    write_attributes: Map<String, Value>,
    strategy: ObserveStrategy,
    bootstrap: Option<Value>,
}

impl ProfileBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            key_names: Map::new(),
            attributes: Vec::new(),
            telemetry: Vec::new(),
            observe: Vec::new(),
            write_attributes: Map::new(),
            strategy: ObserveStrategy::ObserveOnly,
            bootstrap: None,
        }
    }

    /// Reuse a profile id, e.g. to build the next version of a profile.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn attribute(mut self, path: &str, key: &str) -> Self {
        self.key_names.insert(path.to_string(), Value::String(key.to_string()));
        self.attributes.push(path.to_string());
        self
    }

    pub fn telemetry(mut self, path: &str, key: &str) -> Self {
        self.key_names.insert(path.to_string(), Value::String(key.to_string()));
        self.telemetry.push(path.to_string());
        self
    }

    pub fn observe(mut self, path: &str) -> Self {
        self.observe.push(path.to_string());
        self
    }

    pub fn write_attributes(mut self, path: &str, attributes: WriteAttributes) -> Self {
        let value = serde_json::to_value(attributes).unwrap_or(Value::Null);
        self.write_attributes.insert(path.to_string(), value);
        self
    }

    pub fn strategy(mut self, strategy: ObserveStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Bootstrap section with both servers in `mode` (e.g. `"PSK"`).
    pub fn bootstrap(mut self, mode: &str) -> Self {
        self.bootstrap = Some(json!({
            "servers": { "shortId": 123, "lifetime": 300, "binding": "U" },
            "bootstrapServer": { "securityMode": mode, "host": "localhost", "port": 5688, "serverId": 111 },
            "lwm2mServer": { "securityMode": mode, "host": "localhost", "port": 5686, "serverId": 123 },
        }));
        self
    }

    pub fn build(self) -> DeviceProfile {
        let mut document = json!({
            "clientLwM2mSettings": {
                "clientOnlyObserveAfterConnect": u8::from(self.strategy),
            },
            "observeAttr": {
                "keyName": self.key_names,
                "attribute": self.attributes,
                "telemetry": self.telemetry,
                "observe": self.observe,
                "attributeLwm2m": self.write_attributes,
            },
        });
        if let (Some(bootstrap), Some(object)) = (self.bootstrap, document.as_object_mut()) {
            object.insert("bootstrap".into(), bootstrap);
        }
        DeviceProfile {
            id: self.id,
            name: self.name,
            transport_configuration: document,
        }
    }
}

pub fn no_sec_credentials(endpoint: &str) -> Value {
    json!({
        "client": { "securityConfigClientMode": "NO_SEC", "endpoint": endpoint }
    })
}

pub fn psk_credentials(endpoint: &str, identity: &str, key: &[u8]) -> Value {
    json!({
        "client": {
            "securityConfigClientMode": "PSK",
            "endpoint": endpoint,
            "identity": identity,
            "key": hex::encode(key),
        }
    })
}

/// Credentials with a bootstrap section for both servers in `mode`.
pub fn bootstrap_credentials(endpoint: &str, mode: &str, key: &[u8]) -> Value {
    let server = json!({
        "securityMode": mode,
        "clientPublicKeyOrId": endpoint,
        "clientSecretKey": hex::encode(key),
    });
    json!({
        "client": { "securityConfigClientMode": mode, "endpoint": endpoint, "identity": endpoint, "key": hex::encode(key) },
        "bootstrap": { "bootstrapServer": server.clone(), "lwm2mServer": server },
    })
}

/// Random 16 byte pre-shared key.
pub fn random_psk_key() -> Vec<u8> {
    let mut key = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Bootstrap config store kept in memory.
#[derive(Default)]
pub struct MemoryBootstrapStore {
    configs: DashMap<String, BootstrapConfig>,
    removals: AtomicUsize,
}

impl MemoryBootstrapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, BootstrapConfig> {
        self.configs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl BootstrapConfigStore for MemoryBootstrapStore {
    async fn get(&self, endpoint: &str) -> Option<BootstrapConfig> {
        self.configs.get(endpoint).map(|c| c.value().clone())
    }

    async fn add(&self, endpoint: &str, config: BootstrapConfig) -> Result<()> {
        self.configs.insert(endpoint.to_string(), config);
        Ok(())
    }

    async fn remove(&self, endpoint: &str) -> Option<BootstrapConfig> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.configs.remove(endpoint).map(|(_, config)| config)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neomind_lwm2m::{LwM2mPath, ProfileConfig};

    #[test]
    fn test_profile_builder_round_trips_through_profile_config() {
        let profile = ProfileBuilder::new("sensors")
            .attribute("/3_1.0/0/9", "battery")
            .telemetry("/3_1.0/0/13", "time")
            .observe("/3_1.0/0/9")
            .strategy(ObserveStrategy::ReadAllThenObserve)
            .build();
        let config = ProfileConfig::from_profile(&profile).unwrap();
        assert_eq!(config.key_name(&LwM2mPath::resource(3, 0, 9)), Some("battery"));
        assert!(config.is_telemetry(&LwM2mPath::resource(3, 0, 13)));
        assert_eq!(config.observe_eligible().len(), 1);
        assert_eq!(config.strategy, ObserveStrategy::ReadAllThenObserve);
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn test_bootstrap_section_parses() {
        let profile = ProfileBuilder::new("bs").bootstrap("PSK").build();
        let config = ProfileConfig::from_profile(&profile).unwrap();
        let bootstrap = config.bootstrap.unwrap();
        assert_eq!(bootstrap.lwm2m_server.port, 5686);
    }
}
