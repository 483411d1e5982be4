//! Firmware metadata and binary storage.
//!
//! The delivery loop only needs chunk reads. Upload, listing and guarded
//! deletion serve the administrative surface.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use uuid::Uuid;

use crate::error::GatewayError;

const FIRMWARE_INFO_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("firmware_info");
const FIRMWARE_DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("firmware_data");

/// Firmware store result type
pub type FirmwareResult<T> = std::result::Result<T, FirmwareError>;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Firmware not found: {0}")]
    NotFound(Uuid),

    /// Still assigned to a device profile or device
    #[error("Firmware {0} is referenced and cannot be deleted")]
    InUse(Uuid),

    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<FirmwareError> for GatewayError {
    fn from(e: FirmwareError) -> Self {
        match e {
            FirmwareError::NotFound(id) => GatewayError::NotFound(format!("firmware {}", id)),
            other => GatewayError::Backend(other.to_string()),
        }
    }
}

impl From<redb::Error> for FirmwareError {
    fn from(e: redb::Error) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for FirmwareError {
    fn from(e: redb::DatabaseError) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for FirmwareError {
    fn from(e: redb::TransactionError) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for FirmwareError {
    fn from(e: redb::TableError) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for FirmwareError {
    fn from(e: redb::StorageError) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for FirmwareError {
    fn from(e: redb::CommitError) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for FirmwareError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for FirmwareError {
    fn from(e: std::io::Error) -> Self {
        FirmwareError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareKind {
    Firmware,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Lowercase hex digest of `data`.
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            ChecksumAlgorithm::Sha384 => hex::encode(Sha384::digest(data)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// Stored firmware metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_profile_id: Option<Uuid>,
    pub kind: FirmwareKind,
    pub title: String,
    pub version: String,
    pub file_name: String,
    pub content_type: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub checksum: String,
    pub data_size: usize,
    #[serde(default)]
    pub additional_info: Value,
    pub created_at: DateTime<Utc>,
}

/// Upload request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFirmware {
    pub tenant_id: Uuid,
    pub device_profile_id: Option<Uuid>,
    pub kind: FirmwareKind,
    pub title: String,
    pub version: String,
    pub file_name: String,
    pub content_type: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Verified against the data when present, computed otherwise
    pub checksum: Option<String>,
    pub data: Vec<u8>,
    pub additional_info: Value,
}

impl NewFirmware {
    pub fn new(tenant_id: Uuid, title: impl Into<String>, version: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            tenant_id,
            device_profile_id: None,
            kind: FirmwareKind::Firmware,
            title: title.into(),
            version: version.into(),
            file_name: "firmware.bin".into(),
            content_type: "application/octet-stream".into(),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            checksum: None,
            data,
            additional_info: Value::Null,
        }
    }

    /// Verify or compute the checksum and produce the metadata record.
    fn into_record(self) -> FirmwareResult<(FirmwareInfo, Vec<u8>)> {
        let computed = self.checksum_algorithm.digest(&self.data);
        if let Some(expected) = &self.checksum {
            if !expected.eq_ignore_ascii_case(&computed) {
                return Err(FirmwareError::ChecksumMismatch {
                    expected: expected.clone(),
                    computed,
                });
            }
        }
        let info = FirmwareInfo {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            device_profile_id: self.device_profile_id,
            kind: self.kind,
            title: self.title,
            version: self.version,
            file_name: self.file_name,
            content_type: self.content_type,
            checksum_algorithm: self.checksum_algorithm,
            checksum: computed,
            data_size: self.data.len(),
            additional_info: self.additional_info,
            created_at: Utc::now(),
        };
        Ok((info, self.data))
    }
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareFilter {
    pub tenant_id: Option<Uuid>,
    pub device_profile_id: Option<Uuid>,
    pub kind: Option<FirmwareKind>,
}

impl FirmwareFilter {
    fn matches(&self, info: &FirmwareInfo) -> bool {
        self.tenant_id.map_or(true, |t| t == info.tenant_id)
            && self
                .device_profile_id
                .map_or(true, |p| info.device_profile_id == Some(p))
            && self.kind.map_or(true, |k| k == info.kind)
    }
}

fn slice_chunk(data: &[u8], offset: usize, size: usize) -> Vec<u8> {
    if offset >= data.len() {
        return Vec::new();
    }
    let end = offset.saturating_add(size).min(data.len());
    data[offset..end].to_vec()
}

#[async_trait]
pub trait FirmwareStore: Send + Sync {
    async fn save(&self, firmware: NewFirmware) -> FirmwareResult<FirmwareInfo>;

    async fn info(&self, id: Uuid) -> FirmwareResult<Option<FirmwareInfo>>;

    async fn data(&self, id: Uuid) -> FirmwareResult<Option<Vec<u8>>>;

    /// Bytes `[offset, offset + size)`, empty past the end.
    async fn chunk(&self, id: Uuid, offset: usize, size: usize) -> FirmwareResult<Vec<u8>> {
        let data = self.data(id).await?.ok_or(FirmwareError::NotFound(id))?;
        Ok(slice_chunk(&data, offset, size))
    }

    async fn list(&self, filter: &FirmwareFilter) -> FirmwareResult<Vec<FirmwareInfo>>;

    /// Returns whether the firmware existed.
    async fn delete(&self, id: Uuid) -> FirmwareResult<bool>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryFirmwareStore {
    entries: DashMap<Uuid, (FirmwareInfo, Arc<Vec<u8>>)>,
}

impl MemoryFirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FirmwareStore for MemoryFirmwareStore {
    async fn save(&self, firmware: NewFirmware) -> FirmwareResult<FirmwareInfo> {
        let (info, data) = firmware.into_record()?;
        self.entries.insert(info.id, (info.clone(), Arc::new(data)));
        Ok(info)
    }

    async fn info(&self, id: Uuid) -> FirmwareResult<Option<FirmwareInfo>> {
        Ok(self.entries.get(&id).map(|e| e.value().0.clone()))
    }

    async fn data(&self, id: Uuid) -> FirmwareResult<Option<Vec<u8>>> {
        Ok(self.entries.get(&id).map(|e| e.value().1.as_ref().clone()))
    }

    async fn chunk(&self, id: Uuid, offset: usize, size: usize) -> FirmwareResult<Vec<u8>> {
        let data = self
            .entries
            .get(&id)
            .map(|e| e.value().1.clone())
            .ok_or(FirmwareError::NotFound(id))?;
        Ok(slice_chunk(&data, offset, size))
    }

    async fn list(&self, filter: &FirmwareFilter) -> FirmwareResult<Vec<FirmwareInfo>> {
        let mut items: Vec<FirmwareInfo> = self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.value().0))
            .map(|e| e.value().0.clone())
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn delete(&self, id: Uuid) -> FirmwareResult<bool> {
        Ok(self.entries.remove(&id).is_some())
    }
}

/// Persistent store backed by redb.
pub struct RedbFirmwareStore {
    db: Arc<Database>,
}

impl RedbFirmwareStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> FirmwareResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path.as_ref())?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(FIRMWARE_INFO_TABLE)?;
            write_txn.open_table(FIRMWARE_DATA_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl FirmwareStore for RedbFirmwareStore {
    async fn save(&self, firmware: NewFirmware) -> FirmwareResult<FirmwareInfo> {
        let (info, data) = firmware.into_record()?;
        let key = info.id.to_string();
        let value = serde_json::to_vec(&info)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FIRMWARE_INFO_TABLE)?;
            table.insert(key.as_str(), value.as_slice())?;
            let mut table = write_txn.open_table(FIRMWARE_DATA_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(info)
    }

    async fn info(&self, id: Uuid) -> FirmwareResult<Option<FirmwareInfo>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FIRMWARE_INFO_TABLE)?;
        match table.get(id.to_string().as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn data(&self, id: Uuid) -> FirmwareResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FIRMWARE_DATA_TABLE)?;
        let data = table.get(id.to_string().as_str())?.map(|value| value.value().to_vec());
        Ok(data)
    }

    async fn list(&self, filter: &FirmwareFilter) -> FirmwareResult<Vec<FirmwareInfo>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FIRMWARE_INFO_TABLE)?;

        let mut items = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let info: FirmwareInfo = serde_json::from_slice(value.value())?;
            if filter.matches(&info) {
                items.push(info);
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn delete(&self, id: Uuid) -> FirmwareResult<bool> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(FIRMWARE_INFO_TABLE)?;
            let existed = table.remove(key.as_str())?.is_some();
            let mut table = write_txn.open_table(FIRMWARE_DATA_TABLE)?;
            table.remove(key.as_str())?;
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

/// Tells whether a firmware is still assigned somewhere.
#[async_trait]
pub trait FirmwareUsage: Send + Sync {
    async fn is_referenced(&self, firmware_id: Uuid) -> bool;
}

/// Administrative operations over a [`FirmwareStore`].
pub struct FirmwareCatalog {
    store: Arc<dyn FirmwareStore>,
    usage: Arc<dyn FirmwareUsage>,
}

impl FirmwareCatalog {
    pub fn new(store: Arc<dyn FirmwareStore>, usage: Arc<dyn FirmwareUsage>) -> Self {
        Self { store, usage }
    }

    pub async fn upload(&self, firmware: NewFirmware) -> FirmwareResult<FirmwareInfo> {
        let info = self.store.save(firmware).await?;
        tracing::info!(id = %info.id, title = %info.title, version = %info.version, size = info.data_size, "Firmware stored");
        Ok(info)
    }

    pub async fn info(&self, id: Uuid) -> FirmwareResult<FirmwareInfo> {
        self.store.info(id).await?.ok_or(FirmwareError::NotFound(id))
    }

    pub async fn data(&self, id: Uuid) -> FirmwareResult<Vec<u8>> {
        self.store.data(id).await?.ok_or(FirmwareError::NotFound(id))
    }

    pub async fn list(&self, filter: &FirmwareFilter) -> FirmwareResult<Vec<FirmwareInfo>> {
        self.store.list(filter).await
    }

    pub async fn delete(&self, id: Uuid) -> FirmwareResult<()> {
        if self.usage.is_referenced(id).await {
            return Err(FirmwareError::InUse(id));
        }
        if !self.store.delete(id).await? {
            return Err(FirmwareError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_chunk_bounds() {
        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(slice_chunk(&data, 0, 2), vec![1, 2]);
        assert_eq!(slice_chunk(&data, 4, 10), vec![5]);
        assert!(slice_chunk(&data, 5, 2).is_empty());
    }

    #[test]
    fn test_checksum_verified() {
        let tenant = Uuid::new_v4();
        let mut upload = NewFirmware::new(tenant, "fw", "2.0", b"image".to_vec());
        upload.checksum = Some("00".into());
        assert!(matches!(
            upload.clone().into_record(),
            Err(FirmwareError::ChecksumMismatch { .. })
        ));

        upload.checksum = Some(ChecksumAlgorithm::Sha256.digest(b"image").to_uppercase());
        let (info, _) = upload.into_record().unwrap();
        assert_eq!(info.data_size, 5);
        assert_eq!(info.checksum.len(), 64);
    }

    #[test]
    fn test_filter() {
        let tenant = Uuid::new_v4();
        let (info, _) = NewFirmware::new(tenant, "fw", "1", vec![]).into_record().unwrap();
        assert!(FirmwareFilter::default().matches(&info));
        assert!(FirmwareFilter {
            tenant_id: Some(tenant),
            kind: Some(FirmwareKind::Firmware),
            ..Default::default()
        }
        .matches(&info));
        assert!(!FirmwareFilter {
            device_profile_id: Some(Uuid::new_v4()),
            ..Default::default()
        }
        .matches(&info));
    }
}
