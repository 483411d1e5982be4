//! Firmware storage and over-the-air delivery.

pub mod store;
pub mod updater;

pub use store::{
    ChecksumAlgorithm, FirmwareCatalog, FirmwareError, FirmwareFilter, FirmwareInfo, FirmwareKind,
    FirmwareResult, FirmwareStore, FirmwareUsage, MemoryFirmwareStore, NewFirmware, RedbFirmwareStore,
};
pub use updater::{is_firmware_path, FirmwareUpdater, FIRMWARE_VERSION_KEY};
