//! Firmware delivery loop.
//!
//! One cycle is: read the device's firmware version, compare it with the
//! assigned target, write the next chunk of the image to the package
//! resource, read the version again. The loop stops when the device reports
//! the target version or when the image is exhausted.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::TransportService;
use crate::diagnostics::{DeviceLogger, LogLevel};
use crate::dispatcher::{DownlinkCommand, DownlinkDispatcher, Operation, Payload};
use crate::error::Result;
use crate::firmware::store::FirmwareStore;
use crate::model::ContentFormat;
use crate::path::{LwM2mPath, FIRMWARE_OBJECT_ID};
use crate::session::ClientSession;

/// Shared attribute key that announces a firmware assignment change.
pub const FIRMWARE_VERSION_KEY: &str = "fw_version";

enum Step {
    Idle,
    Converged(String),
    Deliver { firmware_id: Uuid, offset: usize },
}

pub struct FirmwareUpdater {
    backend: Arc<dyn TransportService>,
    store: Arc<dyn FirmwareStore>,
    dispatcher: Arc<DownlinkDispatcher>,
    logger: Arc<DeviceLogger>,
    chunk_size: usize,
}

impl FirmwareUpdater {
    pub fn new(
        backend: Arc<dyn TransportService>,
        store: Arc<dyn FirmwareStore>,
        dispatcher: Arc<DownlinkDispatcher>,
        logger: Arc<DeviceLogger>,
        chunk_size: usize,
    ) -> Self {
        Self {
            backend,
            store,
            dispatcher,
            logger,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Compare the assigned firmware with the device and start a cycle when
    /// they differ. Returns whether a version read was issued.
    pub async fn check(&self, session: &Arc<ClientSession>) -> Result<bool> {
        let Some(info) = session.session_info() else {
            return Ok(false);
        };
        if !session.supports_object(FIRMWARE_OBJECT_ID) {
            debug!(endpoint = %session.endpoint(), "Device has no firmware object");
            return Ok(false);
        }
        let Some(assignment) = self.backend.get_firmware(&info).await? else {
            return Ok(false);
        };

        let start = session.update_firmware(|state| {
            if state.target_id != Some(assignment.firmware_id) {
                state.offset = 0;
            }
            state.target_id = Some(assignment.firmware_id);
            state.target_title = Some(assignment.title.clone());
            state.target_version = Some(assignment.version.clone());
            if state.is_converged() || state.pending {
                return false;
            }
            state.pending = true;
            true
        });
        if !start {
            return Ok(false);
        }

        info!(
            endpoint = %session.endpoint(),
            title = %assignment.title,
            version = %assignment.version,
            "Firmware update pending"
        );
        self.read_version(session).await?;
        Ok(true)
    }

    /// Device reported its firmware version.
    pub async fn on_version_report(&self, session: &Arc<ClientSession>, version: &str) -> Result<()> {
        let step = session.update_firmware(|state| {
            state.device_version = Some(version.to_string());
            if state.target_version.is_none() {
                return Step::Idle;
            }
            if state.is_converged() {
                let delivered = state.offset > 0;
                state.pending = false;
                state.offset = 0;
                return if delivered {
                    Step::Converged(version.to_string())
                } else {
                    Step::Idle
                };
            }
            if !state.pending {
                return Step::Idle;
            }
            state.pending = false;
            match state.target_id {
                Some(firmware_id) => Step::Deliver {
                    firmware_id,
                    offset: state.offset,
                },
                None => Step::Idle,
            }
        });

        match step {
            Step::Idle => Ok(()),
            Step::Converged(version) => {
                info!(endpoint = %session.endpoint(), version = %version, "Firmware converged");
                if let Some(info) = session.session_info() {
                    self.logger
                        .log(&info, LogLevel::Info, &format!("Firmware updated to version {}", version))
                        .await;
                }
                Ok(())
            }
            Step::Deliver { firmware_id, offset } => self.deliver(session, firmware_id, offset).await,
        }
    }

    /// A chunk write was acknowledged.
    pub async fn on_chunk_written(&self, session: &Arc<ClientSession>, len: usize) -> Result<()> {
        let offset = session.update_firmware(|state| {
            state.offset += len;
            state.pending = true;
            state.offset
        });
        debug!(endpoint = %session.endpoint(), offset, "Firmware chunk acknowledged");
        self.read_version(session).await
    }

    /// A version read or package write failed. The state is reset so the
    /// next registration update starts over.
    pub async fn on_failure(&self, session: &Arc<ClientSession>, reason: &str) {
        session.update_firmware(|state| state.reset());
        warn!(endpoint = %session.endpoint(), reason, "Firmware update failed");
        if let Some(info) = session.session_info() {
            self.logger
                .log(&info, LogLevel::Error, &format!("Firmware update failed: {}", reason))
                .await;
        }
    }

    async fn deliver(&self, session: &Arc<ClientSession>, firmware_id: Uuid, offset: usize) -> Result<()> {
        let chunk = self.store.chunk(firmware_id, offset, self.chunk_size).await?;
        if chunk.is_empty() {
            session.update_firmware(|state| state.offset = 0);
            info!(endpoint = %session.endpoint(), firmware_id = %firmware_id, "Firmware image delivered");
            return Ok(());
        }

        debug!(endpoint = %session.endpoint(), offset, size = chunk.len(), "Writing firmware chunk");
        let path = session.versioned(LwM2mPath::firmware_package());
        let command = DownlinkCommand::at(Operation::WriteReplace, path)
            .with_format(Some(ContentFormat::Opaque))
            .with_payload(Payload::Bytes(chunk));
        if let Err(e) = self.dispatcher.send(session, command).await {
            self.on_failure(session, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn read_version(&self, session: &Arc<ClientSession>) -> Result<()> {
        let path = session.versioned(LwM2mPath::firmware_version());
        if let Err(e) = self.dispatcher.send(session, DownlinkCommand::at(Operation::Read, path)).await {
            self.on_failure(session, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Whether `path` addresses the firmware version or package resource.
pub fn is_firmware_path(path: &LwM2mPath) -> bool {
    path.resource_path()
        .map(|p| p == LwM2mPath::firmware_version() || p == LwM2mPath::firmware_package())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_paths() {
        assert!(is_firmware_path(&LwM2mPath::resource(5, 0, 7)));
        assert!(is_firmware_path(&LwM2mPath::resource(5, 0, 0)));
        assert!(!is_firmware_path(&LwM2mPath::resource(5, 0, 3)));
        assert!(!is_firmware_path(&LwM2mPath::instance(5, 0)));
        assert!(!is_firmware_path(&LwM2mPath::resource(3, 0, 7)));
    }
}
