//! Hub-side device registry and per-device sync cursors.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use caresync_core::{OrganizationId, Visibility};

/// One registered device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub organization_id: OrganizationId,
    pub revoked: bool,
    /// Audience mask applied to downloads; empty means everything the
    /// organization filter already allows.
    pub audience: Visibility,
}

/// Registry consulted at handshake.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: impl Into<String>, organization_id: OrganizationId) {
        let device_id = device_id.into();
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(
                device_id.clone(),
                DeviceRecord {
                    device_id,
                    organization_id,
                    revoked: false,
                    audience: Visibility::default(),
                },
            );
        }
    }

    pub fn register_with_audience(
        &self,
        device_id: impl Into<String>,
        organization_id: OrganizationId,
        audience: Visibility,
    ) {
        let device_id = device_id.into();
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(
                device_id.clone(),
                DeviceRecord {
                    device_id,
                    organization_id,
                    revoked: false,
                    audience,
                },
            );
        }
    }

    pub fn revoke(&self, device_id: &str) {
        if let Ok(mut devices) = self.devices.write() {
            if let Some(record) = devices.get_mut(device_id) {
                record.revoked = true;
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().ok()?.get(device_id).cloned()
    }
}

/// Hub-side cursors for one device; mirrored on the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub last_uploaded_lsn: u64,
    pub last_downloaded_position: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}
