//! Per-device identity, sequence, and clock-drift state.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use caresync_core::{ConnectionStatus, OrganizationId};

/// Process-wide device state, created once at startup and injected
/// everywhere the handler stamps envelopes.
///
/// Owns the two counters the protocol depends on: the local sequence number
/// (strictly monotonic from 1, never reused, even across failed appends) and
/// the clock-drift estimate learned from the last sync handshake.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: String,
    organization_id: OrganizationId,
    next_lsn: AtomicU64,
    drift_ms: AtomicI64,
    connection: Mutex<ConnectionStatus>,
}

impl DeviceSession {
    pub fn new(device_id: impl Into<String>, organization_id: OrganizationId) -> Self {
        Self {
            device_id: device_id.into(),
            organization_id,
            next_lsn: AtomicU64::new(1),
            drift_ms: AtomicI64::new(0),
            connection: Mutex::new(ConnectionStatus::Offline),
        }
    }

    /// Resume from persisted state: the next LSN to hand out.
    pub fn resume(
        device_id: impl Into<String>,
        organization_id: OrganizationId,
        next_lsn: u64,
        drift_ms: i64,
    ) -> Self {
        let session = Self::new(device_id, organization_id);
        session.next_lsn.store(next_lsn.max(1), Ordering::SeqCst);
        session.drift_ms.store(drift_ms, Ordering::SeqCst);
        session
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    /// Hand out the next local sequence number. Never reused.
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest LSN handed out so far.
    pub fn last_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn drift_ms(&self) -> i64 {
        self.drift_ms.load(Ordering::SeqCst)
    }

    /// Persist the drift estimate computed by the hub at handshake.
    pub fn set_drift_ms(&self, drift_ms: i64) {
        self.drift_ms.store(drift_ms, Ordering::SeqCst);
    }

    pub fn connection(&self) -> ConnectionStatus {
        *self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connection(&self, status: ConnectionStatus) {
        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsns_start_at_one_and_never_repeat() {
        let session = DeviceSession::new("tablet-01", OrganizationId::new());
        assert_eq!(session.last_lsn(), 0);
        assert_eq!(session.next_lsn(), 1);
        assert_eq!(session.next_lsn(), 2);
        assert_eq!(session.last_lsn(), 2);
    }

    #[test]
    fn resume_continues_the_sequence() {
        let session = DeviceSession::resume("tablet-01", OrganizationId::new(), 17, -250);
        assert_eq!(session.next_lsn(), 17);
        assert_eq!(session.drift_ms(), -250);
    }
}
