//! Generic organization-scoped key/value storage for read models.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use caresync_core::OrganizationId;

/// Storage contract for read-model rows, isolated per organization.
///
/// Read models are disposable: `clear_organization` plus replay rebuilds
/// them from the event history.
pub trait OrgStore<K, V>: Send + Sync
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn get(&self, organization_id: OrganizationId, key: &K) -> Option<V>;
    fn upsert(&self, organization_id: OrganizationId, key: K, value: V);
    fn remove(&self, organization_id: OrganizationId, key: &K);
    fn list(&self, organization_id: OrganizationId) -> Vec<V>;
    fn clear_organization(&self, organization_id: OrganizationId);
}

/// In-memory implementation used by tests and device-local state.
#[derive(Debug)]
pub struct InMemoryOrgStore<K, V> {
    rows: RwLock<HashMap<(OrganizationId, K), V>>,
}

impl<K, V> InMemoryOrgStore<K, V> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryOrgStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OrgStore<K, V> for InMemoryOrgStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, organization_id: OrganizationId, key: &K) -> Option<V> {
        self.rows
            .read()
            .ok()?
            .get(&(organization_id, key.clone()))
            .cloned()
    }

    fn upsert(&self, organization_id: OrganizationId, key: K, value: V) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert((organization_id, key), value);
        }
    }

    fn remove(&self, organization_id: OrganizationId, key: &K) {
        if let Ok(mut rows) = self.rows.write() {
            rows.remove(&(organization_id, key.clone()));
        }
    }

    fn list(&self, organization_id: OrganizationId) -> Vec<V> {
        self.rows
            .read()
            .map(|rows| {
                rows.iter()
                    .filter(|((org, _), _)| *org == organization_id)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear_organization(&self, organization_id: OrganizationId) {
        if let Ok(mut rows) = self.rows.write() {
            rows.retain(|(org, _), _| *org != organization_id);
        }
    }
}
