//! In-memory view of host attributes and maintenance modes.
//!
//! Readers get an `Arc` snapshot and never block on writers. Writers are
//! serialized, persist first, and only then swap the in-memory entry, so a
//! snapshot never shows a mode that is not durable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use keel_core::{AttributeMap, HostAttributes, HostId, MaintenanceMode};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::Mutation;

pub struct AttributeStore {
    store: StateStore,
    hosts: RwLock<HashMap<HostId, Arc<HostAttributes>>>,
    writer: Mutex<()>,
}

impl AttributeStore {
    /// Build the view from whatever hosts the store already knows.
    pub fn load(store: StateStore) -> StateResult<Self> {
        let hosts = store
            .list_hosts()?
            .into_iter()
            .map(|attrs| (attrs.host.clone(), Arc::new(attrs)))
            .collect::<HashMap<_, _>>();
        debug!(count = hosts.len(), "host attributes loaded");
        Ok(Self {
            store,
            hosts: RwLock::new(hosts),
            writer: Mutex::new(()),
        })
    }

    /// Snapshot of one host. Unknown hosts read as no attributes, mode `NONE`.
    pub fn snapshot(&self, host: &str) -> Arc<HostAttributes> {
        self.hosts
            .read()
            .get(host)
            .cloned()
            .unwrap_or_else(|| Arc::new(HostAttributes::new(host)))
    }

    pub fn mode(&self, host: &str) -> MaintenanceMode {
        self.hosts
            .read()
            .get(host)
            .map(|attrs| attrs.mode)
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<HostAttributes>> {
        let mut hosts: Vec<_> = self.hosts.read().values().cloned().collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }

    /// Record the labels carried by an offer, keeping the host's maintenance mode.
    ///
    /// No write happens when the labels are unchanged.
    pub fn save_offer_attributes(&self, host: &str, attributes: &AttributeMap) -> StateResult<()> {
        let _guard = self.writer.lock();
        let current = self.snapshot(host);
        if self.hosts.read().contains_key(host) && current.attributes == *attributes {
            return Ok(());
        }
        let next = HostAttributes {
            host: host.to_string(),
            attributes: attributes.clone(),
            mode: current.mode,
        };
        self.store.commit(Mutation::SaveHost(next.clone()))?;
        self.hosts.write().insert(next.host.clone(), Arc::new(next));
        Ok(())
    }

    /// Persist a new maintenance mode and publish it to readers.
    ///
    /// Returns the previous mode. Validation of the move is the caller's job.
    pub fn set_mode(&self, host: &str, mode: MaintenanceMode) -> StateResult<MaintenanceMode> {
        let _guard = self.writer.lock();
        let current = self.snapshot(host);
        let previous = current.mode;
        let next = HostAttributes {
            mode,
            ..(*current).clone()
        };
        self.store.commit(Mutation::SaveHost(next.clone()))?;
        self.hosts.write().insert(next.host.clone(), Arc::new(next));
        debug!(%host, from = %previous, to = %mode, "host mode stored");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
        let mut map = AttributeMap::new();
        for (k, v) in pairs {
            map.entry(k.to_string()).or_default().insert(v.to_string());
        }
        map
    }

    #[test]
    fn unknown_host_reads_as_none() {
        let store = AttributeStore::load(StateStore::open_in_memory().unwrap()).unwrap();
        let snap = store.snapshot("ghost");
        assert_eq!(snap.mode, MaintenanceMode::None);
        assert!(snap.attributes.is_empty());
    }

    #[test]
    fn offer_attributes_keep_mode() {
        let store = AttributeStore::load(StateStore::open_in_memory().unwrap()).unwrap();
        store.set_mode("host-a", MaintenanceMode::Scheduled).unwrap();
        store
            .save_offer_attributes("host-a", &attrs(&[("rack", "r1")]))
            .unwrap();

        let snap = store.snapshot("host-a");
        assert_eq!(snap.mode, MaintenanceMode::Scheduled);
        assert!(snap.values("rack").contains("r1"));
    }

    #[test]
    fn old_snapshot_is_stable_after_write() {
        let store = AttributeStore::load(StateStore::open_in_memory().unwrap()).unwrap();
        let before = store.snapshot("host-a");
        let previous = store.set_mode("host-a", MaintenanceMode::Scheduled).unwrap();

        assert_eq!(previous, MaintenanceMode::None);
        assert_eq!(before.mode, MaintenanceMode::None);
        assert_eq!(store.mode("host-a"), MaintenanceMode::Scheduled);
    }

    #[test]
    fn modes_survive_reload() {
        let state = StateStore::open_in_memory().unwrap();
        {
            let store = AttributeStore::load(state.clone()).unwrap();
            store.set_mode("host-b", MaintenanceMode::Scheduled).unwrap();
            store.set_mode("host-b", MaintenanceMode::Draining).unwrap();
        }
        let reloaded = AttributeStore::load(state).unwrap();
        assert_eq!(reloaded.mode("host-b"), MaintenanceMode::Draining);
        assert_eq!(reloaded.all().len(), 1);
    }
}
