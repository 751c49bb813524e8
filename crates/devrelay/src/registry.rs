use crate::connection::{ConnId, Connection};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devrelay_common::DeviceId;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

/// A connected controller and the devices it wants telemetry from.
#[derive(Debug)]
pub struct ControllerEntry {
    conn: Arc<Connection>,
    subscriptions: HashSet<DeviceId>,
}

impl ControllerEntry {
    /// The controller's connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Current subscription set. Empty means every device.
    #[must_use]
    pub fn subscriptions(&self) -> &HashSet<DeviceId> {
        &self.subscriptions
    }

    /// Whether telemetry from `device_id` should reach this controller.
    #[must_use]
    pub fn wants(&self, device_id: &str) -> bool {
        self.subscriptions.is_empty() || self.subscriptions.contains(device_id)
    }
}

/// Concurrent bookkeeping of authenticated connections.
///
/// Devices are keyed by identity, at most one connection each. Controllers are
/// keyed by connection id and carry their subscription set. Every operation is
/// a single step under the owning shard's lock.
#[derive(Debug, Default)]
pub struct Registry {
    devices: DashMap<DeviceId, Arc<Connection>>,
    controllers: DashMap<ConnId, ControllerEntry>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `device_id` to `conn`. A different connection already bound to the
    /// same identity is terminated and replaced.
    pub fn register_device(&self, device_id: &str, conn: Arc<Connection>) {
        match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().id() != conn.id() {
                    let stale = entry.insert(conn);
                    stale.terminate();
                    tracing::debug!(device_id, stale_conn = stale.id(), "replaced device connection");
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(conn);
            }
        }
    }

    /// Add a controller with an empty (wildcard) subscription set.
    pub fn register_controller(&self, conn: Arc<Connection>) {
        self.controllers.insert(
            conn.id(),
            ControllerEntry {
                conn,
                subscriptions: HashSet::new(),
            },
        );
    }

    /// Unbind `device_id`, but only if it still belongs to `conn`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_device(&self, device_id: &str, conn: &Connection) -> bool {
        self.devices
            .remove_if(device_id, |_, current| current.id() == conn.id())
            .is_some()
    }

    /// Drop a controller. No-op if it is not registered.
    pub fn remove_controller(&self, conn: &Connection) -> bool {
        self.controllers.remove(&conn.id()).is_some()
    }

    /// Connection currently bound to `device_id`.
    #[must_use]
    pub fn lookup_device(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.devices.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Iterate over the controllers registered right now.
    ///
    /// Each call starts a fresh pass over live membership.
    pub fn all_controllers(&self) -> impl Iterator<Item = impl Deref<Target = ControllerEntry> + '_> + '_ {
        self.controllers.iter()
    }

    /// Add `device_id` to the controller's subscription set.
    ///
    /// Returns `false` if `conn` is not a registered controller.
    pub fn subscribe(&self, conn: &Connection, device_id: &str) -> bool {
        match self.controllers.get_mut(&conn.id()) {
            Some(mut entry) => {
                entry.subscriptions.insert(device_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove `device_id` from the controller's subscription set if present.
    ///
    /// Returns `false` if `conn` is not a registered controller.
    pub fn unsubscribe(&self, conn: &Connection, device_id: &str) -> bool {
        match self.controllers.get_mut(&conn.id()) {
            Some(mut entry) => {
                entry.subscriptions.remove(device_id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of a controller's subscription set.
    #[must_use]
    pub fn subscriptions(&self, conn: &Connection) -> Option<HashSet<DeviceId>> {
        self.controllers
            .get(&conn.id())
            .map(|entry| entry.subscriptions.clone())
    }

    /// Number of bound device identities.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of registered controllers.
    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }
}
