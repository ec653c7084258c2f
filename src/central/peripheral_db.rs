use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::central::peripheral::{ConnectionState, Peripheral};
use crate::hci::PeripheralId;

/// Registry of known peripherals keyed by identity.
#[derive(Default)]
pub(in crate) struct PeripheralDb {
    peripherals: HashMap<PeripheralId, Peripheral>,
}

impl PeripheralDb {
    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    /// Inserts `peripheral` replacing any previous one with the same identity.
    pub fn insert(&mut self, peripheral: Peripheral) -> Option<Peripheral> {
        self.peripherals.insert(peripheral.id().clone(), peripheral)
    }

    pub fn remove(&mut self, id: &PeripheralId) -> Option<Peripheral> {
        self.peripherals.remove(id)
    }

    /// All peripherals ordered by identity.
    pub fn all(&self) -> Vec<Peripheral> {
        let mut r: Vec<_> = self.peripherals.values().cloned().collect();
        r.sort_by(|a, b| a.id().cmp(b.id()));
        r
    }

    /// Removes peripherals that are not connected and weren't seen for longer than
    /// `older_than`. Returns the removed ones.
    pub fn expire(&mut self, older_than: Duration) -> Vec<Peripheral> {
        let now = Instant::now();
        let expired: Vec<PeripheralId> = self.peripherals.values()
            .filter(|p| match p.connection_state() {
                ConnectionState::Disconnected | ConnectionState::Error => true,
                _ => false,
            })
            .filter(|p| now.saturating_duration_since(p.last_seen()) > older_than)
            .map(|p| p.id().clone())
            .collect();
        let mut r: Vec<_> = expired.iter()
            .filter_map(|id| self.peripherals.remove(id))
            .collect();
        r.sort_by(|a, b| a.id().cmp(b.id()));
        r
    }
}
