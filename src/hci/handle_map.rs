use std::collections::HashMap;

use crate::hci::PeripheralId;

/// Bidirectional index between controller connection handles and peripheral identities.
///
/// Both directions are always updated together so the mapping stays one-to-one.
#[derive(Debug, Default)]
pub struct HandleMap {
    by_handle: HashMap<u16, PeripheralId>,
    by_id: HashMap<PeripheralId, u16>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self, handle: u16) -> Option<&PeripheralId> {
        self.by_handle.get(&handle)
    }

    pub fn handle(&self, id: &PeripheralId) -> Option<u16> {
        self.by_id.get(id).copied()
    }

    /// Maps `handle` to `id`, dropping any previous mapping of either side.
    pub fn insert(&mut self, handle: u16, id: PeripheralId) {
        if let Some(old_id) = self.by_handle.remove(&handle) {
            self.by_id.remove(&old_id);
        }
        if let Some(old_handle) = self.by_id.remove(&id) {
            self.by_handle.remove(&old_handle);
        }
        self.by_handle.insert(handle, id.clone());
        self.by_id.insert(id, handle);
    }

    /// Removes both directions of the mapping for `handle`.
    pub fn remove_handle(&mut self, handle: u16) -> Option<PeripheralId> {
        let id = self.by_handle.remove(&handle)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn remove_id(&mut self, id: &PeripheralId) -> Option<u16> {
        let handle = self.by_id.remove(id)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item=u16> + '_ {
        self.by_handle.keys().copied()
    }
}
