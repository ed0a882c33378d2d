use crate::interconn::SourceKind;
use crate::mem_event::MemEvent;
use crate::address;
use std::collections::HashMap;

/// Bookkeeping for one in-flight fill.
///
/// `block` is the storage index reserved for the incoming data; `deferred`
/// holds every request that is waiting on it, in arrival order, for
/// re-dispatch once the fill completes.
#[derive(Debug, Default)]
pub struct LoadEntry {
    pub block: usize,
    pub deferred: Vec<(MemEvent, SourceKind)>,
}

/// In-flight fills, keyed by block address.
///
/// At most one entry per block address; concurrent misses on the same
/// address coalesce into the entry's deferred list.
#[derive(Debug, Default)]
pub struct LoadTable {
    entries: HashMap<address, LoadEntry>,
}

impl LoadTable {
    #[must_use]
    pub fn get_mut(&mut self, block_addr: address) -> Option<&mut LoadEntry> {
        self.entries.get_mut(&block_addr)
    }

    #[must_use]
    pub fn contains(&self, block_addr: address) -> bool {
        self.entries.contains_key(&block_addr)
    }

    pub fn insert(&mut self, block_addr: address, entry: LoadEntry) {
        let prev = self.entries.insert(block_addr, entry);
        debug_assert!(prev.is_none(), "duplicate fill for 0x{block_addr:x}");
    }

    pub fn remove(&mut self, block_addr: address) -> Option<LoadEntry> {
        self.entries.remove(&block_addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&address, &LoadEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bookkeeping for one supply this cache is preparing for a peer.
#[derive(Debug, Default)]
pub struct SupplyEntry {
    /// Id of the event queued on the snoop bus, once the delayed supply has
    /// reached the bus queue.
    pub bus_event: Option<u64>,
    /// A peer beat us to it; the delayed supply must complete as a no-op.
    pub canceled: bool,
}

/// In-flight supplies, keyed by (block address, requesting channel).
#[derive(Debug, Default)]
pub struct SupplyTable {
    entries: HashMap<(address, SourceKind), SupplyEntry>,
}

impl SupplyTable {
    #[must_use]
    pub fn get(&self, block_addr: address, src: SourceKind) -> Option<&SupplyEntry> {
        self.entries.get(&(block_addr, src))
    }

    #[must_use]
    pub fn get_mut(&mut self, block_addr: address, src: SourceKind) -> Option<&mut SupplyEntry> {
        self.entries.get_mut(&(block_addr, src))
    }

    /// Begin tracking a supply, replacing any canceled leftover for the same
    /// key.
    pub fn insert(&mut self, block_addr: address, src: SourceKind) {
        self.entries.insert((block_addr, src), SupplyEntry::default());
    }

    pub fn remove(&mut self, block_addr: address, src: SourceKind) -> Option<SupplyEntry> {
        self.entries.remove(&(block_addr, src))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{LoadEntry, LoadTable, SupplyTable};
    use crate::interconn::SourceKind;
    use crate::mem_event::{Command, MemEvent};

    #[test]
    fn loads_coalesce_per_address() {
        let mut loads = LoadTable::default();
        let ev = MemEvent::new("cpu0", 0x40, Command::ReadReq);
        loads.insert(
            0x40,
            LoadEntry {
                block: 3,
                deferred: vec![(ev, SourceKind::UPSTREAM)],
            },
        );
        assert!(loads.contains(0x40));
        let again = MemEvent::new("cpu0", 0x44, Command::WriteReq);
        loads
            .get_mut(0x40)
            .unwrap()
            .deferred
            .push((again, SourceKind::UPSTREAM));
        assert_eq!(loads.len(), 1);
        let entry = loads.remove(0x40).unwrap();
        assert_eq!(entry.deferred.len(), 2);
        assert!(loads.is_empty());
    }

    #[test]
    fn supply_keys_include_channel() {
        let mut supplies = SupplyTable::default();
        supplies.insert(0x40, SourceKind::SNOOP);
        supplies.insert(0x40, SourceKind::DOWNSTREAM);
        assert_eq!(supplies.len(), 2);
        supplies.get_mut(0x40, SourceKind::SNOOP).unwrap().canceled = true;
        assert!(!supplies.get(0x40, SourceKind::DOWNSTREAM).unwrap().canceled);
        supplies.remove(0x40, SourceKind::SNOOP);
        assert_eq!(supplies.len(), 1);
    }
}
