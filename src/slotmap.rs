use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::routing::SLOT_COUNT;

/// Index of a server endpoint in the multiplexer's arena. Slots, bridges and
/// shard records refer to endpoints by id; only the arena owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) u32);

impl EndpointId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Immutable 16384-entry ownership table. Unowned slots are tolerated; the
/// client then routes to any connected server.
#[derive(Debug, Clone)]
pub(crate) struct SlotTable {
    entries: Vec<Option<EndpointId>>,
}

impl SlotTable {
    pub(crate) fn empty() -> SlotTable {
        SlotTable {
            entries: vec![None; SLOT_COUNT as usize],
        }
    }

    /// Builds a table out of `(start, end, owner)` ranges, both bounds
    /// inclusive, as parsed from a CLUSTER SLOTS reply.
    pub(crate) fn from_ranges(ranges: &[(u16, u16, EndpointId)]) -> SlotTable {
        let mut table = SlotTable::empty();
        for &(start, end, owner) in ranges {
            let end = end.min(SLOT_COUNT - 1);
            for slot in start..=end {
                table.entries[slot as usize] = Some(owner);
            }
        }
        table
    }

    pub(crate) fn lookup(&self, slot: u16) -> Option<EndpointId> {
        self.entries.get(slot as usize).copied().flatten()
    }

    /// Copy-on-write single-slot reassignment, used when accepting a MOVED.
    pub(crate) fn assigned(&self, slot: u16, owner: EndpointId) -> SlotTable {
        let mut entries = self.entries.clone();
        if let Some(entry) = entries.get_mut(slot as usize) {
            *entry = Some(owner);
        }
        SlotTable { entries }
    }

    pub(crate) fn owned_slot_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

/// Shared slot map: reads are lock-free through an atomic pointer; writers
/// replace the whole table (topology refresh) or a single entry (MOVED).
#[derive(Debug)]
pub(crate) struct SlotMap {
    table: ArcSwap<SlotTable>,
}

impl SlotMap {
    pub(crate) fn new() -> SlotMap {
        SlotMap {
            table: ArcSwap::from_pointee(SlotTable::empty()),
        }
    }

    pub(crate) fn lookup(&self, slot: u16) -> Option<EndpointId> {
        self.table.load().lookup(slot)
    }

    pub(crate) fn set_slot_owner(&self, slot: u16, owner: EndpointId) {
        self.table.rcu(|table| table.assigned(slot, owner));
    }

    pub(crate) fn replace(&self, table: SlotTable) {
        self.table.store(Arc::new(table));
    }

    pub(crate) fn snapshot(&self) -> Arc<SlotTable> {
        self.table.load_full()
    }
}
