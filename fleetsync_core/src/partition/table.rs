use std::collections::{BTreeMap, BTreeSet, HashMap};

/// In-memory view of the communication-group table for one cycle.
///
/// Maps partition id to device count. Entries are never removed; counts may go
/// negative when a release outruns the stored count. Only entries touched since
/// load are reported by [`PartitionTable::dirty_entries`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    counts: BTreeMap<u32, i64>,
    dirty: BTreeSet<u32>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from the stored hash (decimal-string fields and values).
    ///
    /// Fields that are not non-negative integers are skipped. Unparsable counts load as zero.
    pub fn from_stored(stored: HashMap<String, String>) -> Self {
        let mut counts = BTreeMap::new();
        for (field, value) in stored {
            let Ok(id) = field.trim().parse::<u32>() else {
                tracing::warn!(field = %field, "skipping non-numeric partition id");
                continue;
            };
            let count = value.trim().parse::<i64>().unwrap_or_else(|_| {
                tracing::warn!(partition = id, value = %value, "unparsable partition count, using 0");
                0
            });
            counts.insert(id, count);
        }
        Self {
            counts,
            dirty: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, id: u32) -> Option<i64> {
        self.counts.get(&id).copied()
    }

    /// Assign one slot and return the partition id.
    ///
    /// Existing partitions are scanned in ascending id order and the first with
    /// `count < capacity` is incremented. When all are full, the smallest id in
    /// `0..len` with no entry is created with count 1, else id `len`.
    pub fn allocate(&mut self, capacity: u32) -> i32 {
        let cap = i64::from(capacity);
        let open = self
            .counts
            .iter()
            .find(|(_, count)| **count < cap)
            .map(|(id, _)| *id);

        let id = match open {
            Some(id) => {
                if let Some(count) = self.counts.get_mut(&id) {
                    *count += 1;
                }
                id
            }
            None => {
                let len = self.counts.len() as u32;
                let id = (0..len)
                    .find(|candidate| !self.counts.contains_key(candidate))
                    .unwrap_or(len);
                self.counts.insert(id, 1);
                id
            }
        };
        self.dirty.insert(id);
        id as i32
    }

    /// Return one slot to `id`. Negative ids are ignored; the entry is never removed.
    pub fn release(&mut self, id: i32) {
        let Ok(id) = u32::try_from(id) else {
            return;
        };
        *self.counts.entry(id).or_insert(0) -= 1;
        self.dirty.insert(id);
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Changed entries as (field, value) pairs ready for a hash write.
    pub fn dirty_entries(&self) -> Vec<(String, String)> {
        self.dirty
            .iter()
            .filter_map(|id| self.counts.get(id).map(|c| (id.to_string(), c.to_string())))
            .collect()
    }

    /// Forget pending changes once they have been persisted.
    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }
}
