//! Table objects.
//!
//! The table is the separate-chaining variant backing the host-object
//! registry. Entries live in a slab indexed by bucket chains, so host
//! handles stay stable across resizes. It resizes up when the count
//! exceeds the bucket capacity and down when the count falls below half
//! the capacity minus one.

use quill_core::constants::{TABLE_GROW_FACTOR, TABLE_MIN_CAPACITY};

use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::value::Value;

/// One entry in a bucket chain.
pub struct TableEntry {
    /// The key.
    pub key: Value,
    /// The value.
    pub value: Value,
    /// Slab index of the next entry in this bucket's chain.
    pub next: Option<u32>,
}

/// A separate-chaining hash table.
pub struct TableObj {
    /// Bucket heads, indexing into the slab.
    pub buckets: Vec<Option<u32>>,
    /// Entry slab; vacated slots are recycled through `free`.
    pub entries: Vec<Option<TableEntry>>,
    /// Recyclable slab slots.
    pub free: Vec<u32>,
    /// Number of live entries.
    pub count: usize,
}

impl Default for TableObj {
    fn default() -> Self {
        Self::new()
    }
}

impl TableObj {
    /// Creates a table with the minimum bucket capacity.
    pub fn new() -> Self {
        Self {
            buckets: vec![None; TABLE_MIN_CAPACITY],
            entries: Vec::new(),
            free: Vec::new(),
            count: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Whether an insert or removal should trigger a resize, and to what
    /// capacity.
    pub fn resize_target(&self) -> Option<usize> {
        if self.count > self.buckets.len() {
            Some(self.buckets.len() * TABLE_GROW_FACTOR)
        } else if self.buckets.len() > TABLE_MIN_CAPACITY
            && self.count + 1 < self.buckets.len() / 2
        {
            Some(self.buckets.len() / TABLE_GROW_FACTOR)
        } else {
            None
        }
    }

    /// Claims a slab slot for a new entry, recycling a vacated one when
    /// possible.
    pub fn claim_slot(&mut self, entry: TableEntry) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.entries[slot as usize] = Some(entry);
            slot
        } else {
            self.entries.push(Some(entry));
            (self.entries.len() - 1) as u32
        }
    }

    /// Iterates over the live entries.
    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// Approximate heap footprint of buckets and slab, in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.buckets.len() * std::mem::size_of::<Option<u32>>()
            + self.entries.len() * std::mem::size_of::<Option<TableEntry>>()
    }
}

impl crate::heap::Heap {
    /// Reads the value for `key`, or `None` if absent.
    pub fn table_get(&self, table: Handle, key: Value) -> VmResult<Option<Value>> {
        Ok(self
            .table_find_slot(table, key)?
            .map(|slot| self.table(table).entries[slot as usize]
                .as_ref()
                .map(|entry| entry.value)
                .unwrap_or(Value::Null)))
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn table_set(&mut self, table: Handle, key: Value, value: Value) -> VmResult<()> {
        if let Some(slot) = self.table_find_slot(table, key)? {
            if let Some(entry) = self.table_mut(table).entries[slot as usize].as_mut() {
                entry.value = value;
            }
            return Ok(());
        }

        if let Some(capacity) = self.table(table).resize_target() {
            self.table_resize(table, capacity)?;
        }

        let hash = self.hash_value(key)? as usize;
        let t = self.table_mut(table);
        let bucket = hash % t.capacity();
        let head = t.buckets[bucket];
        let slot = t.claim_slot(TableEntry {
            key,
            value,
            next: head,
        });
        t.buckets[bucket] = Some(slot);
        t.count += 1;
        Ok(())
    }

    /// Removes `key`, returning its value if it was present. The vacated
    /// slab slot is recycled for later inserts.
    pub fn table_remove(&mut self, table: Handle, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)? as usize;

        // Find the entry and its predecessor in the chain.
        let (slot, prev) = {
            let t = self.table(table);
            let bucket = hash % t.capacity();
            let mut prev: Option<u32> = None;
            let mut walk = t.buckets[bucket];
            loop {
                let Some(slot) = walk else {
                    return Ok(None);
                };
                let entry = t.entries[slot as usize]
                    .as_ref()
                    .ok_or_else(|| VmError::fatal("table chain references vacant slot"))?;
                if self.values_equal(entry.key, key) {
                    break (slot, prev);
                }
                prev = Some(slot);
                walk = entry.next;
            }
        };

        let t = self.table_mut(table);
        let entry = t.entries[slot as usize]
            .take()
            .ok_or_else(|| VmError::fatal("table slot vanished during removal"))?;
        match prev {
            Some(prev) => {
                if let Some(prev_entry) = t.entries[prev as usize].as_mut() {
                    prev_entry.next = entry.next;
                }
            }
            None => {
                let bucket = hash % t.capacity();
                t.buckets[bucket] = entry.next;
            }
        }
        t.free.push(slot);
        t.count -= 1;

        if let Some(capacity) = self.table(table).resize_target() {
            self.table_resize(table, capacity)?;
        }
        Ok(Some(entry.value))
    }

    fn table_find_slot(&self, table: Handle, key: Value) -> VmResult<Option<u32>> {
        let hash = self.hash_value(key)? as usize;
        let t = self.table(table);
        let mut walk = t.buckets[hash % t.capacity()];
        while let Some(slot) = walk {
            let entry = t.entries[slot as usize]
                .as_ref()
                .ok_or_else(|| VmError::fatal("table chain references vacant slot"))?;
            if self.values_equal(entry.key, key) {
                return Ok(Some(slot));
            }
            walk = entry.next;
        }
        Ok(None)
    }

    /// Rebuilds the bucket chains at a new capacity. Slab slots are
    /// untouched, so outstanding references by slot stay valid.
    fn table_resize(&mut self, table: Handle, capacity: usize) -> VmResult<()> {
        let mut rehash: Vec<(u32, usize)> = Vec::with_capacity(self.table(table).count);
        for (slot, entry) in self.table(table).entries.iter().enumerate() {
            if let Some(entry) = entry {
                rehash.push((slot as u32, self.hash_value(entry.key)? as usize));
            }
        }

        self.add_bytes(capacity * std::mem::size_of::<Option<u32>>());
        let t = self.table_mut(table);
        t.buckets = vec![None; capacity];
        for (slot, hash) in rehash {
            let bucket = hash % capacity;
            if let Some(entry) = t.entries[slot as usize].as_mut() {
                entry.next = t.buckets[bucket];
                t.buckets[bucket] = Some(slot);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_targets() {
        let mut table = TableObj::new();
        assert_eq!(table.resize_target(), None);

        table.count = TABLE_MIN_CAPACITY + 1;
        assert_eq!(
            table.resize_target(),
            Some(TABLE_MIN_CAPACITY * TABLE_GROW_FACTOR)
        );

        table.buckets = vec![None; 64];
        table.count = 10;
        assert_eq!(table.resize_target(), Some(32));

        table.count = 40;
        assert_eq!(table.resize_target(), None);
    }

    #[test]
    fn test_claim_slot_recycles() {
        let mut table = TableObj::new();
        let entry = |n: f64| TableEntry {
            key: Value::Num(n),
            value: Value::Null,
            next: None,
        };

        let a = table.claim_slot(entry(1.0));
        let b = table.claim_slot(entry(2.0));
        assert_ne!(a, b);

        table.entries[a as usize] = None;
        table.free.push(a);

        let c = table.claim_slot(entry(3.0));
        assert_eq!(c, a);
    }
}
