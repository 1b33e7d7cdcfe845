//! Map objects.
//!
//! The script-visible map is an open-addressed, linear-probing hash table.
//! Empty slots hold the undefined sentinel paired with false; tombstones
//! hold the sentinel paired with true, so probes continue past deleted
//! keys. Hashing and key equality need heap access and therefore live on
//! [`crate::heap::Heap`]; this module owns the storage and slot encoding.

use quill_core::constants::{MAP_LOAD_PERCENT, MAP_MIN_CAPACITY, TABLE_GROW_FACTOR};

use crate::error::{VmError, VmResult};
use crate::heap::Handle;
use crate::value::Value;

/// One slot of the map's entry array.
#[derive(Clone, Copy)]
pub struct MapEntry {
    /// The key, or undefined for empty slots and tombstones.
    pub key: Value,
    /// The value; for sentinel slots, false means empty and true means a
    /// tombstone.
    pub value: Value,
}

impl MapEntry {
    /// An empty slot.
    pub fn empty() -> Self {
        Self {
            key: Value::Undefined,
            value: Value::False,
        }
    }

    /// A tombstone left by a removal.
    pub fn tombstone() -> Self {
        Self {
            key: Value::Undefined,
            value: Value::True,
        }
    }

    /// True for a slot holding no key (empty or tombstone).
    pub fn is_vacant(&self) -> bool {
        self.key.is_undefined()
    }

    /// True for a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.key.is_undefined() && matches!(self.value, Value::True)
    }
}

/// The script-visible hash map.
#[derive(Default)]
pub struct MapObj {
    /// The slot array; the capacity is its length.
    pub entries: Vec<MapEntry>,
    /// Number of live keys.
    pub count: usize,
}

impl MapObj {
    /// Creates an empty map with no storage.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    /// Slot capacity.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates over the live entries.
    pub fn iter(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.iter().filter(|entry| !entry.is_vacant())
    }

    /// Releases all storage.
    pub fn clear(&mut self) {
        self.entries = Vec::new();
        self.count = 0;
    }

    /// Approximate heap footprint of the slot array, in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<MapEntry>()
    }
}

/// Result of probing for a key.
enum Probe {
    /// The key is live at this slot.
    Found(usize),
    /// The key is absent; this is the slot an insert should use.
    Vacant(usize),
}

impl crate::heap::Heap {
    /// Reads the value for `key`, or `None` if absent.
    pub fn map_get(&self, map: Handle, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        let entries = &self.map(map).entries;
        Ok(match self.map_probe(entries, key, hash) {
            Some(Probe::Found(index)) => Some(entries[index].value),
            _ => None,
        })
    }

    /// Returns true if `key` is present.
    pub fn map_contains(&self, map: Handle, key: Value) -> VmResult<bool> {
        Ok(self.map_get(map, key)?.is_some())
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn map_set(&mut self, map: Handle, key: Value, value: Value) -> VmResult<()> {
        let hash = self.hash_value(key)?;

        // Keep the load factor at bay before inserting.
        let (count, capacity) = {
            let m = self.map(map);
            (m.count, m.capacity())
        };
        if count + 1 > capacity * MAP_LOAD_PERCENT / 100 {
            let mut new_capacity = capacity * TABLE_GROW_FACTOR;
            if new_capacity < MAP_MIN_CAPACITY {
                new_capacity = MAP_MIN_CAPACITY;
            }
            self.map_resize(map, new_capacity)?;
        }

        let entries = &self.map(map).entries;
        match self.map_probe(entries, key, hash) {
            Some(Probe::Found(index)) => {
                self.map_mut(map).entries[index].value = value;
            }
            Some(Probe::Vacant(index)) => {
                let m = self.map_mut(map);
                m.entries[index] = MapEntry { key, value };
                m.count += 1;
            }
            None => {
                return Err(VmError::fatal("map probe failed after resize"));
            }
        }
        Ok(())
    }

    /// Removes `key`, returning its value if it was present. The slot
    /// becomes a tombstone so later probes keep walking past it.
    pub fn map_remove(&mut self, map: Handle, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        let entries = &self.map(map).entries;
        let index = match self.map_probe(entries, key, hash) {
            Some(Probe::Found(index)) => index,
            _ => return Ok(None),
        };

        let removed = {
            let m = self.map_mut(map);
            let removed = m.entries[index].value;
            m.entries[index] = MapEntry::tombstone();
            m.count -= 1;
            removed
        };

        let (count, capacity) = {
            let m = self.map(map);
            (m.count, m.capacity())
        };
        if count == 0 {
            self.map_mut(map).clear();
        } else if capacity > MAP_MIN_CAPACITY
            && count < capacity / TABLE_GROW_FACTOR * MAP_LOAD_PERCENT / 100
        {
            let mut new_capacity = capacity / TABLE_GROW_FACTOR;
            if new_capacity < MAP_MIN_CAPACITY {
                new_capacity = MAP_MIN_CAPACITY;
            }
            self.map_resize(map, new_capacity)?;
        }

        Ok(Some(removed))
    }

    /// Linear probe from the key's home slot. Returns the live slot for
    /// the key, or the slot an insert should use (the first tombstone
    /// passed, else the empty slot that ended the probe).
    fn map_probe(&self, entries: &[MapEntry], key: Value, hash: u32) -> Option<Probe> {
        if entries.is_empty() {
            return None;
        }

        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        let mut first_tombstone = None;

        for _ in 0..capacity {
            let entry = &entries[index];
            if entry.is_vacant() {
                if entry.is_tombstone() {
                    // Keep probing; the key may live past the tombstone.
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                } else {
                    return Some(Probe::Vacant(first_tombstone.unwrap_or(index)));
                }
            } else if self.values_equal(entry.key, key) {
                return Some(Probe::Found(index));
            }
            index = (index + 1) % capacity;
        }

        // Every slot is live or a tombstone; fall back to the first
        // tombstone if one was seen.
        first_tombstone.map(Probe::Vacant)
    }

    fn map_resize(&mut self, map: Handle, capacity: usize) -> VmResult<()> {
        let old = std::mem::take(&mut self.map_mut(map).entries);
        let mut entries = vec![MapEntry::empty(); capacity];

        for entry in old.into_iter().filter(|entry| !entry.is_vacant()) {
            let hash = self.hash_value(entry.key)?;
            match self.map_probe(&entries, entry.key, hash) {
                Some(Probe::Vacant(index)) => entries[index] = entry,
                Some(Probe::Found(_)) | None => {
                    return Err(VmError::fatal("map rehash found duplicate key"));
                }
            }
        }

        self.add_bytes(capacity * std::mem::size_of::<MapEntry>());
        self.map_mut(map).entries = entries;
        Ok(())
    }
}
