//! Open-addressed hash table keyed by interned string [`Handle`]s.
//!
//! Used for the globals table, every class's method table, and every
//! instance's field table. Capacity starts at 8 and doubles whenever the
//! load factor (occupied-or-tombstone slots over capacity) would exceed
//! 0.75. Deleting a key leaves a tombstone behind so later probes that
//! walked past it still find keys inserted afterward; tombstones count
//! toward the load factor but are dropped (not copied) whenever the table
//! is rehashed into a larger backing array.
//!
//! Every key is an interned string `Handle`; callers supply that string's
//! precomputed FNV-1a hash on every call rather than the table recomputing
//! or storing a reverse lookup from handle to hash.

use crate::object::Handle;
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Debug)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: Handle, hash: u32, value: Value },
}

#[derive(Debug)]
pub struct Table {
    entries: Vec<Slot>,
    /// Occupied slots plus tombstones -- what the load factor is computed
    /// against, per the spec.
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Slot::Occupied { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_slot(key, hash);
        match &self.entries[index] {
            Slot::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` iff the key was not
    /// already present.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            let new_capacity = grow_capacity(self.capacity());
            self.adjust_capacity(new_capacity);
        }

        let index = self.find_slot(key, hash);
        let is_new_key = !matches!(self.entries[index], Slot::Occupied { .. });
        // A fresh insertion into a tombstone slot doesn't grow `count`
        // again -- the tombstone was already counted toward the load
        // factor.
        if is_new_key && matches!(self.entries[index], Slot::Empty) {
            self.count += 1;
        }
        self.entries[index] = Slot::Occupied { key, hash, value };
        is_new_key
    }

    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_slot(key, hash);
        if matches!(self.entries[index], Slot::Occupied { .. }) {
            self.entries[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Looks up an interned string by its raw bytes and hash, without
    /// already holding a `Handle` for it. `bytes_eq` compares the
    /// candidate handle's backing bytes against the bytes being searched
    /// for; it is only invoked on hash matches.
    pub fn find_string(&self, hash: u32, mut bytes_eq: impl FnMut(Handle) -> bool) -> Option<Handle> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: h, .. } if *h == hash && bytes_eq(*key) => {
                    return Some(*key);
                }
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Copies every live entry of `from` into `self`, overwriting existing
    /// keys. Used to seed a subclass's method table from its superclass.
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Slot::Occupied { key, hash, value } = entry {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Turns every occupied entry for which `keep` returns `false` into a
    /// tombstone. Used by the collector to drop interned strings that
    /// didn't survive a mark phase without disturbing probe chains for
    /// the strings that did.
    pub fn retain(&mut self, mut keep: impl FnMut(Handle, Value) -> bool) {
        for entry in &mut self.entries {
            if let Slot::Occupied { key, value, .. } = entry {
                if !keep(*key, *value) {
                    *entry = Slot::Tombstone;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Slot::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    fn find_slot(&self, key: Handle, hash: u32) -> usize {
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Slot::Occupied { key, hash, value } = entry {
                let mut index = (hash as usize) % new_capacity;
                loop {
                    if matches!(new_entries[index], Slot::Empty) {
                        new_entries[index] = Slot::Occupied { key, hash, value };
                        break;
                    }
                    index = (index + 1) % new_capacity;
                }
                new_count += 1;
            }
            // Tombstones are dropped, not copied.
        }
        self.entries = new_entries;
        self.count = new_count;
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: u32) -> Handle {
        Handle::new(i, 0)
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut t = Table::new();
        assert!(t.set(h(1), 111, Value::number(42.0)));
        assert_eq!(t.get(h(1), 111), Some(Value::number(42.0)));
    }

    #[test]
    fn set_existing_key_overwrites_and_reports_not_new() {
        let mut t = Table::new();
        assert!(t.set(h(1), 111, Value::number(1.0)));
        assert!(!t.set(h(1), 111, Value::number(2.0)));
        assert_eq!(t.get(h(1), 111), Some(Value::number(2.0)));
    }

    #[test]
    fn delete_then_get_returns_none_but_preserves_probe_chain() {
        let mut t = Table::new();
        // Force two keys to collide by sharing a hash.
        t.set(h(1), 5, Value::number(1.0));
        t.set(h(2), 5, Value::number(2.0));
        assert!(t.delete(h(1), 5));
        assert_eq!(t.get(h(1), 5), None);
        assert_eq!(t.get(h(2), 5), Some(Value::number(2.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..20u32 {
            t.set(h(i), i.wrapping_mul(2_654_435_761), Value::number(f64::from(i)));
        }
        assert!(t.capacity() >= 20);
        for i in 0..20u32 {
            assert_eq!(
                t.get(h(i), i.wrapping_mul(2_654_435_761)),
                Some(Value::number(f64::from(i)))
            );
        }
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut from = Table::new();
        from.set(h(1), 1, Value::number(1.0));
        from.set(h(2), 2, Value::number(2.0));
        from.delete(h(2), 2);

        let mut to = Table::new();
        to.add_all(&from);
        assert_eq!(to.get(h(1), 1), Some(Value::number(1.0)));
        assert_eq!(to.get(h(2), 2), None);
    }
}
