//! Open-addressed hash table keyed by interned strings.
//!
//! Used for the VM's globals and the heap's string intern table. Because
//! keys are interned, key comparison is handle identity; each entry caches
//! its key's hash so probing never has to chase the heap. Probing follows
//! the perturbed sequence `index = index * 5 + 1 + perturb; perturb >>= 5`.

use crate::object::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
pub(crate) struct Entry {
    /// `None` marks both empty slots and tombstones; a tombstone has a
    /// non-null value.
    pub(crate) key: Option<ObjRef>,
    pub(crate) hash: u64,
    pub(crate) value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Null,
};

pub struct Table {
    count: usize,
    pub(crate) entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn find_index(&self, key: ObjRef, hash: u64) -> usize {
        let mask = self.entries.len() as u64 - 1;
        let mut index = hash & mask;
        let mut perturb = hash;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &self.entries[index as usize];
            match entry.key {
                None => {
                    if entry.value.is_null() {
                        return tombstone.unwrap_or(index as usize);
                    }
                    // Tombstone: remember it, keep probing.
                    if tombstone.is_none() {
                        tombstone = Some(index as usize);
                    }
                }
                Some(k) if k == key => return index as usize,
                Some(_) => {}
            }

            index = (index.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
            perturb >>= 5;
        }
    }

    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let entry = &self.entries[self.find_index(key, hash)];
        entry.key.map(|_| entry.value)
    }

    pub fn contains(&self, key: ObjRef, hash: u64) -> bool {
        self.get(key, hash).is_some()
    }

    /// Insert or overwrite. Returns true when the key was new.
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        self.reserve_for_insert();

        let index = self.find_index(key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Reusing a tombstone does not change the live count; the tombstone
        // was already counted when its original key went in.
        if is_new && entry.value.is_null() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    /// Delete by leaving a tombstone. Returns true when the key was present.
    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = self.find_index(key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }

        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Grow when the next insert would push the load factor past 3/4.
    fn reserve_for_insert(&mut self) {
        let capacity = self.entries.len();
        if (self.count + 1) * TABLE_MAX_LOAD_DEN <= capacity * TABLE_MAX_LOAD_NUM {
            return;
        }

        let new_capacity = if capacity < 8 { 8 } else { capacity * 2 };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; new_capacity]);

        // Reinsertion drops tombstones; recount live entries.
        self.count = 0;
        for entry in old {
            if entry.key.is_some() {
                let index = self.find_index_for_rehash(entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// Probe for an empty slot during rehash. All keys are distinct, so no
    /// equality checks are needed.
    fn find_index_for_rehash(&self, hash: u64) -> usize {
        let mask = self.entries.len() as u64 - 1;
        let mut index = hash & mask;
        let mut perturb = hash;

        while self.entries[index as usize].key.is_some() {
            index = (index.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
            perturb >>= 5;
        }

        index as usize
    }

    /// Live `(key, value)` pairs, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> ObjRef {
        ObjRef(i)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(key(1), 0xDEAD, Value::Number(1.0)));
        assert!(!table.set(key(1), 0xDEAD, Value::Number(2.0)));
        match table.get(key(1), 0xDEAD) {
            Some(Value::Number(n)) => assert_eq!(n, 2.0),
            other => panic!("unexpected entry: {other:?}"),
        }
        assert!(table.get(key(2), 0xBEEF).is_none());
    }

    #[test]
    fn test_delete_leaves_tombstone_probe_path() {
        let mut table = Table::new();
        // Force collisions by giving every key the same hash.
        for i in 0..6 {
            table.set(key(i), 0x42, Value::Number(i as f64));
        }
        assert!(table.delete(key(2), 0x42));
        assert!(table.get(key(2), 0x42).is_none());
        // Keys that probed through the deleted slot are still reachable.
        for i in (0..6).filter(|&i| i != 2) {
            assert!(table.get(key(i), 0x42).is_some(), "lost key {i}");
        }
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), i as u64 * 31, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert!(table.get(key(i), i as u64 * 31).is_some());
        }
    }
}
