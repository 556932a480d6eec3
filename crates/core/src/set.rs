//! Finite sets.
//!
//! Open-addressed containers of distinct values. Capacity is always a power
//! of two (initially 8), load is kept under 3/4, and probing uses the same
//! perturbed sequence as the string table. Sets never delete individual
//! elements, so there are no tombstones; set algebra materialises fresh
//! sets.

use crate::hash::{FNV_INIT_HASH, avalanche, fnv_mix};
use crate::heap::Heap;
use crate::object::{ObjRef, Payload};
use crate::value::Value;

const SET_INITIAL_CAPACITY: usize = 8;
const SET_MAX_LOAD_NUM: usize = 3;
const SET_MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
pub struct SetEntry {
    /// Null marks an empty slot; sets therefore cannot contain null.
    pub key: Value,
    pub hash: u64,
}

const EMPTY: SetEntry = SetEntry {
    key: Value::Null,
    hash: 0,
};

pub struct SetObj {
    entries: Box<[SetEntry]>,
    count: usize,
}

impl SetObj {
    pub fn new() -> SetObj {
        SetObj {
            entries: vec![EMPTY; SET_INITIAL_CAPACITY].into_boxed_slice(),
            count: 0,
        }
    }

    /// Placeholder used while a set is temporarily detached from the heap.
    pub(crate) fn detached() -> SetObj {
        SetObj {
            entries: Box::new([]),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<SetEntry>()
    }

    /// Occupied entries as `(value, cached hash)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Value, u64)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_null())
            .map(|e| (e.key, e.hash))
    }

    /// Slot index of the first occupied entry at or after `from`.
    pub fn first_occupied_from(&self, from: usize) -> Option<usize> {
        (from..self.entries.len()).find(|&i| !self.entries[i].key.is_null())
    }

    pub fn entry_at(&self, slot: usize) -> Value {
        self.entries[slot].key
    }

    fn find_slot(&self, value: Value, hash: u64, eq: &mut dyn FnMut(Value, Value) -> bool) -> usize {
        let mask = self.entries.len() as u64 - 1;
        let mut index = hash & mask;
        let mut perturb = hash;

        loop {
            let entry = &self.entries[index as usize];
            if entry.key.is_null() {
                return index as usize;
            }
            if entry.hash == hash && eq(entry.key, value) {
                return index as usize;
            }

            index = (index.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
            perturb >>= 5;
        }
    }

    /// Insert with a precomputed hash. Returns `(newly added, bytes delta)`.
    pub fn insert_hashed(
        &mut self,
        value: Value,
        hash: u64,
        eq: &mut dyn FnMut(Value, Value) -> bool,
    ) -> (bool, usize) {
        if value.is_null() {
            return (false, 0);
        }

        let mut grown = 0;
        if (self.count + 1) * SET_MAX_LOAD_DEN > self.entries.len() * SET_MAX_LOAD_NUM {
            grown = self.grow();
        }

        let slot = self.find_slot(value, hash, eq);
        if !self.entries[slot].key.is_null() {
            return (false, grown);
        }

        self.entries[slot] = SetEntry { key: value, hash };
        self.count += 1;
        (true, grown)
    }

    pub fn contains_hashed(
        &self,
        value: Value,
        hash: u64,
        eq: &mut dyn FnMut(Value, Value) -> bool,
    ) -> bool {
        if self.count == 0 || value.is_null() {
            return false;
        }
        !self.entries[self.find_slot(value, hash, eq)].key.is_null()
    }

    /// Double the capacity, reinserting by cached hash. Returns the byte
    /// growth for allocation accounting.
    fn grow(&mut self) -> usize {
        let new_capacity = self.entries.len() * 2;
        let old = std::mem::replace(
            &mut self.entries,
            vec![EMPTY; new_capacity].into_boxed_slice(),
        );

        let mask = new_capacity as u64 - 1;
        for entry in old.iter().filter(|e| !e.key.is_null()) {
            let mut index = entry.hash & mask;
            let mut perturb = entry.hash;
            while !self.entries[index as usize].key.is_null() {
                index = (index.wrapping_mul(5).wrapping_add(1).wrapping_add(perturb)) & mask;
                perturb >>= 5;
            }
            self.entries[index as usize] = *entry;
        }

        (new_capacity - old.len()) * std::mem::size_of::<SetEntry>()
    }
}

impl Default for SetObj {
    fn default() -> Self {
        Self::new()
    }
}

// Set operations that need the heap for structural equality and hashing.
impl Heap {
    pub fn set_new(&mut self) -> ObjRef {
        self.alloc(Payload::Set(SetObj::new()))
    }

    fn take_set(&mut self, set: ObjRef) -> SetObj {
        match std::mem::replace(
            &mut self.get_mut(set).payload,
            Payload::Set(SetObj::detached()),
        ) {
            Payload::Set(data) => data,
            _ => unreachable!("set operation on non-set object"),
        }
    }

    fn put_set(&mut self, set: ObjRef, data: SetObj) {
        self.get_mut(set).payload = Payload::Set(data);
    }

    /// Insert `value` into `set`. Returns true when the element was new.
    pub fn set_insert(&mut self, set: ObjRef, value: Value) -> bool {
        let hash = self.hash_value(value);
        let mut data = self.take_set(set);
        let (added, grown) = data.insert_hashed(value, hash, &mut |a, b| self.values_equal(a, b));
        self.put_set(set, data);
        self.add_bytes(grown);
        added
    }

    pub fn set_contains(&self, set: ObjRef, value: Value) -> bool {
        let hash = self.hash_value(value);
        self.as_set(set)
            .contains_hashed(value, hash, &mut |a, b| self.values_equal(a, b))
    }

    /// Size + containment equality.
    pub fn sets_equal(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        let (sa, sb) = (self.as_set(a), self.as_set(b));
        if sa.len() != sb.len() {
            return false;
        }
        sa.iter()
            .all(|(v, h)| sb.contains_hashed(v, h, &mut |x, y| self.values_equal(x, y)))
    }

    /// Every element of `a` is in `b`.
    pub fn set_is_subset(&self, a: ObjRef, b: ObjRef) -> bool {
        let (sa, sb) = (self.as_set(a), self.as_set(b));
        sa.iter()
            .all(|(v, h)| sb.contains_hashed(v, h, &mut |x, y| self.values_equal(x, y)))
    }

    pub fn set_is_proper_subset(&self, a: ObjRef, b: ObjRef) -> bool {
        self.as_set(a).len() < self.as_set(b).len() && self.set_is_subset(a, b)
    }

    /// `a ∪ b` as a fresh set.
    pub fn set_union(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let result = self.set_new();
        self.insert_all(result, a);
        self.insert_all(result, b);
        result
    }

    /// `a ∩ b` as a fresh set.
    pub fn set_intersect(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let result = self.set_new();
        let entries: Vec<(Value, u64)> = self.as_set(a).iter().collect();
        for (value, hash) in entries {
            let keep = self
                .as_set(b)
                .contains_hashed(value, hash, &mut |x, y| self.values_equal(x, y));
            if keep {
                self.insert_prehashed(result, value, hash);
            }
        }
        result
    }

    /// `a \ b` as a fresh set.
    pub fn set_difference(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let result = self.set_new();
        let entries: Vec<(Value, u64)> = self.as_set(a).iter().collect();
        for (value, hash) in entries {
            let keep = !self
                .as_set(b)
                .contains_hashed(value, hash, &mut |x, y| self.values_equal(x, y));
            if keep {
                self.insert_prehashed(result, value, hash);
            }
        }
        result
    }

    /// An arbitrary element, or null for the empty set. The pick is seeded
    /// per process so programs cannot lean on a stable order.
    pub fn set_arb(&mut self, set: ObjRef) -> Value {
        let (is_empty, capacity) = {
            let data = self.as_set(set);
            (data.is_empty(), data.capacity())
        };
        if is_empty {
            return Value::Null;
        }

        let start = (self.arb_next() % capacity as u64) as usize;
        let data = self.as_set(set);
        let slot = data
            .first_occupied_from(start)
            .or_else(|| data.first_occupied_from(0));
        slot.map_or(Value::Null, |s| data.entry_at(s))
    }

    /// Order-independent structural hash: each element hash is FNV-1a mixed
    /// on its own, then combined with a commutative sum.
    pub(crate) fn hash_set(&self, set: ObjRef) -> u64 {
        let mut acc = 0u64;
        for (_, element_hash) in self.as_set(set).iter() {
            acc = acc.wrapping_add(fnv_mix(FNV_INIT_HASH, element_hash));
        }
        avalanche(acc)
    }

    fn insert_all(&mut self, target: ObjRef, source: ObjRef) {
        let entries: Vec<(Value, u64)> = self.as_set(source).iter().collect();
        for (value, hash) in entries {
            self.insert_prehashed(target, value, hash);
        }
    }

    fn insert_prehashed(&mut self, set: ObjRef, value: Value, hash: u64) {
        let mut data = self.take_set(set);
        let (_, grown) = data.insert_hashed(value, hash, &mut |a, b| self.values_equal(a, b));
        self.put_set(set, data);
        self.add_bytes(grown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedups_and_counts() {
        let mut heap = Heap::new(false);
        let set = heap.set_new();
        assert!(heap.set_insert(set, Value::Number(1.0)));
        assert!(heap.set_insert(set, Value::Number(2.0)));
        assert!(!heap.set_insert(set, Value::Number(1.0)));
        assert_eq!(heap.as_set(set).len(), 2);
        assert!(heap.set_contains(set, Value::Number(2.0)));
        assert!(!heap.set_contains(set, Value::Number(3.0)));
    }

    #[test]
    fn test_null_is_not_an_element() {
        let mut heap = Heap::new(false);
        let set = heap.set_new();
        assert!(!heap.set_insert(set, Value::Null));
        assert!(heap.as_set(set).is_empty());
    }

    #[test]
    fn test_capacity_stays_power_of_two() {
        let mut heap = Heap::new(false);
        let set = heap.set_new();
        for i in 0..100 {
            heap.set_insert(set, Value::Number(i as f64));
        }
        let data = heap.as_set(set);
        assert_eq!(data.len(), 100);
        assert!(data.capacity().is_power_of_two());
        assert!(data.len() * 4 <= data.capacity() * 3);
    }

    #[test]
    fn test_union_intersect_difference_laws() {
        let mut heap = Heap::new(false);
        let a = heap.set_new();
        let b = heap.set_new();
        for i in 0..4 {
            heap.set_insert(a, Value::Number(i as f64));
        }
        for i in 2..6 {
            heap.set_insert(b, Value::Number(i as f64));
        }

        let union = heap.set_union(a, b);
        let inter = heap.set_intersect(a, b);
        let diff = heap.set_difference(a, b);

        assert_eq!(heap.as_set(union).len(), 6);
        assert_eq!(heap.as_set(inter).len(), 2);
        assert_eq!(heap.as_set(diff).len(), 2);

        // |A ∪ B| = |A| + |B| - |A ∩ B|
        assert_eq!(
            heap.as_set(union).len(),
            heap.as_set(a).len() + heap.as_set(b).len() - heap.as_set(inter).len()
        );

        // A ∪ A = A, A ∩ A = A, A \ A = {}
        let self_union = heap.set_union(a, a);
        let self_inter = heap.set_intersect(a, a);
        let self_diff = heap.set_difference(a, a);
        assert!(heap.sets_equal(self_union, a));
        assert!(heap.sets_equal(self_inter, a));
        assert!(heap.as_set(self_diff).is_empty());

        // A ⊆ A ∪ B, and a proper subset when B brings new elements.
        assert!(heap.set_is_subset(a, union));
        assert!(heap.set_is_proper_subset(a, union));
        assert!(!heap.set_is_proper_subset(a, a));
    }

    #[test]
    fn test_nested_set_hash_is_insertion_order_independent() {
        let mut heap = Heap::new(false);
        let a = heap.set_new();
        let b = heap.set_new();
        for i in [1.0, 2.0, 3.0] {
            heap.set_insert(a, Value::Number(i));
        }
        for i in [3.0, 1.0, 2.0] {
            heap.set_insert(b, Value::Number(i));
        }
        assert!(heap.sets_equal(a, b));
        assert_eq!(heap.hash_set(a), heap.hash_set(b));
    }

    #[test]
    fn test_arb_returns_member() {
        let mut heap = Heap::new(false);
        let set = heap.set_new();
        for i in 0..10 {
            heap.set_insert(set, Value::Number(i as f64));
        }
        let picked = heap.set_arb(set);
        assert!(heap.set_contains(set, picked));

        let empty = heap.set_new();
        assert!(heap.set_arb(empty).is_null());
    }
}
