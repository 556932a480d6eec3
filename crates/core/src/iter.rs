//! The iterator protocol over sets, tuples, and strings.
//!
//! An iterator is `{target, index}`. On construction the index points at the
//! first valid element (first occupied slot for sets, 0 for non-empty tuples
//! and strings, -1 when empty). Advancing reads the current value, moves the
//! index to the next valid position, and reports whether the pre-advance
//! read was valid.

use crate::heap::Heap;
use crate::object::{IterObj, ObjKind, ObjRef, Payload};
use crate::value::Value;

impl Heap {
    /// Build an iterator over `target`, which must be iterable.
    pub fn iterator_new(&mut self, target: ObjRef) -> ObjRef {
        let index = match self.kind(target) {
            ObjKind::Set => self
                .as_set(target)
                .first_occupied_from(0)
                .map_or(-1, |slot| slot as i64),
            ObjKind::Tuple => {
                if self.as_tuple(target).is_empty() {
                    -1
                } else {
                    0
                }
            }
            ObjKind::String => {
                if self.as_str(target).is_empty() {
                    -1
                } else {
                    0
                }
            }
            kind => unreachable!("iterator over non-iterable {kind:?}"),
        };

        self.alloc(Payload::Iter(IterObj { target, index }))
    }

    /// Read the current element and advance. `None` means exhausted.
    ///
    /// String iteration yields one-code-point strings, which allocate.
    pub fn iterate(&mut self, iterator: ObjRef) -> Option<Value> {
        let (target, index) = {
            let it = self.as_iter(iterator);
            (it.target, it.index)
        };
        if index < 0 {
            return None;
        }
        let index = index as usize;

        match self.kind(target) {
            ObjKind::Set => {
                let data = self.as_set(target);
                if index >= data.capacity() {
                    return None;
                }
                let value = data.entry_at(index);
                if value.is_null() {
                    return None;
                }
                let next = data
                    .first_occupied_from(index + 1)
                    .map_or(data.capacity() as i64, |slot| slot as i64);
                self.as_iter_mut(iterator).index = next;
                Some(value)
            }
            ObjKind::Tuple => {
                let data = self.as_tuple(target);
                if index >= data.len() {
                    return None;
                }
                let value = data.elements[index];
                self.as_iter_mut(iterator).index = index as i64 + 1;
                Some(value)
            }
            ObjKind::String => {
                if index >= self.as_str(target).len() {
                    return None;
                }
                let value = self.index_string(target, index);
                self.as_iter_mut(iterator).index = index as i64 + 1;
                Some(value)
            }
            kind => unreachable!("iterator over non-iterable {kind:?}"),
        }
    }
}
