//! Open-addressed hash table keyed by interned strings.
//!
//! Used for globals, class method tables, instance fields, and the heap's
//! string intern table. Capacity is always a power of two so probing wraps
//! with a bitmask; collisions resolve by linear probing. Because keys are
//! interned, key equality is handle identity — the one exception is
//! [`Table::find_string`], the intern lookup itself, which compares by
//! hash, length, and bytes.
//!
//! Deletion leaves a tombstone (empty key, `true` value) so probe chains
//! stay intact. Tombstones are dropped on rehash, which reinserts only the
//! live entries.

use crate::object::{Gc, ObjString};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<Gc<ObjString>>,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Nil,
};

#[derive(Debug)]
pub struct Table {
    /// Occupied entries plus tombstones; reset on rehash.
    count: usize,
    entries: Box<[Entry]>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Box::new([]),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`, returning the index of its entry, or of the slot an
    /// insert should use (the first tombstone on the chain, if any).
    fn find_entry(entries: &[Entry], key: Gc<ObjString>) -> usize {
        let mask = entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        // Truly empty: the key is absent.
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity].into_boxed_slice());
        self.count = 0;
        for entry in old.iter() {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key);
                self.entries[index] = *entry;
                self.count += 1;
            }
        }
    }

    pub fn get(&self, key: Gc<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn put(&mut self, key: Gc<ObjString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && entry.value.is_nil() {
            // A fresh slot; reusing a tombstone keeps the old count.
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Remove a key, returning whether it existed.
    pub fn delete(&mut self, key: Gc<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every entry of `other` into `self` (used by inheritance, which
    /// snapshots the superclass method table).
    pub fn add_all_from(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.put(key, value);
        }
    }

    /// Intern-table lookup by contents: the caller has raw bytes and a
    /// hash, not yet a canonical handle.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc<ObjString>> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Some(key) => {
                    if key.hash == hash && &*key.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Drop entries whose key string was not marked by the current
    /// collection. This is the weak semantics of the intern table: a string
    /// survives only if some other root reaches it.
    pub fn remove_white(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key
                && !key.header.marked
            {
                entry.key = None;
                entry.value = Value::Bool(true);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc<ObjString>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
