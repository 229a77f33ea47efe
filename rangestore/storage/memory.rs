use super::Storage;
use crate::error::Result;
use crate::key::KeyType;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Key ordered by the comparator of its key type.
#[derive(Clone, Debug)]
struct OrderedKey {
    key_type: KeyType,
    key: Bytes,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &OrderedKey) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &OrderedKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &OrderedKey) -> Ordering {
        self.key_type.compare(&self.key, &other.key)
    }
}

pub struct MemoryStore {
    key_type: KeyType,
    table: BTreeMap<OrderedKey, Bytes>,
}

impl MemoryStore {
    pub fn new(key_type: KeyType) -> MemoryStore {
        MemoryStore {
            key_type,
            table: BTreeMap::new(),
        }
    }

    fn ordered(&self, key: &[u8]) -> OrderedKey {
        OrderedKey {
            key_type: self.key_type,
            key: Bytes::copy_from_slice(key),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Removes `key`, returning whether it was present.
    pub(super) fn remove(&mut self, key: &[u8]) -> bool {
        let key = self.ordered(key);
        self.table.remove(&key).is_some()
    }
}

impl Storage for MemoryStore {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.table.insert(
            OrderedKey {
                key_type: self.key_type,
                key,
            },
            value,
        );
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.table.get(&self.ordered(key)).cloned())
    }

    fn get_next(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>> {
        let entry = match key {
            Some(key) => self.table.range((Excluded(self.ordered(key)), Unbounded)).next(),
            None => self.table.iter().next(),
        };
        Ok(entry.map(|(k, v)| (k.key.clone(), v.clone())))
    }

    fn get_prev(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>> {
        let entry = match key {
            Some(key) => self
                .table
                .range((Unbounded, Excluded(self.ordered(key))))
                .next_back(),
            None => self.table.iter().next_back(),
        };
        Ok(entry.map(|(k, v)| (k.key.clone(), v.clone())))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
