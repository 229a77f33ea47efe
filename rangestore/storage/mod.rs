//! Ordered key/value engines used by range servers.
//!
//! Every engine is opened as a pair: the main store holding records and a
//! stats store holding one row per slice.
use crate::error::Result;
use crate::key::KeyType;
use bytes::Bytes;
use std::path::{Path, PathBuf};

mod flatlog;
mod memory;

pub use self::flatlog::FlatLogStore;
pub use self::memory::MemoryStore;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// Records live in memory and are lost on close.
    Memory,
    /// In-memory table backed by a commit log replayed on open.
    FlatLog,
}

impl StoreType {
    pub fn is_persistent(self) -> bool {
        self == StoreType::FlatLog
    }
}

/// Ordered key/value store. Ordering follows the key type of the store.
pub trait Storage: Send {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<()>;

    fn bulk_put(&mut self, records: Vec<(Bytes, Bytes)>) -> Result<()> {
        for (key, value) in records {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// First record strictly after `key`, or the first record of the store.
    fn get_next(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>>;

    /// Last record strictly before `key`, or the last record of the store.
    fn get_prev(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>>;

    /// Removes `key`. Removing a missing key succeeds.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Flushes buffered writes.
    fn commit(&mut self) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens the main and stats stores rooted at `base`. Persistent engines
/// accept records of up to `message_max_bytes`.
pub fn open(
    store_type: StoreType,
    base: &Path,
    create_new: bool,
    key_type: KeyType,
    message_max_bytes: usize,
) -> Result<(Box<dyn Storage>, Box<dyn Storage>)> {
    match store_type {
        StoreType::Memory => Ok((
            Box::new(MemoryStore::new(key_type)),
            Box::new(MemoryStore::new(KeyType::LongInt)),
        )),
        StoreType::FlatLog => {
            let main = FlatLogStore::open(
                &with_suffix(base, ".log"),
                create_new,
                key_type,
                message_max_bytes,
            )?;
            let stats = FlatLogStore::open(
                &with_suffix(base, ".stats.log"),
                create_new,
                KeyType::LongInt,
                message_max_bytes,
            )?;
            Ok((Box::new(main), Box::new(stats)))
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}
