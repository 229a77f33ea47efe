use super::{MemoryStore, Storage};
use crate::error::{Error, Result};
use crate::key::KeyType;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use commitlog::message::MessageSet;
use commitlog::{CommitLog, LogOptions, Offset, ReadError, ReadLimit};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PUT_RECORD: u8 = 1;
const DELETE_RECORD: u8 = 2;

const SEGMENT_MAX_BYTES: usize = 64 * 1024 * 1024;
const INDEX_MAX_ITEMS: usize = 100_000;

/// In-memory table whose mutations are appended to a commit log.
///
/// Every mutation is one log message:
///
/// Record = Op:u8 KeyLen:u32 Key [Value]
///     Op = 1 (put, the value runs to the end of the message) | 2 (delete)
pub struct FlatLogStore {
    dir: PathBuf,
    table: MemoryStore,
    log: CommitLog,
}

enum Record {
    Put(Bytes, Bytes),
    Delete(Bytes),
}

impl Record {
    fn encode(op: u8, key: &[u8], value: Option<&[u8]>) -> Bytes {
        let value_len = value.map(|v| v.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(5 + key.len() + value_len);
        buf.put_u8(op);
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        if let Some(value) = value {
            buf.put_slice(value);
        }
        buf.freeze()
    }

    fn decode(offset: Offset, payload: &[u8]) -> Result<Record> {
        let corrupt = || Error::Storage(format!("corrupt log record at offset {}", offset));
        if payload.len() < 5 {
            return Err(corrupt());
        }
        let key_len = LittleEndian::read_u32(&payload[1..5]) as usize;
        let rest = &payload[5..];
        if rest.len() < key_len {
            return Err(corrupt());
        }
        let key = Bytes::copy_from_slice(&rest[..key_len]);
        match payload[0] {
            PUT_RECORD => Ok(Record::Put(
                key,
                Bytes::copy_from_slice(&rest[key_len..]),
            )),
            DELETE_RECORD if rest.len() == key_len => Ok(Record::Delete(key)),
            _ => Err(corrupt()),
        }
    }
}

fn read_error(e: ReadError) -> Error {
    Error::Storage(format!("log read failed: {:?}", e))
}

impl FlatLogStore {
    /// Opens the log directory `dir`, replaying it into memory unless
    /// `create_new` discards it. A record may hold up to `message_max_bytes`.
    pub fn open(
        dir: &Path,
        create_new: bool,
        key_type: KeyType,
        message_max_bytes: usize,
    ) -> Result<FlatLogStore> {
        if create_new {
            match fs::remove_dir_all(dir) {
                Ok(()) => debug!("Discarded log {}", dir.display()),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let log = {
            let mut opts = LogOptions::new(dir);
            opts.message_max_bytes(message_max_bytes);
            opts.index_max_items(INDEX_MAX_ITEMS);
            opts.segment_max_bytes(SEGMENT_MAX_BYTES);
            CommitLog::new(opts)?
        };

        let mut table = MemoryStore::new(key_type);
        FlatLogStore::replay(&log, &mut table, message_max_bytes)?;
        debug!(
            "Opened {} with {} records, next offset {}",
            dir.display(),
            table.len(),
            log.next_offset()
        );

        Ok(FlatLogStore {
            dir: dir.to_path_buf(),
            table,
            log,
        })
    }

    fn replay(log: &CommitLog, table: &mut MemoryStore, message_max_bytes: usize) -> Result<()> {
        let limit = message_max_bytes.saturating_mul(4).max(64 * 1024);
        let mut offset = 0;
        while offset < log.next_offset() {
            let messages = log
                .read(offset, ReadLimit::max_bytes(limit))
                .map_err(read_error)?;
            let mut last = None;
            for msg in messages.iter() {
                match Record::decode(msg.offset(), msg.payload())? {
                    Record::Put(key, value) => table.put(key, value)?,
                    Record::Delete(key) => {
                        table.remove(&key);
                    }
                }
                last = Some(msg.offset());
            }
            match last {
                Some(last) => offset = last + 1,
                None => break,
            }
        }
        Ok(())
    }

    fn append(&mut self, op: u8, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.log
            .append_msg(Record::encode(op, key, value))
            .map_err(|e| Error::Storage(format!("log append failed: {:?}", e)))?;
        Ok(())
    }
}

impl Storage for FlatLogStore {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.append(PUT_RECORD, &key, Some(&value))?;
        self.table.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.table.get(key)
    }

    fn get_next(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>> {
        self.table.get_next(key)
    }

    fn get_prev(&self, key: Option<&[u8]>) -> Result<Option<(Bytes, Bytes)>> {
        self.table.get_prev(key)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.table.remove(key) {
            self.append(DELETE_RECORD, key, None)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.log.flush()?;
        trace!("Committed {}", self.dir.display());
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::int_key;
    use tempfile::tempdir;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn reopen_replays_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");

        let mut store = FlatLogStore::open(&path, true, KeyType::Int, MAX).unwrap();
        store.put(int_key(1), Bytes::from_static(b"one")).unwrap();
        store.put(int_key(2), Bytes::from_static(b"two")).unwrap();
        store.put(int_key(1), Bytes::from_static(b"uno")).unwrap();
        store.delete(&int_key(2)).unwrap();
        // deleting a missing key writes nothing
        store.delete(&int_key(3)).unwrap();
        assert_eq!(4, store.log.next_offset());
        Box::new(store).close().unwrap();

        let store = FlatLogStore::open(&path, false, KeyType::Int, MAX).unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"uno")),
            store.get(&int_key(1)).unwrap()
        );
        assert_eq!(None, store.get(&int_key(2)).unwrap());
    }

    #[test]
    fn create_new_discards_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("db.log");

        let mut store = FlatLogStore::open(&path, true, KeyType::Int, MAX).unwrap();
        store.put(int_key(1), Bytes::from_static(b"one")).unwrap();
        Box::new(store).close().unwrap();

        let store = FlatLogStore::open(&path, true, KeyType::Int, MAX).unwrap();
        assert_eq!(None, store.get(&int_key(1)).unwrap());
        assert_eq!(0, store.log.next_offset());
    }

    #[test]
    fn replay_spans_read_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let value = Bytes::from(vec![b'v'; 1000]);

        let mut store = FlatLogStore::open(&path, true, KeyType::Int, 2048).unwrap();
        for i in 0..200 {
            store.put(int_key(i), value.clone()).unwrap();
        }
        Box::new(store).close().unwrap();

        let store = FlatLogStore::open(&path, false, KeyType::Int, 2048).unwrap();
        assert_eq!(200, store.table.len());
        assert_eq!(
            Some((int_key(199), value)),
            store.get_prev(None).unwrap()
        );
    }

    #[test]
    fn record_layout() {
        let put = Record::encode(PUT_RECORD, b"key", Some(b"value"));
        assert_eq!(&[1, 3, 0, 0, 0], &put[..5]);
        match Record::decode(0, &put).unwrap() {
            Record::Put(k, v) => {
                assert_eq!(&b"key"[..], &k[..]);
                assert_eq!(&b"value"[..], &v[..]);
            }
            Record::Delete(_) => panic!("expected a put"),
        }

        let delete = Record::encode(DELETE_RECORD, b"key", None);
        assert!(matches!(Record::decode(1, &delete), Ok(Record::Delete(_))));
        assert!(Record::decode(2, &delete[..6]).is_err());
        assert!(Record::decode(3, &[9, 0, 0, 0, 0]).is_err());
    }
}
