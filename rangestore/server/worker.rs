use super::{ServerState, SharedState, WorkItem};
use crate::error::{Error, ErrorCode, Result};
use crate::index::Index;
use crate::key::long_key;
use crate::manifest::Manifest;
use crate::metrics::{SERVER_REQUESTS, WORK_QUEUE_DEPTH, WORK_TIME_HISTOGRAM};
use crate::partitioner::key_value;
use crate::protocol::{Body, GetOp, Message, Record};
use crate::stats::{SliceStats, Stat};
use crate::storage::Storage;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Owns the storage of an index and applies requests one at a time.
pub(crate) struct Worker {
    index: Arc<Index>,
    rank: u32,
    storage: Box<dyn Storage>,
    stats_store: Box<dyn Storage>,
    stats: SliceStats,
    value_append: bool,
    manifest: Option<PathBuf>,
    state: SharedState,
}

fn load_stats(stats_store: &dyn Storage) -> Result<SliceStats> {
    let mut stats = SliceStats::default();
    let mut cursor: Option<Bytes> = None;
    while let Some((key, value)) = stats_store.get_next(cursor.as_deref())? {
        if key.len() != 8 {
            return Err(Error::Storage(format!(
                "stat row key has {} bytes",
                key.len()
            )));
        }
        stats.insert(LittleEndian::read_i64(&key) as u64, Stat::decode(&value)?);
        cursor = Some(key);
    }
    Ok(stats)
}

impl Worker {
    pub(crate) fn new(
        index: Arc<Index>,
        rank: u32,
        storage: Box<dyn Storage>,
        stats_store: Box<dyn Storage>,
        value_append: bool,
        manifest: Option<PathBuf>,
        state: SharedState,
    ) -> Result<Worker> {
        let stats = load_stats(&*stats_store)?;
        debug!(
            "Loaded statistics for {} slices of index {}",
            stats.len(),
            index.id()
        );
        Ok(Worker {
            index,
            rank,
            storage,
            stats_store,
            stats,
            value_append,
            manifest,
            state,
        })
    }

    pub(crate) fn run(mut self, mut queue: mpsc::UnboundedReceiver<WorkItem>) {
        let mut closing = None;
        while let Some(item) = queue.blocking_recv() {
            WORK_QUEUE_DEPTH.dec();
            match item {
                WorkItem::Request(message, reply) => {
                    let start = Instant::now();
                    let response = self.handle(message);
                    WORK_TIME_HISTOGRAM.observe(start.elapsed().as_nanos() as f64);
                    reply.send(response);
                }
                WorkItem::Snapshot(reply) => reply.send(self.stats.rows(self.rank)),
                WorkItem::Close(reply) => {
                    if closing.is_some() {
                        reply.send_err(Error::Closed);
                        continue;
                    }
                    // refuse new work, finish what is already queued
                    self.state.set(ServerState::Draining);
                    queue.close();
                    closing = Some(reply);
                }
            }
        }

        let res = self.shutdown();
        match (closing, res) {
            (Some(reply), Ok(())) => reply.send(()),
            (Some(reply), Err(e)) => reply.send_err(e),
            (None, Err(e)) => error!("Error closing range server: {}", e),
            (None, Ok(())) => {}
        }
    }

    fn handle(&mut self, message: Message) -> Message {
        SERVER_REQUESTS
            .with_label_values(&[message.body.name()])
            .inc();
        trace!(
            "Rank {} handling {} from {} for index {}",
            self.rank,
            message.body.name(),
            message.source,
            message.index
        );

        let body = match message.body {
            Body::Put { key, value } => Body::Receipt {
                error: self.put(key, value),
            },
            Body::BulkPut { records } => {
                let mut error = ErrorCode::Success;
                for (key, value) in records {
                    let res = self.put(key, value);
                    if !res.is_success() {
                        error = res;
                    }
                }
                Body::Receipt { error }
            }
            Body::Get { op, key } => match self.lookup(op, key.as_ref()) {
                Ok(Some((key, value))) => Body::GetReceipt {
                    error: ErrorCode::Success,
                    key: Some(key),
                    value: Some(value),
                },
                Ok(None) => Body::GetReceipt {
                    error: ErrorCode::NotFound,
                    key: None,
                    value: None,
                },
                Err(e) => Body::GetReceipt {
                    error: ErrorCode::from(&e),
                    key: None,
                    value: None,
                },
            },
            Body::BulkGet {
                op,
                num_records,
                keys,
            } => {
                // First and Last carry no key and walk from the end
                if num_records > 1 || keys.is_empty() {
                    self.get_sequence(op, keys.into_iter().next(), num_records)
                } else {
                    self.bulk_get(op, keys)
                }
            }
            Body::Delete { key } => Body::Receipt {
                error: self.delete(&key),
            },
            Body::BulkDelete { keys } => {
                let mut error = ErrorCode::Success;
                for key in keys {
                    let res = self.delete(&key);
                    if !res.is_success() {
                        error = res;
                    }
                }
                Body::Receipt { error }
            }
            Body::Commit => Body::Receipt {
                error: match self.storage.commit() {
                    Ok(()) => ErrorCode::Success,
                    Err(e) => {
                        error!("Commit failed for index {}: {}", self.index.id(), e);
                        ErrorCode::DbError
                    }
                },
            },
            body => {
                warn!("Range server cannot handle {}", body.name());
                Body::Receipt {
                    error: ErrorCode::Error,
                }
            }
        };
        Message::new(self.rank, self.index.id(), body)
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> ErrorCode {
        match self.try_put(key, value) {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                error!("Put failed for index {}: {}", self.index.id(), e);
                ErrorCode::from(&e)
            }
        }
    }

    fn try_put(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        let slice = self.index.slice_of(&key)?;
        let position = key_value(&key, self.index.key_type())?;
        let existing = self.storage.get(&key)?;
        let is_new = existing.is_none();

        let value = match existing {
            Some(old) if self.value_append => {
                let mut buf = BytesMut::with_capacity(old.len() + value.len());
                buf.put_slice(&old);
                buf.put_slice(&value);
                buf.freeze()
            }
            _ => value,
        };
        self.storage.put(key, value)?;

        if is_new {
            self.stats.record(slice, position);
        }
        Ok(())
    }

    fn lookup(&self, op: GetOp, key: Option<&Bytes>) -> Result<Option<(Bytes, Bytes)>> {
        match (op, key) {
            (GetOp::Equal, Some(key)) => {
                Ok(self.storage.get(key)?.map(|value| (key.clone(), value)))
            }
            (GetOp::Equal, None) => Err(Error::Protocol("equal get without a key".to_string())),
            (GetOp::Next, key) => self.storage.get_next(key.map(|k| &k[..])),
            (GetOp::Prev, key) => self.storage.get_prev(key.map(|k| &k[..])),
            (GetOp::First, _) => self.storage.get_next(None),
            (GetOp::Last, _) => self.storage.get_prev(None),
        }
    }

    fn bulk_get(&self, op: GetOp, keys: Vec<Bytes>) -> Body {
        let mut records: Vec<Record> = Vec::with_capacity(keys.len());
        let mut failed = false;
        for key in &keys {
            match self.lookup(op, Some(key)) {
                Ok(Some((key, value))) => records.push((Some(key), Some(value))),
                Ok(None) => records.push((None, None)),
                Err(e) => {
                    error!("Get failed for index {}: {}", self.index.id(), e);
                    failed = true;
                    records.push((None, None));
                }
            }
        }
        Body::BulkGetReceipt {
            error: receipt_error(failed, &records),
            records,
        }
    }

    /// Walks `num_records` successive keys, threading each found key into the
    /// next lookup.
    fn get_sequence(&self, op: GetOp, start: Option<Bytes>, num_records: u32) -> Body {
        let step = match op {
            GetOp::Prev | GetOp::Last => GetOp::Prev,
            _ => GetOp::Next,
        };

        let mut records: Vec<Record> = Vec::new();
        let mut failed = false;
        let mut cursor = start;
        let mut op = op;
        while records.len() < num_records.max(1) as usize {
            match self.lookup(op, cursor.as_ref()) {
                Ok(Some((key, value))) => {
                    cursor = Some(key.clone());
                    records.push((Some(key), Some(value)));
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Get failed for index {}: {}", self.index.id(), e);
                    failed = true;
                    break;
                }
            }
            op = step;
        }

        Body::BulkGetReceipt {
            error: receipt_error(failed, &records),
            records,
        }
    }

    fn delete(&mut self, key: &[u8]) -> ErrorCode {
        match self.storage.delete(key) {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                error!("Delete failed for index {}: {}", self.index.id(), e);
                ErrorCode::DbError
            }
        }
    }

    fn shutdown(mut self) -> Result<()> {
        for (slice, stat) in self.stats.iter() {
            self.stats_store.put(long_key(slice as i64), stat.encode())?;
        }
        self.stats_store.commit()?;

        if let Some(ref path) = self.manifest {
            Manifest::of(&self.index).save(path)?;
            debug!("Wrote manifest {}", path.display());
        }

        self.storage.close()?;
        self.stats_store.close()?;
        self.state.set(ServerState::Closed);
        info!(
            "Closed range server for index {} on rank {}",
            self.index.id(),
            self.rank
        );
        Ok(())
    }
}

fn receipt_error(failed: bool, records: &[Record]) -> ErrorCode {
    if failed {
        ErrorCode::DbError
    } else if records.iter().all(|(key, _)| key.is_none()) {
        ErrorCode::NotFound
    } else {
        ErrorCode::Success
    }
}
