//! Client side of the store: resolves the range servers of every key, sends
//! one message per destination and merges the answers.
//!
//! Exact operations are routed by the partitioner. Directional lookups and
//! every lookup on a secondary local index are routed by the statistics of
//! the last flush. Requests to this rank are handed to the local range
//! server without serialization.
//!
//! Results of bulk operations list the local destination first, followed by
//! the remote ones in ascending server number.
use crate::error::{Error, ErrorCode, Result};
use crate::index::{Index, IndexKind};
use crate::metrics::{BULK_DESTINATIONS_HISTOGRAM, BULK_RECORDS_HISTOGRAM, ROUTING_ERRORS};
use crate::protocol::{Body, GetOp, Message, Record};
use crate::store::Node;
use bytes::Bytes;
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Status reported by one range server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub rank: u32,
    pub error: ErrorCode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetResult {
    pub rank: u32,
    pub error: ErrorCode,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl GetResult {
    fn not_found(rank: u32) -> GetResult {
        GetResult {
            rank,
            error: ErrorCode::NotFound,
            key: None,
            value: None,
        }
    }
}

/// Records returned by one range server.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkGetResult {
    pub rank: u32,
    pub error: ErrorCode,
    pub records: Vec<Record>,
}

impl BulkGetResult {
    fn not_found(rank: u32, records: usize) -> BulkGetResult {
        BulkGetResult {
            rank,
            error: ErrorCode::NotFound,
            records: vec![(None, None); records],
        }
    }

    /// Records that were found.
    pub fn found(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.records.iter().filter_map(|record| match record {
            (Some(key), Some(value)) => Some((key, value)),
            _ => None,
        })
    }
}

/// Secondary keys written along with a primary record.
#[derive(Clone, Debug)]
pub struct SecondaryKeys {
    pub index: Arc<Index>,
    pub keys: Vec<Bytes>,
}

/// Work grouped by destination rank.
struct Batches<T> {
    rank: u32,
    groups: BTreeMap<(bool, u32), (u32, Vec<T>)>,
}

impl<T> Batches<T> {
    fn new(rank: u32) -> Batches<T> {
        Batches {
            rank,
            groups: BTreeMap::new(),
        }
    }

    fn push(&mut self, index: &Index, dest: u32, item: T) {
        let server = index.topology().server_number(dest);
        self.groups
            .entry((dest != self.rank, server))
            .or_insert_with(|| (dest, Vec::new()))
            .1
            .push(item);
    }

    fn into_messages(
        self,
        source: u32,
        index: u32,
        body: impl Fn(Vec<T>) -> Body,
    ) -> Vec<(u32, Message)> {
        self.groups
            .into_iter()
            .map(|(_, (dest, items))| (dest, Message::new(source, index, body(items))))
            .collect()
    }
}

fn routing_failed(e: Error) -> Error {
    ROUTING_ERRORS.inc();
    e
}

fn receipt(rank: u32, res: Result<Message>) -> Receipt {
    let error = match res {
        Ok(Message {
            body: Body::Receipt { error },
            ..
        }) => error,
        Ok(message) => {
            warn!("Unexpected {} from rank {}", message.body.name(), rank);
            ErrorCode::Error
        }
        Err(e) => {
            error!("Request to rank {} failed: {}", rank, e);
            ErrorCode::from(&e)
        }
    };
    Receipt { rank, error }
}

fn get_result(rank: u32, res: Result<Message>) -> GetResult {
    match res {
        Ok(Message {
            body: Body::GetReceipt { error, key, value },
            ..
        }) => GetResult {
            rank,
            error,
            key,
            value,
        },
        Ok(message) => {
            warn!("Unexpected {} from rank {}", message.body.name(), rank);
            GetResult {
                error: ErrorCode::Error,
                ..GetResult::not_found(rank)
            }
        }
        Err(e) => {
            error!("Get from rank {} failed: {}", rank, e);
            GetResult {
                error: ErrorCode::from(&e),
                ..GetResult::not_found(rank)
            }
        }
    }
}

fn bulk_get_result(rank: u32, res: Result<Message>) -> BulkGetResult {
    match res {
        Ok(Message {
            body: Body::BulkGetReceipt { error, records },
            ..
        }) => BulkGetResult {
            rank,
            error,
            records,
        },
        Ok(message) => {
            warn!("Unexpected {} from rank {}", message.body.name(), rank);
            BulkGetResult {
                rank,
                error: ErrorCode::Error,
                records: Vec::new(),
            }
        }
        Err(e) => {
            error!("Bulk get from rank {} failed: {}", rank, e);
            BulkGetResult {
                rank,
                error: ErrorCode::from(&e),
                records: Vec::new(),
            }
        }
    }
}

/// The first failure among `receipts`, or the first receipt.
fn worst(rank: u32, receipts: Vec<Receipt>) -> Receipt {
    let first = receipts.first().cloned().unwrap_or(Receipt {
        rank,
        error: ErrorCode::Success,
    });
    receipts
        .into_iter()
        .find(|r| !r.error.is_success())
        .unwrap_or(first)
}

/// Routes operations of this rank to the range servers of an index.
///
/// Every call waits for all of its destinations. There is no timeout, a range
/// server that never answers stalls the call.
#[derive(Clone)]
pub struct Router {
    node: Arc<Node>,
}

impl Router {
    pub(crate) fn new(node: Arc<Node>) -> Router {
        Router { node }
    }

    fn rank(&self) -> u32 {
        self.node.rank()
    }

    fn check_count(&self, count: usize) -> Result<()> {
        let max = self.node.options().max_bulk_ops;
        if count > max {
            return Err(routing_failed(Error::TooManyRecords { count, max }));
        }
        BULK_RECORDS_HISTOGRAM.observe(count as f64);
        Ok(())
    }

    /// Checks the size of every message, then sends them all and waits for
    /// every reply. Nothing is sent when any message is too large.
    async fn send_all(
        &self,
        messages: Vec<(u32, Message)>,
    ) -> Result<Vec<(u32, Result<Message>)>> {
        let max = self.node.options().max_message_bytes;
        for (_, message) in &messages {
            message.check_size(max).map_err(routing_failed)?;
        }
        BULK_DESTINATIONS_HISTOGRAM.observe(messages.len() as f64);

        let calls = messages.into_iter().map(|(dest, message)| {
            let call = self.node.call(dest, message);
            async move { (dest, call.await) }
        });
        Ok(join_all(calls).await)
    }

    async fn send(&self, dest: u32, message: Message) -> Result<Result<Message>> {
        let mut replies = self.send_all(vec![(dest, message)]).await?;
        Ok(replies.pop().map(|(_, res)| res).unwrap_or(Err(Error::Closed)))
    }

    /// Rank storing a new record. Secondary local entries follow the primary
    /// key held in `value`.
    fn put_destination(&self, index: &Index, key: &[u8], value: &[u8]) -> Result<u32> {
        let dest = match index.kind() {
            IndexKind::SecondaryLocal { primary } => {
                index.slice_of(key)?;
                self.node.index(primary)?.route(value)?.rank
            }
            _ => index.route(key)?.rank,
        };
        Ok(dest)
    }

    /// Ranks that may hold `key`.
    fn holders(&self, index: &Index, key: &[u8]) -> Result<Vec<u32>> {
        if index.kind().routes_by_stats() {
            index.stat_candidates(GetOp::Equal, Some(key))
        } else {
            Ok(vec![index.route(key)?.rank])
        }
    }

    /// Ranks to ask for a lookup, best candidate first.
    fn lookup_destinations(
        &self,
        index: &Index,
        op: GetOp,
        key: Option<&[u8]>,
    ) -> Result<Vec<u32>> {
        if index.kind() == IndexKind::Local {
            if let Some(key) = key {
                index.key_type().validate(key)?;
            }
            return Ok(vec![self.rank()]);
        }
        match (op, key) {
            (GetOp::Equal, Some(key)) => self.holders(index, key),
            (GetOp::Equal, None) => Err(Error::Routing("equal lookups require a key".to_string())),
            (op, key) => index.stat_candidates(op, key),
        }
    }

    /// Ranks not in `asked` that may hold a record closer to `key` than
    /// `found`. A server answers with its own nearest record, which can lie
    /// past rows of other servers when bounds tie.
    fn closer_candidates(
        &self,
        index: &Index,
        op: GetOp,
        key: Option<&[u8]>,
        found: &[u8],
        asked: &[u32],
    ) -> Result<Vec<u32>> {
        if index.kind() == IndexKind::Local {
            return Ok(Vec::new());
        }
        Ok(index
            .stat_overlapping(op, key, found)
            .map_err(routing_failed)?
            .into_iter()
            .filter(|rank| !asked.contains(rank))
            .collect())
    }

    pub async fn put(&self, index: &Index, key: Bytes, value: Bytes) -> Result<Receipt> {
        let dest = self
            .put_destination(index, &key, &value)
            .map_err(routing_failed)?;
        let message = Message::new(self.rank(), index.id(), Body::Put { key, value });
        Ok(receipt(dest, self.send(dest, message).await?))
    }

    /// Puts a primary record, then its secondary keys. Secondary keys are
    /// written only when the primary put succeeded, and their failures are
    /// logged without affecting the returned receipt.
    pub async fn put_with(
        &self,
        index: &Index,
        key: Bytes,
        value: Bytes,
        secondaries: &[SecondaryKeys],
    ) -> Result<Receipt> {
        let primary = self.put(index, key.clone(), value).await?;
        if !primary.error.is_success() {
            return Ok(primary);
        }

        for secondary in secondaries {
            let records = secondary
                .keys
                .iter()
                .map(|k| (k.clone(), key.clone()))
                .collect();
            match self.bput(&secondary.index, records).await {
                Ok(receipts) => {
                    for r in receipts.iter().filter(|r| !r.error.is_success()) {
                        warn!(
                            "Secondary index {} put failed on rank {}: {:?}",
                            secondary.index.id(),
                            r.rank,
                            r.error
                        );
                    }
                }
                Err(e) => warn!(
                    "Secondary index {} put failed: {}",
                    secondary.index.id(),
                    e
                ),
            }
        }
        Ok(primary)
    }

    pub async fn bput(
        &self,
        index: &Index,
        records: Vec<(Bytes, Bytes)>,
    ) -> Result<Vec<Receipt>> {
        self.check_count(records.len())?;
        let mut batches = Batches::new(self.rank());
        for (key, value) in records {
            let dest = self
                .put_destination(index, &key, &value)
                .map_err(routing_failed)?;
            batches.push(index, dest, (key, value));
        }

        let messages = batches.into_messages(self.rank(), index.id(), |records| Body::BulkPut {
            records,
        });
        let replies = self.send_all(messages).await?;
        Ok(replies
            .into_iter()
            .map(|(dest, res)| receipt(dest, res))
            .collect())
    }

    /// Looks up one key. Directional lookups ask the candidate servers in
    /// turn until one of them finds a record, then the servers that may
    /// still hold a closer one.
    pub async fn get(&self, index: &Index, op: GetOp, key: Option<Bytes>) -> Result<GetResult> {
        let dests = self
            .lookup_destinations(index, op, key.as_deref())
            .map_err(routing_failed)?;
        if dests.is_empty() {
            trace!("No range server can hold a match for {:?}", op);
            return Ok(GetResult::not_found(self.rank()));
        }

        let request = |key: Option<Bytes>| Body::Get { op, key };
        if index.kind().routes_by_stats() {
            // entries of several servers may interleave, ask them all
            let messages = dests
                .iter()
                .map(|dest| {
                    (
                        *dest,
                        Message::new(self.rank(), index.id(), request(key.clone())),
                    )
                })
                .collect();
            let results = self
                .send_all(messages)
                .await?
                .into_iter()
                .map(|(dest, res)| get_result(dest, res))
                .collect();
            return Ok(best_match(index, op, results, self.rank()));
        }

        let mut last = GetResult::not_found(self.rank());
        for (i, dest) in dests.iter().enumerate() {
            let message = Message::new(self.rank(), index.id(), request(key.clone()));
            let result = get_result(*dest, self.send(*dest, message).await?);
            if result.error == ErrorCode::NotFound {
                last = result;
                continue;
            }
            if !result.error.is_success() || !op.is_directional() {
                return Ok(result);
            }

            let closer = match &result.key {
                Some(found) => {
                    self.closer_candidates(index, op, key.as_deref(), found, &dests[..=i])?
                }
                None => Vec::new(),
            };
            if closer.is_empty() {
                return Ok(result);
            }
            trace!("Asking {:?} for a record closer than rank {}", closer, dest);
            let messages = closer
                .iter()
                .map(|dest| {
                    (
                        *dest,
                        Message::new(self.rank(), index.id(), request(key.clone())),
                    )
                })
                .collect();
            let mut results = vec![result];
            results.extend(
                self.send_all(messages)
                    .await?
                    .into_iter()
                    .map(|(dest, res)| get_result(dest, res)),
            );
            return Ok(best_match(index, op, results, self.rank()));
        }
        Ok(last)
    }

    /// Looks up many keys. Keys no range server can hold are answered with
    /// a not found result for this rank, listed last.
    ///
    /// Directional keys, and every key of a secondary local index, go to all
    /// of their candidate servers. Each server answers with its own nearest
    /// record, so one key may be answered in several results.
    pub async fn bget(
        &self,
        index: &Index,
        op: GetOp,
        keys: Vec<Bytes>,
    ) -> Result<Vec<BulkGetResult>> {
        self.check_count(keys.len())?;
        let fan_out = op.is_directional() || index.kind().routes_by_stats();
        let mut batches = Batches::new(self.rank());
        let mut unrouted = 0;
        for key in keys {
            let dests = self
                .lookup_destinations(index, op, Some(&key))
                .map_err(routing_failed)?;
            match dests.split_first() {
                None => unrouted += 1,
                Some((first, rest)) => {
                    if fan_out {
                        for dest in rest {
                            batches.push(index, *dest, key.clone());
                        }
                    }
                    batches.push(index, *first, key);
                }
            }
        }

        let messages = batches.into_messages(self.rank(), index.id(), |keys| Body::BulkGet {
            op,
            num_records: 1,
            keys,
        });
        let mut results: Vec<BulkGetResult> = self
            .send_all(messages)
            .await?
            .into_iter()
            .map(|(dest, res)| bulk_get_result(dest, res))
            .collect();
        if unrouted > 0 {
            results.push(BulkGetResult::not_found(self.rank(), unrouted));
        }
        Ok(results)
    }

    /// Reads up to `num_records` successive records starting at `key`, or at
    /// either end for `First` and `Last`. The records come from the single
    /// range server holding the record closest to `key`.
    pub async fn bget_op(
        &self,
        index: &Index,
        op: GetOp,
        key: Option<Bytes>,
        num_records: u32,
    ) -> Result<BulkGetResult> {
        let num_records = num_records.max(1);
        self.check_count(num_records as usize)?;
        let dests = self
            .lookup_destinations(index, op, key.as_deref())
            .map_err(routing_failed)?;

        let request = || {
            let body = Body::BulkGet {
                op,
                num_records,
                keys: key.iter().cloned().collect(),
            };
            Message::new(self.rank(), index.id(), body)
        };
        let mut last = BulkGetResult::not_found(self.rank(), 0);
        for (i, dest) in dests.iter().enumerate() {
            let result = bulk_get_result(*dest, self.send(*dest, request()).await?);
            if result.error == ErrorCode::NotFound {
                last = result;
                continue;
            }
            if !result.error.is_success() {
                return Ok(result);
            }

            let closer = match result.found().next() {
                Some((found, _)) => {
                    self.closer_candidates(index, op, key.as_deref(), found, &dests[..=i])?
                }
                None => Vec::new(),
            };
            if closer.is_empty() {
                return Ok(result);
            }
            let messages = closer.iter().map(|dest| (*dest, request())).collect();
            let mut best = result;
            for (dest, res) in self.send_all(messages).await? {
                let other = bulk_get_result(dest, res);
                let nearer = match (other.found().next(), best.found().next()) {
                    (Some((key, _)), Some((current, _))) => is_closer(index, op, key, current),
                    _ => false,
                };
                if nearer {
                    best = other;
                }
            }
            return Ok(best);
        }
        Ok(last)
    }

    /// Looks up `keys` in a secondary index, then reads the primary records
    /// they point to.
    pub async fn bget_primary(
        &self,
        index: &Index,
        op: GetOp,
        keys: Vec<Bytes>,
    ) -> Result<Vec<BulkGetResult>> {
        let primary = match index.kind() {
            IndexKind::SecondaryGlobal { primary } | IndexKind::SecondaryLocal { primary } => {
                self.node.index(primary)?
            }
            _ => {
                return Err(routing_failed(Error::Routing(format!(
                    "index {} is not a secondary index",
                    index.id()
                ))))
            }
        };

        let primary_keys: Vec<Bytes> = self
            .bget(index, op, keys)
            .await?
            .iter()
            .flat_map(|result| result.found().map(|(_, value)| value.clone()))
            .collect();
        if primary_keys.is_empty() {
            return Ok(vec![BulkGetResult::not_found(self.rank(), 0)]);
        }
        self.bget(&primary, GetOp::Equal, primary_keys).await
    }

    /// Deletes `key` from every server that may hold it. Deleting a missing
    /// key succeeds.
    pub async fn del(&self, index: &Index, key: Bytes) -> Result<Receipt> {
        let dests = self.holders(index, &key).map_err(routing_failed)?;
        let messages = dests
            .into_iter()
            .map(|dest| {
                let body = Body::Delete { key: key.clone() };
                (dest, Message::new(self.rank(), index.id(), body))
            })
            .collect();
        let receipts = self
            .send_all(messages)
            .await?
            .into_iter()
            .map(|(dest, res)| receipt(dest, res))
            .collect();
        Ok(worst(self.rank(), receipts))
    }

    pub async fn bdel(&self, index: &Index, keys: Vec<Bytes>) -> Result<Vec<Receipt>> {
        self.check_count(keys.len())?;
        let mut batches = Batches::new(self.rank());
        for key in keys {
            for dest in self.holders(index, &key).map_err(routing_failed)? {
                batches.push(index, dest, key.clone());
            }
        }

        let messages = batches.into_messages(self.rank(), index.id(), |keys| Body::BulkDelete {
            keys,
        });
        let replies = self.send_all(messages).await?;
        Ok(replies
            .into_iter()
            .map(|(dest, res)| receipt(dest, res))
            .collect())
    }

    /// Flushes buffered writes on every range server of `index`.
    pub async fn commit(&self, index: &Index) -> Result<Vec<Receipt>> {
        let mut batches = Batches::new(self.rank());
        for server in index.topology().servers() {
            batches.push(index, server.rank, ());
        }
        let messages = batches.into_messages(self.rank(), index.id(), |_| Body::Commit);
        let replies = self.send_all(messages).await?;
        Ok(replies
            .into_iter()
            .map(|(dest, res)| receipt(dest, res))
            .collect())
    }
}

/// Whether `key` comes before `current` in the direction of `op`.
fn is_closer(index: &Index, op: GetOp, key: &[u8], current: &[u8]) -> bool {
    let order = index.key_type().compare(key, current);
    match op {
        GetOp::Prev | GetOp::Last => order == Ordering::Greater,
        GetOp::Next | GetOp::First => order == Ordering::Less,
        GetOp::Equal => false,
    }
}

/// Picks the answer closest to the start of a directional walk among
/// answers from several servers.
fn best_match(index: &Index, op: GetOp, results: Vec<GetResult>, rank: u32) -> GetResult {
    let mut best: Option<GetResult> = None;
    let mut failure: Option<GetResult> = None;
    for result in results {
        match result.error {
            ErrorCode::Success => {}
            ErrorCode::NotFound => continue,
            _ => {
                failure.get_or_insert(result);
                continue;
            }
        }
        let better = match (&best, &result.key) {
            (None, _) => true,
            (Some(GetResult { key: Some(current), .. }), Some(key)) => {
                is_closer(index, op, key, current)
            }
            _ => false,
        };
        if better {
            best = Some(result);
        }
    }
    best.or(failure)
        .unwrap_or_else(|| GetResult::not_found(rank))
}
