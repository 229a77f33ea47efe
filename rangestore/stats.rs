//! Per-slice key statistics.
//!
//! Range servers keep a `SliceStats` for the slices they own. After a flush
//! every rank holds a `StatTable` with the rows of all servers, which routes
//! directional queries without asking each server.
use crate::error::{Error, Result};
use crate::partitioner::KeyValue;
use crate::protocol::GetOp;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::BTreeMap;

const ENCODED_STAT_LEN: usize = 25;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatValue {
    Int(u64),
    Float(f64),
}

impl StatValue {
    fn from_key(value: KeyValue) -> StatValue {
        match value {
            KeyValue::Int(v) => StatValue::Int(v.max(0) as u64),
            KeyValue::Float(v) => StatValue::Float(v),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, StatValue::Float(_))
    }

    pub fn to_bits(self) -> u64 {
        match self {
            StatValue::Int(v) => v,
            StatValue::Float(v) => v.to_bits(),
        }
    }

    pub fn from_bits(float: bool, bits: u64) -> StatValue {
        if float {
            StatValue::Float(f64::from_bits(bits))
        } else {
            StatValue::Int(bits)
        }
    }
}

/// Position used to compare key values against statistics.
#[derive(Clone, Copy, Debug)]
enum Pos {
    Int(i128),
    Float(f64),
}

impl Pos {
    fn cmp(self, other: Pos) -> Ordering {
        match (self, other) {
            (Pos::Int(a), Pos::Int(b)) => a.cmp(&b),
            (Pos::Float(a), Pos::Float(b)) => a.total_cmp(&b),
            (Pos::Int(a), Pos::Float(b)) => (a as f64).total_cmp(&b),
            (Pos::Float(a), Pos::Int(b)) => a.total_cmp(&(b as f64)),
        }
    }
}

impl From<StatValue> for Pos {
    fn from(v: StatValue) -> Pos {
        match v {
            StatValue::Int(v) => Pos::Int(i128::from(v)),
            StatValue::Float(v) => Pos::Float(v),
        }
    }
}

impl From<KeyValue> for Pos {
    fn from(v: KeyValue) -> Pos {
        match v {
            KeyValue::Int(v) => Pos::Int(i128::from(v)),
            KeyValue::Float(v) => Pos::Float(v),
        }
    }
}

/// Running min/max/count of the keys inserted into one slice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stat {
    pub min: StatValue,
    pub max: StatValue,
    pub num: u64,
}

impl Stat {
    fn new(value: StatValue) -> Stat {
        Stat {
            min: value,
            max: value,
            num: 1,
        }
    }

    fn merge(&mut self, value: StatValue) {
        if Pos::from(value).cmp(Pos::from(self.min)) == Ordering::Less {
            self.min = value;
        }
        if Pos::from(value).cmp(Pos::from(self.max)) == Ordering::Greater {
            self.max = value;
        }
        self.num += 1;
    }

    /// Encoding used in the stats sub-store.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENCODED_STAT_LEN);
        buf.put_u8(self.min.is_float() as u8);
        buf.put_u64_le(self.min.to_bits());
        buf.put_u64_le(self.max.to_bits());
        buf.put_u64_le(self.num);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Stat> {
        if buf.len() != ENCODED_STAT_LEN {
            return Err(Error::Storage(format!(
                "stat row has {} bytes, expected {}",
                buf.len(),
                ENCODED_STAT_LEN
            )));
        }
        let float = buf[0] != 0;
        Ok(Stat {
            min: StatValue::from_bits(float, LittleEndian::read_u64(&buf[1..9])),
            max: StatValue::from_bits(float, LittleEndian::read_u64(&buf[9..17])),
            num: LittleEndian::read_u64(&buf[17..25]),
        })
    }
}

/// Statistics of one slice as reported by one range server.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatRow {
    pub slice: u64,
    pub rank: u32,
    pub stat: Stat,
}

/// Statistics a range server keeps for its own slices.
#[derive(Default, Debug)]
pub struct SliceStats {
    slices: BTreeMap<u64, Stat>,
}

impl SliceStats {
    /// Records a newly inserted key.
    pub fn record(&mut self, slice: u64, value: KeyValue) {
        let value = StatValue::from_key(value);
        self.slices
            .entry(slice)
            .and_modify(|stat| stat.merge(value))
            .or_insert_with(|| Stat::new(value));
    }

    pub fn insert(&mut self, slice: u64, stat: Stat) {
        self.slices.insert(slice, stat);
    }

    pub fn get(&self, slice: u64) -> Option<&Stat> {
        self.slices.get(&slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Stat)> {
        self.slices.iter().map(|(slice, stat)| (*slice, stat))
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn rows(&self, rank: u32) -> Vec<StatRow> {
        self.slices
            .iter()
            .map(|(slice, stat)| StatRow {
                slice: *slice,
                rank,
                stat: *stat,
            })
            .collect()
    }
}

/// Flushed statistics of every range server of an index.
#[derive(Default, Debug)]
pub struct StatTable {
    rows: BTreeMap<(u64, u32), Stat>,
}

impl StatTable {
    /// Installs rows from a flush, replacing rows previously held for the
    /// same slice and server.
    pub fn replace(&mut self, rows: Vec<StatRow>) {
        for row in rows {
            self.rows.insert((row.slice, row.rank), row.stat);
        }
    }

    pub fn rows(&self) -> Vec<StatRow> {
        self.rows
            .iter()
            .map(|((slice, rank), stat)| StatRow {
                slice: *slice,
                rank: *rank,
                stat: *stat,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ranks to ask for a directional query, best candidate first.
    ///
    /// Next picks the rows that may hold keys above `key`, ordered by the
    /// lowest key they can hold. Prev is the mirror image. First and Last
    /// ignore the key. Bounds are inclusive: string and byte keys share a
    /// position when they differ only past the precision of an f64.
    pub fn candidates(&self, op: GetOp, key: Option<KeyValue>) -> Vec<u32> {
        let mut rows: Vec<(Pos, u32)> = match (op, key) {
            (GetOp::First, _) | (GetOp::Next, None) => self
                .rows
                .iter()
                .map(|((_, rank), stat)| (Pos::from(stat.min), *rank))
                .collect(),
            (GetOp::Last, _) | (GetOp::Prev, None) => self
                .rows
                .iter()
                .map(|((_, rank), stat)| (Pos::from(stat.max), *rank))
                .collect(),
            (GetOp::Next, Some(key)) => {
                let key = Pos::from(key);
                self.rows
                    .iter()
                    .filter(|(_, stat)| Pos::from(stat.max).cmp(key) != Ordering::Less)
                    .map(|((_, rank), stat)| {
                        let min = Pos::from(stat.min);
                        let low = if min.cmp(key) == Ordering::Greater {
                            min
                        } else {
                            key
                        };
                        (low, *rank)
                    })
                    .collect()
            }
            (GetOp::Prev, Some(key)) => {
                let key = Pos::from(key);
                self.rows
                    .iter()
                    .filter(|(_, stat)| Pos::from(stat.min).cmp(key) != Ordering::Greater)
                    .map(|((_, rank), stat)| {
                        let max = Pos::from(stat.max);
                        let high = if max.cmp(key) == Ordering::Less {
                            max
                        } else {
                            key
                        };
                        (high, *rank)
                    })
                    .collect()
            }
            (GetOp::Equal, Some(key)) => return self.covering(key),
            (GetOp::Equal, None) => return Vec::new(),
        };

        match op {
            GetOp::Last | GetOp::Prev => rows.sort_by(|a, b| b.0.cmp(a.0)),
            _ => rows.sort_by(|a, b| a.0.cmp(b.0)),
        }

        let mut ranks = Vec::with_capacity(rows.len());
        for (_, rank) in rows {
            if !ranks.contains(&rank) {
                ranks.push(rank);
            }
        }
        ranks
    }

    /// Ranks with rows that may hold keys between `low` and `high`, both
    /// inclusive and unbounded when missing, in slice order.
    pub fn overlapping(&self, low: Option<KeyValue>, high: Option<KeyValue>) -> Vec<u32> {
        let (low, high) = (low.map(Pos::from), high.map(Pos::from));
        let mut ranks = Vec::new();
        for ((_, rank), stat) in &self.rows {
            let above = low.map_or(true, |low| Pos::from(stat.max).cmp(low) != Ordering::Less);
            let below =
                high.map_or(true, |high| Pos::from(stat.min).cmp(high) != Ordering::Greater);
            if above && below && !ranks.contains(rank) {
                ranks.push(*rank);
            }
        }
        ranks
    }

    /// Ranks whose rows cover `key`, in slice order.
    pub fn covering(&self, key: KeyValue) -> Vec<u32> {
        let key = Pos::from(key);
        let mut ranks = Vec::new();
        for ((_, rank), stat) in &self.rows {
            if Pos::from(stat.min).cmp(key) != Ordering::Greater
                && Pos::from(stat.max).cmp(key) != Ordering::Less
                && !ranks.contains(rank)
            {
                ranks.push(*rank);
            }
        }
        ranks
    }
}
