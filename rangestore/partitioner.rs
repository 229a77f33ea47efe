//! Maps keys to slices and slices to range servers.
//!
//! Every rank evaluates these functions independently, so they must stay pure:
//! the same key and topology give the same server on every process.
use crate::error::{Error, Result};
use crate::key::KeyType;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

/// Symbols allowed in string keys, in positional order.
const ALPHABET_SYMBOLS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

lazy_static! {
    /// Position of each byte in `ALPHABET_SYMBOLS`, `None` for bytes outside of it.
    static ref ALPHABET: [Option<u8>; 256] = {
        let mut table = [None; 256];
        for (pos, c) in ALPHABET_SYMBOLS.iter().enumerate() {
            table[*c as usize] = Some(pos as u8);
        }
        table
    };
}

/// Numeric position of a key in the keyspace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyValue {
    Int(i64),
    Float(f64),
}

/// Identity of the server owning a slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeServerInfo {
    pub rank: u32,
    /// Server number, starting at 1
    pub server: u32,
}

/// Placement of range servers within the process group for one index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub factor: u32,
    pub slice_size: u64,
    pub num_nodes: u32,
    /// server number -> rank
    servers: BTreeMap<u32, u32>,
}

impl Topology {
    /// Computes the rank table for a group of `num_nodes` ranks.
    pub fn new(num_nodes: u32, factor: u32, slice_size: u64, max_servers: u32) -> Topology {
        let servers = (0..num_nodes)
            .filter_map(|rank| match is_range_server(rank, num_nodes, factor, max_servers) {
                0 => None,
                n => Some((n, rank)),
            })
            .collect();
        Topology {
            factor,
            slice_size,
            num_nodes,
            servers,
        }
    }

    /// Topology of an index served only by `rank`.
    pub fn single(rank: u32, num_nodes: u32, slice_size: u64) -> Topology {
        let mut servers = BTreeMap::new();
        servers.insert(1, rank);
        Topology {
            factor: 1,
            slice_size,
            num_nodes,
            servers,
        }
    }

    pub fn num_servers(&self) -> u32 {
        self.servers.len() as u32
    }

    /// Server number of `rank`, 0 when the rank does not serve.
    pub fn server_number(&self, rank: u32) -> u32 {
        self.servers
            .iter()
            .find(|(_, r)| **r == rank)
            .map(|(n, _)| *n)
            .unwrap_or(0)
    }

    pub fn rank_of(&self, server: u32) -> Option<u32> {
        self.servers.get(&server).cloned()
    }

    /// Servers in ascending server number.
    pub fn servers(&self) -> impl Iterator<Item = RangeServerInfo> + '_ {
        self.servers
            .iter()
            .map(|(server, rank)| RangeServerInfo {
                rank: *rank,
                server: *server,
            })
    }

    /// Rank collecting statistics during a flush, the holder of server 1.
    pub fn coordinator(&self) -> Option<u32> {
        self.rank_of(1)
    }
}

/// Range server number of `rank`, or 0 if it does not serve.
///
/// When the group has fewer than `factor` ranks besides rank 0, the highest
/// rank is the only server. Otherwise every rank divisible by `factor` serves,
/// rank 0 excluded, up to `max_servers` servers.
pub fn is_range_server(rank: u32, num_nodes: u32, factor: u32, max_servers: u32) -> u32 {
    if num_nodes == 0 || factor == 0 || rank >= num_nodes {
        return 0;
    }

    let last = num_nodes - 1;
    if last < factor {
        return if rank == last { 1 } else { 0 };
    }

    if rank == 0 || rank % factor != 0 {
        return 0;
    }

    let server = rank / factor;
    if server > max_servers {
        0
    } else {
        server
    }
}

pub fn num_range_servers(num_nodes: u32, factor: u32, max_servers: u32) -> u32 {
    (0..num_nodes)
        .filter(|rank| is_range_server(*rank, num_nodes, factor, max_servers) > 0)
        .count() as u32
}

/// Owner of `slice`: server `(slice mod N) + 1`, where N counts the serving
/// ranks of the topology only, not every rank of the group. With a single
/// server every slice maps to server 1.
///
/// `None` means the topology has no server with the computed number, which
/// callers report as a routing failure.
pub fn range_server_for_slice(slice: u64, topology: &Topology) -> Option<RangeServerInfo> {
    let n = topology.num_servers() as u64;
    let server = match n {
        0 => return None,
        1 => 1,
        n => (slice % n) as u32 + 1,
    };
    topology
        .rank_of(server)
        .map(|rank| RangeServerInfo { rank, server })
}

/// Numeric value of a key. Integer keys keep their sign, string and byte keys
/// map to a fraction in `[0, 1)`.
pub fn key_value(key: &[u8], key_type: KeyType) -> Result<KeyValue> {
    key_type.validate(key)?;
    let value = match key_type {
        KeyType::Int => KeyValue::Int(i64::from(LittleEndian::read_i32(key))),
        KeyType::LongInt => KeyValue::Int(LittleEndian::read_i64(key)),
        KeyType::Float => finite(f64::from(LittleEndian::read_f32(key)))?,
        KeyType::Double => finite(LittleEndian::read_f64(key))?,
        KeyType::String => KeyValue::Float(string_fraction(key)?),
        KeyType::Bytes => KeyValue::Float(byte_fraction(key)),
    };
    Ok(value)
}

fn finite(v: f64) -> Result<KeyValue> {
    if v.is_finite() {
        Ok(KeyValue::Float(v))
    } else {
        Err(Error::Routing(format!("{} is not a routable key", v)))
    }
}

fn string_fraction(key: &[u8]) -> Result<f64> {
    let mut value = 0f64;
    let mut scale = 1f64;
    for c in key {
        let pos = match ALPHABET[*c as usize] {
            Some(pos) => pos,
            None => {
                return Err(Error::Routing(format!(
                    "character {:?} is not allowed in string keys",
                    *c as char
                )))
            }
        };
        scale /= 64f64;
        value += f64::from(pos) * scale;
    }
    Ok(value)
}

fn byte_fraction(key: &[u8]) -> f64 {
    let mut value = 0f64;
    let mut scale = 1f64;
    for b in key {
        scale /= 256f64;
        value += f64::from(*b) * scale;
    }
    value
}

/// Slice number of a key, starting at 1.
pub fn slice_of(key: &[u8], key_type: KeyType, slice_size: u64) -> Result<u64> {
    if slice_size == 0 {
        return Err(Error::Config("slice size must be positive".to_string()));
    }

    let key_num = match key_value(key, key_type)? {
        KeyValue::Int(v) if v < 0 => {
            return Err(Error::Routing(format!("negative key {} is out of range", v)))
        }
        KeyValue::Int(v) => v as u64,
        KeyValue::Float(v) if key_type == KeyType::Float || key_type == KeyType::Double => {
            v.abs().floor() as u64
        }
        KeyValue::Float(fraction) => (fraction * i64::MAX as f64).floor() as u64,
    };

    let slice = key_num / slice_size + if key_num % slice_size == 0 { 0 } else { 1 };
    Ok(slice.max(1))
}

/// Server owning the slice of `key`.
pub fn route(key: &[u8], key_type: KeyType, topology: &Topology) -> Result<RangeServerInfo> {
    let slice = slice_of(key, key_type, topology.slice_size)?;
    range_server_for_slice(slice, topology)
        .ok_or_else(|| Error::Routing(format!("no range server owns slice {}", slice)))
}
