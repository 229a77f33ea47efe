use crate::error::{Error, Result};
use crate::key::KeyType;
use crate::partitioner::{self, key_value, RangeServerInfo, Topology};
use crate::protocol::GetOp;
use crate::stats::{StatRow, StatTable};
use crate::storage::StoreType;
use std::sync::{PoisonError, RwLock};

/// Role of an index in the keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    /// Secondary keys partitioned independently of the primary keys.
    SecondaryGlobal { primary: u32 },
    /// Secondary keys stored on the server of the primary record they
    /// point to.
    SecondaryLocal { primary: u32 },
    /// Served only by the rank that created it.
    Local,
}

impl IndexKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Primary => "primary",
            IndexKind::SecondaryGlobal { .. } => "secondary_global",
            IndexKind::SecondaryLocal { .. } => "secondary_local",
            IndexKind::Local => "local",
        }
    }

    /// Whether creating the index involves every rank.
    pub fn is_collective(&self) -> bool {
        *self != IndexKind::Local
    }

    /// Whether operations are routed through statistics instead of the
    /// partitioner.
    pub fn routes_by_stats(&self) -> bool {
        matches!(self, IndexKind::SecondaryLocal { .. })
    }
}

/// A keyspace with its own topology, storage and statistics.
#[derive(Debug)]
pub struct Index {
    id: u32,
    kind: IndexKind,
    key_type: KeyType,
    store_type: StoreType,
    topology: Topology,
    rank: u32,
    stats: RwLock<StatTable>,
}

impl Index {
    pub fn new(
        id: u32,
        kind: IndexKind,
        key_type: KeyType,
        store_type: StoreType,
        topology: Topology,
        rank: u32,
    ) -> Index {
        Index {
            id,
            kind,
            key_type,
            store_type,
            topology,
            rank,
            stats: RwLock::new(StatTable::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Server number of this rank, 0 if it does not serve the index.
    pub fn server_number(&self) -> u32 {
        self.topology.server_number(self.rank)
    }

    pub fn is_server(&self) -> bool {
        self.server_number() > 0
    }

    /// Server owning `key` according to the partitioner.
    pub fn route(&self, key: &[u8]) -> Result<RangeServerInfo> {
        partitioner::route(key, self.key_type, &self.topology)
    }

    pub fn slice_of(&self, key: &[u8]) -> Result<u64> {
        partitioner::slice_of(key, self.key_type, self.topology.slice_size)
    }

    /// Installs flushed statistics.
    pub fn install_stats(&self, rows: Vec<StatRow>) {
        let mut table = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        table.replace(rows);
    }

    pub fn stat_rows(&self) -> Vec<StatRow> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows()
    }

    /// Ranks to ask for `op`, best candidate first, chosen from the flushed
    /// statistics. Empty when no server can hold a matching key.
    pub fn stat_candidates(&self, op: GetOp, key: Option<&[u8]>) -> Result<Vec<u32>> {
        let key = match key {
            Some(key) if op != GetOp::First && op != GetOp::Last => {
                Some(key_value(key, self.key_type)?)
            }
            _ => None,
        };
        if op == GetOp::Equal && key.is_none() {
            return Err(Error::Routing("equal lookups require a key".to_string()));
        }
        let table = self.stats.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.candidates(op, key))
    }

    /// Ranks that may hold a record closer to `key` than `found` for `op`.
    pub fn stat_overlapping(
        &self,
        op: GetOp,
        key: Option<&[u8]>,
        found: &[u8],
    ) -> Result<Vec<u32>> {
        let found = Some(key_value(found, self.key_type)?);
        let key = match (op, key) {
            (GetOp::Next, Some(key)) | (GetOp::Prev, Some(key)) => {
                Some(key_value(key, self.key_type)?)
            }
            _ => None,
        };
        let (low, high) = match op {
            GetOp::Next | GetOp::First => (key, found),
            GetOp::Prev | GetOp::Last => (found, key),
            GetOp::Equal => return Ok(Vec::new()),
        };
        let table = self.stats.read().unwrap_or_else(PoisonError::into_inner);
        Ok(table.overlapping(low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::int_key;
    use crate::stats::{Stat, StatValue};

    fn index() -> Index {
        Index::new(
            0,
            IndexKind::Primary,
            KeyType::Int,
            StoreType::Memory,
            Topology::new(3, 1, 10, 100),
            0,
        )
    }

    #[test]
    fn routing() {
        let index = index();
        assert!(!index.is_server());
        assert_eq!(2, index.route(&int_key(5)).unwrap().rank);
        assert_eq!(1, index.route(&int_key(15)).unwrap().rank);
        assert!(index.route(&int_key(-15)).is_err());
    }

    #[test]
    fn candidates_from_installed_stats() {
        let index = index();
        assert!(index
            .stat_candidates(GetOp::First, None)
            .unwrap()
            .is_empty());

        index.install_stats(vec![StatRow {
            slice: 1,
            rank: 2,
            stat: Stat {
                min: StatValue::Int(0),
                max: StatValue::Int(9),
                num: 10,
            },
        }]);
        assert_eq!(
            vec![2],
            index.stat_candidates(GetOp::First, Some(&int_key(-1))).unwrap()
        );
        assert_eq!(
            vec![2],
            index.stat_candidates(GetOp::Next, Some(&int_key(3))).unwrap()
        );
        assert!(index
            .stat_candidates(GetOp::Next, Some(&int_key(10)))
            .unwrap()
            .is_empty());
        assert_eq!(
            vec![2],
            index
                .stat_overlapping(GetOp::Prev, Some(&int_key(20)), &int_key(9))
                .unwrap()
        );
        assert!(index
            .stat_overlapping(GetOp::Last, None, &int_key(10))
            .unwrap()
            .is_empty());
        assert!(index.stat_candidates(GetOp::Equal, None).is_err());
    }
}
