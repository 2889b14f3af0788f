//! Shard directory for Strata: descriptors, the validated routing table,
//! and the swappable handle the rest of the proxy reads through.
//!
//! Descriptors are created at configuration time and never mutated
//! mid-query; a topology change builds a fresh table and swaps the shared
//! pointer, so readers holding a snapshot keep a consistent view.

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Shard identifier.
pub type ShardId = u64;

/// Sharding key. Ranges are half-open: `[key_low, key_high)`.
pub type ShardKey = i64;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("routing table has no shards")]
    Empty,
    #[error("shard {shard_id}: key_low {low} is not below key_high {high}")]
    InvertedRange { shard_id: ShardId, low: ShardKey, high: ShardKey },
    #[error("shards {a} and {b} have overlapping key ranges")]
    Overlap { a: ShardId, b: ShardId },
    #[error("duplicate shard id {0}")]
    DuplicateId(ShardId),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Endpoints for one shard: a primary and zero or more read replicas used
/// only when the primary is down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub primary: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// One shard's slice of the key space plus how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub key_low: ShardKey,
    pub key_high: ShardKey,
    pub connection: ConnectionInfo,
}

impl ShardDescriptor {
    /// True when this shard's range contains the key.
    pub fn owns(&self, key: ShardKey) -> bool {
        self.key_low <= key && key < self.key_high
    }

    /// Primary endpoint followed by replicas.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.connection.primary.as_str())
            .chain(self.connection.replicas.iter().map(|r| r.as_str()))
    }
}

/// Flat shard entry as written in `strata.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: ShardId,
    pub key_low: ShardKey,
    pub key_high: ShardKey,
    pub primary: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

impl From<ShardConfig> for ShardDescriptor {
    fn from(c: ShardConfig) -> Self {
        ShardDescriptor {
            shard_id: c.shard_id,
            key_low: c.key_low,
            key_high: c.key_high,
            connection: ConnectionInfo { primary: c.primary, replicas: c.replicas },
        }
    }
}

/// Immutable, validated routing table: descriptors sorted by `key_low`.
///
/// Overlapping or inverted ranges and duplicate ids are rejected here.
/// Gaps are tolerated (a key in a gap is a routing error, not a load
/// error) so a misconfiguration surfaces as a defined lookup failure.
#[derive(Debug)]
pub struct RoutingTable {
    shards: Vec<ShardDescriptor>,
}

impl RoutingTable {
    pub fn new(mut shards: Vec<ShardDescriptor>) -> Result<Self, DirectoryError> {
        if shards.is_empty() {
            return Err(DirectoryError::Empty);
        }
        for s in &shards {
            if s.key_low >= s.key_high {
                return Err(DirectoryError::InvertedRange {
                    shard_id: s.shard_id,
                    low: s.key_low,
                    high: s.key_high,
                });
            }
        }
        shards.sort_by_key(|s| s.key_low);
        let mut ids: Vec<ShardId> = shards.iter().map(|s| s.shard_id).collect();
        ids.sort_unstable();
        for pair in ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(DirectoryError::DuplicateId(pair[0]));
            }
        }
        for pair in shards.windows(2) {
            if pair[1].key_low < pair[0].key_high {
                return Err(DirectoryError::Overlap { a: pair[0].shard_id, b: pair[1].shard_id });
            }
            if pair[1].key_low > pair[0].key_high {
                warn!(
                    after = pair[0].shard_id,
                    before = pair[1].shard_id,
                    "gap in key space: keys in [{}, {}) have no shard",
                    pair[0].key_high,
                    pair[1].key_low
                );
            }
        }
        Ok(Self { shards })
    }

    /// Load a routing table from a YAML list of [`ShardConfig`] entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let content = fs::read_to_string(path)?;
        let configs: Vec<ShardConfig> = serde_yaml::from_str(&content)?;
        Self::new(configs.into_iter().map(Into::into).collect())
    }

    /// The descriptor owning `key`, if any. Pure lookup: binary search on
    /// the sorted ranges, no I/O, no mutation.
    pub fn lookup(&self, key: ShardKey) -> Option<&ShardDescriptor> {
        let idx = self.shards.partition_point(|s| s.key_low <= key);
        if idx == 0 {
            return None;
        }
        let candidate = &self.shards[idx - 1];
        candidate.owns(key).then_some(candidate)
    }

    /// Descriptor by shard id.
    pub fn shard(&self, id: ShardId) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.shard_id == id)
    }

    /// Descriptors in key order.
    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// True when the ranges cover the key space with no gaps.
    pub fn is_contiguous(&self) -> bool {
        self.shards.windows(2).all(|p| p[0].key_high == p[1].key_low)
    }
}

/// Shared handle over the current routing table.
///
/// Reads take a cheap `Arc` snapshot; a topology change swaps the pointer
/// under the lock so no table is ever mutated in place.
#[derive(Clone)]
pub struct Directory {
    current: Arc<RwLock<Arc<RoutingTable>>>,
}

impl Directory {
    pub fn new(table: RoutingTable) -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(table))) }
    }

    /// The table as of now. Holders keep this snapshot across a swap.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.current.read().unwrap().clone()
    }

    /// Replace the table; returns the previous one.
    pub fn swap(&self, table: RoutingTable) -> Arc<RoutingTable> {
        let mut guard = self.current.write().unwrap();
        std::mem::replace(&mut *guard, Arc::new(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: ShardId, low: ShardKey, high: ShardKey) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: id,
            key_low: low,
            key_high: high,
            connection: ConnectionInfo {
                primary: format!("host=shard{id} port=5432"),
                replicas: vec![],
            },
        }
    }

    #[test]
    fn lookup_finds_owner() {
        let table = RoutingTable::new(vec![desc(1, 100, 200), desc(0, 0, 100)]).unwrap();
        assert_eq!(table.lookup(0).unwrap().shard_id, 0);
        assert_eq!(table.lookup(99).unwrap().shard_id, 0);
        assert_eq!(table.lookup(100).unwrap().shard_id, 1);
        assert_eq!(table.lookup(199).unwrap().shard_id, 1);
        assert!(table.lookup(200).is_none());
        assert!(table.lookup(-1).is_none());
    }

    #[test]
    fn overlap_rejected() {
        let err = RoutingTable::new(vec![desc(0, 0, 150), desc(1, 100, 200)]).unwrap_err();
        assert!(matches!(err, DirectoryError::Overlap { a: 0, b: 1 }));
    }

    #[test]
    fn inverted_range_rejected() {
        let err = RoutingTable::new(vec![desc(0, 10, 10)]).unwrap_err();
        assert!(matches!(err, DirectoryError::InvertedRange { .. }));
    }

    #[test]
    fn empty_rejected() {
        assert!(matches!(RoutingTable::new(vec![]), Err(DirectoryError::Empty)));
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = RoutingTable::new(vec![desc(0, 0, 100), desc(0, 100, 200)]).unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateId(0)));
    }

    #[test]
    fn gap_is_lookup_miss_not_load_error() {
        let table = RoutingTable::new(vec![desc(0, 0, 100), desc(1, 150, 200)]).unwrap();
        assert!(!table.is_contiguous());
        assert!(table.lookup(120).is_none());
        assert_eq!(table.lookup(150).unwrap().shard_id, 1);
    }

    #[test]
    fn swap_keeps_old_snapshot_alive() {
        let dir = Directory::new(RoutingTable::new(vec![desc(0, 0, 100)]).unwrap());
        let before = dir.snapshot();
        dir.swap(RoutingTable::new(vec![desc(0, 0, 100), desc(1, 100, 200)]).unwrap());
        assert_eq!(before.len(), 1);
        assert_eq!(dir.snapshot().len(), 2);
        assert_eq!(dir.snapshot().lookup(150).unwrap().shard_id, 1);
    }

    #[test]
    fn shard_config_yaml() {
        let yaml = r#"
- shard_id: 0
  key_low: 0
  key_high: 1000
  primary: "host=10.0.0.1 port=5432 user=strata dbname=app"
  replicas: ["host=10.0.0.2 port=5432 user=strata dbname=app"]
"#;
        let configs: Vec<ShardConfig> = serde_yaml::from_str(yaml).unwrap();
        let table = RoutingTable::new(configs.into_iter().map(Into::into).collect()).unwrap();
        let d = table.lookup(500).unwrap();
        assert_eq!(d.shard_id, 0);
        assert_eq!(d.connection.replicas.len(), 1);
    }
}
