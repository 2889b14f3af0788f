//! Key→shard routing strategies for Strata.

use std::sync::Arc;

use strata_directory::{RoutingTable, ShardDescriptor, ShardId, ShardKey};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no shard owns key {key}")]
    NoShardForKey { key: ShardKey },
}

/// A routing strategy. Routing is a pure lookup: no I/O, no mutation.
pub trait Router: Send + Sync {
    fn shard_for_key(&self, key: ShardKey) -> Result<ShardId, RouteError>;
}

/// Range-based router backed by a routing-table snapshot.
pub struct RangeRouter {
    table: Arc<RoutingTable>,
}

impl RangeRouter {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    /// Full descriptor for the shard owning `key`.
    pub fn descriptor_for(&self, key: ShardKey) -> Result<&ShardDescriptor, RouteError> {
        self.table.lookup(key).ok_or(RouteError::NoShardForKey { key })
    }
}

impl Router for RangeRouter {
    fn shard_for_key(&self, key: ShardKey) -> Result<ShardId, RouteError> {
        self.descriptor_for(key).map(|d| d.shard_id)
    }
}

/// Modular hash router for hash-partitioned layouts where every shard id
/// in `0..shards` exists.
pub struct HashRouter {
    shards: u64,
}

impl HashRouter {
    pub fn new(shards: u64) -> Self {
        Self { shards }
    }
}

impl Router for HashRouter {
    fn shard_for_key(&self, key: ShardKey) -> Result<ShardId, RouteError> {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut h);
        Ok(h.finish() % self.shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_directory::{ConnectionInfo, ShardDescriptor};

    fn table() -> Arc<RoutingTable> {
        let desc = |id, low, high| ShardDescriptor {
            shard_id: id,
            key_low: low,
            key_high: high,
            connection: ConnectionInfo { primary: format!("host=shard{id}"), replicas: vec![] },
        };
        Arc::new(RoutingTable::new(vec![desc(0, 0, 100), desc(1, 100, 200)]).unwrap())
    }

    #[test]
    fn range_router_boundaries() {
        let router = RangeRouter::new(table());
        assert_eq!(router.shard_for_key(0).unwrap(), 0);
        assert_eq!(router.shard_for_key(99).unwrap(), 0);
        assert_eq!(router.shard_for_key(100).unwrap(), 1);
        assert_eq!(
            router.shard_for_key(200),
            Err(RouteError::NoShardForKey { key: 200 })
        );
    }

    #[test]
    fn hash_router_is_stable_and_in_range() {
        let router = HashRouter::new(4);
        for key in [-5i64, 0, 1, 42, i64::MAX] {
            let first = router.shard_for_key(key).unwrap();
            assert_eq!(first, router.shard_for_key(key).unwrap());
            assert!(first < 4);
        }
    }

    #[test]
    fn hash_router_spreads_keys() {
        let router = HashRouter::new(4);
        let mut counts = [0u32; 4];
        for key in 0..1000 {
            counts[router.shard_for_key(key).unwrap() as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 100));
    }
}
