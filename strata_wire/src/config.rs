//! Proxy configuration loader.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use strata_aggregate::FanOutConfig;
use strata_directory::{DirectoryError, RoutingTable, ShardConfig};
use strata_failover::HealthConfig;
use strata_pool::PoolConfig;

/// Basic-auth credentials for the metrics endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

/// Whole-proxy configuration, read from `strata.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Client-facing listen address, e.g. "0.0.0.0:7433".
    pub listen: String,
    /// Prometheus exporter address; exporter is disabled when absent.
    #[serde(default)]
    pub metrics_listen: Option<String>,
    #[serde(default)]
    pub metrics_basic_auth: Option<BasicAuth>,
    /// Log directory; stderr logging is used when absent.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub fanout: FanOutConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub shards: Vec<ShardConfig>,
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Build and validate the routing table described by `shards`.
    pub fn routing_table(&self) -> Result<RoutingTable, DirectoryError> {
        RoutingTable::new(self.shards.iter().cloned().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_aggregate::FanOutPolicy;

    const SAMPLE: &str = r#"
listen: "0.0.0.0:7433"
metrics_listen: "0.0.0.0:9187"
fanout:
  policy: partial
  timeout_ms: 2500
pool:
  max_active: 16
shards:
  - shard_id: 0
    key_low: 0
    key_high: 500
    primary: "host=a port=5432"
  - shard_id: 1
    key_low: 500
    key_high: 1000
    primary: "host=b port=5432"
    replicas: ["host=b2 port=5432"]
"#;

    #[test]
    fn parses_full_config() {
        let cfg: ProxyConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:7433");
        assert_eq!(cfg.fanout.policy, FanOutPolicy::Partial);
        assert_eq!(cfg.fanout.timeout_ms, 2500);
        assert_eq!(cfg.pool.max_active, 16);
        assert_eq!(cfg.pool.max_idle, 8); // defaulted
        let table = cfg.routing_table().unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.is_contiguous());
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: ProxyConfig = serde_yaml::from_str(
            r#"
listen: "127.0.0.1:7433"
shards:
  - shard_id: 0
    key_low: -100
    key_high: 100
    primary: "host=only"
"#,
        )
        .unwrap();
        assert!(cfg.metrics_listen.is_none());
        assert_eq!(cfg.fanout.policy, FanOutPolicy::FailFast);
        assert_eq!(cfg.health.down_after, 3);
    }
}
