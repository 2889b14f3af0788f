//! Shard health tracking and failover resolution.
//!
//! A background [`Prober`] TCP-dials every endpoint the directory knows
//! about and feeds a [`HealthBoard`]. Query paths ask the board to
//! [`HealthBoard::resolve`] a descriptor into a live endpoint: the primary
//! while it is up, otherwise the first live replica.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use strata_directory::{Directory, ShardDescriptor, ShardId};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before an endpoint is marked down.
    pub down_after: u32,
    /// Consecutive probe successes before a down endpoint recovers.
    pub up_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { probe_interval_ms: 1000, probe_timeout_ms: 500, down_after: 3, up_after: 2 }
    }
}

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("shard {0} has no live endpoint")]
    ShardUnavailable(ShardId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Up,
    Down,
}

#[derive(Debug, Clone)]
struct EndpointState {
    status: EndpointStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self { status: EndpointStatus::Up, consecutive_failures: 0, consecutive_successes: 0 }
    }
}

/// Per-endpoint health, keyed by endpoint string.
///
/// Endpoints nobody has probed yet count as up: absence of evidence is
/// not treated as failure, matching how an empty cluster boots.
pub struct HealthBoard {
    endpoints: RwLock<HashMap<String, EndpointState>>,
    down_after: u32,
    up_after: u32,
}

impl HealthBoard {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            down_after: config.down_after.max(1),
            up_after: config.up_after.max(1),
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut map = self.endpoints.write().unwrap();
        let state = map.entry(endpoint.to_string()).or_default();
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        if state.status == EndpointStatus::Down && state.consecutive_successes >= self.up_after {
            info!(%endpoint, "endpoint recovered");
            state.status = EndpointStatus::Up;
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut map = self.endpoints.write().unwrap();
        let state = map.entry(endpoint.to_string()).or_default();
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        if state.status == EndpointStatus::Up && state.consecutive_failures >= self.down_after {
            warn!(%endpoint, failures = state.consecutive_failures, "endpoint marked down");
            state.status = EndpointStatus::Down;
        }
    }

    pub fn is_up(&self, endpoint: &str) -> bool {
        self.endpoints
            .read()
            .unwrap()
            .get(endpoint)
            .map(|s| s.status == EndpointStatus::Up)
            .unwrap_or(true)
    }

    /// All tracked endpoints with their status.
    pub fn statuses(&self) -> Vec<(String, EndpointStatus)> {
        self.endpoints
            .read()
            .unwrap()
            .iter()
            .map(|(e, s)| (e.clone(), s.status))
            .collect()
    }

    /// Pick a live endpoint for the shard: primary first, then replicas
    /// in configuration order.
    pub fn resolve<'a>(&self, desc: &'a ShardDescriptor) -> Result<&'a str, FailoverError> {
        if self.is_up(&desc.connection.primary) {
            return Ok(&desc.connection.primary);
        }
        for replica in &desc.connection.replicas {
            if self.is_up(replica) {
                info!(shard_id = desc.shard_id, %replica, "primary down, routing to replica");
                return Ok(replica);
            }
        }
        Err(FailoverError::ShardUnavailable(desc.shard_id))
    }
}

/// Extract `host:port` to TCP-dial from a `host=... port=...` endpoint
/// string. Port defaults to 5432.
fn probe_addr(endpoint: &str) -> Option<String> {
    let mut host = None;
    let mut port = "5432";
    for part in endpoint.split_whitespace() {
        if let Some(v) = part.strip_prefix("host=") {
            host = Some(v);
        } else if let Some(v) = part.strip_prefix("port=") {
            port = v;
        }
    }
    host.map(|h| format!("{h}:{port}"))
}

/// Periodic TCP prober feeding a [`HealthBoard`].
pub struct Prober {
    directory: Directory,
    board: Arc<HealthBoard>,
    interval: Duration,
    probe_timeout: Duration,
}

impl Prober {
    pub fn new(directory: Directory, board: Arc<HealthBoard>, config: &HealthConfig) -> Self {
        Self {
            directory,
            board,
            interval: Duration::from_millis(config.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            let table = self.directory.snapshot();
            for desc in table.shards() {
                for endpoint in desc.endpoints() {
                    match probe_addr(endpoint) {
                        Some(addr) => self.probe(endpoint, &addr).await,
                        None => warn!(%endpoint, "endpoint has no host, cannot probe"),
                    }
                }
            }
            // Jitter keeps probe rounds from synchronizing across proxies.
            let jitter = rand::thread_rng().gen_range(0..=self.interval.as_millis() as u64 / 5);
            sleep(self.interval + Duration::from_millis(jitter)).await;
        }
    }

    async fn probe(&self, endpoint: &str, addr: &str) {
        match timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => self.board.record_success(endpoint),
            _ => {
                debug!(%endpoint, "probe failed");
                self.board.record_failure(endpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_directory::ConnectionInfo;

    fn config(down_after: u32, up_after: u32) -> HealthConfig {
        HealthConfig { down_after, up_after, ..HealthConfig::default() }
    }

    fn desc(primary: &str, replicas: &[&str]) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: 3,
            key_low: 0,
            key_high: 100,
            connection: ConnectionInfo {
                primary: primary.to_string(),
                replicas: replicas.iter().map(|r| r.to_string()).collect(),
            },
        }
    }

    #[test]
    fn down_only_after_consecutive_failures() {
        let board = HealthBoard::new(&config(3, 2));
        board.record_failure("host=a");
        board.record_failure("host=a");
        assert!(board.is_up("host=a"));
        board.record_failure("host=a");
        assert!(!board.is_up("host=a"));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let board = HealthBoard::new(&config(3, 2));
        board.record_failure("host=a");
        board.record_failure("host=a");
        board.record_success("host=a");
        board.record_failure("host=a");
        board.record_failure("host=a");
        assert!(board.is_up("host=a"));
    }

    #[test]
    fn recovery_needs_consecutive_successes() {
        let board = HealthBoard::new(&config(1, 2));
        board.record_failure("host=a");
        assert!(!board.is_up("host=a"));
        board.record_success("host=a");
        assert!(!board.is_up("host=a"));
        board.record_success("host=a");
        assert!(board.is_up("host=a"));
    }

    #[test]
    fn unknown_endpoint_counts_as_up() {
        let board = HealthBoard::new(&HealthConfig::default());
        assert!(board.is_up("host=never-probed"));
    }

    #[test]
    fn resolve_prefers_primary_then_replicas() {
        let board = HealthBoard::new(&config(1, 1));
        let d = desc("host=p", &["host=r1", "host=r2"]);
        assert_eq!(board.resolve(&d).unwrap(), "host=p");

        board.record_failure("host=p");
        assert_eq!(board.resolve(&d).unwrap(), "host=r1");

        board.record_failure("host=r1");
        assert_eq!(board.resolve(&d).unwrap(), "host=r2");

        board.record_failure("host=r2");
        assert!(matches!(board.resolve(&d), Err(FailoverError::ShardUnavailable(3))));
    }

    #[test]
    fn probe_addr_parses_endpoint_strings() {
        assert_eq!(
            probe_addr("host=10.0.0.1 port=5433 user=strata dbname=app"),
            Some("10.0.0.1:5433".to_string())
        );
        assert_eq!(probe_addr("host=db.internal user=x"), Some("db.internal:5432".to_string()));
        assert_eq!(probe_addr("user=x dbname=app"), None);
    }
}
