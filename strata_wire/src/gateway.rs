//! The gateway composes routing, failover resolution, pooled execution,
//! and cross-shard aggregation behind a single request dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};

use strata_aggregate::{Aggregator, FanOutPolicy, ShardWarning};
use strata_directory::{Directory, DirectoryError, RoutingTable, ShardId, ShardKey};
use strata_exec::{PgShardExecutor, ShardExecutor};
use strata_failover::HealthBoard;
use strata_metrics::{FANOUT_TOTAL, QUERIES_TOTAL, QUERY_LATENCY_SECS, ROUTE_MISSES_TOTAL, SHARD_ERRORS_TOTAL};
use strata_router::RouteError;

use crate::config::ProxyConfig;
use crate::{EndpointHealth, Request, Response};

pub struct Gateway {
    directory: Directory,
    board: Arc<HealthBoard>,
    /// One executor per endpoint (primaries and replicas alike).
    executors: HashMap<String, Arc<dyn ShardExecutor>>,
    aggregator: Aggregator,
    policy: FanOutPolicy,
}

impl Gateway {
    /// Build the gateway from configuration: validate the routing table
    /// and open one pooled Postgres executor per distinct endpoint.
    pub fn new(config: &ProxyConfig) -> Result<Self, DirectoryError> {
        let table = config.routing_table()?;
        let mut executors: HashMap<String, Arc<dyn ShardExecutor>> = HashMap::new();
        for desc in table.shards() {
            for endpoint in desc.endpoints() {
                executors.entry(endpoint.to_string()).or_insert_with(|| {
                    Arc::new(PgShardExecutor::new(endpoint, &config.pool)) as Arc<dyn ShardExecutor>
                });
            }
        }
        Ok(Self {
            directory: Directory::new(table),
            board: Arc::new(HealthBoard::new(&config.health)),
            executors,
            aggregator: Aggregator::new(&config.fanout),
            policy: config.fanout.policy,
        })
    }

    /// Assemble a gateway from parts. Used by tests and embedders that
    /// bring their own executors.
    pub fn with_executors(
        table: RoutingTable,
        board: Arc<HealthBoard>,
        executors: HashMap<String, Arc<dyn ShardExecutor>>,
        aggregator: Aggregator,
    ) -> Self {
        let policy = aggregator.policy();
        Self { directory: Directory::new(table), board, executors, aggregator, policy }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn board(&self) -> &Arc<HealthBoard> {
        &self.board
    }

    /// Route `key` to its shard and resolve a live endpoint's executor.
    fn routed_executor(&self, key: ShardKey) -> Result<(ShardId, Arc<dyn ShardExecutor>), String> {
        let table = self.directory.snapshot();
        let desc = table.lookup(key).ok_or_else(|| {
            ROUTE_MISSES_TOTAL.inc();
            RouteError::NoShardForKey { key }.to_string()
        })?;
        let endpoint = self.board.resolve(desc).map_err(|e| e.to_string())?;
        let exec = self
            .executors
            .get(endpoint)
            .cloned()
            .ok_or_else(|| format!("no executor for endpoint {endpoint}"))?;
        Ok((desc.shard_id, exec))
    }

    /// Dispatch one client request. Failures come back as
    /// [`Response::Error`]; the connection stays usable.
    #[instrument(skip(self, req))]
    pub async fn handle(&self, req: Request) -> Response {
        match req {
            Request::Route { key } => {
                let table = self.directory.snapshot();
                match table.lookup(key) {
                    Some(d) => Response::Shard {
                        shard_id: d.shard_id,
                        key_low: d.key_low,
                        key_high: d.key_high,
                    },
                    None => {
                        ROUTE_MISSES_TOTAL.inc();
                        Response::Error { message: RouteError::NoShardForKey { key }.to_string() }
                    }
                }
            }
            Request::Query { key, sql, params } => {
                QUERIES_TOTAL.inc();
                let start = Instant::now();
                let resp = match self.routed_executor(key) {
                    Ok((shard_id, exec)) => match exec.query(&sql, &params).await {
                        Ok(rs) => Response::Rows {
                            columns: rs.columns,
                            rows: rs.rows,
                            warnings: vec![],
                        },
                        Err(e) => {
                            SHARD_ERRORS_TOTAL.with_label_values(&[&shard_id.to_string()]).inc();
                            warn!(shard_id, "query failed: {e}");
                            Response::Error { message: e.to_string() }
                        }
                    },
                    Err(message) => Response::Error { message },
                };
                QUERY_LATENCY_SECS.observe(start.elapsed().as_secs_f64());
                resp
            }
            Request::Exec { key, sql, params } => {
                QUERIES_TOTAL.inc();
                let start = Instant::now();
                let resp = match self.routed_executor(key) {
                    Ok((shard_id, exec)) => match exec.execute(&sql, &params).await {
                        Ok(n) => Response::Count { n },
                        Err(e) => {
                            SHARD_ERRORS_TOTAL.with_label_values(&[&shard_id.to_string()]).inc();
                            warn!(shard_id, "exec failed: {e}");
                            Response::Error { message: e.to_string() }
                        }
                    },
                    Err(message) => Response::Error { message },
                };
                QUERY_LATENCY_SECS.observe(start.elapsed().as_secs_f64());
                resp
            }
            Request::FanOut { sql, params } => {
                FANOUT_TOTAL.inc();
                let start = Instant::now();
                let resp = self.fan_out(&sql, &params).await;
                QUERY_LATENCY_SECS.observe(start.elapsed().as_secs_f64());
                resp
            }
            Request::Health => {
                let endpoints = self
                    .board
                    .statuses()
                    .into_iter()
                    .map(|(endpoint, status)| EndpointHealth {
                        endpoint,
                        up: status == strata_failover::EndpointStatus::Up,
                    })
                    .collect();
                Response::Health { endpoints }
            }
        }
    }

    async fn fan_out(&self, sql: &str, params: &[String]) -> Response {
        let table = self.directory.snapshot();
        let mut targets: Vec<(ShardId, Arc<dyn ShardExecutor>)> = Vec::with_capacity(table.len());
        // Shards with no live endpoint are subject to the same policy as
        // shards that fail mid-query.
        let mut unavailable: Vec<ShardWarning> = Vec::new();
        for desc in table.shards() {
            match self.board.resolve(desc) {
                Ok(endpoint) => match self.executors.get(endpoint) {
                    Some(exec) => targets.push((desc.shard_id, exec.clone())),
                    None => {
                        return Response::Error {
                            message: format!("no executor for endpoint {endpoint}"),
                        }
                    }
                },
                Err(e) => {
                    SHARD_ERRORS_TOTAL.with_label_values(&[&desc.shard_id.to_string()]).inc();
                    if self.policy == FanOutPolicy::FailFast {
                        return Response::Error { message: e.to_string() };
                    }
                    debug!(shard_id = desc.shard_id, "shard excluded from fan-out: {e}");
                    unavailable.push(ShardWarning { shard_id: desc.shard_id, message: e.to_string() });
                }
            }
        }
        if targets.is_empty() {
            return Response::Error { message: format!("all {} shards unavailable", table.len()) };
        }
        match self.aggregator.fan_out(targets, sql, params).await {
            Ok(mut merged) => {
                for w in &merged.warnings {
                    SHARD_ERRORS_TOTAL.with_label_values(&[&w.shard_id.to_string()]).inc();
                }
                merged.warnings.extend(unavailable);
                Response::Rows { columns: merged.columns, rows: merged.rows, warnings: merged.warnings }
            }
            Err(e) => Response::Error { message: e.to_string() },
        }
    }
}
