//! Cross-shard fan-out: run one statement against every shard in parallel
//! and merge the partial results.
//!
//! What happens when a shard fails mid-fan-out is a policy decision, not a
//! guess: `fail_fast` fails the whole operation naming the shard,
//! `partial` degrades to the surviving rows plus a warning per lost shard.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

use strata_directory::ShardId;
use strata_exec::{ExecError, ShardExecutor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Any shard error or timeout fails the whole operation.
    #[default]
    FailFast,
    /// Failed shards become warnings; surviving rows are returned.
    Partial,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    pub policy: FanOutPolicy,
    /// Per-shard deadline for one fan-out query.
    pub timeout_ms: u64,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self { policy: FanOutPolicy::FailFast, timeout_ms: 5000 }
    }
}

/// A shard that was skipped while assembling a partial result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardWarning {
    pub shard_id: ShardId,
    pub message: String,
}

/// Merged cross-shard rows. Row order carries no guarantee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub warnings: Vec<ShardWarning>,
}

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("shard {shard_id}: {source}")]
    ShardFailed {
        shard_id: ShardId,
        #[source]
        source: ExecError,
    },
    #[error("shard {shard_id} timed out after {timeout:?}")]
    ShardTimeout { shard_id: ShardId, timeout: Duration },
    #[error("shard {shard_id} task failed: {message}")]
    ShardTask { shard_id: ShardId, message: String },
    #[error("shard {shard_id} returned mismatching columns")]
    ColumnMismatch { shard_id: ShardId },
    #[error("all {0} shards failed")]
    AllShardsFailed(usize),
}

pub struct Aggregator {
    policy: FanOutPolicy,
    per_shard_timeout: Duration,
}

impl Aggregator {
    pub fn new(config: &FanOutConfig) -> Self {
        Self {
            policy: config.policy,
            per_shard_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn policy(&self) -> FanOutPolicy {
        self.policy
    }

    /// Issue `sql` against every listed shard concurrently and merge the
    /// results. One task per shard, joined before returning.
    pub async fn fan_out(
        &self,
        shards: Vec<(ShardId, Arc<dyn ShardExecutor>)>,
        sql: &str,
        params: &[String],
    ) -> Result<AggregatedResult, FanOutError> {
        if shards.is_empty() {
            return Ok(AggregatedResult::default());
        }
        let total = shards.len();
        let mut handles = Vec::with_capacity(total);
        for (shard_id, exec) in shards {
            let sql = sql.to_string();
            let params = params.to_vec();
            let deadline = self.per_shard_timeout;
            handles.push((
                shard_id,
                tokio::spawn(async move { timeout(deadline, exec.query(&sql, &params)).await }),
            ));
        }

        let mut merged = AggregatedResult::default();
        let mut succeeded = 0usize;
        for (shard_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(Ok(rs))) => Ok(rs),
                Ok(Ok(Err(source))) => Err(FanOutError::ShardFailed { shard_id, source }),
                Ok(Err(_elapsed)) => {
                    Err(FanOutError::ShardTimeout { shard_id, timeout: self.per_shard_timeout })
                }
                Err(join_err) => {
                    Err(FanOutError::ShardTask { shard_id, message: join_err.to_string() })
                }
            };
            let outcome = outcome.and_then(|rs| {
                if !rs.columns.is_empty()
                    && !merged.columns.is_empty()
                    && rs.columns != merged.columns
                {
                    Err(FanOutError::ColumnMismatch { shard_id })
                } else {
                    Ok(rs)
                }
            });
            match outcome {
                Ok(rs) => {
                    if merged.columns.is_empty() {
                        merged.columns = rs.columns;
                    }
                    merged.rows.extend(rs.rows);
                    succeeded += 1;
                }
                // A fail-fast return leaves the remaining shard tasks to
                // finish in the background; their results are discarded.
                Err(e) if self.policy == FanOutPolicy::FailFast => return Err(e),
                Err(e) => {
                    warn!(shard_id, "shard skipped during fan-out: {e}");
                    merged.warnings.push(ShardWarning { shard_id, message: e.to_string() });
                }
            }
        }
        if succeeded == 0 {
            return Err(FanOutError::AllShardsFailed(total));
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strata_exec::ResultSet;

    struct StaticExec(ResultSet);

    #[async_trait]
    impl ShardExecutor for StaticExec {
        async fn query(&self, _sql: &str, _params: &[String]) -> Result<ResultSet, ExecError> {
            Ok(self.0.clone())
        }

        async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64, ExecError> {
            Ok(0)
        }
    }

    struct FailingExec;

    #[async_trait]
    impl ShardExecutor for FailingExec {
        async fn query(&self, _sql: &str, _params: &[String]) -> Result<ResultSet, ExecError> {
            Err(ExecError::Other("connection refused".into()))
        }

        async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64, ExecError> {
            Err(ExecError::Other("connection refused".into()))
        }
    }

    struct SlowExec;

    #[async_trait]
    impl ShardExecutor for SlowExec {
        async fn query(&self, _sql: &str, _params: &[String]) -> Result<ResultSet, ExecError> {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(ResultSet::default())
        }

        async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64, ExecError> {
            Ok(0)
        }
    }

    fn rows(columns: &[&str], vals: &[&[&str]]) -> ResultSet {
        ResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vals
                .iter()
                .map(|r| r.iter().map(|v| Some(v.to_string())).collect())
                .collect(),
        }
    }

    fn agg(policy: FanOutPolicy, timeout_ms: u64) -> Aggregator {
        Aggregator::new(&FanOutConfig { policy, timeout_ms })
    }

    fn shard(id: ShardId, exec: impl ShardExecutor + 'static) -> (ShardId, Arc<dyn ShardExecutor>) {
        (id, Arc::new(exec))
    }

    #[tokio::test]
    async fn merges_union_of_shard_rows() {
        let result = agg(FanOutPolicy::FailFast, 1000)
            .fan_out(
                vec![
                    shard(0, StaticExec(rows(&["id"], &[&["1"], &["2"]]))),
                    shard(1, StaticExec(rows(&["id"], &[&["3"]]))),
                ],
                "SELECT id FROM t",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id"]);
        assert_eq!(result.rows.len(), 3);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn fail_fast_names_the_shard() {
        let err = agg(FanOutPolicy::FailFast, 1000)
            .fan_out(
                vec![shard(0, StaticExec(rows(&["id"], &[]))), shard(7, FailingExec)],
                "SELECT id FROM t",
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::ShardFailed { shard_id: 7, .. }));
    }

    #[tokio::test]
    async fn partial_returns_rows_and_warnings() {
        let result = agg(FanOutPolicy::Partial, 1000)
            .fan_out(
                vec![
                    shard(0, StaticExec(rows(&["id"], &[&["1"]]))),
                    shard(1, FailingExec),
                ],
                "SELECT id FROM t",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].shard_id, 1);
    }

    #[tokio::test]
    async fn all_shards_failing_is_an_error_even_partial() {
        let err = agg(FanOutPolicy::Partial, 1000)
            .fan_out(
                vec![shard(0, FailingExec), shard(1, FailingExec)],
                "SELECT 1",
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::AllShardsFailed(2)));
    }

    #[tokio::test]
    async fn slow_shard_counts_as_failed() {
        let result = agg(FanOutPolicy::Partial, 50)
            .fan_out(
                vec![shard(0, StaticExec(rows(&["id"], &[&["1"]]))), shard(1, SlowExec)],
                "SELECT id FROM t",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.warnings[0].shard_id, 1);
        assert!(result.warnings[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn column_mismatch_is_a_shard_failure() {
        let err = agg(FanOutPolicy::FailFast, 1000)
            .fan_out(
                vec![
                    shard(0, StaticExec(rows(&["id"], &[&["1"]]))),
                    shard(1, StaticExec(rows(&["other"], &[&["2"]]))),
                ],
                "SELECT id FROM t",
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::ColumnMismatch { shard_id: 1 }));
    }
}
