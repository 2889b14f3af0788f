//! Query execution seam for Strata shards.
//!
//! [`ShardExecutor`] is what the router and aggregator dispatch to;
//! [`PgShardExecutor`] backs it with a pooled tokio-postgres endpoint and
//! [`MemoryExecutor`] backs it with a fixed in-memory result for tests and
//! demos.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::warn;

use strata_pool::{Connector, Pool, PoolConfig, PoolError};

/// Text-form query result. NULL cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
    #[error("database: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("unsupported column type {0}")]
    UnsupportedType(String),
    #[error("{0}")]
    Other(String),
}

/// Executes statements against a single shard endpoint.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Run a statement returning rows.
    async fn query(&self, sql: &str, params: &[String]) -> Result<ResultSet, ExecError>;

    /// Run a statement returning an affected-row count.
    async fn execute(&self, sql: &str, params: &[String]) -> Result<u64, ExecError>;
}

/// Pool connector dialing one Postgres endpoint.
pub struct PgConnector {
    dsn: String,
}

impl PgConnector {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self { dsn: dsn.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = Client;

    async fn connect(&self) -> anyhow::Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.dsn, NoTls).await?;
        // Drive the connection until the client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection error: {e}");
            }
        });
        Ok(client)
    }

    fn is_valid(&self, conn: &Client) -> bool {
        !conn.is_closed()
    }
}

/// Postgres-backed shard executor. Each call checks a connection out of
/// the endpoint pool and the guard returns it on every exit path.
pub struct PgShardExecutor {
    pool: Pool<PgConnector>,
}

impl PgShardExecutor {
    pub fn new(dsn: impl Into<String>, config: &PoolConfig) -> Self {
        Self { pool: Pool::new(PgConnector::new(dsn), config) }
    }
}

#[async_trait]
impl ShardExecutor for PgShardExecutor {
    async fn query(&self, sql: &str, params: &[String]) -> Result<ResultSet, ExecError> {
        let conn = self.pool.acquire().await?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = conn.query(sql, &refs).await?;
        rows_to_result_set(&rows)
    }

    async fn execute(&self, sql: &str, params: &[String]) -> Result<u64, ExecError> {
        let conn = self.pool.acquire().await?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        Ok(conn.execute(sql, &refs).await?)
    }
}

fn rows_to_result_set(rows: &[Row]) -> Result<ResultSet, ExecError> {
    let mut out = ResultSet::default();
    if let Some(first) = rows.first() {
        out.columns = first.columns().iter().map(|c| c.name().to_string()).collect();
    }
    for row in rows {
        let mut rec = Vec::with_capacity(row.len());
        for (idx, col) in row.columns().iter().enumerate() {
            rec.push(cell_to_text(row, idx, col.type_())?);
        }
        out.rows.push(rec);
    }
    Ok(out)
}

/// Render one cell as text. The middleware speaks the text protocol, so
/// only the common scalar types need conversions here.
fn cell_to_text(row: &Row, idx: usize, ty: &Type) -> Result<Option<String>, ExecError> {
    let text = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        row.try_get::<_, Option<String>>(idx)?
    } else {
        return Err(ExecError::UnsupportedType(ty.to_string()));
    };
    Ok(text)
}

/// In-memory executor serving a fixed result set and recording every
/// write statement it receives.
pub struct MemoryExecutor {
    result: ResultSet,
    statements: Mutex<Vec<String>>,
}

impl MemoryExecutor {
    pub fn new(result: ResultSet) -> Self {
        Self { result, statements: Mutex::new(Vec::new()) }
    }

    /// Convenience constructor from column names and text rows.
    pub fn with_rows(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        Self::new(ResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        })
    }

    /// Statements seen by `execute`, oldest first.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardExecutor for MemoryExecutor {
    async fn query(&self, _sql: &str, _params: &[String]) -> Result<ResultSet, ExecError> {
        Ok(self.result.clone())
    }

    async fn execute(&self, sql: &str, _params: &[String]) -> Result<u64, ExecError> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: &[&str]) -> Vec<Option<String>> {
        vals.iter().map(|v| Some(v.to_string())).collect()
    }

    #[tokio::test]
    async fn memory_executor_serves_fixed_rows() {
        let exec = MemoryExecutor::with_rows(&["id", "name"], vec![row(&["1", "ada"])]);
        let rs = exec.query("SELECT id, name FROM users", &[]).await.unwrap();
        assert_eq!(rs.columns, vec!["id", "name"]);
        assert_eq!(rs.rows.len(), 1);
    }

    #[tokio::test]
    async fn memory_executor_records_writes() {
        let exec = MemoryExecutor::with_rows(&[], vec![]);
        let n = exec
            .execute("INSERT INTO users VALUES ($1)", &["ada".into()])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(exec.statements(), vec!["INSERT INTO users VALUES ($1)"]);
    }
}
