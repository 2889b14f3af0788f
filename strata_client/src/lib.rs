//! Rust SDK for Strata. Thin wrapper around the framed proxy protocol.

use anyhow::{anyhow, bail};
use tokio::net::TcpStream;

use strata_wire::{read_frame, write_frame, EndpointHealth, Request, Response};

pub use strata_wire::Response as RawResponse;

/// Rows plus any partial-result warnings from a query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub warnings: Vec<String>,
}

/// Strata async client over one proxy connection.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Connect to a proxy (e.g. "127.0.0.1:7433").
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        Ok(Self { stream: TcpStream::connect(addr).await? })
    }

    /// Single-shard read, routed by sharding key.
    pub async fn query(&mut self, key: i64, sql: &str, params: &[&str]) -> anyhow::Result<QueryResult> {
        let req = Request::Query { key, sql: sql.into(), params: owned(params) };
        match self.round_trip(req).await? {
            Response::Rows { columns, rows, warnings } => Ok(QueryResult {
                columns,
                rows,
                warnings: warnings.into_iter().map(|w| w.message).collect(),
            }),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Single-shard write, routed by sharding key. Returns affected rows.
    pub async fn execute(&mut self, key: i64, sql: &str, params: &[&str]) -> anyhow::Result<u64> {
        let req = Request::Exec { key, sql: sql.into(), params: owned(params) };
        match self.round_trip(req).await? {
            Response::Count { n } => Ok(n),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Cross-shard read against every shard.
    pub async fn fan_out(&mut self, sql: &str, params: &[&str]) -> anyhow::Result<QueryResult> {
        let req = Request::FanOut { sql: sql.into(), params: owned(params) };
        match self.round_trip(req).await? {
            Response::Rows { columns, rows, warnings } => Ok(QueryResult {
                columns,
                rows,
                warnings: warnings.into_iter().map(|w| w.message).collect(),
            }),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Which shard id owns this key?
    pub async fn route(&mut self, key: i64) -> anyhow::Result<u64> {
        match self.round_trip(Request::Route { key }).await? {
            Response::Shard { shard_id, .. } => Ok(shard_id),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Endpoint health as seen by the proxy's prober.
    pub async fn health(&mut self) -> anyhow::Result<Vec<EndpointHealth>> {
        match self.round_trip(Request::Health).await? {
            Response::Health { endpoints } => Ok(endpoints),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    async fn round_trip(&mut self, req: Request) -> anyhow::Result<Response> {
        write_frame(&mut self.stream, &req).await?;
        let resp = read_frame::<_, Response>(&mut self.stream)
            .await?
            .ok_or_else(|| anyhow!("proxy closed the connection"))?;
        if let Response::Error { message } = resp {
            bail!("proxy error: {message}");
        }
        Ok(resp)
    }
}

fn owned(params: &[&str]) -> Vec<String> {
    params.iter().map(|p| p.to_string()).collect()
}
