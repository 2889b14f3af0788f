//! Framed JSON protocol and TCP front-end for the Strata proxy.
//!
//! Frames are a `u32` big-endian length prefix followed by one JSON
//! message. Clients send [`Request`] frames and receive one [`Response`]
//! frame per request, in order.

use std::sync::Arc;

use bytes::BufMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument, warn};

use strata_aggregate::ShardWarning;
use strata_metrics::CONNECTIONS_TOTAL;

pub mod config;
pub mod gateway;

pub use config::ProxyConfig;
pub use gateway::Gateway;

/// Upper bound on a single frame. Anything larger is a protocol error.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Which shard owns this key?
    Route { key: i64 },
    /// Single-shard read, routed by key.
    Query {
        key: i64,
        sql: String,
        #[serde(default)]
        params: Vec<String>,
    },
    /// Single-shard write, routed by key.
    Exec {
        key: i64,
        sql: String,
        #[serde(default)]
        params: Vec<String>,
    },
    /// Cross-shard read against every shard.
    #[serde(rename = "fanout")]
    FanOut {
        sql: String,
        #[serde(default)]
        params: Vec<String>,
    },
    /// Endpoint health as seen by the prober.
    Health,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
        #[serde(default)]
        warnings: Vec<ShardWarning>,
    },
    Count { n: u64 },
    Shard { shard_id: u64, key_low: i64, key_high: i64 },
    Health { endpoints: Vec<EndpointHealth> },
    Error { message: String },
}

/// Read one frame, or `None` on a clean end of stream.
pub async fn read_frame<S, T>(stream: &mut S) -> anyhow::Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Some(serde_json::from_slice(&frame)?))
}

/// Write one frame.
pub async fn write_frame<S, T>(stream: &mut S, msg: &T) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(&data);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Run the proxy server on the given address.
#[instrument(skip(gateway))]
pub async fn run_server(addr: &str, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    info!(%addr, "starting strata proxy");
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (socket, peer) = listener.accept().await?;
        CONNECTIONS_TOTAL.inc();
        let gw = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(socket, gw).await {
                warn!(%peer, "connection error: {e}");
            }
        });
    }
}

async fn handle_conn(mut socket: TcpStream, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    while let Some(req) = read_frame::<_, Request>(&mut socket).await? {
        let resp = gateway.handle(req).await;
        write_frame(&mut socket, &resp).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Request::Query { key: 7, sql: "SELECT 1".into(), params: vec![] };
        write_frame(&mut a, &req).await.unwrap();
        drop(a);
        let got: Request = read_frame(&mut b).await.unwrap().unwrap();
        match got {
            Request::Query { key, sql, params } => {
                assert_eq!(key, 7);
                assert_eq!(sql, "SELECT 1");
                assert!(params.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
        // Clean EOF after the sender is gone.
        assert!(read_frame::<_, Request>(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn request_wire_shape_is_tagged() {
        let json = serde_json::to_value(Request::Route { key: 42 }).unwrap();
        assert_eq!(json["op"], "route");
        let fanout: Request =
            serde_json::from_str(r#"{"op":"fanout","sql":"SELECT count(*) FROM t"}"#).unwrap();
        assert!(matches!(fanout, Request::FanOut { .. }));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&(u32::MAX).to_be_bytes());
        bad.extend_from_slice(b"junk");
        let mut cursor = std::io::Cursor::new(bad);
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(read_frame::<_, Request>(&mut cursor))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
