//! Bounded connection pooling for Strata shard endpoints.
//!
//! Checkout hands back a [`PooledConn`] guard; dropping the guard on any
//! exit path (success, error, cancellation) returns the connection to the
//! idle queue and frees its active slot, so a slot can never leak.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per endpoint; extras are closed on release.
    pub max_idle: usize,
    /// Hard cap on live connections per endpoint.
    pub max_active: usize,
    /// How long an acquire waits for a free slot before failing.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 8, max_active: 32, acquire_timeout_ms: 2000 }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: no connection available within {0:?}")]
    Exhausted(Duration),
    #[error("connect: {0}")]
    Connect(#[source] anyhow::Error),
}

/// Factory and validity check for one endpoint's connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Conn>;

    /// Whether a previously pooled connection may be reused.
    fn is_valid(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

struct Inner<C: Connector> {
    connector: C,
    idle: Mutex<VecDeque<C::Conn>>,
    slots: Arc<Semaphore>,
    max_idle: usize,
}

pub struct Pool<C: Connector> {
    inner: Arc<Inner<C>>,
    acquire_timeout: Duration,
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                idle: Mutex::new(VecDeque::new()),
                slots: Arc::new(Semaphore::new(config.max_active)),
                max_idle: config.max_idle,
            }),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    /// Check out a connection, reusing an idle one when possible.
    pub async fn acquire(&self) -> Result<PooledConn<C>, PoolError> {
        let permit = match timeout(self.acquire_timeout, self.inner.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(PoolError::Exhausted(self.acquire_timeout)),
        };
        while let Some(conn) = self.inner.idle.lock().unwrap().pop_front() {
            if self.inner.connector.is_valid(&conn) {
                return Ok(PooledConn { conn: Some(conn), inner: self.inner.clone(), _permit: permit });
            }
            // stale connection: drop it and try the next one
        }
        let conn = self.inner.connector.connect().await.map_err(PoolError::Connect)?;
        Ok(PooledConn { conn: Some(conn), inner: self.inner.clone(), _permit: permit })
    }

    /// Idle connections currently queued.
    pub fn idle_len(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Active slots still available.
    pub fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), acquire_timeout: self.acquire_timeout }
    }
}

/// Checked-out connection. Dereferences to the underlying connection and
/// returns it to the pool when dropped.
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    inner: Arc<Inner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Connector> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.inner.connector.is_valid(&conn) {
                if let Ok(mut idle) = self.inner.idle.lock() {
                    if idle.len() < self.inner.max_idle {
                        idle.push_back(conn);
                    }
                }
            }
        }
        // the permit drops with the guard, freeing an active slot
    }
}
