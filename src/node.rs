//! Node contract and the remote node wrapper.
//!
//! The routing core never talks to a storage backend directly; it only sees
//! the [`KvNode`] trait. Production code supplies a wire client through the
//! [`Transport`]/[`Connection`] seam and wraps it in a [`RemoteNode`], which
//! adds the pieces the router relies on: a stable identity, per-address
//! connection caching, bounded address failover, and per-call timeouts.
//! Tests implement [`KvNode`] directly with an in-memory map.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::ring::md5_digest;

/// Default bound on a single network call (connect or operation).
///
/// A call that exceeds this is treated as a node-level failure, never a hang;
/// no routing operation blocks indefinitely.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// The contract a storage backend must satisfy.
///
/// `identity` is the stable name recorded as an indirection payload, so it
/// must not change for the lifetime of a system. `delete` is idempotent and
/// reports `true` whether or not the key existed.
#[async_trait]
pub trait KvNode: Send + Sync {
    /// Stable name used as the indirection payload.
    fn identity(&self) -> &str;

    /// Fetch a value; `None` is the normal not-found outcome, not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Returns `true` even when the key was absent.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// A live connection to one backend address.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Dials backend addresses. The wire protocol lives entirely behind this
/// trait; the routing core only requires that a successful `connect` yields
/// a usable [`Connection`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection + 'static;

    async fn connect(&self, addr: &str) -> Result<Self::Conn>;
}

/// Process-wide cache of connections, keyed by backend address.
///
/// Connections are established lazily on first use and shared by every node
/// that routes through the same address. Reads take the read lock only; a
/// miss connects outside the lock and inserts with a double-check so two
/// racing callers end up sharing one connection.
pub struct ConnectionCache<T: Transport> {
    transport: T,
    conns: RwLock<HashMap<String, Arc<T::Conn>>>,
}

impl<T: Transport> ConnectionCache<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Get the cached connection for `addr`, dialing it first if needed.
    pub async fn acquire(&self, addr: &str) -> Result<Arc<T::Conn>> {
        {
            let conns = self.conns.read().await;
            if let Some(conn) = conns.get(addr) {
                return Ok(conn.clone());
            }
        }

        let fresh = Arc::new(self.transport.connect(addr).await?);

        let mut conns = self.conns.write().await;
        let conn = conns
            .entry(addr.to_string())
            .or_insert_with(|| {
                debug!(%addr, "cached new backend connection");
                fresh
            })
            .clone();
        Ok(conn)
    }

    /// Drop the cached connection for `addr` so the next call redials.
    pub async fn evict(&self, addr: &str) {
        let mut conns = self.conns.write().await;
        if conns.remove(addr).is_some() {
            debug!(%addr, "evicted backend connection");
        }
    }
}

/// A named storage node backed by one or more addresses.
///
/// The primary address for a key is chosen by hashing the key over the
/// address list, so a multi-address node spreads keys across its backends.
/// When the primary cannot be dialed, the remaining addresses are tried in
/// order; only a successful connect is ever returned, and exhausting the
/// list surfaces one error to the caller. Failover never crosses node
/// identities - that would violate key ownership.
pub struct RemoteNode<T: Transport> {
    name: String,
    addrs: Vec<String>,
    cache: Arc<ConnectionCache<T>>,
    op_timeout: Duration,
}

impl<T: Transport> RemoteNode<T> {
    pub fn new(name: impl Into<String>, addrs: Vec<String>, cache: Arc<ConnectionCache<T>>) -> Self {
        Self {
            name: name.into(),
            addrs,
            cache,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the per-call timeout bound.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Index of the primary address for `key`: little-endian assembly of
    /// digest bytes 4-7, modulo the address count.
    fn primary_index(&self, key: &str) -> usize {
        let digest = md5_digest(key);
        let value = u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]);
        value as usize % self.addrs.len()
    }

    /// Resolve a connection for `key`, failing over across the address list.
    async fn conn_for(&self, key: &str) -> Result<(String, Arc<T::Conn>)> {
        if self.addrs.is_empty() {
            bail!("node {} has no configured addresses", self.name);
        }

        let primary = self.primary_index(key);
        let mut last_err = None;

        for attempt in 0..self.addrs.len() {
            let addr = &self.addrs[(primary + attempt) % self.addrs.len()];
            match timeout(self.op_timeout, self.cache.acquire(addr)).await {
                Ok(Ok(conn)) => return Ok((addr.clone(), conn)),
                Ok(Err(err)) => {
                    warn!(node = %self.name, %addr, %err, "connect failed, trying next address");
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(node = %self.name, %addr, "connect timed out, trying next address");
                    last_err = Some(anyhow!("connect to {addr} timed out"));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no reachable address")))
            .map_err(|err| err.context(format!("all addresses failed for node {}", self.name)))
    }

    /// Run one operation with the per-call timeout, evicting the cached
    /// connection on failure so the next call redials.
    async fn bounded<R>(
        &self,
        addr: &str,
        call: impl std::future::Future<Output = Result<R>>,
    ) -> Result<R> {
        let outcome = match timeout(self.op_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("call to node {} via {addr} timed out", self.name)),
        };
        if outcome.is_err() {
            self.cache.evict(addr).await;
        }
        outcome
    }
}

#[async_trait]
impl<T: Transport> KvNode for RemoteNode<T> {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (addr, conn) = self.conn_for(key).await?;
        self.bounded(&addr, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let (addr, conn) = self.conn_for(key).await?;
        self.bounded(&addr, conn.set(key, value)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let (addr, conn) = self.conn_for(key).await?;
        self.bounded(&addr, conn.delete(key)).await
    }
}
