use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use nimbus_kv::{Connection, KvNode, NodeTable, Router, Transport, Weights, DEFAULT_SYSTEM};

/// In-memory node implementing the `KvNode` contract directly, with failure
/// injection and call recording for protocol assertions.
pub struct MemoryNode {
    name: String,
    store: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    set_calls: Mutex<Vec<(String, Vec<u8>)>>,
    get_calls: Mutex<Vec<String>>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            set_calls: Mutex::new(Vec::new()),
            get_calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Read a key directly, bypassing the `KvNode` contract and recording.
    pub async fn peek(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.store.lock().await;
        store.get(key).cloned()
    }

    /// Write a key directly, staging an indirection state for a test.
    pub async fn plant(&self, key: &str, value: &[u8]) {
        let mut store = self.store.lock().await;
        store.insert(key.to_string(), value.to_vec());
    }

    pub async fn set_calls(&self) -> Vec<(String, Vec<u8>)> {
        let calls = self.set_calls.lock().await;
        calls.clone()
    }

    pub async fn get_calls(&self) -> Vec<String> {
        let calls = self.get_calls.lock().await;
        calls.clone()
    }

    fn check_failure(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("injected node failure on {}", self.name))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvNode for MemoryNode {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_failure()?;
        {
            let mut calls = self.get_calls.lock().await;
            calls.push(key.to_string());
        }
        let store = self.store.lock().await;
        Ok(store.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_failure()?;
        {
            let mut calls = self.set_calls.lock().await;
            calls.push((key.to_string(), value.to_vec()));
        }
        let mut store = self.store.lock().await;
        store.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_failure()?;
        let mut store = self.store.lock().await;
        store.remove(key);
        Ok(true)
    }
}

/// A registered system's in-memory nodes, addressable by identity.
pub struct TestSystem {
    pub router: Router,
    pub lookup: HashMap<String, Arc<MemoryNode>>,
    pub storage: HashMap<String, Arc<MemoryNode>>,
}

impl TestSystem {
    /// Build a router with one system under `DEFAULT_SYSTEM` from plain
    /// node-name lists.
    pub async fn new(lookup_names: &[&str], storage_names: &[&str]) -> Self {
        Self::weighted(lookup_names, storage_names, &Weights::new()).await
    }

    pub async fn weighted(
        lookup_names: &[&str],
        storage_names: &[&str],
        weights: &Weights,
    ) -> Self {
        let lookup: HashMap<String, Arc<MemoryNode>> = lookup_names
            .iter()
            .map(|name| (name.to_string(), MemoryNode::new(*name)))
            .collect();
        let storage: HashMap<String, Arc<MemoryNode>> = storage_names
            .iter()
            .map(|name| (name.to_string(), MemoryNode::new(*name)))
            .collect();

        let router = Router::new();
        router
            .add_system(
                DEFAULT_SYSTEM,
                as_node_table(&lookup),
                as_node_table(&storage),
                weights,
            )
            .await
            .expect("system registration succeeds");

        Self {
            router,
            lookup,
            storage,
        }
    }

    /// Lookup nodes in candidate order for `key`, as `MemoryNode` handles.
    pub async fn lookup_candidates(&self, key: &str) -> Vec<Arc<MemoryNode>> {
        let system = self
            .router
            .system(DEFAULT_SYSTEM)
            .await
            .expect("system registered");
        system
            .lookup_candidates(key)
            .iter()
            .map(|node| self.lookup[node.identity()].clone())
            .collect()
    }

    /// Identity of the storage node `key` hashes to directly.
    pub async fn direct_storage_name(&self, key: &str) -> String {
        let system = self
            .router
            .system(DEFAULT_SYSTEM)
            .await
            .expect("system registered");
        system
            .storage_node_direct(key)
            .expect("storage ring is not empty")
            .identity()
            .to_string()
    }
}

pub fn as_node_table(nodes: &HashMap<String, Arc<MemoryNode>>) -> NodeTable {
    nodes
        .iter()
        .map(|(name, node)| (name.clone(), node.clone() as Arc<dyn KvNode>))
        .collect()
}

/// Shared backing state for the in-memory transport: per-address stores,
/// injected connect failures, per-address operation latency, and connect
/// counts for cache assertions.
#[derive(Default)]
pub struct BackendRegistry {
    stores: Mutex<HashMap<String, Arc<Mutex<HashMap<String, Vec<u8>>>>>>,
    failing: Mutex<HashSet<String>>,
    latencies: Mutex<HashMap<String, Duration>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl BackendRegistry {
    pub async fn set_failing(&self, addr: &str, fail: bool) {
        let mut failing = self.failing.lock().await;
        if fail {
            failing.insert(addr.to_string());
        } else {
            failing.remove(addr);
        }
    }

    pub async fn set_latency(&self, addr: &str, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(addr.to_string(), latency);
    }

    pub async fn connect_count(&self, addr: &str) -> usize {
        let connects = self.connects.lock().await;
        connects.get(addr).copied().unwrap_or(0)
    }

    /// Direct view of one address's store.
    pub async fn store_for(&self, addr: &str) -> Arc<Mutex<HashMap<String, Vec<u8>>>> {
        let mut stores = self.stores.lock().await;
        stores.entry(addr.to_string()).or_default().clone()
    }
}

/// In-memory `Transport` whose connections read and write the registry's
/// per-address stores.
#[derive(Clone)]
pub struct MemoryTransport {
    pub registry: Arc<BackendRegistry>,
}

impl MemoryTransport {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

pub struct MemoryConnection {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    latency: Option<Duration>,
}

impl MemoryConnection {
    async fn maybe_sleep(&self) {
        if let Some(delay) = self.latency {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.maybe_sleep().await;
        let store = self.store.lock().await;
        Ok(store.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.maybe_sleep().await;
        let mut store = self.store.lock().await;
        store.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.maybe_sleep().await;
        let mut store = self.store.lock().await;
        store.remove(key);
        Ok(true)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Conn = MemoryConnection;

    async fn connect(&self, addr: &str) -> Result<MemoryConnection> {
        {
            let mut connects = self.registry.connects.lock().await;
            *connects.entry(addr.to_string()).or_insert(0) += 1;
        }
        {
            let failing = self.registry.failing.lock().await;
            if failing.contains(addr) {
                return Err(anyhow!("injected connect failure for {addr}"));
            }
        }
        let latency = {
            let latencies = self.registry.latencies.lock().await;
            latencies.get(addr).copied()
        };
        Ok(MemoryConnection {
            store: self.registry.store_for(addr).await,
            latency,
        })
    }
}
