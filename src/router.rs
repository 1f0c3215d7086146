//! System registry and the two-ring routing protocol.
//!
//! A *system* pairs a lookup ring with a storage ring over independent node
//! tables. The storage ring says where a key's value would naturally live;
//! the lookup ring holds *indirection pointers* - small records mapping a
//! key to the name of the storage node actually holding it. The indirection
//! layer is what lets storage-side topology changes leave previously placed
//! keys alone: only newly placed keys consult the new assignment.
//!
//! The [`Router`] owns a registry of named systems and implements the
//! protocol on top of the [`KvNode`] contract:
//!
//! - [`set`](Router::set) resolves the owner via
//!   [`locate_node_or_init`](Router::locate_node_or_init) and forwards.
//! - [`get`](Router::get) tries the storage ring's direct assignment first
//!   and falls back to the bounded indirection search.
//! - [`locate_node`](Router::locate_node) walks at most
//!   [`MAX_LOOKUP_HOPS`] lookup candidates and opportunistically repairs a
//!   pointer found off its canonical slot (read-repair).
//! - [`delete`](Router::delete) removes the value and both possible pointer
//!   slots, and always succeeds for absent keys.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::node::{ConnectionCache, KvNode, RemoteNode, Transport};
use crate::ring::{HashRing, Weights};
use crate::topology::Topology;

/// Bound on the indirection search: lookup candidates 0, 1 and 2 are
/// examined, then the search reports not-found. Together with
/// [`CLEANUP_WRITES`] this caps the cost of a lookup at a constant number of
/// node calls while read-repair keeps compacting pointers back to hop 0, so
/// the amortized search cost stays O(1).
pub const MAX_LOOKUP_HOPS: usize = 3;

/// Width of the read-repair pass: `set` on candidate 0 (promote the pointer
/// to its canonical slot), `delete` on candidate 1 (drop the stale copy).
/// Candidates at index 2 and beyond are never written.
pub const CLEANUP_WRITES: usize = 2;

/// System name used by single-system deployments.
pub const DEFAULT_SYSTEM: &str = "default";

/// Node name -> node handle.
pub type NodeTable = HashMap<String, Arc<dyn KvNode>>;

/// One lookup/storage ring pair with its node tables.
///
/// Systems are immutable once built; reconfiguration replaces the whole
/// `Arc<System>` in the registry, so in-flight operations keep a consistent
/// view of whichever generation they started on.
pub struct System {
    lookup_ring: HashRing,
    storage_ring: HashRing,
    lookup_nodes: NodeTable,
    storage_nodes: NodeTable,
}

impl System {
    /// Build both rings from the node tables. Weights apply to ring
    /// placement only; nodes absent from the map get weight 1.
    pub fn new(lookup_nodes: NodeTable, storage_nodes: NodeTable, weights: &Weights) -> Self {
        Self {
            lookup_ring: build_ring(&lookup_nodes, weights),
            storage_ring: build_ring(&storage_nodes, weights),
            lookup_nodes,
            storage_nodes,
        }
    }

    pub fn lookup_ring(&self) -> &HashRing {
        &self.lookup_ring
    }

    pub fn storage_ring(&self) -> &HashRing {
        &self.storage_ring
    }

    /// Lookup nodes in preference order for `key`: ring order starting at
    /// the key's resolved position, each node exactly once.
    pub fn lookup_candidates(&self, key: &str) -> Vec<Arc<dyn KvNode>> {
        self.lookup_ring
            .iterate_nodes(key)
            .into_iter()
            .filter_map(|name| self.lookup_nodes.get(name).cloned())
            .collect()
    }

    /// The storage node `key` hashes to directly, ignoring indirection.
    pub fn storage_node_direct(&self, key: &str) -> Option<Arc<dyn KvNode>> {
        let name = self.storage_ring.get_node(key)?;
        self.storage_nodes.get(name).cloned()
    }

    /// Resolve a storage node by its identity (an indirection payload).
    pub fn storage_node_named(&self, name: &str) -> Option<Arc<dyn KvNode>> {
        self.storage_nodes.get(name).cloned()
    }
}

fn build_ring(nodes: &NodeTable, weights: &Weights) -> HashRing {
    // Sort the names so identical tables always produce identical rings.
    let mut names: Vec<String> = nodes.keys().cloned().collect();
    names.sort_unstable();
    HashRing::build(names, weights)
}

/// Registry of named systems plus the routing operations over them.
///
/// The registry itself is the only mutable state: registration swaps a whole
/// `Arc<System>` under a write lock, while routing operations take the read
/// lock just long enough to clone the `Arc` out.
#[derive(Default)]
pub struct Router {
    systems: RwLock<HashMap<String, Arc<System>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or atomically replace) a system from pre-built node tables.
    pub async fn add_system(
        &self,
        name: impl Into<String>,
        lookup_nodes: NodeTable,
        storage_nodes: NodeTable,
        weights: &Weights,
    ) -> Result<()> {
        let name = name.into();
        let system = Arc::new(System::new(lookup_nodes, storage_nodes, weights));
        debug!(
            system = %name,
            lookup_nodes = system.lookup_nodes.len(),
            storage_nodes = system.storage_nodes.len(),
            "registered system"
        );
        let mut systems = self.systems.write().await;
        systems.insert(name, system);
        Ok(())
    }

    /// Register a system from a topology map, constructing one
    /// [`RemoteNode`] per group over a shared connection cache.
    ///
    /// Groups are classified into tiers by the topology's naming
    /// convention; unclassified groups are ignored.
    pub async fn add_system_from_topology<T: Transport>(
        &self,
        name: impl Into<String>,
        topology: &Topology,
        transport: T,
        weights: &Weights,
    ) -> Result<()> {
        let (lookup_groups, storage_groups) = topology.partition_tiers();
        let cache = Arc::new(ConnectionCache::new(transport));

        let as_table = |groups: std::collections::BTreeMap<String, Vec<String>>| -> NodeTable {
            groups
                .into_iter()
                .map(|(group, addrs)| {
                    let node: Arc<dyn KvNode> =
                        Arc::new(RemoteNode::new(group.clone(), addrs, cache.clone()));
                    (group, node)
                })
                .collect()
        };

        self.add_system(name, as_table(lookup_groups), as_table(storage_groups), weights)
            .await
    }

    /// Fetch the system registered under `name`.
    pub async fn system(&self, name: &str) -> Result<Arc<System>> {
        let systems = self.systems.read().await;
        systems
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no system registered under {name:?}"))
    }

    /// Store `value` under `key`, placing the key's indirection pointer
    /// first if the key is brand new.
    pub async fn set(&self, key: &str, value: &[u8], system_name: &str) -> Result<()> {
        let system = self.system(system_name).await?;
        let node = self.locate_node_or_init_in(&system, key).await?;
        node.set(key, value).await
    }

    /// Fetch `key`'s value. Absent only if both the direct assignment and
    /// the indirection search miss.
    pub async fn get(&self, key: &str, system_name: &str) -> Result<Option<Vec<u8>>> {
        let system = self.system(system_name).await?;

        // Fast path: the common case where the key was never relocated and
        // still lives on its natural storage assignment.
        let direct = system
            .storage_node_direct(key)
            .ok_or_else(|| anyhow!("storage ring for system {system_name:?} is empty"))?;
        if let Some(value) = direct.get(key).await? {
            return Ok(Some(value));
        }

        // Slow path: consult the indirection layer.
        match self.locate_node_in(&system, key).await? {
            Some(node) => node.get(key).await,
            None => Ok(None),
        }
    }

    /// Remove `key`'s value and both possible pointer slots.
    ///
    /// The pointer deletes run unconditionally - deletion is idempotent, so
    /// clearing slots that never held the key is harmless. Deleting an
    /// absent key succeeds.
    pub async fn delete(&self, key: &str, system_name: &str) -> Result<()> {
        let system = self.system(system_name).await?;

        // Resolve the owner before tearing the pointers down, falling back
        // to the direct assignment when indirection knows nothing.
        let storage = match self.locate_node_in(&system, key).await? {
            Some(node) => Some(node),
            None => system.storage_node_direct(key),
        };

        for candidate in system.lookup_candidates(key).iter().take(CLEANUP_WRITES) {
            candidate.delete(key).await?;
        }

        if let Some(node) = storage {
            node.delete(key).await?;
        }
        Ok(())
    }

    /// Bounded indirection search for the storage node owning `key`.
    ///
    /// Returns `None` when no candidate within [`MAX_LOOKUP_HOPS`] holds a
    /// pointer. A pointer found off candidate 0 is stale and triggers
    /// read-repair before the node is returned.
    pub async fn locate_node(
        &self,
        key: &str,
        system_name: &str,
    ) -> Result<Option<Arc<dyn KvNode>>> {
        let system = self.system(system_name).await?;
        self.locate_node_in(&system, key).await
    }

    /// Like [`locate_node`](Router::locate_node), but a miss places the key:
    /// the storage ring's direct assignment is written as a fresh pointer to
    /// lookup candidate 0. This is the only place a new key acquires its
    /// pointer.
    pub async fn locate_node_or_init(
        &self,
        key: &str,
        system_name: &str,
    ) -> Result<Arc<dyn KvNode>> {
        let system = self.system(system_name).await?;
        self.locate_node_or_init_in(&system, key).await
    }

    async fn locate_node_in(
        &self,
        system: &System,
        key: &str,
    ) -> Result<Option<Arc<dyn KvNode>>> {
        let candidates = system.lookup_candidates(key);

        for (hop, candidate) in candidates.iter().take(MAX_LOOKUP_HOPS).enumerate() {
            let Some(payload) = candidate.get(key).await? else {
                continue;
            };
            let pointer =
                String::from_utf8(payload).context("indirection payload is not valid UTF-8")?;

            let resolved = if hop == 0 {
                // Canonical slot, nothing to repair.
                system.storage_node_named(&pointer)
            } else {
                debug!(key, hop, "indirection pointer found off canonical slot, repairing");
                self.clean_up_ring_in(system, key, &pointer).await?
            };

            if resolved.is_none() {
                // The pointer names a storage node the current table does not
                // know, e.g. after a reconfiguration removed it. Treated as
                // not found so locate_node_or_init can re-place the key.
                warn!(key, pointer = %pointer, "dangling indirection pointer");
            }
            return Ok(resolved);
        }

        Ok(None)
    }

    /// Read-repair: promote the pointer to candidate 0, drop the stale copy
    /// on candidate 1, leave everything beyond untouched.
    async fn clean_up_ring_in(
        &self,
        system: &System,
        key: &str,
        pointer: &str,
    ) -> Result<Option<Arc<dyn KvNode>>> {
        let candidates = system.lookup_candidates(key);

        for (slot, candidate) in candidates.iter().take(CLEANUP_WRITES).enumerate() {
            if slot == 0 {
                candidate.set(key, pointer.as_bytes()).await?;
            } else {
                candidate.delete(key).await?;
            }
        }

        Ok(system.storage_node_named(pointer))
    }

    async fn locate_node_or_init_in(
        &self,
        system: &System,
        key: &str,
    ) -> Result<Arc<dyn KvNode>> {
        if let Some(node) = self.locate_node_in(system, key).await? {
            return Ok(node);
        }

        let storage = system
            .storage_node_direct(key)
            .ok_or_else(|| anyhow!("storage ring is empty"))?;
        let first = system
            .lookup_candidates(key)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("lookup ring is empty"))?;

        first.set(key, storage.identity().as_bytes()).await?;
        debug!(key, storage = storage.identity(), "placed pointer for new key");
        Ok(storage)
    }
}
