//! # nimbus-kv
//!
//! The routing core of a distributed key/value store: a weighted
//! consistent-hash ring plus a two-tier lookup/storage indirection scheme
//! that lets key-to-node assignments be relocated without global rehashing,
//! with self-healing read-repair of stale indirection pointers.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`ring`]: the pure, deterministic consistent-hash ring.
//! - [`node`]: the [`KvNode`] contract the core requires from a storage
//!   backend, plus [`RemoteNode`] which layers address failover, connection
//!   caching and call timeouts over a [`Transport`] implementation.
//! - [`router`]: the [`Router`] registry of systems (one lookup ring and
//!   one storage ring each) and the set/get/delete protocol with
//!   bounded-hop indirection search.
//! - [`topology`]: the configuration surface mapping node groups to backend
//!   address lists.
//!
//! ## Getting started
//!
//! Build node tables (any [`KvNode`] implementation works - production code
//! wraps a wire client in [`RemoteNode`]), register a system, and route:
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use nimbus_kv::{KvNode, Router, Weights, DEFAULT_SYSTEM};
//!
//! # async fn run(lookup: HashMap<String, Arc<dyn KvNode>>,
//! #              storage: HashMap<String, Arc<dyn KvNode>>) -> Result<()> {
//! let router = Router::new();
//! router
//!     .add_system(DEFAULT_SYSTEM, lookup, storage, &Weights::new())
//!     .await?;
//!
//! router.set("greeting", b"hello", DEFAULT_SYSTEM).await?;
//! let value = router.get("greeting", DEFAULT_SYSTEM).await?;
//! assert_eq!(value.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod ring;
pub mod router;
pub mod topology;

pub use node::{Connection, ConnectionCache, KvNode, RemoteNode, Transport, DEFAULT_OP_TIMEOUT};
pub use ring::{key_position, md5_digest, ring_positions, HashRing, Weights};
pub use router::{NodeTable, Router, System, CLEANUP_WRITES, DEFAULT_SYSTEM, MAX_LOOKUP_HOPS};
pub use topology::Topology;
