//! Weighted consistent-hash ring.
//!
//! Implements the classic MD5-based continuum: every node is expanded into a
//! number of virtual replicas proportional to its weight, each replica digest
//! contributes three 32-bit positions on a circle, and a key is owned by the
//! first position at or after the key's own hash (wrapping at the top of the
//! ring). Adding or removing a node therefore only remaps the fraction of
//! keys that fall between the affected positions.
//!
//! The ring is pure and immutable: [`HashRing::build`] does all the work up
//! front and the result can be shared freely between concurrent readers.
//! Rebuilding from the same nodes and weights reproduces the identical
//! position sequence, which the test suite relies on.

use std::collections::HashMap;

use md5::{Digest, Md5};
use tracing::debug;

/// Base number of virtual replicas per node at weight 1.
///
/// A node's replica count is `floor(40 * node_count * weight / total_weight)`,
/// so with equal weights every node gets 40 replicas (120 ring positions).
const REPLICAS_PER_NODE: usize = 40;

/// Each replica digest yields this many ring positions (byte groups 0-3,
/// 4-7 and 8-11 of the 16-byte digest; the last group is unused).
const POSITIONS_PER_REPLICA: usize = 3;

/// Per-node weight map. Nodes absent from the map default to weight 1.
pub type Weights = HashMap<String, f64>;

/// Compute the raw 16-byte MD5 digest of a key.
pub fn md5_digest(key: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Assemble a 32-bit value from four digest bytes at `offset`, little-endian:
/// `b[offset] | b[offset+1] << 8 | b[offset+2] << 16 | b[offset+3] << 24`.
fn le_u32_at(digest: &[u8; 16], offset: usize) -> u32 {
    u32::from_le_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

/// Derive the three ring positions contributed by one replica digest.
///
/// Uses byte offsets 0-3, 4-7 and 8-11; offsets 12-15 are discarded.
pub fn ring_positions(digest: &[u8; 16]) -> [u32; 3] {
    [
        le_u32_at(digest, 0),
        le_u32_at(digest, 4),
        le_u32_at(digest, 8),
    ]
}

/// Derive a key's single ring position from its digest (byte offsets 0-3).
///
/// Note the asymmetry with [`ring_positions`]: ring construction spreads each
/// replica across three positions, key lookup uses only the first group.
pub fn key_position(digest: &[u8; 16]) -> u32 {
    le_u32_at(digest, 0)
}

/// An immutable weighted consistent-hash ring over named nodes.
///
/// ```
/// use nimbus_kv::ring::{HashRing, Weights};
///
/// let ring = HashRing::build(["a", "b", "c"], &Weights::new());
/// let owner = ring.get_node("my_key").expect("ring is not empty");
/// assert_eq!(Some(owner), ring.get_node("my_key"));
/// ```
#[derive(Debug, Clone)]
pub struct HashRing {
    /// All ring positions in ascending order. Duplicate values are possible
    /// (hash collisions) and are kept; they resolve through `slots`.
    positions: Vec<u32>,
    /// Position -> node name. On a cross-node collision the last node
    /// inserted wins, matching plain map semantics.
    slots: HashMap<u32, String>,
    /// Distinct node names in insertion order.
    nodes: Vec<String>,
}

impl HashRing {
    /// Build a ring from a set of node names and an optional weight map.
    ///
    /// Nodes missing from `weights` default to weight 1. Higher weight means
    /// proportionally more replicas and therefore proportionally more keys.
    pub fn build<I, S>(nodes: I, weights: &Weights) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();

        let total_weight: f64 = nodes.iter().map(|n| node_weight(weights, n)).sum();

        let mut positions = Vec::new();
        let mut slots = HashMap::new();

        for node in &nodes {
            let weight = node_weight(weights, node);
            let factor = ((REPLICAS_PER_NODE * nodes.len()) as f64 * weight / total_weight)
                .floor() as usize;

            for replica in 0..factor {
                let digest = md5_digest(&format!("{node}-{replica}"));
                for position in ring_positions(&digest) {
                    slots.insert(position, node.clone());
                    positions.push(position);
                }
            }
        }

        positions.sort_unstable();
        debug!(
            nodes = nodes.len(),
            positions = positions.len(),
            "built hash ring"
        );

        Self {
            positions,
            slots,
            nodes,
        }
    }

    /// True when the ring holds no positions at all.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of distinct nodes the ring was built from.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The sorted position sequence, exposed for determinism checks.
    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Resolve the node owning `key`, or `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        let index = self.position_index(key)?;
        self.node_at(index)
    }

    /// Distinct node names in ring order starting at `key`'s resolved
    /// position and wrapping around the circle exactly once.
    ///
    /// Each node appears exactly once (first occurrence kept), so the result
    /// is a preference order over all configured nodes for this key.
    pub fn iterate_nodes(&self, key: &str) -> Vec<&str> {
        let Some(start) = self.position_index(key) else {
            return Vec::new();
        };

        let mut ordered: Vec<&str> = Vec::with_capacity(self.nodes.len());
        let len = self.positions.len();
        for step in 0..len {
            if let Some(node) = self.node_at((start + step) % len) {
                if !ordered.contains(&node) {
                    ordered.push(node);
                }
            }
        }
        ordered
    }

    /// Index of the first position strictly greater than the key's own
    /// position, wrapping to 0 past the end. `None` on an empty ring.
    fn position_index(&self, key: &str) -> Option<usize> {
        if self.positions.is_empty() {
            return None;
        }

        let target = key_position(&md5_digest(key));
        let index = self.positions.partition_point(|&p| p <= target);
        if index == self.positions.len() {
            Some(0)
        } else {
            Some(index)
        }
    }

    fn node_at(&self, index: usize) -> Option<&str> {
        self.slots
            .get(&self.positions[index])
            .map(String::as_str)
    }
}

fn node_weight(weights: &Weights, node: &str) -> f64 {
    weights.get(node).copied().unwrap_or(1.0)
}
