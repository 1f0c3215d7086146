//! Configuration surface for system registration.
//!
//! A topology is a mapping from node group name to an ordered list of
//! backend addresses (`host:port` strings). Group names are classified into
//! the lookup or storage tier by naming convention: any group whose name
//! contains `"lookup"` belongs to the lookup ring, any containing
//! `"storage"` to the storage ring, and anything else is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use crate::ring::Weights;

/// Group name -> ordered backend address list.
///
/// A `BTreeMap` keeps group iteration order stable, so building the same
/// topology twice yields the same rings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node group with its backend addresses.
    pub fn insert(&mut self, group: impl Into<String>, addrs: Vec<String>) -> &mut Self {
        self.groups.insert(group.into(), addrs);
        self
    }

    /// Split the topology into lookup-tier and storage-tier groups.
    ///
    /// Groups matching neither convention are dropped, not errors - a config
    /// file may carry sections this core does not consume.
    pub fn partition_tiers(&self) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let mut lookup = BTreeMap::new();
        let mut storage = BTreeMap::new();

        for (group, addrs) in &self.groups {
            if group.contains("lookup") {
                lookup.insert(group.clone(), addrs.clone());
            } else if group.contains("storage") {
                storage.insert(group.clone(), addrs.clone());
            } else {
                debug!(%group, "ignoring group without lookup/storage classification");
            }
        }

        (lookup, storage)
    }
}
