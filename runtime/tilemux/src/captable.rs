//! Capability tables
//!
//! A table maps the selectors of one owner (an activity or a tile's
//! multiplexer) to nodes of the shared capability arena. The table itself
//! holds no capability data; see [`crate::cap::CapSpace`].

use std::collections::BTreeMap;

use crate::cap::{NodeId, Owner, Selector};
use crate::error::{Code, Error, Result};

/// Selector-to-node mapping of one owner
#[derive(Debug, Clone)]
pub struct CapTable {
    owner: Owner,
    caps: BTreeMap<Selector, NodeId>,
}

impl CapTable {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            caps: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Bind `sel` to `node`
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` if `sel` is already occupied.
    pub fn insert(&mut self, sel: Selector, node: NodeId) -> Result<()> {
        if self.caps.contains_key(&sel) {
            return Err(Error::new(Code::InvArgs, "selector occupied"));
        }
        self.caps.insert(sel, node);
        Ok(())
    }

    pub fn get(&self, sel: Selector) -> Option<NodeId> {
        self.caps.get(&sel).copied()
    }

    pub fn remove(&mut self, sel: Selector) -> Option<NodeId> {
        self.caps.remove(&sel)
    }

    pub fn is_free(&self, sel: Selector) -> bool {
        !self.caps.contains_key(&sel)
    }

    /// True if no selector in `start..start + count` is occupied
    pub fn range_free(&self, start: Selector, count: u64) -> bool {
        match start.checked_add(count) {
            Some(end) => self.caps.range(start..end).next().is_none(),
            None => false,
        }
    }

    /// All occupied selectors in ascending order
    pub fn selectors(&self) -> impl Iterator<Item = Selector> + '_ {
        self.caps.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
