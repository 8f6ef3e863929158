//! Capabilities and the derivation forest
//!
//! ## Design
//!
//! All capabilities of a kernel live in one arena ([`CapSpace`]) and are
//! addressed by [`NodeId`]. Each node stores the indices of its parent, its
//! first child and its next sibling, so derivation links never involve
//! language-level references:
//!
//! ```text
//!   root ──first_child──▶ a ──next_sibling──▶ b
//!                         │
//!                         └─first_child──▶ c
//! ```
//!
//! The arena also owns the per-owner [`CapTable`]s. Removing a node always
//! removes its table entry in the same step, so a table never refers to a
//! dead node.
//!
//! ## Revocation
//!
//! `revoke` collects the subtree iteratively and removes descendants before
//! their ancestors. The removed capabilities are handed back to the caller,
//! which releases the referenced objects and performs side effects such as
//! endpoint invalidation. Revoking an absent selector is a no-op.

use std::collections::BTreeMap;

use bitflags::bitflags;
use tcu::{ActId, TileId};

use crate::captable::CapTable;
use crate::error::{Code, Error, Result};
use crate::objects::ObjId;

/// Index into an owner's capability table
pub type Selector = u64;

/// Stable index of a capability node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Holder of a capability table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Owner {
    /// An activity's own table
    Activity(ActId),
    /// The system table of a tile's endpoint multiplexer
    TileMux(TileId),
}

/// Kind of object a capability refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapKind {
    Activity,
    Tile,
    EndPoint,
    RGate,
    SGate,
    MGate,
    Service,
    Session,
    Sem,
    KMem,
}

impl CapKind {
    pub fn is_gate(self) -> bool {
        matches!(self, CapKind::RGate | CapKind::SGate | CapKind::MGate)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapFlags: u8 {
        /// Survives the owner's teardown: detached instead of revoked
        const KEEP = 1;
    }
}

/// A capability node
#[derive(Debug, Clone)]
pub struct Capability {
    pub owner: Owner,
    pub sel: Selector,
    pub kind: CapKind,
    pub obj: ObjId,
    pub flags: CapFlags,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

impl Capability {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn has_children(&self) -> bool {
        self.first_child.is_some()
    }

    pub fn keep(&self) -> bool {
        self.flags.contains(CapFlags::KEEP)
    }
}

/// A capability removed from the arena, with the id it had
#[derive(Debug, Clone)]
pub struct Removed {
    pub id: NodeId,
    pub cap: Capability,
}

/// Arena of all capability nodes plus the tables indexing them
#[derive(Debug, Default)]
pub struct CapSpace {
    nodes: Vec<Option<Capability>>,
    free: Vec<u32>,
    tables: BTreeMap<Owner, CapTable>,
}

impl CapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table for `owner`
    ///
    /// # Errors
    ///
    /// Returns `Exists` if the owner already has a table.
    pub fn create_table(&mut self, owner: Owner) -> Result<()> {
        if self.tables.contains_key(&owner) {
            return Err(Error::new(Code::Exists, "table exists"));
        }
        self.tables.insert(owner, CapTable::new(owner));
        Ok(())
    }

    /// Drop the table of `owner`; fails with `InvArgs` unless it is empty
    pub fn remove_table(&mut self, owner: Owner) -> Result<()> {
        match self.tables.get(&owner) {
            Some(t) if !t.is_empty() => Err(Error::new(Code::InvArgs, "table not empty")),
            Some(_) => {
                self.tables.remove(&owner);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn table(&self, owner: Owner) -> Option<&CapTable> {
        self.tables.get(&owner)
    }

    /// Number of live capabilities
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: NodeId) -> Option<&Capability> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Capability> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn lookup(&self, owner: Owner, sel: Selector) -> Option<NodeId> {
        self.tables.get(&owner)?.get(sel)
    }

    pub fn get(&self, owner: Owner, sel: Selector) -> Option<&Capability> {
        self.node(self.lookup(owner, sel)?)
    }

    /// Look up a capability and check its kind
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` if the selector is empty or holds another kind.
    pub fn get_kind(&self, owner: Owner, sel: Selector, kind: CapKind) -> Result<(NodeId, &Capability)> {
        let id = self
            .lookup(owner, sel)
            .ok_or(Error::new(Code::InvArgs, "empty selector"))?;
        match self.node(id) {
            Some(cap) if cap.kind == kind => Ok((id, cap)),
            _ => Err(Error::new(Code::InvArgs, "capability of wrong kind")),
        }
    }

    /// True if `owner` has a table and `sel` is free in it
    pub fn is_free(&self, owner: Owner, sel: Selector) -> bool {
        self.tables.get(&owner).map_or(false, |t| t.is_free(sel))
    }

    fn alloc_node(&mut self, cap: Capability) -> NodeId {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(cap);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(cap));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn check_slot(&self, owner: Owner, sel: Selector) -> Result<()> {
        match self.tables.get(&owner) {
            None => Err(Error::new(Code::ActGone, "no such table")),
            Some(t) if !t.is_free(sel) => Err(Error::new(Code::InvArgs, "selector occupied")),
            Some(_) => Ok(()),
        }
    }

    /// Insert a capability without parent
    pub fn insert_root(
        &mut self,
        owner: Owner,
        sel: Selector,
        kind: CapKind,
        obj: ObjId,
        flags: CapFlags,
    ) -> Result<NodeId> {
        self.check_slot(owner, sel)?;
        let id = self.alloc_node(Capability {
            owner,
            sel,
            kind,
            obj,
            flags,
            parent: None,
            first_child: None,
            next_sibling: None,
        });
        self.tables.get_mut(&owner).map(|t| t.insert(sel, id)).transpose()?;
        log::trace!(target: "tilemux::caps", "{:?}:{} = {:?} (root)", owner, sel, kind);
        Ok(id)
    }

    /// Insert a capability as child of `parent`
    ///
    /// The child may reference a different object than its parent (e.g. a
    /// memory sub-range); it is revoked together with the parent either way.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        owner: Owner,
        sel: Selector,
        kind: CapKind,
        obj: ObjId,
        flags: CapFlags,
    ) -> Result<NodeId> {
        let first = self
            .node(parent)
            .ok_or(Error::new(Code::InvArgs, "parent gone"))?
            .first_child;
        self.check_slot(owner, sel)?;
        let id = self.alloc_node(Capability {
            owner,
            sel,
            kind,
            obj,
            flags,
            parent: Some(parent),
            first_child: None,
            next_sibling: first,
        });
        if let Some(p) = self.node_mut(parent) {
            p.first_child = Some(id);
        }
        self.tables.get_mut(&owner).map(|t| t.insert(sel, id)).transpose()?;
        log::trace!(target: "tilemux::caps", "{:?}:{} = {:?} (child of {:?})", owner, sel, kind, parent);
        Ok(id)
    }

    /// Derive an alias of `(owner, sel)` into `(dst_owner, dst_sel)`
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` if the source is absent or the destination occupied.
    pub fn derive(
        &mut self,
        owner: Owner,
        sel: Selector,
        dst_owner: Owner,
        dst_sel: Selector,
    ) -> Result<NodeId> {
        let parent = self
            .lookup(owner, sel)
            .ok_or(Error::new(Code::InvArgs, "empty selector"))?;
        let (kind, obj) = match self.node(parent) {
            Some(cap) => (cap.kind, cap.obj),
            None => return Err(Error::new(Code::InvArgs, "empty selector")),
        };
        self.insert_child(parent, dst_owner, dst_sel, kind, obj, CapFlags::empty())
    }

    /// Node ids of the subtree rooted at `root`, descendants before ancestors
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(cap) = self.node(id) else { continue };
            order.push(id);
            let mut child = cap.first_child;
            while let Some(c) = child {
                stack.push(c);
                child = self.node(c).and_then(|n| n.next_sibling);
            }
        }
        order.reverse();
        order
    }

    /// Revoke `(owner, sel)`
    ///
    /// With `include_self` the capability is removed together with all its
    /// descendants, otherwise only the descendants are. Returns the removed
    /// capabilities, descendants first. An empty selector yields an empty
    /// list.
    pub fn revoke(&mut self, owner: Owner, sel: Selector, include_self: bool) -> Vec<Removed> {
        let Some(root) = self.lookup(owner, sel) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        if include_self {
            self.unlink(root);
            for id in self.subtree(root) {
                removed.extend(self.take(id));
            }
        } else {
            let mut child = self.node(root).and_then(|n| n.first_child);
            while let Some(c) = child {
                child = self.node(c).and_then(|n| n.next_sibling);
                for id in self.subtree(c) {
                    removed.extend(self.take(id));
                }
            }
            if let Some(r) = self.node_mut(root) {
                r.first_child = None;
            }
        }

        log::debug!(
            target: "tilemux::caps",
            "revoke {:?}:{} (self={}): {} capabilities removed",
            owner,
            sel,
            include_self,
            removed.len()
        );
        removed
    }

    /// Remove `(owner, sel)` but keep its descendants
    ///
    /// The children are handed over to the removed node's parent, or become
    /// roots if it had none.
    pub fn detach(&mut self, owner: Owner, sel: Selector) -> Option<Removed> {
        let id = self.lookup(owner, sel)?;
        let parent = self.node(id)?.parent;
        self.unlink(id);

        let mut child = self.node(id)?.first_child;
        while let Some(c) = child {
            child = self.node(c).and_then(|n| n.next_sibling);
            let next = match parent {
                Some(p) => self.node(p).and_then(|n| n.first_child),
                None => None,
            };
            if let Some(n) = self.node_mut(c) {
                n.parent = parent;
                n.next_sibling = next;
            }
            if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
                p.first_child = Some(c);
            }
        }

        log::debug!(target: "tilemux::caps", "detach {:?}:{}", owner, sel);
        self.take(id)
    }

    /// Remove `id` from its parent's child list
    fn unlink(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).and_then(|n| n.parent) else {
            return;
        };
        let next = self.node(id).and_then(|n| n.next_sibling);

        let mut prev: Option<NodeId> = None;
        let mut cur = self.node(parent).and_then(|n| n.first_child);
        while let Some(c) = cur {
            if c == id {
                match prev.and_then(|p| self.node_mut(p)) {
                    Some(p) => p.next_sibling = next,
                    None => {
                        if let Some(p) = self.node_mut(parent) {
                            p.first_child = next;
                        }
                    }
                }
                break;
            }
            prev = Some(c);
            cur = self.node(c).and_then(|n| n.next_sibling);
        }

        if let Some(n) = self.node_mut(id) {
            n.parent = None;
            n.next_sibling = None;
        }
    }

    /// Take a node out of the arena and its table
    fn take(&mut self, id: NodeId) -> Option<Removed> {
        let cap = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        if let Some(t) = self.tables.get_mut(&cap.owner) {
            t.remove(cap.sel);
        }
        Some(Removed { id, cap })
    }
}
