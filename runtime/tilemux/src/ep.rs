//! Endpoint objects
//!
//! An [`EpObject`] records how one physical endpoint of a tile is currently
//! used: which activity it was allocated to and which gate it is bound to.
//! The register contents themselves are owned by the tile's
//! [`crate::pemux::PeMux`].

use tcu::{ActId, EpId, TileId};

use crate::cap::NodeId;
use crate::objects::ObjId;

/// Names a physical endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpHandle {
    pub tile: TileId,
    pub ep: EpId,
}

/// Binding of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpState {
    #[default]
    Unconfigured,
    Send { sgate: ObjId },
    Receive { rgate: ObjId },
    Memory { mgate: ObjId, offset: u64 },
}

impl EpState {
    /// Gate the endpoint is bound to
    pub fn gate(&self) -> Option<ObjId> {
        match *self {
            EpState::Unconfigured => None,
            EpState::Send { sgate } => Some(sgate),
            EpState::Receive { rgate } => Some(rgate),
            EpState::Memory { mgate, .. } => Some(mgate),
        }
    }
}

/// Bookkeeping for one physical endpoint
#[derive(Debug, Clone)]
pub struct EpObject {
    pub tile: TileId,
    pub ep: EpId,
    pub state: EpState,
    /// Activity the endpoint is allocated to
    pub owner: Option<ActId>,
    /// Capability through which it was allocated
    pub alloc_cap: Option<NodeId>,
    /// Tile object the allocation was charged to
    pub quota: Option<ObjId>,
}

impl EpObject {
    pub fn new(tile: TileId, ep: EpId) -> Self {
        Self {
            tile,
            ep,
            state: EpState::Unconfigured,
            owner: None,
            alloc_cap: None,
            quota: None,
        }
    }

    pub fn handle(&self) -> EpHandle {
        EpHandle {
            tile: self.tile,
            ep: self.ep,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state != EpState::Unconfigured
    }

    pub fn is_allocated(&self) -> bool {
        self.owner.is_some()
    }

    /// True if `act` may bind gates to this endpoint
    pub fn usable_by(&self, act: ActId) -> bool {
        self.owner.map_or(true, |o| o == act)
    }
}
