//! Quota objects
//!
//! Tile objects bound the number of endpoints an activity may allocate,
//! kernel-memory objects bound the kernel memory spent on its behalf. Both
//! can be split: the derived object takes its quota from the parent and
//! returns it when destroyed.

use tcu::TileId;

use super::ObjId;
use crate::error::{Code, Error, Result};

/// Endpoint quota on one tile
#[derive(Debug, Clone)]
pub struct TileObject {
    pub tile: TileId,
    /// Endpoints this object may hand out
    pub quota: u32,
    /// Endpoints currently allocated from it
    pub used: u32,
    pub parent: Option<ObjId>,
}

impl TileObject {
    pub fn new(tile: TileId, quota: u32, parent: Option<ObjId>) -> Self {
        Self {
            tile,
            quota,
            used: 0,
            parent,
        }
    }

    pub fn free(&self) -> u32 {
        self.quota - self.used
    }

    /// Take one endpoint from the quota
    pub fn alloc(&mut self) -> Result<()> {
        if self.free() == 0 {
            return Err(Error::new(Code::NoSpace, "endpoint quota exhausted"));
        }
        self.used += 1;
        Ok(())
    }

    pub fn dealloc(&mut self) {
        self.used = self.used.saturating_sub(1);
    }
}

/// Kernel memory quota
#[derive(Debug, Clone)]
pub struct KMemObject {
    /// Quota this object was created with
    pub total: u64,
    /// Quota not yet spent or split off
    pub left: u64,
    pub parent: Option<ObjId>,
}

impl KMemObject {
    pub fn new(total: u64, parent: Option<ObjId>) -> Self {
        Self {
            total,
            left: total,
            parent,
        }
    }
}
