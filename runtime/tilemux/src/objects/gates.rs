//! Gate objects
//!
//! Gates are the communication rights referenced by capabilities. Apart from
//! the activation state they are immutable once created.

use tcu::{ActId, EpId, Label, Perm, TileId, UNLIM_CREDITS};

use super::ObjId;
use crate::ep::EpHandle;
use crate::error::{Code, Error, Result};

/// Largest supported receive buffer order
pub const MAX_RBUF_ORDER: u8 = 31;

/// Largest number of slots per receive buffer, as log2
pub const MAX_SLOTS_ORDER: u8 = 15;

/// Receive gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RGateObject {
    /// log2 of the buffer size
    pub order: u8,
    /// log2 of the message slot size
    pub msg_order: u8,
    /// Buffer address; zero while not activated
    pub addr: u64,
    /// First header slot while activated
    pub header: Option<u16>,
    /// Endpoint the gate is bound to
    pub loc: Option<EpHandle>,
}

impl RGateObject {
    /// # Errors
    ///
    /// Returns `InvArgs` if the buffer cannot hold a single message or the
    /// orders are out of range.
    pub fn new(order: u8, msg_order: u8) -> Result<Self> {
        if msg_order > order {
            return Err(Error::new(Code::InvArgs, "message larger than buffer"));
        }
        if order > MAX_RBUF_ORDER || order - msg_order > MAX_SLOTS_ORDER {
            return Err(Error::new(Code::InvArgs, "receive buffer too large"));
        }
        Ok(Self {
            order,
            msg_order,
            addr: 0,
            header: None,
            loc: None,
        })
    }

    pub fn size(&self) -> u64 {
        1 << self.order
    }

    pub fn slots(&self) -> u32 {
        1 << (self.order - self.msg_order)
    }

    pub fn activated(&self) -> bool {
        self.addr != 0 && self.loc.is_some()
    }

    pub fn bind(&mut self, loc: EpHandle, addr: u64, header: u16) {
        self.loc = Some(loc);
        self.addr = addr;
        self.header = Some(header);
    }

    pub fn unbind(&mut self) {
        self.loc = None;
        self.addr = 0;
        self.header = None;
    }

    /// Where senders to this gate have to send to, if activated
    pub fn target(&self) -> Option<SendTarget> {
        match self.loc {
            Some(loc) if self.addr != 0 => Some(SendTarget {
                tile: loc.tile,
                ep: loc.ep,
                msg_order: self.msg_order,
            }),
            _ => None,
        }
    }
}

/// Destination of a send endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTarget {
    pub tile: TileId,
    pub ep: EpId,
    pub msg_order: u8,
}

/// Send gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SGateObject {
    /// Receive gate messages are delivered to
    pub rgate: ObjId,
    pub label: Label,
    /// Credits, or [`UNLIM_CREDITS`]
    pub credits: u8,
    pub activated: bool,
}

impl SGateObject {
    /// # Errors
    ///
    /// Returns `InvArgs` for zero credits or more than [`UNLIM_CREDITS`].
    pub fn new(rgate: ObjId, label: Label, credits: u32) -> Result<Self> {
        if credits == 0 || credits > UNLIM_CREDITS as u32 {
            return Err(Error::new(Code::InvArgs, "invalid credits"));
        }
        Ok(Self {
            rgate,
            label,
            credits: credits as u8,
            activated: false,
        })
    }

    pub fn unlimited(&self) -> bool {
        self.credits == UNLIM_CREDITS
    }
}

/// Memory gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MGateObject {
    pub tile: TileId,
    pub addr: u64,
    pub size: u64,
    pub perms: Perm,
    /// Activity a derived sub-range was created for
    pub owner_act: Option<ActId>,
}

impl MGateObject {
    pub fn new(tile: TileId, addr: u64, size: u64, perms: Perm) -> Result<Self> {
        if size == 0 || addr.checked_add(size).is_none() {
            return Err(Error::new(Code::InvArgs, "invalid memory region"));
        }
        Ok(Self {
            tile,
            addr,
            size,
            perms,
            owner_act: None,
        })
    }

    /// Describe the sub-range `offset..offset + size` with `perms`
    ///
    /// # Errors
    ///
    /// - `InvArgs` if the range is empty, overflows or exceeds this gate
    /// - `NoPerm` if `perms` is not a subset of this gate's permissions
    pub fn derive(&self, offset: u64, size: u64, perms: Perm, act: ActId) -> Result<Self> {
        let end = offset
            .checked_add(size)
            .ok_or(Error::new(Code::InvArgs, "memory range overflows"))?;
        if size == 0 || end > self.size {
            return Err(Error::new(Code::InvArgs, "memory range out of bounds"));
        }
        if !self.perms.contains(perms) {
            return Err(Error::new(Code::NoPerm, "permissions exceed parent"));
        }
        Ok(Self {
            tile: self.tile,
            addr: self.addr + offset,
            size,
            perms,
            owner_act: Some(act),
        })
    }
}
