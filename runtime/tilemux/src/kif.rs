//! Kernel interface: selectors, requests and replies
//!
//! Requests and replies are `serde` types encoded with `bincode`, which gives
//! a fixed little-endian layout: a 4-byte variant index followed by the
//! arguments in declaration order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tcu::Label;

use crate::cap::Selector;
use crate::error::{Code, Error, Result};

/// Tile capability of every activity
pub const SEL_TILE: Selector = 0;
/// Kernel memory capability of every activity
pub const SEL_KMEM: Selector = 1;
/// Every activity's capability to itself
pub const SEL_ACT: Selector = 2;
/// First selector not preassigned
pub const FIRST_FREE_SEL: Selector = 3;
/// "No capability", e.g. to unbind an endpoint
pub const INVALID_SEL: Selector = 0xFFFF;
/// Selector of the first endpoint capability in a multiplexer's table
pub const FIRST_EP_SEL: Selector = 0x1_0000;

static_assertions::const_assert!(FIRST_FREE_SEL > SEL_ACT);
static_assertions::const_assert!(FIRST_EP_SEL > tcu::ActId::MAX as Selector);

bitflags::bitflags! {
    /// Flags of [`Syscall::Activate`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActivateFlags: u32 {
        /// Wait for the receive gate of a send gate to be activated
        const WAIT = 1;
    }
}

/// A range of capability selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRngDesc {
    pub start: Selector,
    pub count: u64,
}

impl CapRngDesc {
    pub fn new(start: Selector, count: u64) -> Self {
        Self { start, count }
    }

    /// Single selector
    pub fn one(sel: Selector) -> Self {
        Self::new(sel, 1)
    }

    /// The selectors of the range, or `None` if it overflows
    pub fn selectors(&self) -> Option<core::ops::Range<Selector>> {
        let end = self.start.checked_add(self.count)?;
        Some(self.start..end)
    }
}

/// System call of an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syscall {
    CreateRGate { dst: Selector, order: u8, msg_order: u8 },
    CreateSGate { dst: Selector, rgate: Selector, label: Label, credits: u32 },
    CreateSrv { dst: Selector, rgate: Selector, name: String },
    CreateSess { dst: Selector, srv: Selector, ident: u64 },
    CreateSem { dst: Selector, value: u32 },
    /// Allocate an endpoint for activity `act`; replies the endpoint id
    AllocEp { dst: Selector, act: Selector },
    Activate { ep: Selector, gate: Selector, rbuf_addr: u64, flags: u32 },
    DeriveMem { act: Selector, dst: Selector, src: Selector, offset: u64, size: u64, perms: u32 },
    DeriveKMem { kmem: Selector, dst: Selector, quota: u64 },
    DeriveTile { tile: Selector, dst: Selector, eps: u32 },
    Derive { act: Selector, src: Selector, dst: Selector },
    Revoke { act: Selector, crd: CapRngDesc, own: bool },
    Exchange { act: Selector, own: CapRngDesc, other: CapRngDesc, obtain: bool },
    /// Replies the number of free endpoints of the tile object
    TileQuota { tile: Selector },
    Noop,
}

/// Privileged call of a tile's multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PemuxCall {
    /// Bind `gate_sel` of activity `act_sel` to endpoint `ep_sel`
    Activate { act_sel: Selector, gate_sel: Selector, ep_sel: Selector, addr: u64 },
}

/// Reply to every call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub error: u32,
    pub value: u64,
}

impl Reply {
    pub fn ok(value: u64) -> Self {
        Self {
            error: Code::Success.raw(),
            value,
        }
    }

    pub fn err(code: Code) -> Self {
        Self {
            error: code.raw(),
            value: 0,
        }
    }

    pub fn code(&self) -> Code {
        Code::from_raw(self.error)
    }

    pub fn is_ok(&self) -> bool {
        self.code() == Code::Success
    }

    /// The value on success, the error code otherwise
    pub fn into_result(self) -> Result<u64> {
        match self.code() {
            Code::Success => Ok(self.value),
            code => Err(code.into()),
        }
    }
}

impl From<Result<u64>> for Reply {
    fn from(res: Result<u64>) -> Self {
        match res {
            Ok(value) => Reply::ok(value),
            Err(e) => Reply::err(e.code()),
        }
    }
}

/// Encode a message
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|_| Error::new(Code::InvArgs, "unencodable message"))
}

/// Decode a message
///
/// # Errors
///
/// Returns `InvArgs` for truncated messages and unknown opcodes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|_| Error::new(Code::InvArgs, "malformed message"))
}
