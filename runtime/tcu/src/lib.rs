//! Tile Communication Unit (TCU) model
//!
//! # Purpose
//! Describes the endpoint register file of a tile's communication unit and
//! provides an in-memory implementation of it for tests and simulation.
//!
//! # Integration Points
//! - Depends on: nothing but the register layout below
//! - Provides to: the per-tile endpoint multiplexer (the only writer)
//!
//! # Architecture
//! Every endpoint occupies [`EP_REGS`] 64-bit registers. The first register
//! holds the endpoint type and the owning activity, the remaining ones depend
//! on the type (see [`regs`]). Privileged software writes whole register
//! images; unprivileged software only issues commands (`send`, `ack`) that
//! operate on an already configured endpoint.
//!
//! # Testing Strategy
//! - Unit tests: register encoding, credit accounting, forced invalidation
//! - Integration tests: exercised through the `tilemux` crate

use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;

pub mod mock;
pub mod regs;

pub use mock::MockTcu;
pub use regs::{EpConfig, MemEp, RecvEp, SendEp};

/// Endpoint index within a tile
pub type EpId = u16;

/// Tile identifier within the platform
pub type TileId = u16;

/// Activity identifier as stored in endpoint registers
pub type ActId = u16;

/// Opaque value delivered with every message sent over a send endpoint
pub type Label = u64;

/// One endpoint register
pub type Reg = u64;

/// Number of registers per endpoint
pub const EP_REGS: usize = 3;

/// Upper bound for the number of endpoints per tile supported by the layout
pub const MAX_EPS: usize = 256;

/// Credit value meaning "no limit"
pub const UNLIM_CREDITS: u8 = 0x3F;

/// Marker for "no endpoint"
pub const INVALID_EP: EpId = 0xFFFF;

/// Activity id used for endpoints of the tile multiplexer itself
pub const TILEMUX_ACT: ActId = 0xFFFE;

/// Marker for "no activity"
pub const INVALID_ACT: ActId = 0xFFFF;

/// Send endpoint of the tile multiplexer's privileged channel
pub const KPEX_SEP: EpId = 4;

/// Receive endpoint of the tile multiplexer's privileged channel
pub const KPEX_REP: EpId = 5;

/// Order of the privileged channel's receive buffer (one message slot)
pub const KPEX_RBUF_ORDER: u8 = 6;

/// First endpoint that is not reserved for the standard channels
pub const FIRST_FREE_EP: EpId = 8;

/// Default number of endpoints per tile
pub const EP_COUNT: usize = 64;

/// Default number of message header slots per tile
pub const HEADER_COUNT: u32 = 1024;

const_assert_eq!(EP_REGS, 3);
const_assert!(KPEX_SEP < FIRST_FREE_EP);
const_assert!(KPEX_REP < FIRST_FREE_EP);
const_assert!((FIRST_FREE_EP as usize) < EP_COUNT);
const_assert!(EP_COUNT <= MAX_EPS);
const_assert!(UNLIM_CREDITS < 64);
const_assert!(HEADER_COUNT <= u16::MAX as u32);

bitflags::bitflags! {
    /// Access permissions of a memory endpoint
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const R = 1;
        const W = 2;
        const X = 4;
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

/// Errors reported by the communication unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TcuError {
    #[error("endpoint {ep} does not exist")]
    InvalidEp { ep: EpId },

    #[error("endpoint {ep} is not a send endpoint")]
    NoSep { ep: EpId },

    #[error("endpoint {ep} belongs to activity {owner}, current is {cur}")]
    ForeignEp { ep: EpId, owner: ActId, cur: ActId },

    #[error("no credits left on endpoint {ep}")]
    NoCredits { ep: EpId },

    #[error("endpoint {ep} has unacknowledged messages in flight")]
    Busy { ep: EpId },

    #[error("malformed register image for endpoint {ep}")]
    BadRegs { ep: EpId },
}

/// Endpoint register file of one tile
///
/// The privileged part (`write_ep`, `invalidate_ep`, `xchg_act`) must only
/// be used by the tile's multiplexer.
pub trait TcuRegs {
    /// Number of endpoints of this unit
    fn ep_count(&self) -> usize;

    /// Read the raw register image of an endpoint
    fn read_ep(&self, ep: EpId) -> Result<[Reg; EP_REGS], TcuError>;

    /// Overwrite the register image of an endpoint
    fn write_ep(&mut self, ep: EpId, regs: [Reg; EP_REGS]) -> Result<(), TcuError>;

    /// Invalidate an endpoint
    ///
    /// Without `force`, this fails with [`TcuError::Busy`] while a send
    /// endpoint has credits in flight.
    fn invalidate_ep(&mut self, ep: EpId, force: bool) -> Result<(), TcuError>;

    /// Exchange the current activity, returning the previous one
    fn xchg_act(&mut self, act: ActId) -> ActId;

    /// Send one message over a send endpoint (consumes a credit)
    fn send(&mut self, ep: EpId) -> Result<(), TcuError>;

    /// Acknowledge a message sent over `ep` (returns a credit)
    fn ack(&mut self, ep: EpId) -> Result<(), TcuError>;

    /// Decode the current configuration of an endpoint
    fn config(&self, ep: EpId) -> Result<EpConfig, TcuError> {
        let regs = self.read_ep(ep)?;
        EpConfig::decode(ep, regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_subsets() {
        assert!(Perm::RWX.contains(Perm::RW));
        assert!(!Perm::R.contains(Perm::W));
        assert_eq!(Perm::from_bits_truncate(0xFF), Perm::RWX);
    }

    #[test]
    fn test_error_messages_name_the_endpoint() {
        let e = TcuError::Busy { ep: 9 };
        assert_eq!(e.to_string(), "endpoint 9 has unacknowledged messages in flight");
    }
}
