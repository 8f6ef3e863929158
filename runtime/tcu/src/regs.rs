//! Endpoint register layout
//!
//! ## Register 0 (all types)
//!
//! | bits    | field                      |
//! |---------|----------------------------|
//! | 0..3    | type (0 invalid, 1 send, 2 receive, 3 memory) |
//! | 3..19   | owning activity            |
//!
//! ## Send
//!
//! r0: current credits 19..25, max credits 25..31, message order 31..37.
//! r1: destination tile 0..16, destination endpoint 16..32. r2: label.
//!
//! ## Receive
//!
//! r0: buffer order 19..25, message order 25..31, first header slot 31..47.
//! r1: buffer address. r2: unused.
//!
//! ## Memory
//!
//! r0: permissions 19..23, target tile 23..39. r1: address. r2: size.

use crate::{ActId, EpId, Label, Perm, Reg, TcuError, TileId, EP_REGS};

const TYPE_INVALID: Reg = 0;
const TYPE_SEND: Reg = 1;
const TYPE_RECEIVE: Reg = 2;
const TYPE_MEMORY: Reg = 3;

const fn field(reg: Reg, shift: u32, bits: u32) -> Reg {
    (reg >> shift) & ((1 << bits) - 1)
}

const fn put(value: Reg, shift: u32, bits: u32) -> Reg {
    (value & ((1 << bits) - 1)) << shift
}

/// Send endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendEp {
    pub act: ActId,
    pub label: Label,
    pub tile: TileId,
    pub dst_ep: EpId,
    pub msg_order: u8,
    pub max_credits: u8,
    pub cur_credits: u8,
}

/// Receive endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvEp {
    pub act: ActId,
    pub buffer: u64,
    pub order: u8,
    pub msg_order: u8,
    pub header: u16,
}

impl RecvEp {
    /// Number of message slots of the buffer
    pub fn slots(&self) -> u32 {
        1 << (self.order - self.msg_order)
    }
}

/// Memory endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEp {
    pub act: ActId,
    pub tile: TileId,
    pub addr: u64,
    pub size: u64,
    pub perm: Perm,
}

/// Decoded endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpConfig {
    #[default]
    Invalid,
    Send(SendEp),
    Receive(RecvEp),
    Memory(MemEp),
}

impl EpConfig {
    /// Activity the endpoint belongs to, if configured
    pub fn act(&self) -> Option<ActId> {
        match self {
            EpConfig::Invalid => None,
            EpConfig::Send(s) => Some(s.act),
            EpConfig::Receive(r) => Some(r.act),
            EpConfig::Memory(m) => Some(m.act),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, EpConfig::Invalid)
    }

    /// Encode into the register image written to the unit
    pub fn encode(&self) -> [Reg; EP_REGS] {
        match *self {
            EpConfig::Invalid => [0; EP_REGS],
            EpConfig::Send(s) => [
                TYPE_SEND
                    | put(s.act as Reg, 3, 16)
                    | put(s.cur_credits as Reg, 19, 6)
                    | put(s.max_credits as Reg, 25, 6)
                    | put(s.msg_order as Reg, 31, 6),
                put(s.tile as Reg, 0, 16) | put(s.dst_ep as Reg, 16, 16),
                s.label,
            ],
            EpConfig::Receive(r) => [
                TYPE_RECEIVE
                    | put(r.act as Reg, 3, 16)
                    | put(r.order as Reg, 19, 6)
                    | put(r.msg_order as Reg, 25, 6)
                    | put(r.header as Reg, 31, 16),
                r.buffer,
                0,
            ],
            EpConfig::Memory(m) => [
                TYPE_MEMORY
                    | put(m.act as Reg, 3, 16)
                    | put(m.perm.bits() as Reg, 19, 4)
                    | put(m.tile as Reg, 23, 16),
                m.addr,
                m.size,
            ],
        }
    }

    /// Decode a register image read from endpoint `ep`
    ///
    /// # Errors
    ///
    /// Returns [`TcuError::BadRegs`] for an unknown endpoint type.
    pub fn decode(ep: EpId, regs: [Reg; EP_REGS]) -> Result<Self, TcuError> {
        let r0 = regs[0];
        let act = field(r0, 3, 16) as ActId;
        match field(r0, 0, 3) {
            TYPE_INVALID => Ok(EpConfig::Invalid),
            TYPE_SEND => Ok(EpConfig::Send(SendEp {
                act,
                cur_credits: field(r0, 19, 6) as u8,
                max_credits: field(r0, 25, 6) as u8,
                msg_order: field(r0, 31, 6) as u8,
                tile: field(regs[1], 0, 16) as TileId,
                dst_ep: field(regs[1], 16, 16) as EpId,
                label: regs[2],
            })),
            TYPE_RECEIVE => Ok(EpConfig::Receive(RecvEp {
                act,
                order: field(r0, 19, 6) as u8,
                msg_order: field(r0, 25, 6) as u8,
                header: field(r0, 31, 16) as u16,
                buffer: regs[1],
            })),
            TYPE_MEMORY => Ok(EpConfig::Memory(MemEp {
                act,
                perm: Perm::from_bits_truncate(field(r0, 19, 4) as u32),
                tile: field(r0, 23, 16) as TileId,
                addr: regs[1],
                size: regs[2],
            })),
            _ => Err(TcuError::BadRegs { ep }),
        }
    }
}
