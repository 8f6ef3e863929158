//! In-memory communication unit
//!
//! Keeps the register file in a vector and implements the credit protocol
//! of send endpoints, so that invalidation and context switches can be
//! observed without hardware.

use crate::{
    ActId, EpConfig, EpId, Reg, TcuError, TcuRegs, EP_REGS, INVALID_ACT, UNLIM_CREDITS,
};

/// Register file backed by plain memory
#[derive(Debug, Clone)]
pub struct MockTcu {
    regs: Vec<[Reg; EP_REGS]>,
    cur_act: ActId,
    writes: usize,
}

impl MockTcu {
    /// Create a unit with `ep_count` invalid endpoints
    pub fn new(ep_count: usize) -> Self {
        Self {
            regs: vec![[0; EP_REGS]; ep_count],
            cur_act: INVALID_ACT,
            writes: 0,
        }
    }

    /// Number of register writes performed so far (including invalidations)
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Activity currently running on the tile
    pub fn cur_act(&self) -> ActId {
        self.cur_act
    }

    fn slot(&self, ep: EpId) -> Result<usize, TcuError> {
        let idx = ep as usize;
        if idx < self.regs.len() {
            Ok(idx)
        } else {
            Err(TcuError::InvalidEp { ep })
        }
    }
}

impl TcuRegs for MockTcu {
    fn ep_count(&self) -> usize {
        self.regs.len()
    }

    fn read_ep(&self, ep: EpId) -> Result<[Reg; EP_REGS], TcuError> {
        Ok(self.regs[self.slot(ep)?])
    }

    fn write_ep(&mut self, ep: EpId, regs: [Reg; EP_REGS]) -> Result<(), TcuError> {
        let idx = self.slot(ep)?;
        log::trace!(target: "tcu", "EP{} <- {:#x?}", ep, regs);
        self.regs[idx] = regs;
        self.writes += 1;
        Ok(())
    }

    fn invalidate_ep(&mut self, ep: EpId, force: bool) -> Result<(), TcuError> {
        let idx = self.slot(ep)?;
        if !force {
            if let EpConfig::Send(s) = EpConfig::decode(ep, self.regs[idx])? {
                if s.max_credits != UNLIM_CREDITS && s.cur_credits < s.max_credits {
                    return Err(TcuError::Busy { ep });
                }
            }
        }
        self.regs[idx] = [0; EP_REGS];
        self.writes += 1;
        Ok(())
    }

    fn xchg_act(&mut self, act: ActId) -> ActId {
        core::mem::replace(&mut self.cur_act, act)
    }

    fn send(&mut self, ep: EpId) -> Result<(), TcuError> {
        let idx = self.slot(ep)?;
        let EpConfig::Send(mut s) = EpConfig::decode(ep, self.regs[idx])? else {
            return Err(TcuError::NoSep { ep });
        };
        if s.act != self.cur_act {
            return Err(TcuError::ForeignEp {
                ep,
                owner: s.act,
                cur: self.cur_act,
            });
        }
        if s.max_credits != UNLIM_CREDITS {
            if s.cur_credits == 0 {
                return Err(TcuError::NoCredits { ep });
            }
            s.cur_credits -= 1;
            self.regs[idx] = EpConfig::Send(s).encode();
        }
        Ok(())
    }

    fn ack(&mut self, ep: EpId) -> Result<(), TcuError> {
        let idx = self.slot(ep)?;
        let EpConfig::Send(mut s) = EpConfig::decode(ep, self.regs[idx])? else {
            return Err(TcuError::NoSep { ep });
        };
        if s.max_credits != UNLIM_CREDITS && s.cur_credits < s.max_credits {
            s.cur_credits += 1;
            self.regs[idx] = EpConfig::Send(s).encode();
        }
        Ok(())
    }
}
