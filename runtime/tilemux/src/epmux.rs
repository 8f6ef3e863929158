//! Activity-side endpoint multiplexer
//!
//! An activity usually holds more gates than it has endpoints. [`EpMux`]
//! keeps a small pool of endpoint capabilities and binds gates to them on
//! demand through the `Activate` syscall:
//!
//! - a gate that is already bound keeps its endpoint
//! - otherwise a free endpoint is used
//! - otherwise a victim is picked round-robin and unbound first; victims
//!   that cannot be unbound right now (messages in flight) are skipped

use tcu::{ActId, EpId};

use crate::cap::Selector;
use crate::error::{Code, Error, Result};
use crate::kernel::Kernel;
use crate::kif::{Syscall, INVALID_SEL, SEL_ACT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    /// Endpoint capability
    sel: Selector,
    ep: EpId,
    /// Gate currently bound through this slot
    gate: Option<Selector>,
}

/// Endpoint pool of one activity
#[derive(Debug, Clone)]
pub struct EpMux {
    act: ActId,
    slots: Vec<Slot>,
    next_victim: usize,
}

impl EpMux {
    pub fn new(act: ActId) -> Self {
        Self {
            act,
            slots: Vec::new(),
            next_victim: 0,
        }
    }

    pub fn act(&self) -> ActId {
        self.act
    }

    /// Allocate `count` endpoints with capabilities at `first_sel..`
    pub fn reserve(&mut self, kernel: &mut Kernel, count: u64, first_sel: Selector) -> Result<()> {
        for sel in first_sel..first_sel + count {
            let ep = kernel.call(self.act, &Syscall::AllocEp { dst: sel, act: SEL_ACT })?;
            let ep = EpId::try_from(ep).map_err(|_| Error::new(Code::InvArgs, "bogus endpoint id"))?;
            self.add_ep(sel, ep);
        }
        Ok(())
    }

    /// Add an endpoint the activity already holds a capability for
    pub fn add_ep(&mut self, sel: Selector, ep: EpId) {
        self.slots.push(Slot { sel, ep, gate: None });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Endpoint `gate` is currently bound to
    pub fn ep_of(&self, gate: Selector) -> Option<EpId> {
        self.slots.iter().find(|s| s.gate == Some(gate)).map(|s| s.ep)
    }

    /// Make `gate` usable and return its endpoint
    ///
    /// `rbuf_addr` is passed on to the activation (receive buffer or memory
    /// offset) when the gate is not bound yet.
    ///
    /// # Errors
    ///
    /// `NoSpace` if every endpoint is busy, otherwise whatever the
    /// activation fails with.
    pub fn switch_to(&mut self, kernel: &mut Kernel, gate: Selector, rbuf_addr: u64) -> Result<EpId> {
        if let Some(ep) = self.ep_of(gate) {
            return Ok(ep);
        }

        let idx = match self.slots.iter().position(|s| s.gate.is_none()) {
            Some(i) => i,
            None => self.evict(kernel)?,
        };
        let slot = self.slots[idx];
        kernel.call(
            self.act,
            &Syscall::Activate {
                ep: slot.sel,
                gate,
                rbuf_addr,
                flags: 0,
            },
        )?;
        self.slots[idx].gate = Some(gate);
        log::debug!(target: "tilemux::eps", "act{}: gate {} -> EP{}", self.act, gate, slot.ep);
        Ok(slot.ep)
    }

    /// Unbind `gate` if it is bound
    pub fn remove(&mut self, kernel: &mut Kernel, gate: Selector) -> Result<()> {
        let Some(idx) = self.slots.iter().position(|s| s.gate == Some(gate)) else {
            return Ok(());
        };
        self.unbind(kernel, idx)?;
        Ok(())
    }

    fn unbind(&mut self, kernel: &mut Kernel, idx: usize) -> Result<()> {
        let sel = self.slots[idx].sel;
        kernel.call(
            self.act,
            &Syscall::Activate {
                ep: sel,
                gate: INVALID_SEL,
                rbuf_addr: 0,
                flags: 0,
            },
        )?;
        self.slots[idx].gate = None;
        Ok(())
    }

    fn evict(&mut self, kernel: &mut Kernel) -> Result<usize> {
        for _ in 0..self.slots.len() {
            let idx = self.next_victim;
            self.next_victim = (idx + 1) % self.slots.len();
            match self.unbind(kernel, idx) {
                Ok(()) => {
                    log::debug!(target: "tilemux::eps", "act{}: evicted EP{}", self.act, self.slots[idx].ep);
                    return Ok(idx);
                }
                Err(e) if e.code() == Code::Abort => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::new(Code::NoSpace, "no endpoint available"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlatformConfig, RBUF_BASE};
    use tcu::Perm;

    fn setup(eps: u64) -> (Kernel, EpMux) {
        let mut k = Kernel::new(PlatformConfig::default()).unwrap();
        let act = k.create_activity(0).unwrap();
        let mut mux = EpMux::new(act);
        mux.reserve(&mut k, eps, 100).unwrap();
        for i in 0..4 {
            k.grant_memory(act, 10 + i, 0, i * 0x1000, 0x1000, Perm::RW).unwrap();
        }
        (k, mux)
    }

    #[test]
    fn test_bound_gate_is_reused() {
        let (mut k, mut mux) = setup(2);
        let ep = mux.switch_to(&mut k, 10, 0).unwrap();
        assert_eq!(mux.switch_to(&mut k, 10, 0).unwrap(), ep);
        assert_eq!(mux.ep_of(10), Some(ep));
    }

    #[test]
    fn test_round_robin_eviction() {
        let (mut k, mut mux) = setup(2);
        let a = mux.switch_to(&mut k, 10, 0).unwrap();
        let b = mux.switch_to(&mut k, 11, 0).unwrap();
        assert_ne!(a, b);

        assert_eq!(mux.switch_to(&mut k, 12, 0).unwrap(), a);
        assert_eq!(mux.ep_of(10), None);
        assert_eq!(mux.switch_to(&mut k, 13, 0).unwrap(), b);
        assert_eq!(mux.ep_of(11), None);
    }

    #[test]
    fn test_busy_victims_are_skipped() {
        let (mut k, mut mux) = setup(2);
        let act = mux.act();
        k.call(act, &Syscall::CreateRGate { dst: 20, order: 8, msg_order: 6 }).unwrap();
        k.call(act, &Syscall::CreateSGate { dst: 21, rgate: 20, label: 1, credits: 2 }).unwrap();

        let recv = mux.switch_to(&mut k, 20, RBUF_BASE + 0x1000).unwrap();
        let send = mux.switch_to(&mut k, 21, 0).unwrap();
        // a message in flight pins the send endpoint
        k.send(act, 101).unwrap();

        assert_eq!(mux.switch_to(&mut k, 10, 0).unwrap(), recv);
        assert_eq!(mux.ep_of(21), Some(send));
    }

    #[test]
    fn test_no_space_when_all_busy() {
        let (mut k, mut mux) = setup(1);
        let act = mux.act();
        k.call(act, &Syscall::CreateRGate { dst: 20, order: 8, msg_order: 6 }).unwrap();
        k.call(act, &Syscall::CreateSGate { dst: 21, rgate: 20, label: 1, credits: 1 }).unwrap();
        // the receive gate lives on an endpoint outside the pool
        k.call(act, &Syscall::AllocEp { dst: 50, act: SEL_ACT }).unwrap();
        k.call(act, &Syscall::Activate { ep: 50, gate: 20, rbuf_addr: RBUF_BASE + 0x1000, flags: 0 })
            .unwrap();

        mux.switch_to(&mut k, 21, 0).unwrap();
        k.send(act, 100).unwrap();
        assert_eq!(mux.switch_to(&mut k, 10, 0).unwrap_err().code(), Code::NoSpace);
    }

    #[test]
    fn test_remove_unbinds() {
        let (mut k, mut mux) = setup(1);
        let ep = mux.switch_to(&mut k, 10, 0).unwrap();
        mux.remove(&mut k, 10).unwrap();
        assert_eq!(mux.ep_of(10), None);
        assert!(!k.pemux(0).unwrap().ep(ep).unwrap().is_bound());
        // unknown gates are ignored
        mux.remove(&mut k, 77).unwrap();
    }
}
