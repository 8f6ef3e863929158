//! Binding gates to endpoints
//!
//! Shared by the `Activate` syscall and the multiplexers' privileged
//! activate call. Every check happens before the first register write, so a
//! failed activation leaves the endpoint as it was.

use tcu::ActId;

use crate::cap::{CapKind, NodeId, Owner, Selector};
use crate::ep::EpHandle;
use crate::error::{Code, Error, Result};
use crate::kernel::Kernel;
use crate::kif::INVALID_SEL;
use crate::objects::ObjId;
use crate::waiters::{CallId, Resume, Waiter};

/// Outcome of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Done,
    /// Waiting for the receive gate of a send gate
    Suspended(CallId),
}

impl Kernel {
    /// Bind the gate at `gate_sel` of `act` to endpoint `ep`
    ///
    /// `INVALID_SEL` unbinds the endpoint. `addr` is the receive buffer for
    /// receive gates and the offset for memory gates. `ep_cap` is the
    /// endpoint capability the request named; a suspended activation fails
    /// once it is gone.
    ///
    /// # Errors
    ///
    /// - `ActGone` if `act` is not running
    /// - `NoPerm` if the endpoint is allocated to another activity
    /// - `Exists` if the gate is bound to another endpoint
    /// - `Abort` when unbinding a send endpoint with messages in flight
    /// - `InvArgs` for anything else that does not fit
    pub(crate) fn activate(
        &mut self,
        act: ActId,
        ep: EpHandle,
        ep_cap: Option<NodeId>,
        gate_sel: Selector,
        addr: u64,
        wait: bool,
    ) -> Result<Activation> {
        self.live_act(act)?;
        let epo = self
            .tiles
            .get(ep.tile as usize)
            .and_then(|m| m.ep(ep.ep))
            .ok_or(Error::new(Code::InvArgs, "endpoint not managed"))?;
        if !epo.usable_by(act) {
            return Err(Error::new(Code::NoPerm, "endpoint allocated to another activity"));
        }
        let bound = epo.state.gate();

        if gate_sel == INVALID_SEL {
            let old = self.tiles[ep.tile as usize].invalidate(ep.ep, false)?;
            self.unbind(old);
            return Ok(Activation::Done);
        }

        let cap = self
            .caps
            .get(Owner::Activity(act), gate_sel)
            .ok_or(Error::new(Code::InvArgs, "empty gate selector"))?;
        let (kind, gate) = (cap.kind, cap.obj);
        if bound == Some(gate) {
            return Ok(Activation::Done);
        }

        match kind {
            CapKind::RGate => self.activate_recv(act, ep, gate, addr),
            CapKind::SGate => self.activate_send(act, ep, ep_cap, gate, wait),
            CapKind::MGate => self.activate_mem(act, ep, gate, addr),
            _ => Err(Error::new(Code::InvArgs, "not a gate")),
        }
    }

    fn activate_recv(&mut self, act: ActId, ep: EpHandle, id: ObjId, addr: u64) -> Result<Activation> {
        let rgate = self
            .objs
            .rgate_mut(id)
            .ok_or(Error::new(Code::InvArgs, "receive gate gone"))?;
        if rgate.activated() {
            return Err(Error::new(Code::Exists, "receive gate already activated"));
        }
        let old = self.tiles[ep.tile as usize].config_receive(ep.ep, act, id, rgate, addr)?;
        self.unbind(old);
        self.waiters.notify(id, Code::Success);
        Ok(Activation::Done)
    }

    fn activate_send(
        &mut self,
        act: ActId,
        ep: EpHandle,
        ep_cap: Option<NodeId>,
        id: ObjId,
        wait: bool,
    ) -> Result<Activation> {
        let sgate = self
            .objs
            .sgate(id)
            .ok_or(Error::new(Code::InvArgs, "send gate gone"))?;
        if sgate.activated {
            return Err(Error::new(Code::Exists, "send gate already activated"));
        }
        let rgate = sgate.rgate;
        let target = self
            .objs
            .rgate(rgate)
            .ok_or(Error::new(Code::InvArgs, "receive gate gone"))?
            .target();

        let Some(target) = target else {
            if wait {
                let call = self.waiters.register(rgate, act, Resume::ActivateSend { ep, ep_cap, sgate: id });
                return Ok(Activation::Suspended(call));
            }
            return Err(Error::new(Code::InvArgs, "receive gate not activated"));
        };

        let sgate = self
            .objs
            .sgate_mut(id)
            .ok_or(Error::new(Code::InvArgs, "send gate gone"))?;
        let old = self.tiles[ep.tile as usize].config_send(ep.ep, act, id, sgate, target)?;
        self.unbind(old);
        Ok(Activation::Done)
    }

    fn activate_mem(&mut self, act: ActId, ep: EpHandle, id: ObjId, offset: u64) -> Result<Activation> {
        let mgate = self
            .objs
            .mgate(id)
            .ok_or(Error::new(Code::InvArgs, "memory gate gone"))?;
        let old = self.tiles[ep.tile as usize].config_memory(ep.ep, act, id, mgate, offset)?;
        self.unbind(old);
        Ok(Activation::Done)
    }

    /// Continue a suspended activation after its receive gate was activated
    pub(crate) fn resume(&mut self, w: Waiter) -> Result<()> {
        match w.resume {
            Resume::ActivateSend { ep, ep_cap, sgate } => {
                self.live_act(w.act)?;
                if let Some(node) = ep_cap {
                    let held = self.caps.node(node).map_or(false, |c| {
                        c.kind == CapKind::EndPoint
                            && c.owner == Owner::Activity(w.act)
                            && self.objs.ep(c.obj) == Some(&ep)
                    });
                    if !held {
                        return Err(Error::new(Code::InvArgs, "endpoint capability revoked"));
                    }
                }
                let epo = self
                    .tiles
                    .get(ep.tile as usize)
                    .and_then(|m| m.ep(ep.ep))
                    .ok_or(Error::new(Code::InvArgs, "endpoint not managed"))?;
                if !epo.usable_by(w.act) {
                    return Err(Error::new(Code::NoPerm, "endpoint allocated to another activity"));
                }
                if epo.state.gate() == Some(sgate) {
                    return Ok(());
                }
                match self.activate_send(w.act, ep, ep_cap, sgate, false)? {
                    Activation::Done => Ok(()),
                    Activation::Suspended(_) => Err(Error::new(Code::WouldBlock, "still waiting")),
                }
            }
        }
    }
}
