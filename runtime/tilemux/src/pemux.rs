//! Per-tile endpoint multiplexer (PEMux)
//!
//! # Purpose
//! Binds logical gates to the few physical endpoints of a tile. The PEMux is
//! the only writer of the tile's endpoint registers; everything else asks it
//! to configure or invalidate an endpoint.
//!
//! # Architecture
//! - Endpoints below `first_free_ep` are reserved; 4 and 5 carry the
//!   multiplexer's own channel to the kernel and are set up on construction
//! - Every endpoint from `first_free_ep` on has an [`EpObject`]
//! - A saved register image is kept for every endpoint. Only endpoints of the
//!   tile's current activity (and the multiplexer's own) are present in
//!   hardware; [`PeMux::switch_to`] swaps them on a context switch
//! - Header slots come from a [`HeaderAlloc`], receive buffers must lie in
//!   the tile's receive-buffer space without overlapping each other
//!
//! # Testing Strategy
//! - Unit tests: configuration checks, implicit invalidation, context switch
//! - Integration tests: driven through the kernel's syscalls

use std::collections::BTreeMap;

use tcu::{
    ActId, EpConfig, EpId, Label, MemEp, RecvEp, SendEp, TcuRegs, TileId, EP_REGS, INVALID_ACT,
    KPEX_RBUF_ORDER, KPEX_REP, KPEX_SEP, TILEMUX_ACT, UNLIM_CREDITS,
};

use crate::cap::Selector;
use crate::config::TileConfig;
use crate::ep::{EpHandle, EpObject, EpState};
use crate::error::{Code, Error, Result};
use crate::headers::HeaderAlloc;
use crate::kif::FIRST_EP_SEL;
use crate::objects::{MGateObject, ObjId, RGateObject, SGateObject, SendTarget};

/// Tile id the multiplexers' own send endpoints point to
pub const KERNEL_TILE: TileId = TileId::MAX;

/// Endpoint on the kernel tile receiving privileged calls
pub const KERNEL_PEX_EP: EpId = 0;

/// Claimed parts of the receive-buffer space
#[derive(Debug, Clone)]
struct RbufSpace {
    base: u64,
    size: u64,
    /// start -> (end, endpoint holding the claim)
    claims: BTreeMap<u64, (u64, EpId)>,
}

impl RbufSpace {
    fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            claims: BTreeMap::new(),
        }
    }

    /// Check that `addr..addr + len` may be claimed for `ep`
    ///
    /// A claim already held by `ep` itself does not count, since it is
    /// released when `ep` is reconfigured.
    fn check(&self, addr: u64, len: u64, ep: EpId) -> Result<()> {
        let end = addr
            .checked_add(len)
            .ok_or(Error::new(Code::InvArgs, "receive buffer overflows"))?;
        if addr < self.base || end > self.base + self.size {
            return Err(Error::new(Code::InvArgs, "receive buffer outside receive space"));
        }
        let overlaps = self
            .claims
            .range(..end)
            .any(|(&s, &(e, owner))| owner != ep && s < end && addr < e);
        if overlaps {
            return Err(Error::new(Code::InvArgs, "receive buffer overlaps another"));
        }
        Ok(())
    }

    fn claim(&mut self, addr: u64, len: u64, ep: EpId) {
        self.claims.insert(addr, (addr + len, ep));
    }

    fn release(&mut self, ep: EpId) {
        self.claims.retain(|_, &mut (_, owner)| owner != ep);
    }

    fn used(&self) -> u64 {
        self.claims.iter().map(|(&s, &(e, _))| e - s).sum()
    }
}

fn in_flight(cfg: &EpConfig) -> bool {
    matches!(cfg, EpConfig::Send(s) if s.max_credits != UNLIM_CREDITS && s.cur_credits < s.max_credits)
}

/// Endpoint multiplexer of one tile
pub struct PeMux {
    tile: TileId,
    cfg: TileConfig,
    eps: Vec<EpObject>,
    saved: Vec<EpConfig>,
    headers: HeaderAlloc,
    rbufs: RbufSpace,
    regs: Box<dyn TcuRegs + Send>,
    cur: Option<ActId>,
}

impl core::fmt::Debug for PeMux {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeMux")
            .field("tile", &self.tile)
            .field("cur", &self.cur)
            .field("headers", &self.headers)
            .field("rbuf_used", &self.rbufs.used())
            .finish_non_exhaustive()
    }
}

impl PeMux {
    /// Take over the communication unit of `tile`
    ///
    /// Configures the multiplexer's own channel and reserves its header slot
    /// and receive buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` if the unit has fewer endpoints than configured.
    pub fn new(
        tile: TileId,
        cfg: TileConfig,
        regs: Box<dyn TcuRegs + Send>,
    ) -> Result<Self> {
        if regs.ep_count() < cfg.ep_count {
            return Err(Error::new(Code::InvArgs, "communication unit has too few endpoints"));
        }

        let eps = (cfg.first_free_ep..cfg.ep_count as EpId)
            .map(|ep| EpObject::new(tile, ep))
            .collect();
        let mut pemux = Self {
            tile,
            eps,
            saved: vec![EpConfig::Invalid; cfg.ep_count],
            headers: HeaderAlloc::new(cfg.header_count),
            rbufs: RbufSpace::new(cfg.rbuf_base, cfg.rbuf_size),
            regs,
            cur: None,
            cfg,
        };

        pemux.write(
            KPEX_SEP,
            EpConfig::Send(SendEp {
                act: TILEMUX_ACT,
                label: tile as Label,
                tile: KERNEL_TILE,
                dst_ep: KERNEL_PEX_EP,
                msg_order: KPEX_RBUF_ORDER,
                max_credits: 1,
                cur_credits: 1,
            }),
        )?;
        pemux.rbufs.claim(pemux.cfg.rbuf_base, 1 << KPEX_RBUF_ORDER, KPEX_REP);
        pemux.write(
            KPEX_REP,
            EpConfig::Receive(RecvEp {
                act: TILEMUX_ACT,
                buffer: pemux.cfg.rbuf_base,
                order: KPEX_RBUF_ORDER,
                msg_order: KPEX_RBUF_ORDER,
                header: 0,
            }),
        )?;
        pemux.regs.xchg_act(INVALID_ACT);

        log::info!(
            target: "tilemux::eps",
            "Tile{}: {} endpoints ({} managed), {} header slots",
            tile,
            pemux.cfg.ep_count,
            pemux.eps.len(),
            pemux.cfg.header_count
        );
        Ok(pemux)
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn config(&self) -> &TileConfig {
        &self.cfg
    }

    pub fn cur_act(&self) -> Option<ActId> {
        self.cur
    }

    pub fn headers(&self) -> &HeaderAlloc {
        &self.headers
    }

    /// Bytes of the receive-buffer space currently claimed
    pub fn rbuf_used(&self) -> u64 {
        self.rbufs.used()
    }

    pub fn regs(&self) -> &dyn TcuRegs {
        &*self.regs
    }

    fn idx(&self, ep: EpId) -> Result<usize> {
        if ep < self.cfg.first_free_ep || ep as usize >= self.cfg.ep_count {
            return Err(Error::new(Code::InvArgs, "endpoint not managed"));
        }
        Ok((ep - self.cfg.first_free_ep) as usize)
    }

    pub fn ep(&self, ep: EpId) -> Option<&EpObject> {
        self.idx(ep).ok().map(|i| &self.eps[i])
    }

    pub(crate) fn ep_mut(&mut self, ep: EpId) -> Option<&mut EpObject> {
        let i = self.idx(ep).ok()?;
        Some(&mut self.eps[i])
    }

    pub fn eps(&self) -> impl Iterator<Item = &EpObject> {
        self.eps.iter()
    }

    /// Selector of the endpoint's capability in the multiplexer's table
    pub fn ep_sel(&self, ep: EpId) -> Option<Selector> {
        self.idx(ep).ok().map(|i| FIRST_EP_SEL + i as Selector)
    }

    /// Endpoint whose capability sits at `sel` in the multiplexer's table
    pub fn sel_ep(&self, sel: Selector) -> Option<EpId> {
        let i = sel.checked_sub(FIRST_EP_SEL)?;
        if (i as usize) < self.eps.len() {
            Some(self.cfg.first_free_ep + i as EpId)
        } else {
            None
        }
    }

    /// First endpoint that is neither allocated nor bound
    pub fn find_free_ep(&self) -> Option<EpId> {
        self.eps
            .iter()
            .find(|e| !e.is_allocated() && !e.is_bound())
            .map(|e| e.ep)
    }

    /// Saved register image of an endpoint
    pub fn saved_config(&self, ep: EpId) -> EpConfig {
        self.saved.get(ep as usize).copied().unwrap_or_default()
    }

    fn live(&self, cfg: &EpConfig) -> bool {
        match cfg.act() {
            None | Some(TILEMUX_ACT) => true,
            Some(act) => self.cur == Some(act),
        }
    }

    /// Store an endpoint image and write it through if its activity runs
    fn write(&mut self, ep: EpId, cfg: EpConfig) -> Result<()> {
        self.saved[ep as usize] = cfg;
        let regs = if self.live(&cfg) {
            cfg.encode()
        } else {
            [0; EP_REGS]
        };
        self.regs.write_ep(ep, regs)?;
        Ok(())
    }

    /// Check that a receive buffer can be configured on `ep`
    ///
    /// # Errors
    ///
    /// - `InvArgs` if the buffer lies outside the receive space or overlaps
    ///   another claimed buffer
    /// - `OutOfMem` if not enough header slots are left
    pub fn check_receive(&self, ep: EpId, rgate: &RGateObject, addr: u64) -> Result<()> {
        self.idx(ep)?;
        self.rbufs.check(addr, rgate.size(), ep)?;
        if !self.headers.can_alloc(rgate.slots()) {
            return Err(Error::new(Code::OutOfMem, "header slots exhausted"));
        }
        Ok(())
    }

    /// Bind a receive gate to `ep` with its buffer at `addr`
    ///
    /// Allocates `2^(order - msg_order)` header slots. Whatever `ep` was bound
    /// to before is invalidated and returned. Waking calls that wait for the
    /// gate is up to the caller.
    pub fn config_receive(
        &mut self,
        ep: EpId,
        act: ActId,
        id: ObjId,
        rgate: &mut RGateObject,
        addr: u64,
    ) -> Result<EpState> {
        self.check_receive(ep, rgate, addr)?;
        let old = self.invalidate_bound(ep)?;

        let header = self
            .headers
            .alloc(rgate.slots())
            .ok_or(Error::new(Code::OutOfMem, "header slots exhausted"))?;
        self.rbufs.claim(addr, rgate.size(), ep);
        rgate.bind(EpHandle { tile: self.tile, ep }, addr, header);

        log::info!(
            target: "tilemux::eps",
            "Tile{}:EP{} = RGate[addr={:#x}, order={}, msgorder={}, header={}]",
            self.tile,
            ep,
            addr,
            rgate.order,
            rgate.msg_order,
            header
        );
        self.write(
            ep,
            EpConfig::Receive(RecvEp {
                act,
                buffer: addr,
                order: rgate.order,
                msg_order: rgate.msg_order,
                header,
            }),
        )?;
        self.set_state(ep, EpState::Receive { rgate: id });
        Ok(old)
    }

    /// Bind a send gate to `ep`
    ///
    /// # Errors
    ///
    /// Returns `Exists` if the gate is already bound to an endpoint.
    pub fn config_send(
        &mut self,
        ep: EpId,
        act: ActId,
        id: ObjId,
        sgate: &mut SGateObject,
        target: SendTarget,
    ) -> Result<EpState> {
        self.idx(ep)?;
        if sgate.activated {
            return Err(Error::new(Code::Exists, "send gate already activated"));
        }
        let old = self.invalidate_bound(ep)?;

        log::info!(
            target: "tilemux::eps",
            "Tile{}:EP{} = Send[tile={}, ep={}, label={:#x}, msgorder={}, crd={:#x}]",
            self.tile,
            ep,
            target.tile,
            target.ep,
            sgate.label,
            target.msg_order,
            sgate.credits
        );
        self.write(
            ep,
            EpConfig::Send(SendEp {
                act,
                label: sgate.label,
                tile: target.tile,
                dst_ep: target.ep,
                msg_order: target.msg_order,
                max_credits: sgate.credits,
                cur_credits: sgate.credits,
            }),
        )?;
        sgate.activated = true;
        self.set_state(ep, EpState::Send { sgate: id });
        Ok(old)
    }

    /// Check that `mgate` can be bound at `offset`
    pub fn check_memory(&self, ep: EpId, mgate: &MGateObject, offset: u64) -> Result<()> {
        self.idx(ep)?;
        if offset >= mgate.size || mgate.addr.checked_add(offset).is_none() {
            return Err(Error::new(Code::InvArgs, "memory offset out of range"));
        }
        Ok(())
    }

    /// Bind the part of a memory gate starting at `offset` to `ep`
    pub fn config_memory(
        &mut self,
        ep: EpId,
        act: ActId,
        id: ObjId,
        mgate: &MGateObject,
        offset: u64,
    ) -> Result<EpState> {
        self.check_memory(ep, mgate, offset)?;
        let old = self.invalidate_bound(ep)?;

        log::info!(
            target: "tilemux::eps",
            "Tile{}:EP{} = Mem[act={:?}, tile={}, addr={:#x}, size={:#x}, perms={:?}]",
            self.tile,
            ep,
            mgate.owner_act,
            mgate.tile,
            mgate.addr + offset,
            mgate.size - offset,
            mgate.perms
        );
        self.write(
            ep,
            EpConfig::Memory(MemEp {
                act,
                tile: mgate.tile,
                addr: mgate.addr + offset,
                size: mgate.size - offset,
                perm: mgate.perms,
            }),
        )?;
        self.set_state(ep, EpState::Memory { mgate: id, offset });
        Ok(old)
    }

    fn invalidate_bound(&mut self, ep: EpId) -> Result<EpState> {
        match self.ep(ep) {
            Some(e) if e.is_bound() => self.invalidate(ep, true),
            _ => Ok(EpState::Unconfigured),
        }
    }

    fn set_state(&mut self, ep: EpId, state: EpState) {
        if let Some(e) = self.ep_mut(ep) {
            e.state = state;
        }
    }

    /// Invalidate `ep` and return what it was bound to
    ///
    /// Header slots and the receive buffer of a receive endpoint are
    /// released.
    ///
    /// # Errors
    ///
    /// Without `force`, fails with `Abort` while a send endpoint has messages
    /// in flight.
    pub fn invalidate(&mut self, ep: EpId, force: bool) -> Result<EpState> {
        let i = self.idx(ep)?;
        let cfg = self.saved[ep as usize];

        if cfg.is_valid() && self.live(&cfg) {
            self.regs.invalidate_ep(ep, force)?;
        } else if !force && in_flight(&cfg) {
            return Err(Error::new(Code::Abort, "endpoint has messages in flight"));
        }

        if let EpConfig::Receive(r) = cfg {
            self.headers.free(r.header, r.slots());
            self.rbufs.release(ep);
        }
        self.saved[ep as usize] = EpConfig::Invalid;

        log::info!(target: "tilemux::eps", "Tile{}:EP{} = invalid", self.tile, ep);
        Ok(core::mem::take(&mut self.eps[i].state))
    }

    /// Invalidate every managed endpoint, returning the bound ones
    pub fn invalidate_eps(&mut self) -> Vec<(EpId, EpState)> {
        let mut bound = Vec::new();
        for ep in self.cfg.first_free_ep..self.cfg.ep_count as EpId {
            match self.invalidate(ep, true) {
                Ok(EpState::Unconfigured) => {}
                Ok(old) => bound.push((ep, old)),
                Err(e) => log::warn!(target: "tilemux::eps", "Tile{}:EP{}: {}", self.tile, ep, e),
            }
        }
        bound
    }

    /// Make `act` the running activity of the tile
    ///
    /// The outgoing activity's endpoints are read back into the saved image
    /// (so credits survive) and removed from hardware; the incoming one's are
    /// written from the saved image.
    pub fn switch_to(&mut self, act: Option<ActId>) -> Result<()> {
        if act == self.cur {
            return Ok(());
        }
        let first = self.cfg.first_free_ep;
        let last = self.cfg.ep_count as EpId;

        if let Some(old) = self.cur {
            for ep in first..last {
                if self.saved[ep as usize].act() == Some(old) {
                    self.saved[ep as usize] = self.regs.config(ep)?;
                    self.regs.invalidate_ep(ep, true)?;
                }
            }
        }

        self.regs.xchg_act(act.unwrap_or(INVALID_ACT));
        log::debug!(target: "tilemux::acts", "Tile{}: switch {:?} -> {:?}", self.tile, self.cur, act);
        self.cur = act;

        if let Some(new) = act {
            for ep in first..last {
                let cfg = self.saved[ep as usize];
                if cfg.act() == Some(new) {
                    self.regs.write_ep(ep, cfg.encode())?;
                }
            }
        }
        Ok(())
    }

    /// Send a message over `ep` on behalf of the current activity
    pub fn send(&mut self, ep: EpId) -> Result<()> {
        self.idx(ep)?;
        self.regs.send(ep)?;
        Ok(())
    }

    /// Acknowledge a message sent over `ep`, returning its credit
    pub fn ack(&mut self, ep: EpId) -> Result<()> {
        self.idx(ep)?;
        self.regs.ack(ep)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RBUF_BASE;
    use crate::objects::{ObjStore, Object};
    use tcu::{MockTcu, Perm, FIRST_FREE_EP};

    const OWN_RBUF: u64 = 1 << KPEX_RBUF_ORDER;

    fn pemux() -> PeMux {
        let cfg = TileConfig::default();
        let regs = Box::new(MockTcu::new(cfg.ep_count));
        PeMux::new(0, cfg, regs).unwrap()
    }

    fn rgate(objs: &mut ObjStore, order: u8, msg_order: u8) -> (ObjId, RGateObject) {
        let r = RGateObject::new(order, msg_order).unwrap();
        (objs.insert(Object::RGate(r.clone())), r)
    }

    #[test]
    fn test_own_channel_is_configured() {
        let mux = pemux();
        assert!(matches!(mux.regs().config(KPEX_SEP), Ok(EpConfig::Send(_))));
        match mux.regs().config(KPEX_REP) {
            Ok(EpConfig::Receive(r)) => {
                assert_eq!(r.header, 0);
                assert_eq!(r.buffer, RBUF_BASE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mux.headers().available(), 1023);
        assert_eq!(mux.rbuf_used(), OWN_RBUF);
    }

    #[test]
    fn test_ep_selectors() {
        let mux = pemux();
        assert_eq!(mux.ep_sel(FIRST_FREE_EP), Some(FIRST_EP_SEL));
        assert_eq!(mux.ep_sel(KPEX_REP), None);
        assert_eq!(mux.sel_ep(FIRST_EP_SEL + 3), Some(FIRST_FREE_EP + 3));
        assert_eq!(mux.sel_ep(FIRST_EP_SEL + 56), None);
        assert_eq!(mux.sel_ep(0), None);
    }

    #[test]
    fn test_config_receive_allocates_headers() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (id, mut r) = rgate(&mut objs, 8, 6);

        mux.config_receive(8, 1, id, &mut r, RBUF_BASE + OWN_RBUF).unwrap();
        assert_eq!(r.header, Some(1));
        assert!(r.activated());
        assert_eq!(mux.ep(8).map(|e| e.state), Some(EpState::Receive { rgate: id }));
        assert_eq!(mux.headers().available(), 1023 - 4);
    }

    #[test]
    fn test_receive_buffer_bounds() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (id, mut r) = rgate(&mut objs, 8, 6);
        let end = RBUF_BASE + mux.config().rbuf_size;

        // overlapping the multiplexer's own buffer
        let err = mux.config_receive(8, 1, id, &mut r, RBUF_BASE).unwrap_err();
        assert_eq!(err.code(), Code::InvArgs);
        // one byte past the end
        let err = mux.config_receive(8, 1, id, &mut r, end - 256 + 1).unwrap_err();
        assert_eq!(err.code(), Code::InvArgs);
        // exactly at the end
        assert!(mux.config_receive(8, 1, id, &mut r, end - 256).is_ok());
    }

    #[test]
    fn test_receive_buffers_must_not_overlap() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (a, mut ra) = rgate(&mut objs, 8, 6);
        let (b, mut rb) = rgate(&mut objs, 8, 6);
        let addr = RBUF_BASE + 0x1000;

        mux.config_receive(8, 1, a, &mut ra, addr).unwrap();
        let err = mux.config_receive(9, 1, b, &mut rb, addr + 0x80).unwrap_err();
        assert_eq!(err.code(), Code::InvArgs);
        assert!(mux.config_receive(9, 1, b, &mut rb, addr + 0x100).is_ok());
    }

    #[test]
    fn test_headers_exhausted_leaves_endpoint_alone() {
        let cfg = TileConfig {
            header_count: 8,
            ..TileConfig::default()
        };
        let mut mux = PeMux::new(0, cfg.clone(), Box::new(MockTcu::new(cfg.ep_count))).unwrap();
        let mut objs = ObjStore::new();
        let (a, mut ra) = rgate(&mut objs, 8, 6);
        let (b, mut rb) = rgate(&mut objs, 8, 6);

        mux.config_receive(8, 1, a, &mut ra, RBUF_BASE + 0x1000).unwrap();
        let err = mux.config_receive(9, 1, b, &mut rb, RBUF_BASE + 0x2000).unwrap_err();
        assert_eq!(err.code(), Code::OutOfMem);
        assert!(!mux.ep(9).unwrap().is_bound());
        assert!(!rb.activated());
        assert_eq!(mux.headers().available(), 3);
    }

    #[test]
    fn test_invalidate_releases_receive_resources() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (id, mut r) = rgate(&mut objs, 10, 6);
        mux.config_receive(8, 1, id, &mut r, RBUF_BASE + 0x1000).unwrap();

        assert_eq!(mux.invalidate(8, false).unwrap(), EpState::Receive { rgate: id });
        assert_eq!(mux.headers().available(), 1023);
        assert_eq!(mux.rbuf_used(), OWN_RBUF);
        assert_eq!(mux.saved_config(8), EpConfig::Invalid);
        assert_eq!(mux.invalidate(8, false).unwrap(), EpState::Unconfigured);
    }

    #[test]
    fn test_config_send_twice_fails() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (r, _) = rgate(&mut objs, 8, 6);
        let mut s = SGateObject::new(r, 0x1234, 2).unwrap();
        let sid = objs.insert(Object::SGate(s.clone()));
        let target = SendTarget { tile: 1, ep: 8, msg_order: 6 };

        mux.config_send(10, 1, sid, &mut s, target).unwrap();
        let err = mux.config_send(11, 1, sid, &mut s, target).unwrap_err();
        assert_eq!(err.code(), Code::Exists);
        assert!(!mux.ep(11).unwrap().is_bound());
    }

    #[test]
    fn test_reconfigure_overwrites_and_returns_old_binding() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (rid, mut r) = rgate(&mut objs, 8, 6);
        let m = MGateObject::new(1, 0x1000, 0x1000, Perm::RW).unwrap();
        let mid = objs.insert(Object::MGate(m.clone()));

        mux.config_receive(8, 1, rid, &mut r, RBUF_BASE + 0x1000).unwrap();
        let old = mux.config_memory(8, 1, mid, &m, 0x100).unwrap();
        assert_eq!(old, EpState::Receive { rgate: rid });
        assert_eq!(mux.headers().available(), 1023);
        match mux.saved_config(8) {
            EpConfig::Memory(me) => {
                assert_eq!(me.addr, 0x1100);
                assert_eq!(me.size, 0xF00);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_memory_offset_checks() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let m = MGateObject::new(1, 0x1000, 0x1000, Perm::R).unwrap();
        let mid = objs.insert(Object::MGate(m.clone()));
        let before = mux.saved_config(8);

        let err = mux.config_memory(8, 1, mid, &m, 0x1000).unwrap_err();
        assert_eq!(err.code(), Code::InvArgs);
        assert_eq!(mux.saved_config(8), before);
    }

    #[test]
    fn test_context_switch_saves_credits() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let (r, _) = rgate(&mut objs, 8, 6);
        let mut s = SGateObject::new(r, 0, 2).unwrap();
        let sid = objs.insert(Object::SGate(s.clone()));
        let target = SendTarget { tile: 1, ep: 8, msg_order: 6 };

        // configured while not running: only the saved image has it
        mux.config_send(8, 1, sid, &mut s, target).unwrap();
        assert_eq!(mux.regs().config(8), Ok(EpConfig::Invalid));

        mux.switch_to(Some(1)).unwrap();
        mux.send(8).unwrap();
        mux.switch_to(Some(2)).unwrap();
        assert_eq!(mux.regs().config(8), Ok(EpConfig::Invalid));
        match mux.saved_config(8) {
            EpConfig::Send(se) => assert_eq!(se.cur_credits, 1),
            other => panic!("unexpected {:?}", other),
        }

        // not running, but still counted as busy
        assert_eq!(mux.invalidate(8, false).unwrap_err().code(), Code::Abort);

        mux.switch_to(Some(1)).unwrap();
        mux.send(8).unwrap();
        assert_eq!(mux.send(8).unwrap_err().code(), Code::MissCredits);
        mux.ack(8).unwrap();
        mux.ack(8).unwrap();
        assert!(mux.invalidate(8, false).is_ok());
    }

    #[test]
    fn test_invalidate_eps_clears_everything() {
        let mut mux = pemux();
        let mut objs = ObjStore::new();
        let m = MGateObject::new(1, 0, 0x1000, Perm::R).unwrap();
        let mid = objs.insert(Object::MGate(m.clone()));
        mux.config_memory(8, 1, mid, &m, 0).unwrap();
        mux.config_memory(20, 1, mid, &m, 0).unwrap();

        let bound = mux.invalidate_eps();
        assert_eq!(bound.len(), 2);
        assert!(mux.eps().all(|e| !e.is_bound()));
        // the multiplexer's own channel is untouched
        assert!(mux.regs().config(KPEX_REP).unwrap().is_valid());
    }
}
