//! Kernel context
//!
//! # Purpose
//! Owns everything one kernel instance manages: the capability space, the
//! object store, one [`PeMux`] per tile, the activities and the wait
//! registry. There is no global state; every operation takes the context
//! explicitly, so independent kernels can live side by side in one process.
//!
//! # Architecture
//! All state changes funnel through two places:
//! - `install` inserts a capability and takes a reference on its object
//! - `drop_caps` handles capabilities removed by revocation or teardown:
//!   it frees endpoint allocations, releases object references and applies
//!   the destruction side effects (endpoint invalidation, waking waiters)
//!
//! Calls are processed to completion one at a time. Calls that must wait are
//! parked in the [`WaitRegistry`] and finish later through
//! [`Kernel::process_wakeups`].

use std::collections::BTreeMap;

use tcu::{ActId, MockTcu, Perm, TcuRegs, TileId, TILEMUX_ACT};

use crate::cap::{CapFlags, CapKind, CapSpace, Capability, NodeId, Owner, Removed, Selector};
use crate::config::PlatformConfig;
use crate::ep::{EpHandle, EpState};
use crate::error::{Code, Error, Result};
use crate::kif::{Reply, SEL_ACT, SEL_KMEM, SEL_TILE};
use crate::objects::{
    ActivityObject, KMemObject, MGateObject, ObjId, ObjStore, Object, TileObject, OBJ_COST,
};
use crate::pemux::PeMux;
use crate::waiters::{CallId, Resume, WaitRegistry, Waiter};

/// Late reply to a call that was suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub call: CallId,
    pub act: ActId,
    pub reply: Reply,
}

/// One kernel instance
#[derive(Debug)]
pub struct Kernel {
    cfg: PlatformConfig,
    pub(crate) caps: CapSpace,
    pub(crate) objs: ObjStore,
    pub(crate) tiles: Vec<PeMux>,
    acts: BTreeMap<ActId, ObjId>,
    next_act: ActId,
    pub(crate) waiters: WaitRegistry,
    pub(crate) done: Vec<Completion>,
}

impl Kernel {
    /// Kernel with an in-memory communication unit on every tile
    pub fn new(cfg: PlatformConfig) -> Result<Self> {
        let regs = cfg
            .tiles
            .iter()
            .map(|t| Box::new(MockTcu::new(t.ep_count)) as Box<dyn TcuRegs + Send>)
            .collect();
        Self::with_tcus(cfg, regs)
    }

    /// Kernel driving the given communication units, one per tile
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` for an invalid configuration or if the number of
    /// units does not match the number of tiles.
    pub fn with_tcus(cfg: PlatformConfig, regs: Vec<Box<dyn TcuRegs + Send>>) -> Result<Self> {
        cfg.validate()?;
        if regs.len() != cfg.tiles.len() {
            return Err(Error::new(Code::InvArgs, "one communication unit per tile required"));
        }

        let waiters = WaitRegistry::new();
        let mut caps = CapSpace::new();
        let mut objs = ObjStore::new();
        let mut tiles = Vec::with_capacity(regs.len());

        for (i, (tcfg, unit)) in cfg.tiles.iter().zip(regs).enumerate() {
            let tile = i as TileId;
            let mux = PeMux::new(tile, tcfg.clone(), unit)?;

            let owner = Owner::TileMux(tile);
            caps.create_table(owner)?;
            for ep in mux.eps() {
                let Some(sel) = mux.ep_sel(ep.ep) else { continue };
                let obj = objs.insert(Object::Ep(ep.handle()));
                caps.insert_root(owner, sel, CapKind::EndPoint, obj, CapFlags::KEEP)?;
                objs.acquire(obj)?;
            }
            tiles.push(mux);
        }

        log::info!(target: "tilemux::acts", "kernel up with {} tiles", tiles.len());
        Ok(Self {
            cfg,
            caps,
            objs,
            tiles,
            acts: BTreeMap::new(),
            next_act: 0,
            waiters,
            done: Vec::new(),
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.cfg
    }

    pub fn caps(&self) -> &CapSpace {
        &self.caps
    }

    pub fn objects(&self) -> &ObjStore {
        &self.objs
    }

    pub fn pemux(&self, tile: TileId) -> Option<&PeMux> {
        self.tiles.get(tile as usize)
    }

    pub fn pemux_mut(&mut self, tile: TileId) -> Option<&mut PeMux> {
        self.tiles.get_mut(tile as usize)
    }

    /// Capability `sel` of activity `act`
    pub fn cap(&self, act: ActId, sel: Selector) -> Option<&Capability> {
        self.caps.get(Owner::Activity(act), sel)
    }

    /// Object referenced by capability `sel` of activity `act`
    pub fn cap_object(&self, act: ActId, sel: Selector) -> Option<&Object> {
        self.objs.get(self.cap(act, sel)?.obj)
    }

    pub fn activity(&self, act: ActId) -> Option<&ActivityObject> {
        self.objs.activity(*self.acts.get(&act)?)
    }

    /// Ids of all activities that are still running
    pub fn activities(&self) -> Vec<ActId> {
        self.acts
            .keys()
            .copied()
            .filter(|&a| self.activity(a).map_or(false, ActivityObject::is_alive))
            .collect()
    }

    /// Number of suspended calls
    pub fn pending_calls(&self) -> usize {
        self.waiters.pending()
    }

    pub(crate) fn live_act(&self, act: ActId) -> Result<&ActivityObject> {
        match self.activity(act) {
            Some(a) if a.is_alive() => Ok(a),
            _ => Err(Error::new(Code::ActGone, "no such activity")),
        }
    }

    /// Create an activity on `tile`
    ///
    /// The activity gets its root capabilities (tile quota, kernel memory,
    /// itself), all marked `KEEP`, and the tile's multiplexer gets a
    /// capability for it at selector `id`.
    pub fn create_activity(&mut self, tile: TileId) -> Result<ActId> {
        let tcfg = self
            .cfg
            .tiles
            .get(tile as usize)
            .ok_or(Error::new(Code::InvArgs, "no such tile"))?;
        let ep_quota = tcfg.ep_quota;
        if self.next_act >= TILEMUX_ACT {
            return Err(Error::new(Code::NoSpace, "activity ids exhausted"));
        }

        let id = self.next_act;
        self.next_act += 1;
        let owner = Owner::Activity(id);
        self.caps.create_table(owner)?;

        let obj = self.objs.insert(Object::Activity(ActivityObject::new(id, tile)));
        let root = self.install(None, Owner::TileMux(tile), id as Selector, obj, CapFlags::empty())?;
        self.install(Some(root), owner, SEL_ACT, obj, CapFlags::KEEP)?;

        let quota = self.objs.insert(Object::Tile(TileObject::new(tile, ep_quota, None)));
        self.install(None, owner, SEL_TILE, quota, CapFlags::KEEP)?;

        let kmem = self.objs.insert(Object::KMem(KMemObject::new(self.cfg.kmem_quota, None)));
        self.install(None, owner, SEL_KMEM, kmem, CapFlags::KEEP)?;

        self.acts.insert(id, obj);
        log::info!(target: "tilemux::acts", "created activity {} on tile {}", id, tile);
        Ok(id)
    }

    /// Tear down activity `act`
    ///
    /// Every capability in its table is revoked, except `KEEP` ones, which
    /// are detached so that capabilities derived from them survive. Calls of
    /// the activity that are still suspended complete with `ActGone`.
    pub fn exit_activity(&mut self, act: ActId) -> Result<()> {
        let tile = self.live_act(act)?.tile;
        if let Some(obj) = self.acts.get(&act).and_then(|&o| self.objs.activity_mut(o)) {
            obj.state = crate::objects::ActState::Dead;
        }

        let cancelled = self.waiters.cancel_act(act);
        self.fail_waiters(cancelled, Code::ActGone);

        let owner = Owner::Activity(act);
        let sels: Vec<Selector> = self
            .caps
            .table(owner)
            .map(|t| t.selectors().collect())
            .unwrap_or_default();
        for sel in sels {
            let keep = match self.caps.get(owner, sel) {
                Some(cap) => cap.keep(),
                None => continue,
            };
            if keep {
                let detached = self.caps.detach(owner, sel);
                self.drop_caps(detached.into_iter().collect());
            } else {
                let removed = self.caps.revoke(owner, sel, true);
                self.drop_caps(removed);
            }
        }

        // endpoints allocated to it through another activity's capability
        let owned: Vec<_> = self.tiles[tile as usize]
            .eps()
            .filter(|e| e.owner == Some(act) && e.is_bound())
            .map(|e| e.ep)
            .collect();
        for ep in owned {
            let old = self.tiles[tile as usize].invalidate(ep, true)?;
            self.unbind(old);
        }
        if self.tiles[tile as usize].cur_act() == Some(act) {
            self.tiles[tile as usize].switch_to(None)?;
        }

        let removed = self.caps.revoke(Owner::TileMux(tile), act as Selector, true);
        self.drop_caps(removed);
        self.caps.remove_table(owner)?;

        log::info!(target: "tilemux::acts", "activity {} exited", act);
        Ok(())
    }

    /// Give `act` a memory gate for `addr..addr + size` of `tile`'s memory
    pub fn grant_memory(
        &mut self,
        act: ActId,
        dst: Selector,
        tile: TileId,
        addr: u64,
        size: u64,
        perms: Perm,
    ) -> Result<()> {
        self.live_act(act)?;
        let memory = self
            .cfg
            .tiles
            .get(tile as usize)
            .ok_or(Error::new(Code::InvArgs, "no such tile"))?
            .memory;
        match addr.checked_add(size) {
            Some(end) if end <= memory => {}
            _ => return Err(Error::new(Code::InvArgs, "memory region outside tile memory")),
        }
        self.check_free(Owner::Activity(act), dst)?;

        let mgate = MGateObject::new(tile, addr, size, perms)?;
        let obj = self.objs.insert(Object::MGate(mgate));
        self.install(None, Owner::Activity(act), dst, obj, CapFlags::empty())?;
        log::info!(
            target: "tilemux::caps",
            "act{}:{} = MGate[tile={}, addr={:#x}, size={:#x}, perms={:?}]",
            act,
            dst,
            tile,
            addr,
            size,
            perms
        );
        Ok(())
    }

    /// Give `holder` a capability for activity `act` at `dst`
    ///
    /// The capability is derived from the one in `act`'s multiplexer table,
    /// so it vanishes when `act` exits.
    pub fn grant_activity(&mut self, holder: ActId, dst: Selector, act: ActId) -> Result<()> {
        self.live_act(holder)?;
        let tile = self.live_act(act)?.tile;
        self.check_free(Owner::Activity(holder), dst)?;
        let root = self
            .caps
            .lookup(Owner::TileMux(tile), act as Selector)
            .ok_or(Error::new(Code::ActGone, "activity capability missing"))?;
        let obj = self
            .acts
            .get(&act)
            .copied()
            .ok_or(Error::new(Code::ActGone, "no such activity"))?;
        self.install(Some(root), Owner::Activity(holder), dst, obj, CapFlags::empty())?;
        log::info!(target: "tilemux::caps", "act{}:{} = Activity[{}]", holder, dst, act);
        Ok(())
    }

    /// Send a message through the endpoint behind `ep_sel`
    ///
    /// Switches the endpoint's tile to `act` first.
    pub fn send(&mut self, act: ActId, ep_sel: Selector) -> Result<()> {
        let (tile, ep) = self.running_mux(act, ep_sel)?;
        self.tiles[tile as usize].send(ep)
    }

    /// Return a credit to the endpoint behind `ep_sel`
    pub fn ack(&mut self, act: ActId, ep_sel: Selector) -> Result<()> {
        let (tile, ep) = self.running_mux(act, ep_sel)?;
        self.tiles[tile as usize].ack(ep)
    }

    fn running_mux(&mut self, act: ActId, ep_sel: Selector) -> Result<(TileId, tcu::EpId)> {
        let tile = self.live_act(act)?.tile;
        let h = self.ep_handle(act, ep_sel)?;
        if h.tile != tile {
            return Err(Error::new(Code::NoPerm, "endpoint on another tile"));
        }
        self.tiles[tile as usize].switch_to(Some(act))?;
        Ok((h.tile, h.ep))
    }

    /// Physical endpoint behind the endpoint capability `sel` of `act`
    pub(crate) fn ep_handle(&self, act: ActId, sel: Selector) -> Result<EpHandle> {
        self.ep_cap(act, sel).map(|(_, h)| h)
    }

    /// Endpoint capability `sel` of `act` and the endpoint behind it
    pub(crate) fn ep_cap(&self, act: ActId, sel: Selector) -> Result<(NodeId, EpHandle)> {
        let (node, cap) = self.caps.get_kind(Owner::Activity(act), sel, CapKind::EndPoint)?;
        let h = self
            .objs
            .ep(cap.obj)
            .copied()
            .ok_or(Error::new(Code::InvArgs, "endpoint object gone"))?;
        Ok((node, h))
    }

    /// Fail unless `sel` can take a new capability of `owner`
    pub(crate) fn check_free(&self, owner: Owner, sel: Selector) -> Result<()> {
        if sel == crate::kif::INVALID_SEL {
            return Err(Error::new(Code::InvArgs, "invalid selector"));
        }
        match self.caps.table(owner) {
            None => Err(Error::new(Code::ActGone, "no such table")),
            Some(t) if !t.is_free(sel) => Err(Error::new(Code::InvArgs, "selector occupied")),
            Some(_) => Ok(()),
        }
    }

    /// Insert a capability for `obj` and take a reference on it
    ///
    /// An object that ends up without any reference is discarded.
    pub(crate) fn install(
        &mut self,
        parent: Option<NodeId>,
        owner: Owner,
        sel: Selector,
        obj: ObjId,
        flags: CapFlags,
    ) -> Result<NodeId> {
        let kind = self
            .objs
            .get(obj)
            .map(Object::kind)
            .ok_or(Error::new(Code::InvArgs, "object gone"))?;
        let res = match parent {
            Some(p) => self.caps.insert_child(p, owner, sel, kind, obj, flags),
            None => self.caps.insert_root(owner, sel, kind, obj, flags),
        };
        match res {
            Ok(id) => {
                self.objs.acquire(obj)?;
                Ok(id)
            }
            Err(e) => {
                for (id, o) in self.objs.discard(obj) {
                    self.on_destroy(id, o);
                }
                Err(e)
            }
        }
    }

    /// Create a new object charged to `payer` and install it
    pub(crate) fn create_object(
        &mut self,
        payer: ActId,
        parent: Option<NodeId>,
        owner: Owner,
        sel: Selector,
        obj: Object,
    ) -> Result<NodeId> {
        let (_, kcap) = self
            .caps
            .get_kind(Owner::Activity(payer), SEL_KMEM, CapKind::KMem)?;
        let kmem = kcap.obj;
        self.objs.can_charge(kmem, OBJ_COST)?;
        self.check_free(owner, sel)?;

        let id = self.objs.insert(obj);
        if let Err(e) = self.objs.charge(id, kmem, OBJ_COST) {
            self.objs.discard(id);
            return Err(e);
        }
        self.install(parent, owner, sel, id, CapFlags::empty())
    }

    /// Release removed capabilities and apply the consequences
    pub(crate) fn drop_caps(&mut self, removed: Vec<Removed>) {
        for r in removed {
            if r.cap.kind == CapKind::EndPoint {
                let node = r.id;
                let cancelled = self
                    .waiters
                    .cancel(|w| matches!(w.resume, Resume::ActivateSend { ep_cap, .. } if ep_cap == Some(node)));
                self.fail_waiters(cancelled, Code::InvArgs);
                self.free_ep_alloc(r.id, r.cap.obj);
            }
            for (id, obj) in self.objs.release(r.cap.obj) {
                self.on_destroy(id, obj);
            }
        }
    }

    /// Free the endpoint if `node` is the capability it was allocated through
    fn free_ep_alloc(&mut self, node: NodeId, obj: ObjId) {
        let Some(h) = self.objs.ep(obj).copied() else { return };
        let Some(mux) = self.tiles.get_mut(h.tile as usize) else { return };
        match mux.ep(h.ep) {
            Some(e) if e.alloc_cap == Some(node) => {}
            _ => return,
        }

        let old = match mux.invalidate(h.ep, true) {
            Ok(old) => old,
            Err(e) => {
                log::warn!(target: "tilemux::eps", "Tile{}:EP{}: {}", h.tile, h.ep, e);
                EpState::Unconfigured
            }
        };
        let quota = mux.ep_mut(h.ep).and_then(|e| {
            e.owner = None;
            e.alloc_cap = None;
            e.quota.take()
        });
        self.unbind(old);

        if let Some(q) = quota {
            if let Some(t) = self.objs.tile_mut(q) {
                t.dealloc();
            }
            for (id, o) in self.objs.release(q) {
                self.on_destroy(id, o);
            }
        }
        log::debug!(target: "tilemux::eps", "Tile{}:EP{} freed", h.tile, h.ep);
    }

    /// Reset the gate an endpoint was bound to
    pub(crate) fn unbind(&mut self, old: EpState) {
        match old {
            EpState::Send { sgate } => {
                if let Some(s) = self.objs.sgate_mut(sgate) {
                    s.activated = false;
                }
            }
            EpState::Receive { rgate } => {
                if let Some(r) = self.objs.rgate_mut(rgate) {
                    r.unbind();
                }
            }
            EpState::Memory { .. } | EpState::Unconfigured => {}
        }
    }

    fn on_destroy(&mut self, id: ObjId, obj: Object) {
        log::debug!(target: "tilemux::caps", "destroyed {:?} {:?}", obj.kind(), id);
        match obj {
            Object::RGate(_) => {
                self.invalidate_bound_to(id);
                self.invalidate_senders_to(id);
                self.waiters.notify(id, Code::RecvGone);
            }
            Object::SGate(_) => {
                self.invalidate_bound_to(id);
                let cancelled = self
                    .waiters
                    .cancel(|w| matches!(w.resume, Resume::ActivateSend { sgate, .. } if sgate == id));
                self.fail_waiters(cancelled, Code::InvArgs);
            }
            Object::MGate(_) => self.invalidate_bound_to(id),
            Object::Activity(a) => {
                self.acts.remove(&a.id);
            }
            _ => {}
        }
    }

    /// Invalidate every endpoint bound to gate `gate`
    fn invalidate_bound_to(&mut self, gate: ObjId) {
        for mux in &mut self.tiles {
            let bound: Vec<_> = mux
                .eps()
                .filter(|e| e.state.gate() == Some(gate))
                .map(|e| e.ep)
                .collect();
            for ep in bound {
                if let Err(e) = mux.invalidate(ep, true) {
                    log::warn!(target: "tilemux::eps", "Tile{}:EP{}: {}", mux.tile(), ep, e);
                }
            }
        }
    }

    /// Invalidate every send endpoint whose gate targets receive gate `rgate`
    ///
    /// The receive endpoint may be rebound to another gate later; senders of
    /// the old one must not reach it.
    fn invalidate_senders_to(&mut self, rgate: ObjId) {
        let mut senders = Vec::new();
        for mux in &self.tiles {
            for e in mux.eps() {
                if let EpState::Send { sgate } = e.state {
                    if self.objs.sgate(sgate).map_or(false, |s| s.rgate == rgate) {
                        senders.push((mux.tile(), e.ep));
                    }
                }
            }
        }
        for (tile, ep) in senders {
            match self.tiles[tile as usize].invalidate(ep, true) {
                Ok(old) => self.unbind(old),
                Err(e) => log::warn!(target: "tilemux::eps", "Tile{}:EP{}: {}", tile, ep, e),
            }
        }
    }

    /// Complete cancelled calls with `code`
    fn fail_waiters(&mut self, waiters: Vec<Waiter>, code: Code) {
        for w in waiters {
            log::debug!(target: "tilemux::sysc", "call {} of activity {} cancelled: {:?}", w.call, w.act, code);
            self.done.push(Completion {
                call: w.call,
                act: w.act,
                reply: Reply::err(code),
            });
        }
    }

    /// Finish calls whose awaited object changed state
    ///
    /// Returns the replies of all calls completed since the last invocation,
    /// including those cancelled by activity teardown.
    pub fn process_wakeups(&mut self) -> Vec<Completion> {
        self.collect_wakeups();
        core::mem::take(&mut self.done)
    }

    pub(crate) fn collect_wakeups(&mut self) {
        loop {
            let events = self.waiters.take_events();
            if events.is_empty() {
                break;
            }
            for (ev, waiters) in events {
                for w in waiters {
                    let res = if ev.result == Code::Success {
                        self.resume(w)
                    } else {
                        Err(ev.result.into())
                    };
                    log::debug!(target: "tilemux::sysc", "call {} of activity {} resumed: {:?}", w.call, w.act, res);
                    self.done.push(Completion {
                        call: w.call,
                        act: w.act,
                        reply: res.map(|()| 0).into(),
                    });
                }
            }
        }
    }
}
