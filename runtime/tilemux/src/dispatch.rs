//! Syscall and privileged-call dispatch
//!
//! # Purpose
//! Decodes requests, runs the handler and produces the reply. Each handler
//! resolves and validates all of its arguments first and only then changes
//! state, so a failing call has no side effects.
//!
//! # Integration Points
//! - Activities enter through [`Kernel::syscall`] (raw message) or
//!   [`Kernel::dispatch`] (decoded request)
//! - Tile multiplexers enter through [`Kernel::pemux_call`]
//! - Suspended calls complete through [`Kernel::process_wakeups`]

use tcu::{ActId, Perm, TileId};

use crate::activate::Activation;
use crate::cap::{CapKind, Owner, Selector};
use crate::error::{Code, Error, Result};
use crate::kernel::Kernel;
use crate::kif::{self, ActivateFlags, CapRngDesc, PemuxCall, Reply, Syscall, FIRST_FREE_SEL, SEL_TILE};
use crate::objects::{
    KMemObject, Object, RGateObject, SGateObject, SemObject, ServiceObject, SessionObject,
    TileObject,
};
use crate::waiters::CallId;

/// Most capabilities a single exchange may transfer
pub const MAX_EXCHANGE: u64 = 32;

/// Longest service name
pub const MAX_SRV_NAME: usize = 64;

/// Result of dispatching a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Replied(Reply),
    /// The reply follows as a [`crate::Completion`] with this call id
    Suspended(CallId),
}

enum Outcome {
    Value(u64),
    Suspended(CallId),
}

impl From<u64> for Outcome {
    fn from(v: u64) -> Self {
        Outcome::Value(v)
    }
}

impl Kernel {
    /// Handle a raw syscall message of `act`
    pub fn syscall(&mut self, act: ActId, msg: &[u8]) -> Dispatch {
        match kif::decode::<Syscall>(msg) {
            Ok(call) => self.dispatch(act, &call),
            Err(e) => {
                log::debug!(target: "tilemux::sysc", "act{}: {}", act, e);
                Dispatch::Replied(Reply::err(e.code()))
            }
        }
    }

    /// Handle a decoded syscall of `act`
    pub fn dispatch(&mut self, act: ActId, call: &Syscall) -> Dispatch {
        let res = self.handle(act, call);
        let out = match res {
            Ok(Outcome::Value(v)) => Dispatch::Replied(Reply::ok(v)),
            Ok(Outcome::Suspended(c)) => Dispatch::Suspended(c),
            Err(e) => {
                log::debug!(target: "tilemux::sysc", "act{}: {:?} failed: {}", act, call, e);
                Dispatch::Replied(Reply::err(e.code()))
            }
        };
        self.collect_wakeups();
        out
    }

    /// Handle a syscall and wait for nothing
    ///
    /// A call that would suspend fails with `WouldBlock` instead.
    pub fn call(&mut self, act: ActId, call: &Syscall) -> Result<u64> {
        match self.dispatch(act, call) {
            Dispatch::Replied(r) => r.into_result(),
            Dispatch::Suspended(_) => Err(Error::new(Code::WouldBlock, "call suspended")),
        }
    }

    /// Handle a privileged call from the multiplexer of `tile`
    pub fn pemux_call(&mut self, tile: TileId, msg: &[u8]) -> Reply {
        let res = kif::decode::<PemuxCall>(msg).and_then(|call| self.handle_pemux(tile, &call));
        if let Err(e) = &res {
            log::debug!(target: "tilemux::pexc", "Tile{}: {}", tile, e);
        }
        self.collect_wakeups();
        res.map(|()| 0).into()
    }

    fn handle_pemux(&mut self, tile: TileId, call: &PemuxCall) -> Result<()> {
        let PemuxCall::Activate {
            act_sel,
            gate_sel,
            ep_sel,
            addr,
        } = *call;
        log::debug!(
            target: "tilemux::pexc",
            "PEXCall[Tile{}] activate(act={}, gate={}, ep={:#x}, addr={:#x})",
            tile,
            act_sel,
            gate_sel,
            ep_sel,
            addr
        );

        let owner = Owner::TileMux(tile);
        if self.caps.table(owner).is_none() {
            return Err(Error::new(Code::InvArgs, "no such tile"));
        }
        let (_, acap) = self.caps.get_kind(owner, act_sel, CapKind::Activity)?;
        let act = self
            .objs
            .activity(acap.obj)
            .ok_or(Error::new(Code::ActGone, "activity gone"))?
            .id;
        let (ep_node, ecap) = self.caps.get_kind(owner, ep_sel, CapKind::EndPoint)?;
        let ep = *self
            .objs
            .ep(ecap.obj)
            .ok_or(Error::new(Code::InvArgs, "endpoint object gone"))?;

        match self.activate(act, ep, Some(ep_node), gate_sel, addr, false)? {
            Activation::Done => Ok(()),
            Activation::Suspended(_) => Err(Error::new(Code::WouldBlock, "activation suspended")),
        }
    }

    fn handle(&mut self, act: ActId, call: &Syscall) -> Result<Outcome> {
        self.live_act(act)?;
        log::debug!(target: "tilemux::sysc", "act{}: {:?}", act, call);

        match *call {
            Syscall::CreateRGate { dst, order, msg_order } => {
                self.create_rgate(act, dst, order, msg_order).map(Outcome::from)
            }
            Syscall::CreateSGate {
                dst,
                rgate,
                label,
                credits,
            } => self.create_sgate(act, dst, rgate, label, credits).map(Outcome::from),
            Syscall::CreateSrv { dst, rgate, ref name } => {
                self.create_srv(act, dst, rgate, name).map(Outcome::from)
            }
            Syscall::CreateSess { dst, srv, ident } => {
                self.create_sess(act, dst, srv, ident).map(Outcome::from)
            }
            Syscall::CreateSem { dst, value } => self.create_sem(act, dst, value).map(Outcome::from),
            Syscall::AllocEp { dst, act: act_sel } => self.alloc_ep(act, dst, act_sel).map(Outcome::from),
            Syscall::Activate {
                ep,
                gate,
                rbuf_addr,
                flags,
            } => {
                let flags = ActivateFlags::from_bits(flags)
                    .ok_or(Error::new(Code::InvArgs, "unknown activate flags"))?;
                let (node, h) = self.ep_cap(act, ep)?;
                let wait = flags.contains(ActivateFlags::WAIT);
                match self.activate(act, h, Some(node), gate, rbuf_addr, wait)? {
                    Activation::Done => Ok(Outcome::Value(0)),
                    Activation::Suspended(c) => Ok(Outcome::Suspended(c)),
                }
            }
            Syscall::DeriveMem {
                act: act_sel,
                dst,
                src,
                offset,
                size,
                perms,
            } => self
                .derive_mem(act, act_sel, dst, src, offset, size, perms)
                .map(Outcome::from),
            Syscall::DeriveKMem { kmem, dst, quota } => {
                self.derive_kmem(act, kmem, dst, quota).map(Outcome::from)
            }
            Syscall::DeriveTile { tile, dst, eps } => self.derive_tile(act, tile, dst, eps).map(Outcome::from),
            Syscall::Derive { act: act_sel, src, dst } => {
                self.derive(act, act_sel, src, dst).map(Outcome::from)
            }
            Syscall::Revoke { act: act_sel, crd, own } => {
                self.revoke(act, act_sel, crd, own).map(Outcome::from)
            }
            Syscall::Exchange {
                act: act_sel,
                own,
                other,
                obtain,
            } => self.exchange(act, act_sel, own, other, obtain).map(Outcome::from),
            Syscall::TileQuota { tile } => self.tile_quota(act, tile).map(Outcome::from),
            Syscall::Noop => Ok(Outcome::Value(0)),
        }
    }

    /// Running activity named by capability `sel` of `act`
    fn target_act(&self, act: ActId, sel: Selector) -> Result<ActId> {
        let (_, cap) = self.caps.get_kind(Owner::Activity(act), sel, CapKind::Activity)?;
        match self.objs.activity(cap.obj) {
            Some(a) if a.is_alive() => Ok(a.id),
            _ => Err(Error::new(Code::ActGone, "activity gone")),
        }
    }

    fn create_rgate(&mut self, act: ActId, dst: Selector, order: u8, msg_order: u8) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let rgate = RGateObject::new(order, msg_order)?;
        let tile = self.live_act(act)?.tile;
        let space = self
            .pemux(tile)
            .map_or(0, |m| m.config().rbuf_size);
        if rgate.size() > space {
            return Err(Error::new(Code::InvArgs, "receive buffer larger than receive space"));
        }

        self.create_object(act, None, owner, dst, Object::RGate(rgate))?;
        log::info!(
            target: "tilemux::caps",
            "act{}:{} = RGate[order={}, msgorder={}]",
            act,
            dst,
            order,
            msg_order
        );
        Ok(0)
    }

    fn create_sgate(
        &mut self,
        act: ActId,
        dst: Selector,
        rgate_sel: Selector,
        label: tcu::Label,
        credits: u32,
    ) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let (_, rcap) = self.caps.get_kind(owner, rgate_sel, CapKind::RGate)?;
        let sgate = SGateObject::new(rcap.obj, label, credits)?;

        self.create_object(act, None, owner, dst, Object::SGate(sgate))?;
        log::info!(
            target: "tilemux::caps",
            "act{}:{} = SGate[rgate={}, label={:#x}, crd={}]",
            act,
            dst,
            rgate_sel,
            label,
            credits
        );
        Ok(0)
    }

    fn create_srv(&mut self, act: ActId, dst: Selector, rgate_sel: Selector, name: &str) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        if name.is_empty() || name.len() > MAX_SRV_NAME {
            return Err(Error::new(Code::InvArgs, "invalid service name"));
        }
        let (_, rcap) = self.caps.get_kind(owner, rgate_sel, CapKind::RGate)?;
        let srv = ServiceObject {
            name: name.to_string(),
            rgate: rcap.obj,
            owner: act,
        };

        self.create_object(act, None, owner, dst, Object::Service(srv))?;
        log::info!(target: "tilemux::caps", "act{}:{} = Service[{}]", act, dst, name);
        Ok(0)
    }

    fn create_sess(&mut self, act: ActId, dst: Selector, srv_sel: Selector, ident: u64) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let (srv_node, scap) = self.caps.get_kind(owner, srv_sel, CapKind::Service)?;
        let sess = SessionObject {
            srv: scap.obj,
            ident,
        };

        self.create_object(act, Some(srv_node), owner, dst, Object::Session(sess))?;
        log::info!(target: "tilemux::caps", "act{}:{} = Session[srv={}, ident={:#x}]", act, dst, srv_sel, ident);
        Ok(0)
    }

    fn create_sem(&mut self, act: ActId, dst: Selector, value: u32) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        self.create_object(act, None, owner, dst, Object::Sem(SemObject::new(value)))?;
        log::info!(target: "tilemux::caps", "act{}:{} = Sem[{}]", act, dst, value);
        Ok(0)
    }

    /// Allocate a free endpoint on the tile of the activity at `act_sel`
    ///
    /// The allocation is charged to the caller's tile quota, which must be
    /// for that tile. Replies the endpoint id.
    fn alloc_ep(&mut self, act: ActId, dst: Selector, act_sel: Selector) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let target = self.target_act(act, act_sel)?;
        let tile = self.live_act(target)?.tile;

        let (_, qcap) = self.caps.get_kind(owner, SEL_TILE, CapKind::Tile)?;
        let quota = qcap.obj;
        let tobj = self
            .objs
            .tile(quota)
            .ok_or(Error::new(Code::InvArgs, "tile object gone"))?;
        if tobj.tile != tile {
            return Err(Error::new(Code::InvArgs, "tile quota is for another tile"));
        }
        if tobj.free() == 0 {
            return Err(Error::new(Code::NoSpace, "endpoint quota exhausted"));
        }

        let mux = self
            .pemux(tile)
            .ok_or(Error::new(Code::InvArgs, "no such tile"))?;
        let ep = mux
            .find_free_ep()
            .ok_or(Error::new(Code::NoSpace, "no free endpoint"))?;
        let root_sel = mux
            .ep_sel(ep)
            .ok_or(Error::new(Code::InvArgs, "endpoint not managed"))?;
        let root = self
            .caps
            .lookup(Owner::TileMux(tile), root_sel)
            .ok_or(Error::new(Code::InvArgs, "endpoint capability missing"))?;
        let ep_obj = self
            .caps
            .node(root)
            .map(|c| c.obj)
            .ok_or(Error::new(Code::InvArgs, "endpoint capability missing"))?;

        let node = self.install(Some(root), owner, dst, ep_obj, crate::cap::CapFlags::empty())?;
        if let Some(t) = self.objs.tile_mut(quota) {
            t.alloc()?;
        }
        self.objs.acquire(quota)?;
        if let Some(e) = self.pemux_mut(tile).and_then(|m| m.ep_mut(ep)) {
            e.owner = Some(target);
            e.alloc_cap = Some(node);
            e.quota = Some(quota);
        }

        log::info!(target: "tilemux::eps", "act{}:{} = Tile{}:EP{} for activity {}", act, dst, tile, ep, target);
        Ok(ep as u64)
    }

    #[allow(clippy::too_many_arguments)]
    fn derive_mem(
        &mut self,
        act: ActId,
        act_sel: Selector,
        dst: Selector,
        src: Selector,
        offset: u64,
        size: u64,
        perms: u32,
    ) -> Result<u64> {
        let target = self.target_act(act, act_sel)?;
        let towner = Owner::Activity(target);
        self.check_free(towner, dst)?;
        let perms = Perm::from_bits(perms).ok_or(Error::new(Code::InvArgs, "unknown permissions"))?;
        let (src_node, mcap) = self.caps.get_kind(Owner::Activity(act), src, CapKind::MGate)?;
        let child = self
            .objs
            .mgate(mcap.obj)
            .ok_or(Error::new(Code::InvArgs, "memory gate gone"))?
            .derive(offset, size, perms, target)?;

        log::info!(
            target: "tilemux::caps",
            "act{}:{} = MGate[tile={}, addr={:#x}, size={:#x}, perms={:?}]",
            target,
            dst,
            child.tile,
            child.addr,
            child.size,
            child.perms
        );
        self.create_object(act, Some(src_node), towner, dst, Object::MGate(child))?;
        Ok(0)
    }

    fn derive_kmem(&mut self, act: ActId, kmem_sel: Selector, dst: Selector, quota: u64) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let (src_node, kcap) = self.caps.get_kind(owner, kmem_sel, CapKind::KMem)?;
        let src = kcap.obj;
        if quota == 0 {
            return Err(Error::new(Code::InvArgs, "empty quota"));
        }
        self.objs.can_charge(src, quota)?;

        let id = self.objs.insert(Object::KMem(KMemObject::new(quota, Some(src))));
        self.install(Some(src_node), owner, dst, id, crate::cap::CapFlags::empty())?;
        if let Some(k) = self.objs.kmem_mut(src) {
            k.left -= quota;
        }
        self.objs.acquire(src)?;
        log::info!(target: "tilemux::caps", "act{}:{} = KMem[quota={:#x}]", act, dst, quota);
        Ok(0)
    }

    fn derive_tile(&mut self, act: ActId, tile_sel: Selector, dst: Selector, eps: u32) -> Result<u64> {
        let owner = Owner::Activity(act);
        self.check_free(owner, dst)?;
        let (src_node, tcap) = self.caps.get_kind(owner, tile_sel, CapKind::Tile)?;
        let src = tcap.obj;
        let parent = self
            .objs
            .tile(src)
            .ok_or(Error::new(Code::InvArgs, "tile object gone"))?;
        if eps == 0 {
            return Err(Error::new(Code::InvArgs, "empty quota"));
        }
        if parent.free() < eps {
            return Err(Error::new(Code::NoSpace, "endpoint quota exhausted"));
        }
        let tile = parent.tile;

        let id = self.objs.insert(Object::Tile(TileObject::new(tile, eps, Some(src))));
        self.install(Some(src_node), owner, dst, id, crate::cap::CapFlags::empty())?;
        if let Some(t) = self.objs.tile_mut(src) {
            t.quota -= eps;
        }
        self.objs.acquire(src)?;
        log::info!(target: "tilemux::caps", "act{}:{} = Tile[tile={}, eps={}]", act, dst, tile, eps);
        Ok(0)
    }

    /// Derive a copy of capability `src` of `act` into the activity at `act_sel`
    fn derive(&mut self, act: ActId, act_sel: Selector, src: Selector, dst: Selector) -> Result<u64> {
        let target = self.target_act(act, act_sel)?;
        let towner = Owner::Activity(target);
        self.check_free(towner, dst)?;
        let src_node = self
            .caps
            .lookup(Owner::Activity(act), src)
            .ok_or(Error::new(Code::InvArgs, "empty source selector"))?;
        let obj = self
            .caps
            .node(src_node)
            .map(|c| c.obj)
            .ok_or(Error::new(Code::InvArgs, "empty source selector"))?;

        self.install(Some(src_node), towner, dst, obj, crate::cap::CapFlags::empty())?;
        log::info!(target: "tilemux::caps", "act{}:{} derived to act{}:{}", act, src, target, dst);
        Ok(0)
    }

    /// Revoke the capabilities of `crd` in the table of the activity at `act_sel`
    ///
    /// With `own`, the capabilities themselves go as well; otherwise only
    /// what was derived from them. Empty selectors are skipped.
    fn revoke(&mut self, act: ActId, act_sel: Selector, crd: CapRngDesc, own: bool) -> Result<u64> {
        let target = self.target_act(act, act_sel)?;
        let range = crd
            .selectors()
            .ok_or(Error::new(Code::InvArgs, "selector range overflows"))?;
        if own && range.start < FIRST_FREE_SEL && !range.is_empty() {
            return Err(Error::new(Code::InvArgs, "root capabilities cannot be revoked"));
        }

        let owner = Owner::Activity(target);
        let sels: Vec<Selector> = self
            .caps
            .table(owner)
            .map(|t| t.selectors().filter(|s| range.contains(s)).collect())
            .unwrap_or_default();
        let mut count = 0;
        for sel in sels {
            let removed = self.caps.revoke(owner, sel, own);
            count += removed.len();
            self.drop_caps(removed);
        }
        log::info!(target: "tilemux::caps", "act{}: revoked {:?} of act{} ({} caps)", act, range, target, count);
        Ok(0)
    }

    /// Copy capabilities between the caller and the activity at `act_sel`
    ///
    /// With `obtain`, `other` of the target is copied to `own` of the caller;
    /// otherwise `own` is copied to `other`. The copies are children of the
    /// sources, so revoking a source revokes its copy.
    fn exchange(
        &mut self,
        act: ActId,
        act_sel: Selector,
        own: CapRngDesc,
        other: CapRngDesc,
        obtain: bool,
    ) -> Result<u64> {
        let target = self.target_act(act, act_sel)?;
        if own.count != other.count {
            return Err(Error::new(Code::InvArgs, "ranges differ in size"));
        }
        if own.count > MAX_EXCHANGE {
            return Err(Error::new(Code::InvArgs, "too many capabilities"));
        }
        let own_r = own
            .selectors()
            .ok_or(Error::new(Code::InvArgs, "selector range overflows"))?;
        let other_r = other
            .selectors()
            .ok_or(Error::new(Code::InvArgs, "selector range overflows"))?;

        let (src_owner, src_r, dst_owner, dst_r) = if obtain {
            (Owner::Activity(target), other_r, Owner::Activity(act), own_r)
        } else {
            (Owner::Activity(act), own_r, Owner::Activity(target), other_r)
        };
        if src_owner == dst_owner && src_r.start < dst_r.end && dst_r.start < src_r.end {
            return Err(Error::new(Code::InvArgs, "overlapping ranges"));
        }

        let mut srcs = Vec::with_capacity(own.count as usize);
        for sel in src_r {
            let node = self
                .caps
                .lookup(src_owner, sel)
                .ok_or(Error::new(Code::InvArgs, "empty source selector"))?;
            srcs.push(node);
        }
        for sel in dst_r.clone() {
            self.check_free(dst_owner, sel)?;
        }

        for (node, sel) in srcs.into_iter().zip(dst_r) {
            let obj = self
                .caps
                .node(node)
                .map(|c| c.obj)
                .ok_or(Error::new(Code::InvArgs, "empty source selector"))?;
            self.install(Some(node), dst_owner, sel, obj, crate::cap::CapFlags::empty())?;
        }
        log::info!(
            target: "tilemux::caps",
            "act{}: exchanged {} caps with act{} (obtain={})",
            act,
            own.count,
            target,
            obtain
        );
        Ok(0)
    }

    fn tile_quota(&mut self, act: ActId, tile_sel: Selector) -> Result<u64> {
        let (_, tcap) = self.caps.get_kind(Owner::Activity(act), tile_sel, CapKind::Tile)?;
        let t = self
            .objs
            .tile(tcap.obj)
            .ok_or(Error::new(Code::InvArgs, "tile object gone"))?;
        Ok(t.free() as u64)
    }
}
