//! Integration tests for the kernel core
//!
//! These tests drive the kernel the way activities and tile multiplexers do,
//! through syscalls and privileged calls, and check:
//! - Gate activation order and send credits
//! - Revocation across activity tables
//! - Endpoint, header and quota accounting
//! - Suspended activations
//! - Independent kernels in parallel threads

use tilemux::config::RBUF_BASE;
use tilemux::ep::EpState;
use tilemux::kif::{self, FIRST_FREE_SEL, INVALID_SEL, SEL_ACT, SEL_TILE};
use tilemux::tcu::{ActId, FIRST_FREE_EP};
use tilemux::*;

const RGATE: Selector = 10;
const SGATE: Selector = 11;
const EP: Selector = 20;
const OTHER: Selector = 5;

fn kernel() -> Kernel {
    Kernel::new(PlatformConfig::default()).unwrap()
}

fn ok(k: &mut Kernel, act: ActId, call: Syscall) -> u64 {
    match k.call(act, &call) {
        Ok(v) => v,
        Err(e) => panic!("{:?} failed: {}", call, e),
    }
}

fn err(k: &mut Kernel, act: ActId, call: Syscall) -> Code {
    k.call(act, &call).unwrap_err().code()
}

fn activate(ep: Selector, gate: Selector, rbuf_addr: u64) -> Syscall {
    Syscall::Activate {
        ep,
        gate,
        rbuf_addr,
        flags: 0,
    }
}

fn revoke(start: Selector, own: bool) -> Syscall {
    Syscall::Revoke {
        act: SEL_ACT,
        crd: CapRngDesc::one(start),
        own,
    }
}

fn give(sel: Selector) -> Syscall {
    Syscall::Exchange {
        act: OTHER,
        own: CapRngDesc::one(sel),
        other: CapRngDesc::one(sel),
        obtain: false,
    }
}

/// Server on tile 0 with a receive gate, client on tile 1 holding a send
/// gate for it. Nothing is activated yet.
fn gates(k: &mut Kernel, credits: u32) -> (ActId, ActId) {
    let server = k.create_activity(0).unwrap();
    let client = k.create_activity(1).unwrap();
    k.grant_activity(server, OTHER, client).unwrap();

    ok(k, server, Syscall::CreateRGate { dst: RGATE, order: 8, msg_order: 6 });
    ok(k, server, Syscall::CreateSGate { dst: SGATE, rgate: RGATE, label: 0x1234, credits });
    ok(k, server, give(SGATE));
    ok(k, server, Syscall::AllocEp { dst: EP, act: SEL_ACT });
    ok(k, client, Syscall::AllocEp { dst: EP, act: SEL_ACT });
    (server, client)
}

/// Like [`gates`], with both gates activated
fn channel(k: &mut Kernel, credits: u32) -> (ActId, ActId) {
    let (server, client) = gates(k, credits);
    ok(k, server, activate(EP, RGATE, RBUF_BASE + 0x100));
    ok(k, client, activate(EP, SGATE, 0));
    (server, client)
}

/// Receive gate with order 8 and message order 6 takes 4 header slots
#[test]
fn test_receive_gate_allocates_headers() {
    let mut k = kernel();
    let (server, _) = gates(&mut k, 1);
    let before = k.pemux(0).unwrap().headers().available();

    let ep = FIRST_FREE_EP;
    ok(&mut k, server, activate(EP, RGATE, RBUF_BASE + 0x100));

    let mux = k.pemux(0).unwrap();
    assert_eq!(mux.headers().available(), before - 4);
    assert!(matches!(mux.ep(ep).unwrap().state, EpState::Receive { .. }));
    match k.cap_object(server, RGATE) {
        Some(tilemux::objects::Object::RGate(r)) => {
            assert_eq!(r.header, Some(1));
            assert_eq!(r.addr, RBUF_BASE + 0x100);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// A send gate can be created before its receive gate is activated, but not
/// activated
#[test]
fn test_send_gate_needs_activated_receive_gate() {
    let mut k = kernel();
    let (_, client) = gates(&mut k, 1);
    assert!(k.cap(client, SGATE).is_some());
    assert_eq!(err(&mut k, client, activate(EP, SGATE, 0)), Code::InvArgs);
    assert!(!k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap().is_bound());
}

/// Three credits allow three sends; the fourth fails until a reply returns one
#[test]
fn test_send_credits() {
    let mut k = kernel();
    let (_, client) = channel(&mut k, 3);

    for _ in 0..3 {
        k.send(client, EP).unwrap();
    }
    assert_eq!(k.send(client, EP).unwrap_err().code(), Code::MissCredits);
    k.ack(client, EP).unwrap();
    k.send(client, EP).unwrap();
}

/// Deriving a memory gate at `offset == size` fails and touches nothing
#[test]
fn test_derive_mem_offset_at_size() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    k.grant_memory(a, 10, 0, 0x1000, 0x1000, tcu::Perm::RW).unwrap();
    let caps = k.caps().len();

    let code = err(
        &mut k,
        a,
        Syscall::DeriveMem { act: SEL_ACT, dst: 11, src: 10, offset: 0x1000, size: 1, perms: 1 },
    );
    assert_eq!(code, Code::InvArgs);
    assert_eq!(k.caps().len(), caps);
    assert!(k.pemux(0).unwrap().eps().all(|e| !e.is_bound()));
}

/// Derived memory gates cannot widen permissions
#[test]
fn test_derive_mem_narrows_only() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    k.grant_memory(a, 10, 0, 0x1000, 0x1000, tcu::Perm::R).unwrap();

    let code = err(
        &mut k,
        a,
        Syscall::DeriveMem { act: SEL_ACT, dst: 11, src: 10, offset: 0, size: 0x100, perms: 3 },
    );
    assert_eq!(code, Code::NoPerm);
    ok(&mut k, a, Syscall::DeriveMem { act: SEL_ACT, dst: 11, src: 10, offset: 0x100, size: 0x100, perms: 1 });
    match k.cap_object(a, 11) {
        Some(tilemux::objects::Object::MGate(m)) => {
            assert_eq!(m.addr, 0x1100);
            assert_eq!(m.size, 0x100);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Revoking the receive gate leaves the client's send gate in place but
/// unusable
#[test]
fn test_revoked_receive_gate_severs_send_gate() {
    let mut k = kernel();
    let (server, client) = gates(&mut k, 1);

    ok(&mut k, server, revoke(RGATE, true));
    assert!(k.cap(server, RGATE).is_none());
    assert!(k.cap(client, SGATE).is_some());
    assert_eq!(err(&mut k, client, activate(EP, SGATE, 0)), Code::InvArgs);
}

/// Revoking the receive gate also cuts off send endpoints already bound to
/// it, even when its endpoint is reused for another receive gate
#[test]
fn test_revoked_receive_gate_invalidates_senders() {
    let mut k = kernel();
    let (server, client) = channel(&mut k, 3);
    k.send(client, EP).unwrap();

    ok(&mut k, server, revoke(RGATE, true));
    let client_ep = k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap();
    assert_eq!(client_ep.state, EpState::Unconfigured);
    assert!(client_ep.is_allocated());

    // same endpoint, same buffer, unrelated gate
    ok(&mut k, server, Syscall::CreateRGate { dst: 12, order: 8, msg_order: 6 });
    ok(&mut k, server, activate(EP, 12, RBUF_BASE + 0x100));
    assert!(k.send(client, EP).is_err());
    assert_eq!(err(&mut k, client, activate(EP, SGATE, 0)), Code::InvArgs);
}

/// Destroying an activated receive gate frees its endpoint and header slots
#[test]
fn test_revoked_receive_gate_releases_endpoint() {
    let mut k = kernel();
    let (server, _) = channel(&mut k, 1);
    let headers = k.pemux(0).unwrap().config().header_count - 1;

    ok(&mut k, server, revoke(RGATE, true));
    let mux = k.pemux(0).unwrap();
    assert!(!mux.ep(FIRST_FREE_EP).unwrap().is_bound());
    assert_eq!(mux.headers().available(), headers);
}

/// Buffer exactly at the end of the receive space fits, one byte further does not
#[test]
fn test_receive_buffer_boundary() {
    let mut k = kernel();
    let (server, _) = gates(&mut k, 1);
    let end = RBUF_BASE + k.config().tiles[0].rbuf_size;

    assert_eq!(err(&mut k, server, activate(EP, RGATE, end - 256 + 1)), Code::InvArgs);
    ok(&mut k, server, activate(EP, RGATE, end - 256));
}

/// Running out of header slots allocates nothing
#[test]
fn test_header_exhaustion() {
    let mut cfg = PlatformConfig::default();
    cfg.tiles[0].header_count = 8;
    let mut k = Kernel::new(cfg).unwrap();
    let a = k.create_activity(0).unwrap();
    for sel in [10, 11] {
        ok(&mut k, a, Syscall::CreateRGate { dst: sel, order: 8, msg_order: 6 });
    }
    ok(&mut k, a, Syscall::AllocEp { dst: 20, act: SEL_ACT });
    ok(&mut k, a, Syscall::AllocEp { dst: 21, act: SEL_ACT });

    ok(&mut k, a, activate(20, 10, RBUF_BASE + 0x1000));
    assert_eq!(err(&mut k, a, activate(21, 11, RBUF_BASE + 0x2000)), Code::OutOfMem);
    assert_eq!(k.pemux(0).unwrap().headers().available(), 3);

    // freed slots are handed out again
    ok(&mut k, a, revoke(10, true));
    ok(&mut k, a, activate(21, 11, RBUF_BASE + 0x2000));
}

/// A gate is bound to one endpoint at a time
#[test]
fn test_activated_gate_is_exclusive() {
    let mut k = kernel();
    let (server, client) = channel(&mut k, 1);
    ok(&mut k, server, Syscall::AllocEp { dst: 21, act: SEL_ACT });
    ok(&mut k, client, Syscall::AllocEp { dst: 21, act: SEL_ACT });

    assert_eq!(err(&mut k, server, activate(21, RGATE, RBUF_BASE + 0x1000)), Code::Exists);
    assert_eq!(err(&mut k, client, activate(21, SGATE, 0)), Code::Exists);
    // activating on the same endpoint again is fine
    ok(&mut k, client, activate(EP, SGATE, 0));
}

/// Unbinding a send endpoint waits for outstanding credits
#[test]
fn test_unbind_with_messages_in_flight() {
    let mut k = kernel();
    let (_, client) = channel(&mut k, 2);
    k.send(client, EP).unwrap();

    assert_eq!(err(&mut k, client, activate(EP, INVALID_SEL, 0)), Code::Abort);
    k.ack(client, EP).unwrap();
    ok(&mut k, client, activate(EP, INVALID_SEL, 0));
    // the gate can be bound again
    ok(&mut k, client, activate(EP, SGATE, 0));
}

/// Revoking twice is not an error and frees the endpoint once
#[test]
fn test_revoke_is_idempotent() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let ep = ok(&mut k, a, Syscall::AllocEp { dst: 20, act: SEL_ACT });
    assert_eq!(ok(&mut k, a, Syscall::TileQuota { tile: SEL_TILE }), 55);

    ok(&mut k, a, revoke(20, true));
    ok(&mut k, a, revoke(20, true));
    ok(&mut k, a, Syscall::Revoke { act: SEL_ACT, crd: CapRngDesc::new(100, u64::MAX - 100), own: true });

    assert_eq!(ok(&mut k, a, Syscall::TileQuota { tile: SEL_TILE }), 56);
    assert!(!k.pemux(0).unwrap().ep(ep as tcu::EpId).unwrap().is_allocated());
    assert_eq!(ok(&mut k, a, Syscall::AllocEp { dst: 20, act: SEL_ACT }), ep);
}

/// Revocation follows derivations into other activities' tables
#[test]
fn test_revoke_reaches_all_descendants() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(0).unwrap();
    let c = k.create_activity(1).unwrap();
    k.grant_activity(a, OTHER, b).unwrap();
    k.grant_activity(b, OTHER, c).unwrap();

    ok(&mut k, a, Syscall::CreateSem { dst: 10, value: 1 });
    ok(&mut k, a, Syscall::Derive { act: OTHER, src: 10, dst: 12 });
    ok(&mut k, b, Syscall::Derive { act: OTHER, src: 12, dst: 14 });
    ok(&mut k, a, Syscall::Derive { act: SEL_ACT, src: 10, dst: 11 });

    // children only
    ok(&mut k, a, revoke(10, false));
    assert!(k.cap(a, 10).is_some());
    assert!(k.cap(a, 11).is_none());
    assert!(k.cap(b, 12).is_none());
    assert!(k.cap(c, 14).is_none());

    ok(&mut k, a, revoke(10, true));
    assert!(k.cap(a, 10).is_none());
}

/// Root capabilities survive revocation requests
#[test]
fn test_root_caps_are_protected() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let code = err(
        &mut k,
        a,
        Syscall::Revoke { act: SEL_ACT, crd: CapRngDesc::new(0, FIRST_FREE_SEL + 1), own: true },
    );
    assert_eq!(code, Code::InvArgs);
    assert!(k.cap(a, SEL_TILE).is_some());
}

/// Exchange checks the whole destination range before copying anything
#[test]
fn test_exchange_is_all_or_nothing() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(0).unwrap();
    k.grant_activity(a, OTHER, b).unwrap();
    ok(&mut k, a, Syscall::CreateSem { dst: 10, value: 0 });
    ok(&mut k, a, Syscall::CreateSem { dst: 11, value: 0 });
    ok(&mut k, b, Syscall::CreateSem { dst: 13, value: 0 });

    let code = err(
        &mut k,
        a,
        Syscall::Exchange {
            act: OTHER,
            own: CapRngDesc::new(10, 2),
            other: CapRngDesc::new(12, 2),
            obtain: false,
        },
    );
    assert_eq!(code, Code::InvArgs);
    assert!(k.cap(b, 12).is_none());

    let code = err(
        &mut k,
        a,
        Syscall::Exchange {
            act: OTHER,
            own: CapRngDesc::new(10, 2),
            other: CapRngDesc::new(20, 3),
            obtain: false,
        },
    );
    assert_eq!(code, Code::InvArgs);
}

/// Obtained capabilities are children of the source
#[test]
fn test_exchange_obtain() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(0).unwrap();
    k.grant_activity(a, OTHER, b).unwrap();
    ok(&mut k, b, Syscall::CreateSem { dst: 13, value: 0 });

    ok(
        &mut k,
        a,
        Syscall::Exchange {
            act: OTHER,
            own: CapRngDesc::one(20),
            other: CapRngDesc::one(13),
            obtain: true,
        },
    );
    assert_eq!(k.cap(a, 20).map(|c| c.kind), Some(CapKind::Sem));
    assert_eq!(k.cap(a, 20).map(|c| c.obj), k.cap(b, 13).map(|c| c.obj));

    ok(&mut k, b, revoke(13, true));
    assert!(k.cap(a, 20).is_none());
}

/// Endpoint quota can be split and comes back
#[test]
fn test_tile_quota_split() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    ok(&mut k, a, Syscall::DeriveTile { tile: SEL_TILE, dst: 10, eps: 4 });
    assert_eq!(ok(&mut k, a, Syscall::TileQuota { tile: SEL_TILE }), 52);
    assert_eq!(ok(&mut k, a, Syscall::TileQuota { tile: 10 }), 4);
    assert_eq!(
        err(&mut k, a, Syscall::DeriveTile { tile: SEL_TILE, dst: 11, eps: 100 }),
        Code::NoSpace
    );

    ok(&mut k, a, revoke(10, true));
    assert_eq!(ok(&mut k, a, Syscall::TileQuota { tile: SEL_TILE }), 56);
}

/// Endpoint allocation stops at the quota
#[test]
fn test_endpoint_quota_exhausted() {
    let mut cfg = PlatformConfig::default();
    cfg.tiles[0].ep_quota = 2;
    let mut k = Kernel::new(cfg).unwrap();
    let a = k.create_activity(0).unwrap();

    ok(&mut k, a, Syscall::AllocEp { dst: 20, act: SEL_ACT });
    ok(&mut k, a, Syscall::AllocEp { dst: 21, act: SEL_ACT });
    assert_eq!(err(&mut k, a, Syscall::AllocEp { dst: 22, act: SEL_ACT }), Code::NoSpace);
    ok(&mut k, a, revoke(20, true));
    ok(&mut k, a, Syscall::AllocEp { dst: 22, act: SEL_ACT });
}

/// Endpoints of another tile cannot be allocated with the local quota
#[test]
fn test_alloc_ep_for_other_tile() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(1).unwrap();
    k.grant_activity(a, OTHER, b).unwrap();
    assert_eq!(err(&mut k, a, Syscall::AllocEp { dst: 20, act: OTHER }), Code::InvArgs);
}

/// Credits of each activity survive context switches on a shared tile
#[test]
fn test_context_switch_keeps_credits() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(0).unwrap();
    for (act, rbuf) in [(a, RBUF_BASE + 0x1000), (b, RBUF_BASE + 0x2000)] {
        ok(&mut k, act, Syscall::CreateRGate { dst: RGATE, order: 8, msg_order: 6 });
        ok(&mut k, act, Syscall::CreateSGate { dst: SGATE, rgate: RGATE, label: act as u64, credits: 2 });
        ok(&mut k, act, Syscall::AllocEp { dst: 20, act: SEL_ACT });
        ok(&mut k, act, Syscall::AllocEp { dst: 21, act: SEL_ACT });
        ok(&mut k, act, activate(20, RGATE, rbuf));
        ok(&mut k, act, activate(21, SGATE, 0));
    }

    k.send(a, 21).unwrap();
    k.send(b, 21).unwrap();
    assert_eq!(k.pemux(0).unwrap().cur_act(), Some(b));
    k.send(a, 21).unwrap();
    assert_eq!(k.send(a, 21).unwrap_err().code(), Code::MissCredits);
    k.send(b, 21).unwrap();
    assert_eq!(k.send(b, 21).unwrap_err().code(), Code::MissCredits);
}

/// Endpoints of another activity cannot be used
#[test]
fn test_foreign_endpoint() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let b = k.create_activity(0).unwrap();
    k.grant_activity(a, OTHER, b).unwrap();
    ok(&mut k, a, Syscall::AllocEp { dst: 20, act: OTHER });
    ok(&mut k, a, Syscall::CreateSem { dst: 10, value: 0 });
    k.grant_memory(a, 11, 0, 0, 0x1000, tcu::Perm::R).unwrap();

    assert_eq!(err(&mut k, a, activate(20, 11, 0)), Code::NoPerm);

    // not a gate
    ok(&mut k, a, Syscall::AllocEp { dst: 21, act: SEL_ACT });
    assert_eq!(err(&mut k, a, activate(21, 10, 0)), Code::InvArgs);
    ok(&mut k, a, activate(21, 11, 0));
}

/// Waiting activation finishes once the receive gate is activated
#[test]
fn test_wait_for_receive_gate() {
    let mut k = kernel();
    let (server, client) = gates(&mut k, 1);

    let call = match k.dispatch(
        client,
        &Syscall::Activate {
            ep: EP,
            gate: SGATE,
            rbuf_addr: 0,
            flags: ActivateFlags::WAIT.bits(),
        },
    ) {
        Dispatch::Suspended(c) => c,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(k.pending_calls(), 1);
    assert!(k.process_wakeups().is_empty());

    ok(&mut k, server, activate(EP, RGATE, RBUF_BASE + 0x100));
    assert_eq!(
        k.process_wakeups(),
        vec![Completion { call, act: client, reply: Reply::ok(0) }]
    );
    assert_eq!(k.pending_calls(), 0);
    assert!(matches!(
        k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap().state,
        EpState::Send { .. }
    ));
    k.send(client, EP).unwrap();
}

/// Revoking the awaited receive gate wakes the waiter with an error
#[test]
fn test_wait_ends_with_revocation() {
    let mut k = kernel();
    let (server, client) = gates(&mut k, 1);
    let wait = Syscall::Activate {
        ep: EP,
        gate: SGATE,
        rbuf_addr: 0,
        flags: ActivateFlags::WAIT.bits(),
    };
    let Dispatch::Suspended(call) = k.dispatch(client, &wait) else {
        panic!("not suspended");
    };

    ok(&mut k, server, revoke(RGATE, true));
    let done = k.process_wakeups();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].call, call);
    assert_eq!(done[0].reply.code(), Code::RecvGone);
    assert!(!k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap().is_bound());
}

/// Revoking the send gate being activated wakes the waiter with an error
#[test]
fn test_wait_ends_with_send_gate_revocation() {
    let mut k = kernel();
    let (server, client) = gates(&mut k, 1);
    let wait = Syscall::Activate {
        ep: EP,
        gate: SGATE,
        rbuf_addr: 0,
        flags: ActivateFlags::WAIT.bits(),
    };
    let Dispatch::Suspended(call) = k.dispatch(client, &wait) else {
        panic!("not suspended");
    };

    ok(&mut k, server, revoke(SGATE, true));
    assert!(k.cap(client, SGATE).is_none());
    assert_eq!(
        k.process_wakeups(),
        vec![Completion { call, act: client, reply: Reply::err(Code::InvArgs) }]
    );
    assert_eq!(k.pending_calls(), 0);

    // a later activation of the receive gate finds nobody waiting
    ok(&mut k, server, activate(EP, RGATE, RBUF_BASE + 0x100));
    assert!(k.process_wakeups().is_empty());
    assert!(!k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap().is_bound());
}

/// Revoking the endpoint capability named by a waiting activation cancels it
#[test]
fn test_wait_ends_with_endpoint_revocation() {
    let mut k = kernel();
    let (server, client) = gates(&mut k, 1);
    let wait = Syscall::Activate {
        ep: EP,
        gate: SGATE,
        rbuf_addr: 0,
        flags: ActivateFlags::WAIT.bits(),
    };
    let Dispatch::Suspended(call) = k.dispatch(client, &wait) else {
        panic!("not suspended");
    };

    ok(&mut k, client, revoke(EP, true));
    assert!(k.cap(client, EP).is_none());
    assert_eq!(
        k.process_wakeups(),
        vec![Completion { call, act: client, reply: Reply::err(Code::InvArgs) }]
    );

    ok(&mut k, server, activate(EP, RGATE, RBUF_BASE + 0x100));
    assert!(k.process_wakeups().is_empty());
    let ep = k.pemux(1).unwrap().ep(FIRST_FREE_EP).unwrap();
    assert_eq!(ep.state, EpState::Unconfigured);
    assert!(!ep.is_allocated());
}

/// An exiting activity's suspended calls complete with `ActGone`
#[test]
fn test_exit_cancels_waiting_calls() {
    let mut k = kernel();
    let (_, client) = gates(&mut k, 1);
    let wait = Syscall::Activate {
        ep: EP,
        gate: SGATE,
        rbuf_addr: 0,
        flags: ActivateFlags::WAIT.bits(),
    };
    assert!(matches!(k.dispatch(client, &wait), Dispatch::Suspended(_)));

    k.exit_activity(client).unwrap();
    let done = k.process_wakeups();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].reply.code(), Code::ActGone);
    assert_eq!(k.pending_calls(), 0);
}

/// Exit frees endpoints, quota and capabilities of the activity
#[test]
fn test_exit_releases_endpoints() {
    let mut k = kernel();
    let (server, client) = channel(&mut k, 1);
    k.send(client, EP).unwrap();

    k.exit_activity(client).unwrap();
    let mux = k.pemux(1).unwrap();
    assert!(mux.eps().all(|e| !e.is_bound() && !e.is_allocated()));
    assert_eq!(mux.cur_act(), None);
    assert!(k.activity(client).is_none());
    assert_eq!(k.call(client, &Syscall::Noop).unwrap_err().code(), Code::ActGone);
    // the server's capability for the client went with it
    assert!(k.cap(server, OTHER).is_none());
    // the send gate can be handed out again
    ok(&mut k, server, Syscall::CreateSem { dst: 30, value: 0 });
}

/// Privileged activate call from a tile multiplexer
#[test]
fn test_pemux_activate() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    ok(&mut k, a, Syscall::CreateRGate { dst: RGATE, order: 8, msg_order: 6 });
    let ep_sel = k.pemux(0).unwrap().ep_sel(FIRST_FREE_EP + 2).unwrap();

    let msg = kif::encode(&PemuxCall::Activate {
        act_sel: a as Selector,
        gate_sel: RGATE,
        ep_sel,
        addr: RBUF_BASE + 0x400,
    })
    .unwrap();
    assert!(k.pemux_call(0, &msg).is_ok());
    assert!(k.pemux(0).unwrap().ep(FIRST_FREE_EP + 2).unwrap().is_bound());

    // the activity is not known to tile 1's multiplexer
    assert_eq!(k.pemux_call(1, &msg).code(), Code::InvArgs);

    let msg = kif::encode(&PemuxCall::Activate {
        act_sel: 999,
        gate_sel: RGATE,
        ep_sel,
        addr: 0,
    })
    .unwrap();
    assert_eq!(k.pemux_call(0, &msg).code(), Code::InvArgs);
}

/// Raw syscall messages
#[test]
fn test_raw_syscall() {
    let mut k = kernel();
    let a = k.create_activity(0).unwrap();
    let msg = kif::encode(&Syscall::CreateSem { dst: 10, value: 3 }).unwrap();
    assert_eq!(k.syscall(a, &msg), Dispatch::Replied(Reply::ok(0)));
    assert_eq!(k.syscall(a, &msg), Dispatch::Replied(Reply::err(Code::InvArgs)));
    assert_eq!(k.syscall(a, &msg[..2]), Dispatch::Replied(Reply::err(Code::InvArgs)));
}

/// Independent kernels in parallel threads
#[test]
fn test_parallel_kernels() {
    crossbeam::scope(|s| {
        for credits in 1..=4 {
            s.spawn(move |_| {
                let mut k = kernel();
                let (_, client) = channel(&mut k, credits);
                for _ in 0..credits {
                    k.send(client, EP).unwrap();
                }
                assert_eq!(k.send(client, EP).unwrap_err().code(), Code::MissCredits);
            });
        }
    })
    .unwrap();
}

/// Endpoint sharing through the activity-side multiplexer
#[test]
fn test_epmux_shares_endpoints() {
    let mut k = kernel();
    let (_, client) = channel(&mut k, 1);
    let mut mux = EpMux::new(client);
    mux.reserve(&mut k, 1, 40).unwrap();
    for i in 0..3 {
        k.grant_memory(client, 50 + i, 1, i * 0x1000, 0x1000, tcu::Perm::R).unwrap();
    }

    let ep = mux.switch_to(&mut k, 50, 0).unwrap();
    assert_eq!(mux.switch_to(&mut k, 51, 0).unwrap(), ep);
    assert_eq!(mux.switch_to(&mut k, 52, 0).unwrap(), ep);
    assert_eq!(mux.ep_of(50), None);

    // revocation behind the multiplexer's back leaves an invalid endpoint
    ok(&mut k, client, revoke(52, true));
    assert!(!k.pemux(1).unwrap().ep(ep).unwrap().is_bound());
    assert_eq!(mux.switch_to(&mut k, 50, 0).unwrap(), ep);
}
