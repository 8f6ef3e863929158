//! Wait registry for suspended calls
//!
//! A call that cannot complete yet (activating a send gate whose receive gate
//! is not activated) registers here, keyed by the object it waits for. When
//! that object changes state, [`WaitRegistry::notify`] posts a [`WakeEvent`]
//! on the registry's channel. The kernel drains the channel and re-enters the
//! suspended calls; nothing is run from inside `notify`.
//!
//! Revoking an object a call waits for posts an error event, so no waiter
//! stays blocked on an object that is gone. Calls that depend on something
//! else (the send gate being bound, the endpoint capability named) are
//! removed with [`WaitRegistry::cancel`] when that goes away.

use std::collections::BTreeMap;

use crossbeam::channel::{self, Receiver, Sender};
use tcu::ActId;

use crate::cap::NodeId;
use crate::ep::EpHandle;
use crate::error::Code;
use crate::objects::ObjId;

/// Identifies a suspended call
pub type CallId = u64;

/// State change of an object that calls may wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub key: ObjId,
    /// `Success` if the awaited state was reached, the error for waiters otherwise
    pub result: Code,
}

/// What to do when a waiter is woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Finish binding a send gate to an endpoint
    ///
    /// `ep_cap` is the endpoint capability the call named, if any.
    ActivateSend {
        ep: EpHandle,
        ep_cap: Option<NodeId>,
        sgate: ObjId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub call: CallId,
    pub act: ActId,
    pub resume: Resume,
}

#[derive(Debug)]
pub struct WaitRegistry {
    waiting: BTreeMap<ObjId, Vec<Waiter>>,
    tx: Sender<WakeEvent>,
    rx: Receiver<WakeEvent>,
    next_call: CallId,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            waiting: BTreeMap::new(),
            tx,
            rx,
            next_call: 1,
        }
    }

    /// Suspend a call of `act` until `key` changes state
    pub fn register(&mut self, key: ObjId, act: ActId, resume: Resume) -> CallId {
        let call = self.next_call;
        self.next_call += 1;
        self.waiting.entry(key).or_default().push(Waiter { call, act, resume });
        log::debug!(target: "tilemux::sysc", "call {} of activity {} waits for {:?}", call, act, key);
        call
    }

    /// Post an event for `key` if anyone waits for it
    pub fn notify(&self, key: ObjId, result: Code) {
        if self.waiting.contains_key(&key) {
            // the registry owns both ends, so the channel cannot be disconnected
            let _ = self.tx.send(WakeEvent { key, result });
        }
    }

    /// Sender for posting events from outside the kernel context
    pub fn sender(&self) -> Sender<WakeEvent> {
        self.tx.clone()
    }

    /// Drain posted events together with the waiters they release
    ///
    /// Events for keys nobody waits for (anymore) are dropped.
    pub fn take_events(&mut self) -> Vec<(WakeEvent, Vec<Waiter>)> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            if let Some(waiters) = self.waiting.remove(&ev.key) {
                out.push((ev, waiters));
            }
        }
        out
    }

    /// Remove all waiters of `act`
    pub fn cancel_act(&mut self, act: ActId) -> Vec<Waiter> {
        self.cancel(|w| w.act == act)
    }

    /// Remove all waiters matching `pred`, whatever they wait for
    pub fn cancel(&mut self, pred: impl Fn(&Waiter) -> bool) -> Vec<Waiter> {
        let mut cancelled = Vec::new();
        self.waiting.retain(|_, waiters| {
            waiters.retain(|w| {
                if pred(w) {
                    cancelled.push(*w);
                    false
                } else {
                    true
                }
            });
            !waiters.is_empty()
        });
        cancelled
    }

    /// Number of suspended calls
    pub fn pending(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }
}
