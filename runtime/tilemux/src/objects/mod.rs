//! Kernel objects
//!
//! ## Design
//!
//! Objects live in an [`ObjStore`] and are referenced by generation-checked
//! [`ObjId`]s. Every capability referring to an object holds one reference;
//! an object is destroyed when its last reference is released. A few
//! references are held by objects themselves:
//!
//! - a quota object derived from another (tile or kernel memory) holds its
//!   parent, and gives its quota back when destroyed
//! - an object charged to a kernel-memory object holds that object until the
//!   charge is refunded
//!
//! Weak references (a send gate naming its receive gate, a service naming
//! its receive gate) are plain ids; they simply stop resolving once the
//! target is gone, since ids are never reused with the same generation.

mod activity;
mod gates;
mod quota;
mod service;

pub use activity::{ActState, ActivityObject};
pub use gates::{MGateObject, RGateObject, SGateObject, SendTarget};
pub use quota::{KMemObject, TileObject};
pub use service::{SemObject, ServiceObject, SessionObject};

use crate::cap::CapKind;
use crate::ep::EpHandle;
use crate::error::{Code, Error, Result};

/// Generation-checked object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId {
    idx: u32,
    gen: u32,
}

/// A kernel object
#[derive(Debug, Clone)]
pub enum Object {
    Activity(ActivityObject),
    Tile(TileObject),
    Ep(EpHandle),
    RGate(RGateObject),
    SGate(SGateObject),
    MGate(MGateObject),
    Service(ServiceObject),
    Session(SessionObject),
    Sem(SemObject),
    KMem(KMemObject),
}

impl Object {
    pub fn kind(&self) -> CapKind {
        match self {
            Object::Activity(_) => CapKind::Activity,
            Object::Tile(_) => CapKind::Tile,
            Object::Ep(_) => CapKind::EndPoint,
            Object::RGate(_) => CapKind::RGate,
            Object::SGate(_) => CapKind::SGate,
            Object::MGate(_) => CapKind::MGate,
            Object::Service(_) => CapKind::Service,
            Object::Session(_) => CapKind::Session,
            Object::Sem(_) => CapKind::Sem,
            Object::KMem(_) => CapKind::KMem,
        }
    }
}

/// Kernel memory consumed by an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    pub kmem: ObjId,
    pub amount: u64,
}

/// Kernel memory charged for every object created on behalf of an activity
pub const OBJ_COST: u64 = core::mem::size_of::<Object>() as u64;

#[derive(Debug)]
struct Entry {
    refs: u32,
    obj: Object,
    charge: Option<Charge>,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    entry: Option<Entry>,
}

macro_rules! typed_access {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty);)*) => {
        $(
            pub fn $get(&self, id: ObjId) -> Option<&$ty> {
                match self.get(id) {
                    Some(Object::$variant(o)) => Some(o),
                    _ => None,
                }
            }

            pub fn $get_mut(&mut self, id: ObjId) -> Option<&mut $ty> {
                match self.get_mut(id) {
                    Some(Object::$variant(o)) => Some(o),
                    _ => None,
                }
            }
        )*
    };
}

/// Reference-counted object storage
#[derive(Debug, Default)]
pub struct ObjStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ObjStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new object without references
    pub fn insert(&mut self, obj: Object) -> ObjId {
        let entry = Entry {
            refs: 0,
            obj,
            charge: None,
        };
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.gen = slot.gen.wrapping_add(1);
                slot.entry = Some(entry);
                ObjId { idx, gen: slot.gen }
            }
            None => {
                self.slots.push(Slot {
                    gen: 0,
                    entry: Some(entry),
                });
                ObjId {
                    idx: (self.slots.len() - 1) as u32,
                    gen: 0,
                }
            }
        }
    }

    fn entry(&self, id: ObjId) -> Option<&Entry> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: ObjId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn get(&self, id: ObjId) -> Option<&Object> {
        self.entry(id).map(|e| &e.obj)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Object> {
        self.entry_mut(id).map(|e| &mut e.obj)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.entry(id).is_some()
    }

    pub fn refs(&self, id: ObjId) -> u32 {
        self.entry(id).map_or(0, |e| e.refs)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a reference
    pub fn acquire(&mut self, id: ObjId) -> Result<()> {
        let entry = self
            .entry_mut(id)
            .ok_or(Error::new(Code::InvArgs, "object gone"))?;
        entry.refs += 1;
        Ok(())
    }

    /// Check that `kmem` can pay for `amount` bytes
    pub fn can_charge(&self, kmem: ObjId, amount: u64) -> Result<()> {
        match self.kmem(kmem) {
            Some(k) if k.left >= amount => Ok(()),
            Some(_) => Err(Error::new(Code::NoKmem, "kernel memory quota exhausted")),
            None => Err(Error::new(Code::InvArgs, "kernel memory object gone")),
        }
    }

    /// Charge `amount` bytes of `kmem` to object `id`
    ///
    /// The charge is refunded when `id` is destroyed.
    pub fn charge(&mut self, id: ObjId, kmem: ObjId, amount: u64) -> Result<()> {
        self.can_charge(kmem, amount)?;
        if !self.contains(id) {
            return Err(Error::new(Code::InvArgs, "object gone"));
        }
        if let Some(k) = self.kmem_mut(kmem) {
            k.left -= amount;
        }
        self.acquire(kmem)?;
        if let Some(e) = self.entry_mut(id) {
            e.charge = Some(Charge { kmem, amount });
        }
        Ok(())
    }

    /// Drop a reference and return every object destroyed as a consequence
    ///
    /// Destroying an object refunds its charge and returns derived quota to
    /// the parent quota object, which may in turn destroy those.
    pub fn release(&mut self, id: ObjId) -> Vec<(ObjId, Object)> {
        let mut destroyed = Vec::new();
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                continue;
            }
            let Some(entry) = self.remove(id) else {
                continue;
            };

            if let Some(c) = entry.charge {
                if let Some(k) = self.kmem_mut(c.kmem) {
                    k.left += c.amount;
                }
                work.push(c.kmem);
            }
            match &entry.obj {
                Object::Tile(t) => {
                    if let Some(p) = t.parent {
                        if let Some(parent) = self.tile_mut(p) {
                            parent.quota += t.quota;
                        }
                        work.push(p);
                    }
                }
                Object::KMem(k) => {
                    if let Some(p) = k.parent {
                        if let Some(parent) = self.kmem_mut(p) {
                            parent.left += k.total;
                        }
                        work.push(p);
                    }
                }
                _ => {}
            }
            destroyed.push((id, entry.obj));
        }
        destroyed
    }

    /// Remove an object that never gained a reference
    pub fn discard(&mut self, id: ObjId) -> Vec<(ObjId, Object)> {
        match self.entry(id) {
            Some(e) if e.refs == 0 => {
                if let Some(e) = self.entry_mut(id) {
                    e.refs = 1;
                }
                self.release(id)
            }
            _ => Vec::new(),
        }
    }

    fn remove(&mut self, id: ObjId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(id.idx);
        Some(entry)
    }

    typed_access! {
        activity, activity_mut => Activity(ActivityObject);
        tile, tile_mut => Tile(TileObject);
        ep, ep_mut => Ep(EpHandle);
        rgate, rgate_mut => RGate(RGateObject);
        sgate, sgate_mut => SGate(SGateObject);
        mgate, mgate_mut => MGate(MGateObject);
        service, service_mut => Service(ServiceObject);
        session, session_mut => Session(SessionObject);
        sem, sem_mut => Sem(SemObject);
        kmem, kmem_mut => KMem(KMemObject);
    }
}
