use tcu::ActId;

use super::ObjId;

/// A service registered by an activity
#[derive(Debug, Clone)]
pub struct ServiceObject {
    pub name: String,
    /// Receive gate the service listens on
    pub rgate: ObjId,
    pub owner: ActId,
}

/// A session with a service
#[derive(Debug, Clone)]
pub struct SessionObject {
    pub srv: ObjId,
    /// Identifier chosen by the service
    pub ident: u64,
}

/// A counting semaphore
#[derive(Debug, Clone)]
pub struct SemObject {
    pub value: u32,
}

impl SemObject {
    pub fn new(value: u32) -> Self {
        Self { value }
    }
}
