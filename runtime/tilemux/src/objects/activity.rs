use tcu::{ActId, TileId};

/// Lifecycle state of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActState {
    Running,
    Dead,
}

/// An activity hosted on a tile
#[derive(Debug, Clone)]
pub struct ActivityObject {
    pub id: ActId,
    pub tile: TileId,
    pub state: ActState,
}

impl ActivityObject {
    pub fn new(id: ActId, tile: TileId) -> Self {
        Self {
            id,
            tile,
            state: ActState::Running,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == ActState::Running
    }
}
