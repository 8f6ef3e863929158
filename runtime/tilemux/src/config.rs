//! Platform configuration
//!
//! Describes the tiles of the platform: how many endpoints and header slots
//! their communication units have and where the receive-buffer space lies.
//! Configurations are usually loaded from TOML:
//!
//! ```toml
//! kmem_quota = 65536
//!
//! [[tiles]]
//! ep_count = 64
//! header_count = 1024
//! rbuf_base = 0x30000000
//! rbuf_size = 0x10000
//! ```
//!
//! Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use tcu::{EpId, EP_COUNT, FIRST_FREE_EP, HEADER_COUNT, KPEX_RBUF_ORDER, KPEX_REP, MAX_EPS};

use crate::error::{Code, Error, Result};

/// Default start of the receive-buffer space
pub const RBUF_BASE: u64 = 0x3000_0000;

/// Default size of the receive-buffer space
pub const RBUF_SIZE: u64 = 64 * 1024;

/// Default amount of kernel memory given to each new activity
pub const KMEM_QUOTA: u64 = 64 * 1024;

/// Default size of tile-local memory
pub const TILE_MEMORY: u64 = 256 * 1024 * 1024;

static_assertions::const_assert!((1u64 << KPEX_RBUF_ORDER) < RBUF_SIZE);
static_assertions::const_assert!(RBUF_BASE.checked_add(RBUF_SIZE).is_some());

/// Configuration of a single tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Number of endpoints of the tile's communication unit
    pub ep_count: usize,
    /// First endpoint available to activities
    pub first_free_ep: EpId,
    /// Number of message header slots
    pub header_count: u32,
    /// Start of the receive-buffer space
    pub rbuf_base: u64,
    /// Size of the receive-buffer space
    pub rbuf_size: u64,
    /// Endpoints each new activity on this tile may allocate
    pub ep_quota: u32,
    /// Size of tile-local memory
    pub memory: u64,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            ep_count: EP_COUNT,
            first_free_ep: FIRST_FREE_EP,
            header_count: HEADER_COUNT,
            rbuf_base: RBUF_BASE,
            rbuf_size: RBUF_SIZE,
            ep_quota: (EP_COUNT - FIRST_FREE_EP as usize) as u32,
            memory: TILE_MEMORY,
        }
    }
}

impl TileConfig {
    /// Number of endpoints managed by the multiplexer
    pub fn free_eps(&self) -> usize {
        self.ep_count - self.first_free_ep as usize
    }

    fn validate(&self) -> Result<()> {
        if self.ep_count > MAX_EPS {
            return Err(Error::new(Code::InvArgs, "too many endpoints"));
        }
        if self.first_free_ep <= KPEX_REP || self.first_free_ep as usize >= self.ep_count {
            return Err(Error::new(Code::InvArgs, "first free endpoint out of range"));
        }
        if self.header_count < 2 || self.header_count > u16::MAX as u32 {
            return Err(Error::new(Code::InvArgs, "header count out of range"));
        }
        if self.rbuf_size <= (1 << KPEX_RBUF_ORDER) || self.rbuf_base.checked_add(self.rbuf_size).is_none() {
            return Err(Error::new(Code::InvArgs, "receive-buffer space too small"));
        }
        Ok(())
    }
}

/// Configuration of the whole platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Kernel memory quota of each new activity
    pub kmem_quota: u64,
    /// Tiles, indexed by tile id
    pub tiles: Vec<TileConfig>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kmem_quota: KMEM_QUOTA,
            tiles: vec![TileConfig::default(); 2],
        }
    }
}

impl PlatformConfig {
    /// Parse and validate a TOML platform description
    ///
    /// # Errors
    ///
    /// Returns `InvArgs` if the text is not valid TOML or describes an
    /// impossible platform.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| {
            log::warn!("invalid platform configuration: {}", e);
            Error::new(Code::InvArgs, "malformed platform configuration")
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            log::warn!("cannot serialize platform configuration: {}", e);
            Error::new(Code::InvArgs, "unserializable platform configuration")
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiles.is_empty() || self.tiles.len() > u16::MAX as usize {
            return Err(Error::new(Code::InvArgs, "invalid number of tiles"));
        }
        self.tiles.iter().try_for_each(TileConfig::validate)
    }
}
