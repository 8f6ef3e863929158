//! TileMux - capability kernel core for tiled manycores
//!
//! # Purpose
//! Manages capabilities, the gate objects they refer to and the physical
//! endpoints of every tile. Activities name objects through selectors in
//! their capability table; the kernel binds gates to the few endpoints of a
//! tile and keeps every binding consistent with revocation.
//!
//! # Integration Points
//! - Depends on: `tcu` (endpoint registers of the communication unit)
//! - Provides to: activities (syscalls), tile multiplexers (privileged calls)
//! - Wire format: [`kif`] requests and replies, `bincode` encoded
//!
//! # Architecture
//! - [`cap`]: arena-based derivation forest plus one [`captable::CapTable`]
//!   per activity and per tile multiplexer
//! - [`objects`]: reference-counted kernel objects (gates, quotas, ...)
//! - [`pemux`]: the per-tile endpoint multiplexer, sole writer of endpoint
//!   registers, with its [`headers`] allocator
//! - [`Kernel`]: one explicit context owning all of the above, with the
//!   syscall dispatcher and the [`waiters`] registry for suspended calls
//! - [`epmux`]: activity-side helper that shares endpoints between gates
//!
//! # Testing Strategy
//! - Unit tests: per module
//! - Integration tests: end-to-end scenarios in `tests/integration_test.rs`
//! - Benchmarks: revocation cascades (`benches/revoke.rs`)

pub mod cap;
pub mod captable;
pub mod config;
pub mod ep;
pub mod epmux;
pub mod error;
pub mod headers;
pub mod kernel;
pub mod kif;
pub mod objects;
pub mod pemux;
pub mod waiters;

mod activate;
mod dispatch;

pub use activate::Activation;
pub use cap::{CapFlags, CapKind, Owner, Selector};
pub use config::{PlatformConfig, TileConfig};
pub use dispatch::{Dispatch, MAX_EXCHANGE, MAX_SRV_NAME};
pub use epmux::EpMux;
pub use error::{Code, Error, Result};
pub use kernel::{Completion, Kernel};
pub use kif::{ActivateFlags, CapRngDesc, PemuxCall, Reply, Syscall};

// re-exported so users do not need a direct dependency
pub use tcu;
