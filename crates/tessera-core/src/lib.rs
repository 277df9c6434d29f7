//! # TESSERA Core
//!
//! Foundational types for the tile-based GPU driver interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      tessera-drm                         │
//! │           (wire records, per-client files)               │
//! ├────────────────────────────┬─────────────────────────────┤
//! │        tessera-mem         │        tessera-cmd          │
//! │ (buffers, spaces, binding) │ (queues, render, scheduler) │
//! ├────────────────────────────┴─────────────────────────────┤
//! │                      tessera-core                        │
//! │  error · types · handle · config · params · sync         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate touches hardware. Every other layer builds on the
//! error taxonomy, the generational [`HandleTable`], and the timeline
//! [`SyncObject`] defined here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handle;
pub mod params;
pub mod sync;
pub mod types;

pub use config::{DeviceConfig, FeatureIncompat, GpuIdentity, Limits, VmLayout};
pub use error::{Error, ExecFault, Result};
pub use handle::{Handle, HandleTable};
pub use params::{Param, ParamRegistry};
pub use sync::{SyncObject, SyncPoint};
pub use types::{ByteSize, GpuAddr, VaRange};

/// Protocol version reported through `UNSTABLE_UABI_VERSION`
pub const UABI_VERSION: u64 = 4;
