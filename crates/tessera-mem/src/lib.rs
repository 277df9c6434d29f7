//! # TESSERA Memory Management
//!
//! Buffer objects, per-client GPU address spaces and the binding table that
//! places buffer ranges into those spaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    AddressSpaceManager                       │
//! │   AddressSpace ── BindingTable (start → Binding)             │
//! │         │                    │                               │
//! │         │ queue refs         │ binding refs                  │
//! │         ▼                    ▼                               │
//! │      Queues            BufferStore ── BufferPin (in flight)  │
//! │                              │                               │
//! │  ┌───────────────────────────┴───────────────────────────┐   │
//! │  │        MemoryBackend (storage + page tables)          │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Operations touching both tables ([`bind`], [`unbind`], pinning) take the
//! address space manager first and the buffer store second. The free
//! functions in [`binding`] receive both guards so the order is visible at
//! every call site.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backing;
pub mod binding;
pub mod bo;
pub mod vm;

pub use backing::{MemoryBackend, StorageId, SystemMemoryBackend};
pub use binding::{bind, unbind, unbind_all, BindFlags, BindRequest, Binding, BindingTable};
pub use bo::{BoFlags, BufferHandle, BufferObject, BufferPin, BufferStore};
pub use vm::{AddressSpace, AddressSpaceManager, Region, VmHandle};
