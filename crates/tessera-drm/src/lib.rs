//! # TESSERA DRM Interface
//!
//! The client-facing surface of the driver: fixed-layout operation records,
//! per-client files and the device object that ties memory, queues and sync
//! objects together.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  client ──▶ Device::ioctl (uapi records, UserMemory reads)   │
//! │                     │                                        │
//! │                     ▼                                        │
//! │  Device ── ParamRegistry · SyncObject table · Scheduler      │
//! │    │                                                         │
//! │    ├── File ── AddressSpaceManager (VMs, bindings)           │
//! │    │      ├── BufferStore (buffer objects, pins)             │
//! │    │      └── Queues ──▶ Scheduler ──▶ ExecutionBackend      │
//! │    └── File ...                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Identifiers are scoped to the file that created them, except sync
//! objects, which live in one device-wide table so clients can share
//! timelines.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod device;
pub mod file;
pub mod ioctl;
pub mod uapi;
pub mod user;

pub use device::{Device, SubmitArgs, SyncEntry, SyncHandle};
pub use file::{File, QueueHandle};
pub use user::{read_array, read_record, HostMemory, UserMemory};
