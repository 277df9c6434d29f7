//! # TESSERA Command Submission
//!
//! Typed command payloads, per-address-space submission queues and the
//! scheduler that feeds them to an execution backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │   Submit ──▶ Queue (seq order, waits, pins, fault channel) │
//! │                 │                                          │
//! │                 ▼                                          │
//! │   Scheduler  (priority 0 first, retire in order)           │
//! │                 │                 ▲                        │
//! │                 ▼ execute         │ poll_completions       │
//! │   ExecutionBackend  (Immediate / Null / Manual / firmware) │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod command;
pub mod queue;
pub mod render;
pub mod scheduler;

pub use backend::{
    Completion, ExecutionBackend, ImmediateBackend, JobDescriptor, ManualBackend, NullBackend,
};
pub use command::{BlitCommand, Command, CommandType, ComputeCommand};
pub use queue::{FaultRecord, Priority, Queue, QueueKind, QueueState, Retired, Submission};
pub use render::{
    Attachment, AttachmentKind, HardwareState, PipelineBinding, Pipelines, RenderCommand,
    RenderFlags, Stage, TileSize, ZsPlane,
};
pub use scheduler::Scheduler;
