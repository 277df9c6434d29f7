//! # TESSERA Error Handling
//!
//! One error type for every synchronous failure in the driver interface.
//!
//! Asynchronous failures discovered while a job executes are not errors of
//! the call that queued the job; they are [`ExecFault`]s delivered on the
//! queue's fault channel.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// TESSERA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// TESSERA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Unknown identifiers
    // =========================================================================
    /// Buffer or queue handle does not name a live object
    InvalidHandle,
    /// Address space identifier does not name a live space
    InvalidAddressSpace,
    /// Sync object handle does not name a live sync object
    InvalidSyncObject,
    /// Parameter id is not part of the registry
    UnknownParameter,
    /// No binding matches the given buffer, space and address
    NotFound,

    // =========================================================================
    // Malformed requests
    // =========================================================================
    /// Buffer size is zero
    InvalidSize,
    /// Queue priority outside 0..=3
    InvalidPriority,
    /// Command type not accepted by the queue kind
    TypeMismatch,
    /// Nonzero reserved field, unknown flag bit or malformed record
    InvalidArgument,
    /// Render command is structurally malformed
    InvalidCommand,
    /// Address, offset or length not page aligned
    MisalignedAddress,

    // =========================================================================
    // Binding table violations
    // =========================================================================
    /// Buffer range exceeds the buffer size
    OutOfBounds,
    /// Target range leaves the user or shader range
    AddressOutOfRange,
    /// Target range overlaps an existing binding
    RangeConflict,

    // =========================================================================
    // Lifecycle & resources
    // =========================================================================
    /// Destroy blocked by live references
    ResourceBusy,
    /// Table, memory or queue capacity exhausted
    OutOfResources,

    // =========================================================================
    // Waits & execution
    // =========================================================================
    /// Wait deadline expired before the point was reached
    TimedOut,
    /// Wait abandoned by its caller
    Interrupted,
    /// Queue is faulted and refuses new work until reset
    ExecutionFault,
    /// Copy from client memory failed
    BadAddress,
}

impl Error {
    /// Negative errno returned at the ioctl boundary
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidHandle
            | Self::InvalidAddressSpace
            | Self::InvalidSyncObject
            | Self::NotFound => -errno::ENOENT,
            Self::InvalidSize
            | Self::InvalidPriority
            | Self::TypeMismatch
            | Self::InvalidArgument
            | Self::InvalidCommand
            | Self::MisalignedAddress
            | Self::UnknownParameter
            | Self::OutOfBounds
            | Self::AddressOutOfRange => -errno::EINVAL,
            Self::RangeConflict => -errno::EEXIST,
            Self::ResourceBusy => -errno::EBUSY,
            Self::OutOfResources => -errno::ENOMEM,
            Self::TimedOut => -errno::ETIME,
            Self::Interrupted => -errno::EINTR,
            Self::ExecutionFault => -errno::EIO,
            Self::BadAddress => -errno::EFAULT,
        }
    }

    /// Whether the error names an identifier that does not exist
    pub const fn is_unknown_identifier(self) -> bool {
        matches!(
            self,
            Self::InvalidHandle
                | Self::InvalidAddressSpace
                | Self::InvalidSyncObject
                | Self::UnknownParameter
                | Self::NotFound
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::InvalidAddressSpace => write!(f, "invalid address space"),
            Self::InvalidSyncObject => write!(f, "invalid sync object"),
            Self::UnknownParameter => write!(f, "unknown parameter"),
            Self::NotFound => write!(f, "binding not found"),

            Self::InvalidSize => write!(f, "invalid size"),
            Self::InvalidPriority => write!(f, "invalid queue priority"),
            Self::TypeMismatch => write!(f, "command type not valid for queue"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidCommand => write!(f, "malformed command"),
            Self::MisalignedAddress => write!(f, "misaligned address"),

            Self::OutOfBounds => write!(f, "range exceeds buffer"),
            Self::AddressOutOfRange => write!(f, "address outside VM range"),
            Self::RangeConflict => write!(f, "range overlaps existing binding"),

            Self::ResourceBusy => write!(f, "resource busy"),
            Self::OutOfResources => write!(f, "out of resources"),

            Self::TimedOut => write!(f, "wait timed out"),
            Self::Interrupted => write!(f, "wait interrupted"),
            Self::ExecutionFault => write!(f, "queue faulted"),
            Self::BadAddress => write!(f, "bad user address"),
        }
    }
}

impl std::error::Error for Error {}

/// Linux errno values used by the ioctl boundary
pub mod errno {
    /// No such entry
    pub const ENOENT: i32 = 2;
    /// Interrupted call
    pub const EINTR: i32 = 4;
    /// I/O error
    pub const EIO: i32 = 5;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Bad address
    pub const EFAULT: i32 = 14;
    /// Busy
    pub const EBUSY: i32 = 16;
    /// Exists
    pub const EEXIST: i32 = 17;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Timer expired
    pub const ETIME: i32 = 62;
}

// =============================================================================
// EXECUTION FAULTS
// =============================================================================

/// Failure discovered while a job was executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFault {
    /// Job exceeded its execution budget
    Timeout,
    /// GPU accessed an address with no binding behind it
    MmuFault {
        /// Faulting GPU virtual address
        addr: u64,
    },
    /// Job was cancelled because an earlier job on its queue faulted
    Killed,
    /// A sync object in the wait list was destroyed before the job ran
    DependencyLost,
    /// Backend reported a failure it could not classify
    Unknown,
}

impl fmt::Display for ExecFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "job timed out"),
            Self::MmuFault { addr } => write!(f, "MMU fault at {:#x}", addr),
            Self::Killed => write!(f, "job killed"),
            Self::DependencyLost => write!(f, "wait dependency destroyed"),
            Self::Unknown => write!(f, "unknown execution fault"),
        }
    }
}
