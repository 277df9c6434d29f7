//! # User ABI
//!
//! Fixed-layout records exchanged with user space, one per operation.
//!
//! Every record is `#[repr(C)]` with explicit padding so it can be read
//! straight from the caller's bytes. Padding and reserved fields are
//! must-be-zero and rejected when set.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

// =============================================================================
// OPERATION NUMBERS
// =============================================================================

/// Query a parameter
pub const GET_PARAM: u32 = 0x00;
/// Create an address space
pub const VM_CREATE: u32 = 0x01;
/// Destroy an address space
pub const VM_DESTROY: u32 = 0x02;
/// Create a buffer object
pub const GEM_CREATE: u32 = 0x03;
/// Get a buffer's mapping token
pub const GEM_MMAP_OFFSET: u32 = 0x04;
/// Bind a buffer range
pub const GEM_BIND: u32 = 0x05;
/// Create a queue
pub const QUEUE_CREATE: u32 = 0x06;
/// Destroy a queue
pub const QUEUE_DESTROY: u32 = 0x07;
/// Submit a command buffer
pub const SUBMIT: u32 = 0x08;
/// Remove a binding
pub const GEM_UNBIND: u32 = 0x09;
/// Close a buffer handle
pub const GEM_CLOSE: u32 = 0x0A;
/// Create a sync object
pub const SYNCOBJ_CREATE: u32 = 0x0B;
/// Destroy a sync object
pub const SYNCOBJ_DESTROY: u32 = 0x0C;
/// Wait on a sync object
pub const SYNCOBJ_WAIT: u32 = 0x0D;
/// Signal a sync object from the host
pub const SYNCOBJ_SIGNAL: u32 = 0x0E;
/// Return a faulted queue to service
pub const QUEUE_RESET: u32 = 0x0F;
/// Pop one record from a queue's fault channel
pub const QUEUE_GET_FAULT: u32 = 0x10;

/// Attachment type: color
pub const ATTACHMENT_C: u32 = 0;
/// Attachment type: depth
pub const ATTACHMENT_Z: u32 = 1;
/// Attachment type: stencil
pub const ATTACHMENT_S: u32 = 2;
/// Attachments per render record
pub const MAX_ATTACHMENTS: usize = 16;

/// `timeout_ns` value that waits forever
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Fault kinds reported by `QUEUE_GET_FAULT`
pub mod fault_kind {
    /// Channel empty
    pub const NONE: u32 = 0;
    /// Job timed out
    pub const TIMEOUT: u32 = 1;
    /// MMU fault; `addr` is valid
    pub const MMU: u32 = 2;
    /// Killed after an earlier fault
    pub const KILLED: u32 = 3;
    /// Wait dependency destroyed
    pub const DEPENDENCY_LOST: u32 = 4;
    /// Unclassified
    pub const UNKNOWN: u32 = 5;
}

// =============================================================================
// OBJECT RECORDS
// =============================================================================

/// `GET_PARAM`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GetParam {
    /// Parameter id
    pub param: u32,
    /// MBZ
    pub pad: u32,
    /// Returned value
    pub value: u64,
}

/// `VM_CREATE`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct VmCreate {
    /// Returned VM id
    pub vm_id: u32,
    /// MBZ
    pub pad: u32,
}

/// `VM_DESTROY`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct VmDestroy {
    /// VM id
    pub vm_id: u32,
    /// MBZ
    pub pad: u32,
}

/// `GEM_CREATE`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GemCreate {
    /// Requested size
    pub size: u64,
    /// `WRITEBACK` or zero
    pub flags: u32,
    /// Returned handle
    pub handle: u32,
}

/// `GEM_MMAP_OFFSET`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GemMmapOffset {
    /// Buffer handle
    pub handle: u32,
    /// MBZ
    pub flags: u32,
    /// Returned fake offset
    pub offset: u64,
}

/// `GEM_BIND`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GemBind {
    /// Buffer handle
    pub handle: u32,
    /// VM id
    pub vm_id: u32,
    /// Offset into the buffer
    pub offset: u64,
    /// Bytes to bind
    pub range: u64,
    /// Target GPU address
    pub addr: u64,
    /// `READ` and/or `WRITE`
    pub flags: u32,
    /// MBZ
    pub pad: u32,
}

/// `GEM_UNBIND`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GemUnbind {
    /// Buffer handle
    pub handle: u32,
    /// VM id
    pub vm_id: u32,
    /// Address the binding starts at
    pub addr: u64,
}

/// `GEM_CLOSE`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GemClose {
    /// Buffer handle
    pub handle: u32,
    /// MBZ
    pub pad: u32,
}

/// `QUEUE_CREATE`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct QueueCreate {
    /// VM id
    pub vm_id: u32,
    /// Render (0) or compute (1)
    pub queue_type: u32,
    /// 0..=3
    pub priority: u32,
    /// MBZ
    pub flags: u32,
    /// Returned queue id
    pub queue_id: u32,
}

/// `QUEUE_DESTROY`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct QueueDestroy {
    /// Queue id
    pub queue_id: u32,
}

/// `QUEUE_RESET`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct QueueReset {
    /// Queue id
    pub queue_id: u32,
    /// MBZ
    pub pad: u32,
}

/// `QUEUE_GET_FAULT`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct QueueGetFault {
    /// Queue id
    pub queue_id: u32,
    /// Returned [`fault_kind`]
    pub kind: u32,
    /// Returned sequence number of the faulting job
    pub seq: u64,
    /// Returned faulting address for MMU faults
    pub addr: u64,
}

/// `SUBMIT`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Submit {
    /// Queue id
    pub queue_id: u32,
    /// Render (0), blit (1) or compute (2)
    pub cmd_type: u32,
    /// User pointer to the command record
    pub cmd_buffer: u64,
    /// MBZ
    pub flags: u32,
    /// Entries in `in_syncs`
    pub in_sync_count: u32,
    /// User pointer to an array of `u32` sync object handles
    pub in_syncs: u64,
    /// Sync object to signal, or zero
    pub out_sync: u32,
    /// MBZ
    pub pad: u32,
}

/// `SYNCOBJ_CREATE`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SyncobjCreate {
    /// Returned handle
    pub handle: u32,
    /// MBZ
    pub flags: u32,
}

/// `SYNCOBJ_DESTROY`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SyncobjDestroy {
    /// Handle
    pub handle: u32,
    /// MBZ
    pub pad: u32,
}

/// `SYNCOBJ_WAIT`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SyncobjWait {
    /// Handle
    pub handle: u32,
    /// MBZ
    pub flags: u32,
    /// Point to wait for
    pub point: u64,
    /// Relative timeout, [`TIMEOUT_INFINITE`] to wait forever
    pub timeout_ns: u64,
    /// Returned current point
    pub value: u64,
}

/// `SYNCOBJ_SIGNAL`
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SyncobjSignal {
    /// Handle
    pub handle: u32,
    /// MBZ
    pub pad: u32,
    /// Point to advance to
    pub point: u64,
}

// =============================================================================
// COMMAND RECORDS
// =============================================================================

/// Render target entry
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AttachmentRecord {
    /// `ATTACHMENT_C`, `_Z` or `_S`
    pub kind: u32,
    /// Size in bytes
    pub size: u32,
    /// Target address
    pub pointer: u64,
}

/// Render pass record
///
/// Field names follow the hardware command layout.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CmdRender {
    pub flags: u64,
    pub encoder_ptr: u64,

    pub depth_buffer: [u64; 3],
    pub depth_meta_buffer: [u64; 3],
    pub stencil_buffer: [u64; 3],
    pub stencil_meta_buffer: [u64; 3],

    pub scissor_array: u64,
    pub depth_bias_array: u64,
    pub visibility_result_buffer: u64,

    pub zls_ctrl: u64,
    pub ppp_multisamplectl: u64,
    pub ppp_ctrl: u32,

    pub fb_width: u32,
    pub fb_height: u32,
    pub utile_width: u32,
    pub utile_height: u32,
    pub samples: u32,
    pub layers: u32,

    pub encoder_id: u32,
    pub cmd_ta_id: u32,
    pub cmd_3d_id: u32,

    pub iogpu_unk_49: u32,
    pub iogpu_unk_212: u32,
    pub iogpu_unk_214: u32,

    pub merge_upper_x: u32,
    pub merge_upper_y: u32,

    pub load_pipeline: u32,
    pub load_pipeline_bind: u32,
    pub store_pipeline: u32,
    pub store_pipeline_bind: u32,
    pub partial_reload_pipeline: u32,
    pub partial_reload_pipeline_bind: u32,
    pub partial_store_pipeline: u32,
    pub partial_store_pipeline_bind: u32,

    pub depth_dimensions: u32,
    pub isp_bgobjdepth: u32,
    pub isp_bgobjvals: u32,

    pub attachments: [AttachmentRecord; MAX_ATTACHMENTS],
    pub attachment_count: u32,
    /// MBZ
    pub pad: u32,
}

/// Blit record
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CmdBlit {
    /// MBZ
    pub flags: u64,
    pub encoder_ptr: u64,
    pub encoder_end: u64,
    pub encoder_id: u32,
    pub cmd_id: u32,
}

/// Compute record
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CmdCompute {
    /// MBZ
    pub flags: u64,
    pub encoder_ptr: u64,
    pub encoder_end: u64,
    pub buffer_descriptor: u64,
    pub buffer_descriptor_size: u32,
    pub ctx_switch_prog: u32,
    pub encoder_id: u32,
    pub cmd_id: u32,
}

const_assert_eq!(core::mem::size_of::<GetParam>(), 16);
const_assert_eq!(core::mem::size_of::<VmCreate>(), 8);
const_assert_eq!(core::mem::size_of::<GemCreate>(), 16);
const_assert_eq!(core::mem::size_of::<GemMmapOffset>(), 16);
const_assert_eq!(core::mem::size_of::<GemBind>(), 40);
const_assert_eq!(core::mem::size_of::<GemUnbind>(), 16);
const_assert_eq!(core::mem::size_of::<QueueCreate>(), 20);
const_assert_eq!(core::mem::size_of::<QueueDestroy>(), 4);
const_assert_eq!(core::mem::size_of::<QueueGetFault>(), 24);
const_assert_eq!(core::mem::size_of::<Submit>(), 40);
const_assert_eq!(core::mem::size_of::<SyncobjWait>(), 32);
const_assert_eq!(core::mem::size_of::<SyncobjSignal>(), 16);
const_assert_eq!(core::mem::size_of::<AttachmentRecord>(), 16);
const_assert_eq!(core::mem::size_of::<CmdRender>(), 520);
const_assert_eq!(core::mem::size_of::<CmdBlit>(), 32);
const_assert_eq!(core::mem::size_of::<CmdCompute>(), 48);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_record_offsets() {
        let rec = CmdRender::zeroed();
        let base = core::ptr::addr_of!(rec) as usize;
        assert_eq!(core::ptr::addr_of!(rec.ppp_ctrl) as usize - base, 152);
        assert_eq!(core::ptr::addr_of!(rec.attachments) as usize - base, 256);
        assert_eq!(core::ptr::addr_of!(rec.attachment_count) as usize - base, 512);
    }

    #[test]
    fn test_records_read_unaligned() {
        let mut bytes = [0u8; 17];
        bytes[1..17].copy_from_slice(bytemuck::bytes_of(&GemCreate {
            size: 0x4000,
            flags: 1,
            handle: 0,
        }));
        let rec: GemCreate = bytemuck::pod_read_unaligned(&bytes[1..17]);
        assert_eq!(rec.size, 0x4000);
        assert_eq!(rec.flags, 1);
    }
}
