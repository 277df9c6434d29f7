//! # Wire Dispatch
//!
//! Decodes fixed-layout operation records and forwards them to the typed
//! [`Device`] entry points. Output fields are written back into the record
//! only when the operation succeeds.

use core::time::Duration;

use arrayvec::ArrayVec;
use bytemuck::Pod;
use tessera_cmd::{
    Attachment, AttachmentKind, BlitCommand, Command, CommandType, ComputeCommand, HardwareState,
    PipelineBinding, Pipelines, RenderCommand, RenderFlags, TileSize, ZsPlane,
};
use tessera_core::{Error, ExecFault, GpuAddr, Handle, Result};
use tessera_mem::BindRequest;

use crate::device::{Device, SubmitArgs};
use crate::file::File;
use crate::uapi::{self, fault_kind};
use crate::user::{read_array, read_record, UserMemory};

/// Run `f` on the record held in `data`, copying it back on success
fn with_record<T: Pod>(data: &mut [u8], f: impl FnOnce(&mut T) -> Result<()>) -> Result<()> {
    if data.len() != core::mem::size_of::<T>() {
        return Err(Error::InvalidArgument);
    }
    let mut record: T = bytemuck::pod_read_unaligned(data);
    f(&mut record)?;
    data.copy_from_slice(bytemuck::bytes_of(&record));
    Ok(())
}

fn mbz(value: u32) -> Result<()> {
    if value != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn handle<T>(raw: u32, err: Error) -> Result<Handle<T>> {
    Handle::from_raw(raw).ok_or(err)
}

impl Device {
    /// Execute wire operation `nr` on the record in `data`
    ///
    /// `user` gives access to memory the record points at (command buffers,
    /// sync arrays). Unknown operations fail with `InvalidArgument`.
    pub fn ioctl(&self, file: &File, nr: u32, data: &mut [u8], user: &dyn UserMemory) -> Result<()> {
        let result = match nr {
            uapi::GET_PARAM => with_record(data, |r: &mut uapi::GetParam| {
                mbz(r.pad)?;
                r.value = self.get_param(r.param)?;
                Ok(())
            }),
            uapi::VM_CREATE => with_record(data, |r: &mut uapi::VmCreate| {
                mbz(r.pad)?;
                r.vm_id = self.vm_create(file)?.to_raw();
                Ok(())
            }),
            uapi::VM_DESTROY => with_record(data, |r: &mut uapi::VmDestroy| {
                mbz(r.pad)?;
                self.vm_destroy(file, handle(r.vm_id, Error::InvalidAddressSpace)?)
            }),
            uapi::GEM_CREATE => with_record(data, |r: &mut uapi::GemCreate| {
                mbz(r.handle)?;
                r.handle = self.gem_create(file, r.size, r.flags)?.to_raw();
                Ok(())
            }),
            uapi::GEM_MMAP_OFFSET => with_record(data, |r: &mut uapi::GemMmapOffset| {
                let bo = handle(r.handle, Error::InvalidHandle)?;
                r.offset = self.gem_mmap_offset(file, bo, r.flags)?;
                Ok(())
            }),
            uapi::GEM_BIND => with_record(data, |r: &mut uapi::GemBind| {
                mbz(r.pad)?;
                let req = BindRequest {
                    buffer: handle(r.handle, Error::InvalidHandle)?,
                    vm: handle(r.vm_id, Error::InvalidAddressSpace)?,
                    offset: r.offset,
                    length: r.range,
                    addr: GpuAddr::new(r.addr),
                    flags: r.flags,
                };
                self.gem_bind(file, &req)
            }),
            uapi::GEM_UNBIND => with_record(data, |r: &mut uapi::GemUnbind| {
                let bo = handle(r.handle, Error::InvalidHandle)?;
                let vm = handle(r.vm_id, Error::InvalidAddressSpace)?;
                self.gem_unbind(file, bo, vm, GpuAddr::new(r.addr))
            }),
            uapi::GEM_CLOSE => with_record(data, |r: &mut uapi::GemClose| {
                mbz(r.pad)?;
                self.gem_close(file, handle(r.handle, Error::InvalidHandle)?)
            }),
            uapi::QUEUE_CREATE => with_record(data, |r: &mut uapi::QueueCreate| {
                let vm = handle(r.vm_id, Error::InvalidAddressSpace)?;
                r.queue_id = self
                    .queue_create(file, vm, r.queue_type, r.priority, r.flags)?
                    .to_raw();
                Ok(())
            }),
            uapi::QUEUE_DESTROY => with_record(data, |r: &mut uapi::QueueDestroy| {
                self.queue_destroy(file, handle(r.queue_id, Error::InvalidHandle)?)
            }),
            uapi::QUEUE_RESET => with_record(data, |r: &mut uapi::QueueReset| {
                mbz(r.pad)?;
                self.queue_reset(file, handle(r.queue_id, Error::InvalidHandle)?)
            }),
            uapi::QUEUE_GET_FAULT => with_record(data, |r: &mut uapi::QueueGetFault| {
                let queue = handle(r.queue_id, Error::InvalidHandle)?;
                let (kind, seq, addr) = match self.queue_pop_fault(file, queue)? {
                    None => (fault_kind::NONE, 0, 0),
                    Some(rec) => match rec.fault {
                        ExecFault::Timeout => (fault_kind::TIMEOUT, rec.seq, 0),
                        ExecFault::MmuFault { addr } => (fault_kind::MMU, rec.seq, addr),
                        ExecFault::Killed => (fault_kind::KILLED, rec.seq, 0),
                        ExecFault::DependencyLost => (fault_kind::DEPENDENCY_LOST, rec.seq, 0),
                        ExecFault::Unknown => (fault_kind::UNKNOWN, rec.seq, 0),
                    },
                };
                r.kind = kind;
                r.seq = seq;
                r.addr = addr;
                Ok(())
            }),
            uapi::SUBMIT => with_record(data, |r: &mut uapi::Submit| self.submit_record(file, r, user)),
            uapi::SYNCOBJ_CREATE => with_record(data, |r: &mut uapi::SyncobjCreate| {
                mbz(r.flags)?;
                mbz(r.handle)?;
                r.handle = self.syncobj_create(file)?.to_raw();
                Ok(())
            }),
            uapi::SYNCOBJ_DESTROY => with_record(data, |r: &mut uapi::SyncobjDestroy| {
                mbz(r.pad)?;
                self.syncobj_destroy(file, handle(r.handle, Error::InvalidSyncObject)?)
            }),
            uapi::SYNCOBJ_WAIT => with_record(data, |r: &mut uapi::SyncobjWait| {
                mbz(r.flags)?;
                let sync = handle(r.handle, Error::InvalidSyncObject)?;
                let timeout = match r.timeout_ns {
                    uapi::TIMEOUT_INFINITE => None,
                    ns => Some(Duration::from_nanos(ns)),
                };
                self.syncobj_wait(sync, r.point, timeout)?;
                r.value = self.syncobj_query(sync)?;
                Ok(())
            }),
            uapi::SYNCOBJ_SIGNAL => with_record(data, |r: &mut uapi::SyncobjSignal| {
                mbz(r.pad)?;
                self.syncobj_signal(handle(r.handle, Error::InvalidSyncObject)?, r.point)
            }),
            _ => Err(Error::InvalidArgument),
        };

        if let Err(e) = result {
            log::debug!("[File {}]: op {:#04x} failed: {}", file.id(), nr, e);
        }
        result
    }

    fn submit_record(&self, file: &File, r: &uapi::Submit, user: &dyn UserMemory) -> Result<()> {
        mbz(r.pad)?;
        let queue = handle(r.queue_id, Error::InvalidHandle)?;
        file.queue(queue)?;
        mbz(r.flags)?;

        let command = match CommandType::from_raw(r.cmd_type)? {
            CommandType::Render => decode_render(&read_record(user, r.cmd_buffer)?)?,
            CommandType::Blit => decode_blit(&read_record(user, r.cmd_buffer)?)?,
            CommandType::Compute => decode_compute(&read_record(user, r.cmd_buffer)?)?,
        };

        let count = r.in_sync_count as usize;
        if count > self.config().limits.max_wait_syncs {
            return Err(Error::InvalidArgument);
        }
        let waits = read_array::<u32>(user, r.in_syncs, count)?
            .into_iter()
            .map(|raw| handle(raw, Error::InvalidSyncObject).map(|h| (h, 0)))
            .collect::<Result<Vec<_>>>()?;
        let signal = match r.out_sync {
            0 => None,
            raw => Some(handle(raw, Error::InvalidSyncObject)?),
        };

        self.submit(
            file,
            SubmitArgs {
                queue,
                command,
                flags: r.flags,
                waits,
                signal,
            },
        )?;
        Ok(())
    }
}

// =============================================================================
// COMMAND DECODING
// =============================================================================

fn addr(raw: u64) -> GpuAddr {
    GpuAddr::new(raw)
}

fn plane(buffers: [u64; 3], meta: [u64; 3]) -> ZsPlane {
    ZsPlane {
        buffers: buffers.map(addr),
        meta: meta.map(addr),
    }
}

fn decode_render(rec: &uapi::CmdRender) -> Result<Command> {
    if rec.pad != 0 {
        return Err(Error::InvalidCommand);
    }
    let count = rec.attachment_count as usize;
    if count > uapi::MAX_ATTACHMENTS {
        return Err(Error::InvalidCommand);
    }
    let attachments = rec.attachments[..count]
        .iter()
        .map(|a| {
            Ok(Attachment {
                kind: AttachmentKind::from_raw(a.kind)?,
                size: a.size,
                pointer: addr(a.pointer),
            })
        })
        .collect::<Result<ArrayVec<_, { uapi::MAX_ATTACHMENTS }>>>()?;

    let stage = |pipeline, bind| PipelineBinding { pipeline, bind };
    let mut cmd = RenderCommand::new(addr(rec.encoder_ptr), rec.fb_width, rec.fb_height);
    cmd.flags = RenderFlags::from_bits_retain(rec.flags);
    cmd.depth = plane(rec.depth_buffer, rec.depth_meta_buffer);
    cmd.stencil = plane(rec.stencil_buffer, rec.stencil_meta_buffer);
    cmd.scissor_array = addr(rec.scissor_array);
    cmd.depth_bias_array = addr(rec.depth_bias_array);
    cmd.visibility_result_buffer = addr(rec.visibility_result_buffer);
    cmd.utile = TileSize {
        width: rec.utile_width,
        height: rec.utile_height,
    };
    cmd.samples = rec.samples;
    cmd.layers = rec.layers;
    cmd.encoder_id = rec.encoder_id;
    cmd.cmd_ta_id = rec.cmd_ta_id;
    cmd.cmd_3d_id = rec.cmd_3d_id;
    cmd.pipelines = Pipelines {
        load: stage(rec.load_pipeline, rec.load_pipeline_bind),
        store: stage(rec.store_pipeline, rec.store_pipeline_bind),
        partial_reload: stage(rec.partial_reload_pipeline, rec.partial_reload_pipeline_bind),
        partial_store: stage(rec.partial_store_pipeline, rec.partial_store_pipeline_bind),
    };
    cmd.hw = HardwareState {
        zls_ctrl: rec.zls_ctrl,
        ppp_multisamplectl: rec.ppp_multisamplectl,
        ppp_ctrl: rec.ppp_ctrl,
        iogpu_unk: [rec.iogpu_unk_49, rec.iogpu_unk_212, rec.iogpu_unk_214],
        merge_upper: (rec.merge_upper_x, rec.merge_upper_y),
        depth_dimensions: rec.depth_dimensions,
        isp_bgobjdepth: rec.isp_bgobjdepth,
        isp_bgobjvals: rec.isp_bgobjvals,
    };
    cmd.attachments = attachments;
    Ok(Command::Render(Box::new(cmd)))
}

fn decode_blit(rec: &uapi::CmdBlit) -> Result<Command> {
    if rec.flags != 0 {
        return Err(Error::InvalidCommand);
    }
    Ok(Command::Blit(BlitCommand {
        encoder_ptr: addr(rec.encoder_ptr),
        encoder_end: addr(rec.encoder_end),
        encoder_id: rec.encoder_id,
        cmd_id: rec.cmd_id,
    }))
}

fn decode_compute(rec: &uapi::CmdCompute) -> Result<Command> {
    if rec.flags != 0 {
        return Err(Error::InvalidCommand);
    }
    Ok(Command::Compute(ComputeCommand {
        encoder_ptr: addr(rec.encoder_ptr),
        encoder_end: addr(rec.encoder_end),
        buffer_descriptor: addr(rec.buffer_descriptor),
        buffer_descriptor_size: rec.buffer_descriptor_size,
        ctx_switch_prog: rec.ctx_switch_prog,
        encoder_id: rec.encoder_id,
        cmd_id: rec.cmd_id,
    }))
}
