//! # Device
//!
//! The device object behind every client file: configuration, the parameter
//! registry, the device-wide sync object table and the scheduler.
//!
//! Every client operation has a typed entry point here; [`Device::ioctl`]
//! decodes wire records and forwards to them.
//!
//! Global lock order: file `vms` → file `bos` → file `queues` → scheduler →
//! queue → `syncobjs` → sync object. No lock is held while waiting on a sync
//! object.

use core::sync::atomic::AtomicBool;
use core::time::Duration;
use std::sync::Arc;

use spin::RwLock;
use tessera_cmd::{
    Command, ExecutionBackend, FaultRecord, ImmediateBackend, Priority, Queue, QueueKind,
    Scheduler, Submission,
};
use tessera_core::{
    DeviceConfig, Error, GpuAddr, Handle, HandleTable, ParamRegistry, Result, SyncObject,
    SyncPoint,
};
use tessera_mem::{
    bind, unbind, unbind_all, BindRequest, BufferHandle, BufferPin, MemoryBackend, StorageId,
    SystemMemoryBackend, VmHandle,
};

use crate::file::{File, QueueHandle};

/// Sync object handle
pub type SyncHandle = Handle<SyncEntry>;

/// Entry of the device-wide sync object table
#[derive(Debug)]
pub struct SyncEntry {
    sync: Arc<SyncObject>,
    owner: u64,
}

/// Arguments of a submission
#[derive(Debug)]
pub struct SubmitArgs {
    /// Target queue
    pub queue: QueueHandle,
    /// Command payload
    pub command: Command,
    /// Reserved, must be zero
    pub flags: u32,
    /// Sync objects to wait for, with target points (0 = all scheduled)
    pub waits: Vec<(SyncHandle, SyncPoint)>,
    /// Sync object signalled on completion
    pub signal: Option<SyncHandle>,
}

/// A GPU instance shared by all client files
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    params: ParamRegistry,
    memory: Arc<dyn MemoryBackend>,
    scheduler: Scheduler,
    syncobjs: RwLock<HandleTable<SyncEntry>>,
}

impl Device {
    /// Create a device over a memory backend and an execution backend
    pub fn new(
        config: DeviceConfig,
        memory: Arc<dyn MemoryBackend>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "device: G{}{} rev {:#x} chip {:#x}, page {:#x}",
            config.identity.generation,
            config.identity.variant as char,
            config.identity.revision,
            config.identity.chip_id,
            config.vm.page_size
        );
        Ok(Self {
            params: ParamRegistry::new(&config),
            syncobjs: RwLock::new(HandleTable::new(config.limits.max_handles)),
            config,
            memory,
            scheduler: Scheduler::new(backend),
        })
    }

    /// Device on host memory that completes every job immediately
    pub fn headless(config: DeviceConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(SystemMemoryBackend::new()),
            Arc::new(ImmediateBackend::new()),
        )
    }

    /// Device configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    // =========================================================================
    // Client lifecycle
    // =========================================================================

    /// Open a new client file
    pub fn open(&self) -> Arc<File> {
        let file = Arc::new(File::new(&self.config, Arc::clone(&self.memory)));
        log::debug!("[File {}]: opened", file.id());
        file
    }

    /// Release everything a client owns
    ///
    /// Queues stop accepting work and drain; bindings are removed, address
    /// spaces destroyed, buffer handles closed and the client's sync objects
    /// destroyed. Storage still pinned by draining jobs is released when
    /// those jobs retire.
    pub fn close(&self, file: &File) {
        if !file.mark_closed() {
            return;
        }

        // Creators recheck the closed flag under the same locks, so nothing
        // is added to the tables once they are emptied here.
        let queues: Vec<Arc<Queue>> = {
            let mut vms = file.vms.write();
            let queues: Vec<Arc<Queue>> = {
                let mut table = file.queues.lock();
                table
                    .handles()
                    .into_iter()
                    .filter_map(|h| table.remove(h))
                    .collect()
            };
            for queue in &queues {
                queue.close();
                vms.detach_queue(queue.vm());
            }
            let mut bos = file.bos.lock();
            for vm in vms.handles() {
                if let Err(e) = unbind_all(&mut vms, &mut bos, vm) {
                    log::error!("[File {} VM {}]: unbind on close: {}", file.id(), vm, e);
                }
                if let Err(e) = vms.destroy(vm) {
                    log::error!("[File {} VM {}]: destroy on close: {}", file.id(), vm, e);
                }
            }
            for handle in bos.open_handles() {
                if let Err(e) = bos.close(handle) {
                    log::error!("[File {}]: GEM close {} on exit: {}", file.id(), handle, e);
                }
            }
            queues
        };

        let dropped: Vec<SyncEntry> = {
            let mut table = self.syncobjs.write();
            let owned: Vec<SyncHandle> = table
                .iter()
                .filter(|(_, e)| e.owner == file.id())
                .map(|(h, _)| h)
                .collect();
            owned.into_iter().filter_map(|h| table.remove(h)).collect()
        };

        self.scheduler.kick();
        log::debug!(
            "[File {}]: closed ({} queues draining, {} sync objects)",
            file.id(),
            queues.len(),
            dropped.len()
        );
    }

    /// Run the scheduler pump
    pub fn pump(&self) {
        self.scheduler.kick();
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Query a parameter by wire id
    pub fn get_param(&self, param: u32) -> Result<u64> {
        self.params.query(param)
    }

    // =========================================================================
    // Address spaces
    // =========================================================================

    /// Create an address space
    pub fn vm_create(&self, file: &File) -> Result<VmHandle> {
        let mut vms = file.vms.write();
        file.ensure_open()?;
        vms.create()
    }

    /// Destroy an address space with no queues or bindings
    pub fn vm_destroy(&self, file: &File, vm: VmHandle) -> Result<()> {
        file.vms.write().destroy(vm)
    }

    // =========================================================================
    // Buffer objects
    // =========================================================================

    /// Create a buffer object
    pub fn gem_create(&self, file: &File, size: u64, flags: u32) -> Result<BufferHandle> {
        let mut bos = file.bos.lock();
        file.ensure_open()?;
        bos.create(size, flags)
    }

    /// Mapping token of a buffer
    pub fn gem_mmap_offset(&self, file: &File, handle: BufferHandle, flags: u32) -> Result<u64> {
        if flags != 0 {
            return Err(Error::InvalidArgument);
        }
        file.bos.lock().mmap_offset(handle)
    }

    /// Resolve a mapping token for the mapping collaborator
    pub fn lookup_mapping_token(&self, file: &File, token: u64) -> Option<(StorageId, u64)> {
        file.bos
            .lock()
            .lookup_mapping_token(token)
            .map(|(_, storage, size)| (storage, size.as_bytes()))
    }

    /// Bind a buffer range into an address space
    pub fn gem_bind(&self, file: &File, req: &BindRequest) -> Result<()> {
        let mut vms = file.vms.write();
        let mut bos = file.bos.lock();
        bind(&mut vms, &mut bos, req)
    }

    /// Remove a binding
    pub fn gem_unbind(
        &self,
        file: &File,
        buffer: BufferHandle,
        vm: VmHandle,
        addr: GpuAddr,
    ) -> Result<()> {
        let mut vms = file.vms.write();
        let mut bos = file.bos.lock();
        unbind(&mut vms, &mut bos, buffer, vm, addr)
    }

    /// Close a buffer handle
    pub fn gem_close(&self, file: &File, handle: BufferHandle) -> Result<()> {
        file.bos.lock().close(handle)
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Create a queue on an address space
    pub fn queue_create(
        &self,
        file: &File,
        vm: VmHandle,
        kind: u32,
        priority: u32,
        flags: u32,
    ) -> Result<QueueHandle> {
        file.ensure_open()?;
        if flags != 0 {
            return Err(Error::InvalidArgument);
        }
        let kind = QueueKind::from_raw(kind)?;

        let mut vms = file.vms.write();
        // Closing empties the queue table under this lock.
        file.ensure_open()?;
        vms.get(vm)?;
        let priority = Priority::new(priority)?;
        let context_id = vms.attach_queue(vm)?;
        let queue = Arc::new(Queue::new(
            file.id(),
            vm,
            context_id,
            kind,
            priority,
            self.config.limits.max_inflight_per_queue,
        ));
        let handle = match file.queues.lock().insert(Arc::clone(&queue)) {
            Ok(handle) => handle,
            Err(e) => {
                vms.detach_queue(vm);
                return Err(e);
            }
        };
        drop(vms);

        log::debug!(
            "[File {} VM {}]: queue {} created ({:?}, priority {})",
            file.id(),
            vm,
            queue.id(),
            kind,
            priority.get()
        );
        self.scheduler.register(queue);
        Ok(handle)
    }

    /// Destroy a queue with nothing in flight
    pub fn queue_destroy(&self, file: &File, handle: QueueHandle) -> Result<()> {
        let queue = {
            let mut table = file.queues.lock();
            let queue = table.get(handle).cloned().ok_or(Error::InvalidHandle)?;
            queue.try_close()?;
            table.remove(handle);
            queue
        };
        self.scheduler.unregister(queue.id());
        file.vms.write().detach_queue(queue.vm());
        log::debug!("[File {}]: queue {} destroyed", file.id(), queue.id());
        Ok(())
    }

    /// Return a faulted queue to service
    pub fn queue_reset(&self, file: &File, handle: QueueHandle) -> Result<()> {
        file.queue(handle)?.reset()?;
        self.scheduler.kick();
        Ok(())
    }

    /// Drain a queue's fault channel
    pub fn queue_take_faults(&self, file: &File, handle: QueueHandle) -> Result<Vec<FaultRecord>> {
        Ok(file.queue(handle)?.take_faults())
    }

    /// Pop the oldest fault from a queue's fault channel
    pub fn queue_pop_fault(&self, file: &File, handle: QueueHandle) -> Result<Option<FaultRecord>> {
        Ok(file.queue(handle)?.pop_fault())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queue a command buffer, returning its sequence number
    ///
    /// Returns as soon as the job is accepted. Failures found while it runs
    /// go to the queue's fault channel.
    pub fn submit(&self, file: &File, args: SubmitArgs) -> Result<u64> {
        file.ensure_open()?;
        let queue = file.queue(args.queue)?;
        if args.flags != 0 {
            return Err(Error::InvalidArgument);
        }
        queue.check(&args.command)?;
        if args.waits.len() > self.config.limits.max_wait_syncs {
            return Err(Error::InvalidArgument);
        }

        let (waits, signal) = {
            let table = self.syncobjs.read();
            let lookup = |h: SyncHandle| {
                table
                    .get(h)
                    .map(|e| Arc::downgrade(&e.sync))
                    .ok_or(Error::InvalidSyncObject)
            };
            let waits = args
                .waits
                .iter()
                .map(|&(h, point)| lookup(h).map(|w| (w, point)))
                .collect::<Result<Vec<_>>>()?;
            let signal = args.signal.map(lookup).transpose()?;
            (waits, signal)
        };

        let (pins, unresolved) = self.pin_pointers(file, &queue, &args.command)?;
        if let Some(addr) = unresolved {
            log::debug!(
                "[File {}]: queue {} submission references unbound {}",
                file.id(),
                queue.id(),
                addr
            );
        }

        let seq = queue.enqueue(Submission {
            command: args.command,
            waits,
            signal,
            pins,
            unresolved,
        })?;
        log::debug!(
            "[File {}]: queue {} accepted job {}",
            file.id(),
            queue.id(),
            seq
        );
        self.scheduler.kick();
        Ok(seq)
    }

    /// Pin every buffer the command points into
    ///
    /// Returns the pins and the first address with no binding behind it.
    fn pin_pointers(
        &self,
        file: &File,
        queue: &Queue,
        command: &Command,
    ) -> Result<(Vec<BufferPin>, Option<GpuAddr>)> {
        let vms = file.vms.read();
        let space = vms.get(queue.vm())?;

        let mut buffers: Vec<BufferHandle> = Vec::new();
        let mut unresolved = None;
        for addr in command.pointers() {
            match space.bindings().resolve(addr) {
                Some(binding) => {
                    if !buffers.contains(&binding.buffer) {
                        buffers.push(binding.buffer);
                    }
                }
                None => {
                    unresolved.get_or_insert(addr);
                }
            }
        }

        let mut pins = Vec::with_capacity(buffers.len());
        let mut failed = None;
        let mut bos = file.bos.lock();
        for handle in buffers {
            match BufferPin::new(&file.bos, &mut bos, handle) {
                Ok(pin) => pins.push(pin),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        drop(bos);
        drop(vms);

        // Pins unpin on drop, which needs the store unlocked.
        match failed {
            Some(e) => Err(e),
            None => Ok((pins, unresolved)),
        }
    }

    // =========================================================================
    // Sync objects
    // =========================================================================

    fn sync(&self, handle: SyncHandle) -> Result<Arc<SyncObject>> {
        self.syncobjs
            .read()
            .get(handle)
            .map(|e| Arc::clone(&e.sync))
            .ok_or(Error::InvalidSyncObject)
    }

    /// Create a sync object at point 0
    pub fn syncobj_create(&self, file: &File) -> Result<SyncHandle> {
        let handle = {
            let mut table = self.syncobjs.write();
            file.ensure_open()?;
            table.insert(SyncEntry {
                sync: Arc::new(SyncObject::new()),
                owner: file.id(),
            })?
        };
        log::debug!("[File {}]: syncobj {} created", file.id(), handle);
        Ok(handle)
    }

    /// Destroy a sync object created by this client
    ///
    /// Jobs still waiting on it fault with a lost dependency.
    pub fn syncobj_destroy(&self, file: &File, handle: SyncHandle) -> Result<()> {
        let entry = {
            let mut table = self.syncobjs.write();
            match table.get(handle) {
                Some(e) if e.owner == file.id() => {}
                _ => return Err(Error::InvalidSyncObject),
            }
            table.remove(handle)
        };
        drop(entry);
        self.scheduler.kick();
        Ok(())
    }

    /// Host-side signal to `point`
    pub fn syncobj_signal(&self, handle: SyncHandle, point: SyncPoint) -> Result<()> {
        self.sync(handle)?.signal(point)?;
        self.scheduler.kick();
        Ok(())
    }

    /// Current point of a sync object
    pub fn syncobj_query(&self, handle: SyncHandle) -> Result<SyncPoint> {
        Ok(self.sync(handle)?.current())
    }

    /// Block until a sync object reaches `point`
    pub fn syncobj_wait(
        &self,
        handle: SyncHandle,
        point: SyncPoint,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let sync = self.sync(handle)?;
        sync.wait(point, timeout)
    }

    /// Like [`syncobj_wait`](Self::syncobj_wait), abandoned once `cancel` is set
    pub fn syncobj_wait_interruptible(
        &self,
        handle: SyncHandle,
        point: SyncPoint,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let sync = self.sync(handle)?;
        sync.wait_interruptible(point, timeout, cancel)
    }
}
