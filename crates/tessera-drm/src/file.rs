//! # Client Files
//!
//! Each open of the device gets a [`File`]: the client's own namespace of
//! address spaces, buffer objects and queues. Identifiers from one file mean
//! nothing in another.
//!
//! Lock order inside a file: `vms` before `bos` before `queues`.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};
use tessera_cmd::Queue;
use tessera_core::{DeviceConfig, Error, Handle, HandleTable, Result};
use tessera_mem::{AddressSpaceManager, BufferStore, MemoryBackend};

/// Queue handle
pub type QueueHandle = Handle<Arc<Queue>>;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-client state
#[derive(Debug)]
pub struct File {
    id: u64,
    closed: AtomicBool,
    pub(crate) vms: RwLock<AddressSpaceManager>,
    pub(crate) bos: Arc<Mutex<BufferStore>>,
    pub(crate) queues: Mutex<HandleTable<Arc<Queue>>>,
}

impl File {
    pub(crate) fn new(config: &DeviceConfig, memory: Arc<dyn MemoryBackend>) -> Self {
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
        let limits = &config.limits;
        Self {
            id,
            closed: AtomicBool::new(false),
            vms: RwLock::new(AddressSpaceManager::new(
                id,
                Arc::clone(&memory),
                config.vm,
                limits.max_handles,
            )),
            bos: Arc::new(Mutex::new(BufferStore::new(
                id,
                memory,
                config.vm.page_size,
                limits.max_buffer_size,
                limits.max_handles,
            ))),
            queues: Mutex::new(HandleTable::new(limits.max_handles)),
        }
    }

    /// Device-unique client id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the client has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail with `InvalidHandle` once the client is closed
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }

    /// Mark closed; returns `false` if it already was
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Look up a queue, releasing the table lock before returning
    pub(crate) fn queue(&self, handle: QueueHandle) -> Result<Arc<Queue>> {
        self.queues
            .lock()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Number of live address spaces
    pub fn vm_count(&self) -> usize {
        self.vms.read().len()
    }

    /// Number of buffers whose storage is still alive
    pub fn buffer_count(&self) -> usize {
        self.bos.lock().live_count()
    }

    /// Number of live queues
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}
