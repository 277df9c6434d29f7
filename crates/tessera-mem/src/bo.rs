//! # Buffer Object Store
//!
//! GPU-visible allocations owned by one client, independent of any address
//! space until bound.
//!
//! A buffer is referenced by its client handle, by each binding of it, and by
//! each in-flight submission that pins it. Closing the handle drops only the
//! client reference; storage goes back to the backend when all three counts
//! reach zero. The handle slot stays occupied (and its identifier unusable)
//! until then.

use std::sync::Arc;

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::Mutex;
use tessera_core::{ByteSize, Error, Handle, HandleTable, Result};

use crate::backing::{MemoryBackend, StorageId};

/// Base of the fake offset space handed out for CPU mappings
const MMAP_OFFSET_BASE: u64 = 1 << 32;

bitflags! {
    /// Buffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoFlags: u32 {
        /// CPU mappings use writeback caching
        const WRITEBACK = 1 << 0;
    }
}

/// Buffer handle
pub type BufferHandle = Handle<BufferObject>;

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// A buffer object
#[derive(Debug)]
pub struct BufferObject {
    /// Size, rounded to the VM page size
    size: ByteSize,
    /// Creation flags
    flags: BoFlags,
    /// Backend storage
    storage: StorageId,
    /// CPU mapping token
    mmap_offset: u64,
    /// Client handle still open
    open: bool,
    /// Live bindings
    bindings: u32,
    /// In-flight submissions
    pins: u32,
}

impl BufferObject {
    /// Size in bytes
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Creation flags
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// Backend storage
    pub fn storage(&self) -> StorageId {
        self.storage
    }

    /// Number of live bindings
    pub fn binding_count(&self) -> u32 {
        self.bindings
    }

    /// Number of in-flight submissions referencing the buffer
    pub fn pin_count(&self) -> u32 {
        self.pins
    }

    fn is_unreferenced(&self) -> bool {
        !self.open && self.bindings == 0 && self.pins == 0
    }
}

// =============================================================================
// BUFFER STORE
// =============================================================================

/// Per-client buffer object table
#[derive(Debug)]
pub struct BufferStore {
    file_id: u64,
    page_size: u64,
    max_size: u64,
    backend: Arc<dyn MemoryBackend>,
    buffers: HandleTable<BufferObject>,
    tokens: HashMap<u64, BufferHandle>,
    next_token: u64,
}

impl BufferStore {
    /// Create an empty store
    pub fn new(
        file_id: u64,
        backend: Arc<dyn MemoryBackend>,
        page_size: u64,
        max_size: u64,
        max_handles: usize,
    ) -> Self {
        Self {
            file_id,
            page_size,
            max_size,
            backend,
            buffers: HandleTable::new(max_handles),
            tokens: HashMap::new(),
            next_token: MMAP_OFFSET_BASE,
        }
    }

    /// Create a buffer of at least `size` bytes
    pub fn create(&mut self, size: u64, flags: u32) -> Result<BufferHandle> {
        let flags = BoFlags::from_bits(flags).ok_or(Error::InvalidArgument)?;
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let size = ByteSize::from_bytes(size)
            .checked_align_up(self.page_size)
            .filter(|s| s.as_bytes() <= self.max_size)
            .ok_or(Error::OutOfResources)?;
        let mmap_offset = self.next_token;
        let next_token = mmap_offset
            .checked_add(size.as_bytes())
            .ok_or(Error::OutOfResources)?;

        let storage = self
            .backend
            .allocate(size, flags.contains(BoFlags::WRITEBACK))?;
        let handle = match self.buffers.insert(BufferObject {
            size,
            flags,
            storage,
            mmap_offset,
            open: true,
            bindings: 0,
            pins: 0,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.release(storage);
                return Err(e);
            }
        };
        self.next_token = next_token;
        self.tokens.insert(mmap_offset, handle);

        log::debug!(
            "[File {}]: GEM create {} -> {} ({:?})",
            self.file_id,
            size,
            handle,
            flags
        );
        Ok(handle)
    }

    /// Look up an open buffer
    pub fn get(&self, handle: BufferHandle) -> Result<&BufferObject> {
        self.buffers
            .get(handle)
            .filter(|bo| bo.open)
            .ok_or(Error::InvalidHandle)
    }

    fn get_mut(&mut self, handle: BufferHandle) -> Result<&mut BufferObject> {
        self.buffers
            .get_mut(handle)
            .filter(|bo| bo.open)
            .ok_or(Error::InvalidHandle)
    }

    /// Token the mapping collaborator turns into CPU-visible memory
    pub fn mmap_offset(&self, handle: BufferHandle) -> Result<u64> {
        self.get(handle).map(|bo| bo.mmap_offset)
    }

    /// Resolve a mapping token back to its buffer
    pub fn lookup_mapping_token(&self, token: u64) -> Option<(BufferHandle, StorageId, ByteSize)> {
        let handle = *self.tokens.get(&token)?;
        let bo = self.buffers.get(handle)?;
        Some((handle, bo.storage, bo.size))
    }

    /// Drop the client reference
    ///
    /// Fails with `ResourceBusy` while the buffer is still bound.
    pub fn close(&mut self, handle: BufferHandle) -> Result<()> {
        let file_id = self.file_id;
        let bo = self.get_mut(handle)?;
        if bo.bindings > 0 {
            log::debug!(
                "[File {}]: GEM close {} refused, {} bindings",
                file_id,
                handle,
                bo.bindings
            );
            return Err(Error::ResourceBusy);
        }
        bo.open = false;
        log::debug!("[File {}]: GEM close {}", file_id, handle);
        self.release_if_unreferenced(handle);
        Ok(())
    }

    /// Handles of all open buffers
    pub fn open_handles(&self) -> Vec<BufferHandle> {
        self.buffers
            .iter()
            .filter(|(_, bo)| bo.open)
            .map(|(h, _)| h)
            .collect()
    }

    /// Buffers whose storage is still alive, open or not
    pub fn live_count(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn acquire_binding(&mut self, handle: BufferHandle) -> Result<()> {
        self.get_mut(handle)?.bindings += 1;
        Ok(())
    }

    pub(crate) fn release_binding(&mut self, handle: BufferHandle) {
        match self.buffers.get_mut(handle) {
            Some(bo) if bo.bindings > 0 => bo.bindings -= 1,
            _ => {
                log::error!("[File {}]: binding release on {} underflows", self.file_id, handle);
                return;
            }
        }
        self.release_if_unreferenced(handle);
    }

    /// Take an in-flight reference
    pub fn pin(&mut self, handle: BufferHandle) -> Result<()> {
        let bo = self.buffers.get_mut(handle).ok_or(Error::InvalidHandle)?;
        bo.pins += 1;
        Ok(())
    }

    /// Drop an in-flight reference
    pub fn unpin(&mut self, handle: BufferHandle) {
        match self.buffers.get_mut(handle) {
            Some(bo) if bo.pins > 0 => bo.pins -= 1,
            _ => {
                log::error!("[File {}]: unpin on {} underflows", self.file_id, handle);
                return;
            }
        }
        self.release_if_unreferenced(handle);
    }

    fn release_if_unreferenced(&mut self, handle: BufferHandle) {
        let unreferenced = self
            .buffers
            .get(handle)
            .is_some_and(BufferObject::is_unreferenced);
        if !unreferenced {
            return;
        }
        if let Some(bo) = self.buffers.remove(handle) {
            self.tokens.remove(&bo.mmap_offset);
            self.backend.release(bo.storage);
            log::debug!("[File {}]: GEM {} storage released", self.file_id, handle);
        }
    }
}

// =============================================================================
// BUFFER PIN
// =============================================================================

/// In-flight reference that unpins its buffer on drop
///
/// Must not be dropped while the owning store is locked.
#[derive(Debug)]
pub struct BufferPin {
    store: Arc<Mutex<BufferStore>>,
    handle: BufferHandle,
}

impl BufferPin {
    /// Pin `handle` in an already-locked store
    pub fn new(
        store: &Arc<Mutex<BufferStore>>,
        locked: &mut BufferStore,
        handle: BufferHandle,
    ) -> Result<Self> {
        locked.pin(handle)?;
        Ok(Self {
            store: Arc::clone(store),
            handle,
        })
    }

    /// Pinned buffer
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        self.store.lock().unpin(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::SystemMemoryBackend;

    fn store() -> (Arc<SystemMemoryBackend>, BufferStore) {
        let backend = Arc::new(SystemMemoryBackend::new());
        let store = BufferStore::new(1, backend.clone(), 0x4000, 1 << 30, 64);
        (backend, store)
    }

    #[test]
    fn test_create_rounds_to_page() {
        let (backend, mut store) = store();
        let h = store.create(1, 0).unwrap();
        assert_eq!(store.get(h).unwrap().size().as_bytes(), 0x4000);
        assert_eq!(backend.allocated_bytes(), 0x4000);
    }

    #[test]
    fn test_create_zero_size() {
        let (_, mut store) = store();
        assert_eq!(store.create(0, 0), Err(Error::InvalidSize));
    }

    #[test]
    fn test_create_rejects_unknown_flags() {
        let (_, mut store) = store();
        assert_eq!(store.create(0x4000, 0x2), Err(Error::InvalidArgument));
        let h = store.create(0x4000, BoFlags::WRITEBACK.bits()).unwrap();
        assert!(store.get(h).unwrap().flags().contains(BoFlags::WRITEBACK));
    }

    #[test]
    fn test_create_too_large() {
        let (_, mut store) = store();
        assert_eq!(store.create(u64::MAX, 0), Err(Error::OutOfResources));
        assert_eq!(store.create((1 << 30) + 1, 0), Err(Error::OutOfResources));
    }

    #[test]
    fn test_mmap_tokens_distinct_and_stable() {
        let (_, mut store) = store();
        let mut tokens = Vec::new();
        for size in [1, 0x4000, 0x10000, 3] {
            let h = store.create(size, 0).unwrap();
            let token = store.mmap_offset(h).unwrap();
            assert_eq!(store.mmap_offset(h), Ok(token));
            assert_eq!(token % 0x4000, 0);
            assert_eq!(store.lookup_mapping_token(token).map(|t| t.0), Some(h));
            tokens.push(token);
        }
        tokens.sort_unstable();
        tokens.dedup();
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_mmap_token_space_exhausted() {
        let (backend, mut store) = store();
        store.next_token = u64::MAX - 0x4000;
        assert_eq!(store.create(0x8000, 0), Err(Error::OutOfResources));
        assert_eq!(backend.live_allocations(), 0);
        let h = store.create(0x4000, 0).unwrap();
        assert_eq!(store.mmap_offset(h), Ok(u64::MAX - 0x4000));
        assert_eq!(store.create(0x4000, 0), Err(Error::OutOfResources));
    }

    #[test]
    fn test_close_invalidates_handle() {
        let (backend, mut store) = store();
        let h = store.create(0x4000, 0).unwrap();
        store.close(h).unwrap();
        assert_eq!(store.mmap_offset(h), Err(Error::InvalidHandle));
        assert_eq!(store.close(h), Err(Error::InvalidHandle));
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_close_while_bound_is_busy() {
        let (_, mut store) = store();
        let h = store.create(0x4000, 0).unwrap();
        store.acquire_binding(h).unwrap();
        assert_eq!(store.close(h), Err(Error::ResourceBusy));
        store.release_binding(h);
        assert_eq!(store.close(h), Ok(()));
    }

    #[test]
    fn test_pin_keeps_storage_after_close() {
        let backend = Arc::new(SystemMemoryBackend::new());
        let store = Arc::new(Mutex::new(BufferStore::new(
            1,
            backend.clone(),
            0x4000,
            1 << 30,
            64,
        )));
        let h = store.lock().create(0x4000, 0).unwrap();
        let pin = {
            let mut locked = store.lock();
            BufferPin::new(&store, &mut locked, h).unwrap()
        };
        store.lock().close(h).unwrap();
        assert_eq!(backend.live_allocations(), 1);
        assert_eq!(store.lock().live_count(), 1);
        drop(pin);
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(store.lock().live_count(), 0);
    }
}
