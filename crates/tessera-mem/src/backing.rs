//! # Memory Backend
//!
//! Physical storage and page-table programming are owned by the platform.
//! The driver core only asks for them through [`MemoryBackend`].

use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;
use tessera_core::{ByteSize, Error, GpuAddr, Result};

use crate::binding::BindFlags;

/// Opaque identifier of a backing allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Storage allocation and GPU page-table collaborator
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Allocate backing storage of `size` bytes
    fn allocate(&self, size: ByteSize, writeback: bool) -> Result<StorageId>;

    /// Release backing storage; called exactly once per allocation
    fn release(&self, storage: StorageId);

    /// Map `len` bytes of `storage` starting at `offset` at `addr` in `context`
    fn map(
        &self,
        context: u64,
        addr: GpuAddr,
        storage: StorageId,
        offset: u64,
        len: u64,
        flags: BindFlags,
    ) -> Result<()>;

    /// Remove the mapping at `addr` in `context`
    fn unmap(&self, context: u64, addr: GpuAddr, len: u64);
}

// =============================================================================
// SYSTEM MEMORY BACKEND
// =============================================================================

#[derive(Debug)]
struct Allocation {
    size: ByteSize,
    writeback: bool,
}

#[derive(Debug)]
struct Mapping {
    storage: StorageId,
    offset: u64,
    len: u64,
    flags: BindFlags,
}

#[derive(Debug, Default)]
struct SystemState {
    next_id: u64,
    allocations: HashMap<StorageId, Allocation>,
    mappings: HashMap<(u64, GpuAddr), Mapping>,
    used: u64,
}

/// Host-memory backend used when no GPU MMU is attached
///
/// Tracks allocations and page-table entries so headless runs can observe
/// what the driver asked for.
#[derive(Debug)]
pub struct SystemMemoryBackend {
    budget: Option<u64>,
    state: Mutex<SystemState>,
}

impl SystemMemoryBackend {
    /// Backend without a size budget
    pub fn new() -> Self {
        Self {
            budget: None,
            state: Mutex::new(SystemState::default()),
        }
    }

    /// Backend that fails allocations beyond `bytes`
    pub fn with_budget(bytes: u64) -> Self {
        Self {
            budget: Some(bytes),
            state: Mutex::new(SystemState::default()),
        }
    }

    /// Bytes currently allocated
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of page-table mappings in `context`
    pub fn mapping_count(&self, context: u64) -> usize {
        self.state
            .lock()
            .mappings
            .keys()
            .filter(|(ctx, _)| *ctx == context)
            .count()
    }

    /// Whether writeback caching was requested for `storage`
    pub fn is_writeback(&self, storage: StorageId) -> Option<bool> {
        self.state
            .lock()
            .allocations
            .get(&storage)
            .map(|a| a.writeback)
    }

    /// Storage, offset and flags mapped at `addr` in `context`
    pub fn mapping_at(&self, context: u64, addr: GpuAddr) -> Option<(StorageId, u64, BindFlags)> {
        self.state
            .lock()
            .mappings
            .get(&(context, addr))
            .map(|m| (m.storage, m.offset, m.flags))
    }
}

impl Default for SystemMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for SystemMemoryBackend {
    fn allocate(&self, size: ByteSize, writeback: bool) -> Result<StorageId> {
        let mut state = self.state.lock();
        let used = state
            .used
            .checked_add(size.as_bytes())
            .ok_or(Error::OutOfResources)?;
        if self.budget.is_some_and(|budget| used > budget) {
            return Err(Error::OutOfResources);
        }
        state.next_id += 1;
        let id = StorageId(state.next_id);
        state.allocations.insert(id, Allocation { size, writeback });
        state.used = used;
        Ok(id)
    }

    fn release(&self, storage: StorageId) {
        let mut state = self.state.lock();
        match state.allocations.remove(&storage) {
            Some(alloc) => state.used -= alloc.size.as_bytes(),
            None => log::error!("release of unknown storage {:?}", storage),
        }
    }

    fn map(
        &self,
        context: u64,
        addr: GpuAddr,
        storage: StorageId,
        offset: u64,
        len: u64,
        flags: BindFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let fits = state
            .allocations
            .get(&storage)
            .is_some_and(|a| offset + len <= a.size.as_bytes());
        if !fits {
            return Err(Error::OutOfBounds);
        }
        state.mappings.insert(
            (context, addr),
            Mapping {
                storage,
                offset,
                len,
                flags,
            },
        );
        Ok(())
    }

    fn unmap(&self, context: u64, addr: GpuAddr, len: u64) {
        let mut state = self.state.lock();
        match state.mappings.remove(&(context, addr)) {
            Some(m) if m.len == len => {}
            Some(m) => log::error!(
                "unmap length mismatch at {} ({:#x} != {:#x})",
                addr,
                len,
                m.len
            ),
            None => log::error!("unmap of unmapped address {} in context {}", addr, context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release() {
        let backend = SystemMemoryBackend::new();
        let a = backend.allocate(ByteSize::from_kib(16), true).unwrap();
        let b = backend.allocate(ByteSize::from_kib(32), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.allocated_bytes(), 48 * 1024);
        assert_eq!(backend.is_writeback(a), Some(true));
        backend.release(a);
        assert_eq!(backend.allocated_bytes(), 32 * 1024);
        assert_eq!(backend.live_allocations(), 1);
    }

    #[test]
    fn test_budget() {
        let backend = SystemMemoryBackend::with_budget(0x8000);
        backend.allocate(ByteSize::from_kib(16), false).unwrap();
        backend.allocate(ByteSize::from_kib(16), false).unwrap();
        assert_eq!(
            backend.allocate(ByteSize::from_kib(16), false),
            Err(Error::OutOfResources)
        );
    }

    #[test]
    fn test_map_unmap() {
        let backend = SystemMemoryBackend::new();
        let s = backend.allocate(ByteSize::from_kib(32), false).unwrap();
        let addr = GpuAddr::new(0x20_0000_0000);
        backend
            .map(7, addr, s, 0x4000, 0x4000, BindFlags::READ)
            .unwrap();
        assert_eq!(backend.mapping_count(7), 1);
        assert_eq!(
            backend.mapping_at(7, addr),
            Some((s, 0x4000, BindFlags::READ))
        );
        backend.unmap(7, addr, 0x4000);
        assert_eq!(backend.mapping_count(7), 0);
    }
}
