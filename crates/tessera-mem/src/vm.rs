//! # GPU Address Space Management
//!
//! Per-client GPU virtual address spaces. Every space shares the device VM
//! layout: a user range for general bindings and a shader range for code.
//!
//! Destruction is strict: a space with live queues or bindings cannot be
//! destroyed. The client must destroy queues and unbind first, or let the
//! process-exit path do it in that order.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessera_core::{Error, GpuAddr, Handle, HandleTable, Result, VaRange, VmLayout};

use crate::backing::MemoryBackend;
use crate::binding::BindingTable;

/// Address space handle
pub type VmHandle = Handle<AddressSpace>;

/// Device-wide MMU context ids, never reused
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// REGIONS
// =============================================================================

/// Sub-range of an address space a binding may target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// General client bindings
    User,
    /// Shader code bindings
    Shader,
}

impl Region {
    /// Region containing `addr`
    pub fn classify(layout: &VmLayout, addr: GpuAddr) -> Option<Self> {
        if layout.user.contains(addr) {
            Some(Self::User)
        } else if layout.shader.contains(addr) {
            Some(Self::Shader)
        } else {
            None
        }
    }

    /// Address range of the region
    pub fn range(self, layout: &VmLayout) -> VaRange {
        match self {
            Self::User => layout.user,
            Self::Shader => layout.shader,
        }
    }
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    /// MMU context id
    context_id: u64,
    /// Shared layout
    layout: VmLayout,
    /// Placed buffer ranges
    bindings: BindingTable,
    /// Live queues attached to this space
    queue_refs: u32,
}

impl AddressSpace {
    /// MMU context id
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Bindings of this space
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub(crate) fn bindings_mut(&mut self) -> &mut BindingTable {
        &mut self.bindings
    }

    /// Number of live queues
    pub fn queue_count(&self) -> u32 {
        self.queue_refs
    }

    /// Range (user or shader) that contains `addr`
    pub fn region_of(&self, addr: GpuAddr) -> Option<VaRange> {
        Region::classify(&self.layout, addr).map(|r| r.range(&self.layout))
    }
}

// =============================================================================
// ADDRESS SPACE MANAGER
// =============================================================================

/// Per-client address space table
#[derive(Debug)]
pub struct AddressSpaceManager {
    file_id: u64,
    layout: VmLayout,
    backend: Arc<dyn MemoryBackend>,
    spaces: HandleTable<AddressSpace>,
}

impl AddressSpaceManager {
    /// Create an empty manager
    pub fn new(
        file_id: u64,
        backend: Arc<dyn MemoryBackend>,
        layout: VmLayout,
        max_handles: usize,
    ) -> Self {
        Self {
            file_id,
            layout,
            backend,
            spaces: HandleTable::new(max_handles),
        }
    }

    /// Owning client id
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// VM layout shared by every space
    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// Page-table collaborator
    pub fn backend(&self) -> Arc<dyn MemoryBackend> {
        Arc::clone(&self.backend)
    }

    /// Number of live spaces
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Create a new address space
    pub fn create(&mut self) -> Result<VmHandle> {
        let context_id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        let handle = self.spaces.insert(AddressSpace {
            context_id,
            layout: self.layout,
            bindings: BindingTable::new(),
            queue_refs: 0,
        })?;
        log::debug!(
            "[File {} VM {}]: created, context {}",
            self.file_id,
            handle,
            context_id
        );
        Ok(handle)
    }

    /// Destroy an address space with no queues or bindings
    pub fn destroy(&mut self, handle: VmHandle) -> Result<()> {
        let space = self.get(handle)?;
        if space.queue_refs > 0 || !space.bindings.is_empty() {
            log::debug!(
                "[File {} VM {}]: destroy refused ({} queues, {} bindings)",
                self.file_id,
                handle,
                space.queue_refs,
                space.bindings.len()
            );
            return Err(Error::ResourceBusy);
        }
        self.spaces.remove(handle);
        log::debug!("[File {} VM {}]: destroyed", self.file_id, handle);
        Ok(())
    }

    /// Look up a space
    pub fn get(&self, handle: VmHandle) -> Result<&AddressSpace> {
        self.spaces.get(handle).ok_or(Error::InvalidAddressSpace)
    }

    pub(crate) fn get_mut(&mut self, handle: VmHandle) -> Result<&mut AddressSpace> {
        self.spaces.get_mut(handle).ok_or(Error::InvalidAddressSpace)
    }

    /// Record a queue created on `handle`
    pub fn attach_queue(&mut self, handle: VmHandle) -> Result<u64> {
        let space = self.get_mut(handle)?;
        space.queue_refs += 1;
        Ok(space.context_id)
    }

    /// Record a queue destroyed on `handle`
    pub fn detach_queue(&mut self, handle: VmHandle) {
        match self.spaces.get_mut(handle) {
            Some(space) if space.queue_refs > 0 => space.queue_refs -= 1,
            _ => log::error!(
                "[File {} VM {}]: queue detach without attach",
                self.file_id,
                handle
            ),
        }
    }

    /// Handles of all live spaces
    pub fn handles(&self) -> Vec<VmHandle> {
        self.spaces.handles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::SystemMemoryBackend;

    fn manager() -> AddressSpaceManager {
        AddressSpaceManager::new(
            1,
            Arc::new(SystemMemoryBackend::new()),
            VmLayout::default(),
            4,
        )
    }

    #[test]
    fn test_create_destroy() {
        let mut vms = manager();
        let a = vms.create().unwrap();
        let b = vms.create().unwrap();
        assert_ne!(a, b);
        assert_ne!(
            vms.get(a).unwrap().context_id(),
            vms.get(b).unwrap().context_id()
        );
        vms.destroy(a).unwrap();
        assert_eq!(vms.get(a).map(|_| ()), Err(Error::InvalidAddressSpace));
        assert_eq!(vms.destroy(a), Err(Error::InvalidAddressSpace));
        assert_eq!(vms.len(), 1);
    }

    #[test]
    fn test_destroy_busy_with_queue() {
        let mut vms = manager();
        let vm = vms.create().unwrap();
        vms.attach_queue(vm).unwrap();
        assert_eq!(vms.destroy(vm), Err(Error::ResourceBusy));
        vms.detach_queue(vm);
        assert_eq!(vms.destroy(vm), Ok(()));
    }

    #[test]
    fn test_exhaustion() {
        let mut vms = manager();
        for _ in 0..4 {
            vms.create().unwrap();
        }
        assert_eq!(vms.create(), Err(Error::OutOfResources));
    }

    #[test]
    fn test_regions() {
        let vms = manager();
        let layout = vms.layout();
        assert_eq!(
            Region::classify(layout, GpuAddr::new(0x11_0000_4000)),
            Some(Region::Shader)
        );
        assert_eq!(
            Region::classify(layout, GpuAddr::new(0x30_0000_0000)),
            Some(Region::User)
        );
        assert_eq!(Region::classify(layout, GpuAddr::new(0x4000)), None);
    }
}
