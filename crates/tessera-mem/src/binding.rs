//! # Binding Table
//!
//! Placement of buffer ranges at GPU virtual addresses.
//!
//! Each address space keeps its bindings in a map ordered by start address.
//! Bindings never overlap, so the only candidate that can overlap a new range
//! is the last binding starting before the new range ends.

use std::collections::BTreeMap;

use bitflags::bitflags;
use tessera_core::{Error, GpuAddr, Result, VaRange};

use crate::bo::{BufferHandle, BufferStore};
use crate::vm::{AddressSpaceManager, VmHandle};

bitflags! {
    /// Binding permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindFlags: u32 {
        /// GPU may read
        const READ = 1 << 0;
        /// GPU may write
        const WRITE = 1 << 1;
    }
}

// =============================================================================
// BINDING
// =============================================================================

/// One buffer range placed in an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Bound buffer
    pub buffer: BufferHandle,
    /// Offset into the buffer
    pub offset: u64,
    /// Target virtual range
    pub range: VaRange,
    /// Permissions
    pub flags: BindFlags,
}

impl Binding {
    /// Buffer offset backing `addr`, if the binding covers it
    pub fn translate(&self, addr: GpuAddr) -> Option<u64> {
        if self.range.contains(addr) {
            Some(self.offset + (addr.raw() - self.range.start.raw()))
        } else {
            None
        }
    }
}

/// Bindings of one address space
#[derive(Debug, Default)]
pub struct BindingTable {
    entries: BTreeMap<GpuAddr, Binding>,
}

impl BindingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binding overlapping `range`, if any
    pub fn find_overlap(&self, range: &VaRange) -> Option<&Binding> {
        self.entries
            .range(..range.end)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.range.overlaps(range))
    }

    /// Binding covering `addr`
    pub fn resolve(&self, addr: GpuAddr) -> Option<&Binding> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.range.contains(addr))
    }

    /// Binding starting exactly at `addr`
    pub fn get(&self, addr: GpuAddr) -> Option<&Binding> {
        self.entries.get(&addr)
    }

    /// Iterate in address order
    pub fn iter(&self) -> impl Iterator<Item = &Binding> + '_ {
        self.entries.values()
    }

    fn insert(&mut self, binding: Binding) {
        self.entries.insert(binding.range.start, binding);
    }

    fn remove(&mut self, addr: GpuAddr) -> Option<Binding> {
        self.entries.remove(&addr)
    }
}

// =============================================================================
// BIND / UNBIND
// =============================================================================

/// Arguments of a bind operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    /// Buffer to bind
    pub buffer: BufferHandle,
    /// Target address space
    pub vm: VmHandle,
    /// Offset into the buffer
    pub offset: u64,
    /// Bytes to bind
    pub length: u64,
    /// Target GPU address
    pub addr: GpuAddr,
    /// Raw permission bits
    pub flags: u32,
}

/// Place a buffer range into an address space
///
/// Both tables must be locked by the caller, address spaces first.
/// Re-binding an identical range is a successful no-op.
pub fn bind(
    spaces: &mut AddressSpaceManager,
    store: &mut BufferStore,
    req: &BindRequest,
) -> Result<()> {
    let size = store.get(req.buffer)?.size().as_bytes();
    let page_size = spaces.layout().page_size;
    let space = spaces.get(req.vm)?;

    let end = req.offset.checked_add(req.length).ok_or(Error::OutOfBounds)?;
    if end > size {
        return Err(Error::OutOfBounds);
    }
    if req.length == 0 {
        return Err(Error::InvalidArgument);
    }
    if req.offset % page_size != 0 || req.length % page_size != 0 || !req.addr.is_aligned(page_size)
    {
        return Err(Error::MisalignedAddress);
    }

    let flags = BindFlags::from_bits(req.flags).ok_or(Error::InvalidArgument)?;
    if flags.is_empty() {
        return Err(Error::InvalidArgument);
    }

    let range = VaRange::from_start_len(req.addr, req.length).ok_or(Error::AddressOutOfRange)?;
    let region = space.region_of(req.addr).ok_or(Error::AddressOutOfRange)?;
    if !region.encloses(&range) {
        return Err(Error::AddressOutOfRange);
    }

    let binding = Binding {
        buffer: req.buffer,
        offset: req.offset,
        range,
        flags,
    };
    if let Some(existing) = space.bindings().find_overlap(&range) {
        if *existing == binding {
            log::trace!(
                "[File {} VM {}]: identical rebind at {}",
                spaces.file_id(),
                req.vm,
                req.addr
            );
            return Ok(());
        }
        return Err(Error::RangeConflict);
    }

    let storage = store.get(req.buffer)?.storage();
    let context = space.context_id();
    spaces
        .backend()
        .map(context, req.addr, storage, req.offset, req.length, flags)?;
    store.acquire_binding(req.buffer)?;
    spaces.get_mut(req.vm)?.bindings_mut().insert(binding);

    log::debug!(
        "[File {} VM {}]: bind {} [{:#x}+{:#x}] at {} {:?}",
        spaces.file_id(),
        req.vm,
        req.buffer,
        req.offset,
        req.length,
        req.addr,
        flags
    );
    Ok(())
}

/// Remove the binding of `buffer` starting at `addr`
pub fn unbind(
    spaces: &mut AddressSpaceManager,
    store: &mut BufferStore,
    buffer: BufferHandle,
    vm: VmHandle,
    addr: GpuAddr,
) -> Result<()> {
    store.get(buffer)?;
    let file_id = spaces.file_id();
    let backend = spaces.backend();
    let space = spaces.get_mut(vm)?;
    let context = space.context_id();

    let matches = space
        .bindings()
        .get(addr)
        .is_some_and(|b| b.buffer == buffer);
    if !matches {
        return Err(Error::NotFound);
    }
    let binding = space.bindings_mut().remove(addr).ok_or(Error::NotFound)?;
    backend.unmap(context, addr, binding.range.len());
    store.release_binding(buffer);

    log::debug!(
        "[File {} VM {}]: unbind {} at {}",
        file_id,
        vm,
        buffer,
        addr
    );
    Ok(())
}

/// Remove every binding of an address space, returning how many were removed
pub fn unbind_all(
    spaces: &mut AddressSpaceManager,
    store: &mut BufferStore,
    vm: VmHandle,
) -> Result<usize> {
    let backend = spaces.backend();
    let space = spaces.get_mut(vm)?;
    let context = space.context_id();
    let removed: Vec<Binding> = core::mem::take(space.bindings_mut())
        .entries
        .into_values()
        .collect();
    for binding in &removed {
        backend.unmap(context, binding.range.start, binding.range.len());
        store.release_binding(binding.buffer);
    }
    Ok(removed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{MemoryBackend, SystemMemoryBackend};
    use std::sync::Arc;
    use tessera_core::VmLayout;

    const USER: u64 = 0x20_0000_0000;
    const SHADER: u64 = 0x11_0000_0000;
    const PAGE: u64 = 0x4000;

    struct Fixture {
        backend: Arc<SystemMemoryBackend>,
        spaces: AddressSpaceManager,
        store: BufferStore,
        vm: VmHandle,
        bo: BufferHandle,
    }

    fn fixture(bo_size: u64) -> Fixture {
        let backend = Arc::new(SystemMemoryBackend::new());
        let dyn_backend: Arc<dyn MemoryBackend> = backend.clone();
        let mut spaces = AddressSpaceManager::new(1, dyn_backend.clone(), VmLayout::default(), 16);
        let mut store = BufferStore::new(1, dyn_backend, PAGE, 1 << 30, 16);
        let vm = spaces.create().unwrap();
        let bo = store.create(bo_size, 0).unwrap();
        Fixture {
            backend,
            spaces,
            store,
            vm,
            bo,
        }
    }

    fn req(f: &Fixture, offset: u64, length: u64, addr: u64) -> BindRequest {
        BindRequest {
            buffer: f.bo,
            vm: f.vm,
            offset,
            length,
            addr: GpuAddr::new(addr),
            flags: (BindFlags::READ | BindFlags::WRITE).bits(),
        }
    }

    impl Fixture {
        /// Bind the fixture buffer read-write
        fn bind_at(&mut self, offset: u64, length: u64, addr: u64) -> Result<()> {
            let r = req(self, offset, length, addr);
            bind(&mut self.spaces, &mut self.store, &r)
        }
    }

    #[test]
    fn test_bind_and_resolve() {
        let mut f = fixture(4 * PAGE);
        let r = req(&f, PAGE, 2 * PAGE, USER);
        bind(&mut f.spaces, &mut f.store, &r).unwrap();

        let space = f.spaces.get(f.vm).unwrap();
        let hit = space.bindings().resolve(GpuAddr::new(USER + PAGE + 8)).unwrap();
        assert_eq!(hit.buffer, f.bo);
        assert_eq!(hit.translate(GpuAddr::new(USER + PAGE + 8)), Some(2 * PAGE + 8));
        assert!(space.bindings().resolve(GpuAddr::new(USER + 2 * PAGE)).is_none());
        assert_eq!(f.store.get(f.bo).unwrap().binding_count(), 1);
        assert_eq!(f.backend.mapping_count(space.context_id()), 1);
    }

    #[test]
    fn test_identical_rebind_is_noop() {
        let mut f = fixture(2 * PAGE);
        let r = req(&f, 0, 2 * PAGE, USER);
        bind(&mut f.spaces, &mut f.store, &r).unwrap();
        bind(&mut f.spaces, &mut f.store, &r).unwrap();
        assert_eq!(f.spaces.get(f.vm).unwrap().bindings().len(), 1);
        assert_eq!(f.store.get(f.bo).unwrap().binding_count(), 1);
    }

    #[test]
    fn test_overlap_at_different_offset_conflicts() {
        let mut f = fixture(4 * PAGE);
        f.bind_at(0, 2 * PAGE, USER).unwrap();
        let other = req(&f, PAGE, 2 * PAGE, USER);
        assert_eq!(
            bind(&mut f.spaces, &mut f.store, &other),
            Err(Error::RangeConflict)
        );
        let tail = req(&f, 0, PAGE, USER + PAGE);
        assert_eq!(
            bind(&mut f.spaces, &mut f.store, &tail),
            Err(Error::RangeConflict)
        );
    }

    #[test]
    fn test_rebind_with_other_flags_conflicts() {
        let mut f = fixture(PAGE);
        f.bind_at(0, PAGE, USER).unwrap();
        let mut ro = req(&f, 0, PAGE, USER);
        ro.flags = BindFlags::READ.bits();
        assert_eq!(bind(&mut f.spaces, &mut f.store, &ro), Err(Error::RangeConflict));
    }

    #[test]
    fn test_adjacent_bindings() {
        let mut f = fixture(2 * PAGE);
        f.bind_at(0, PAGE, USER).unwrap();
        f.bind_at(PAGE, PAGE, USER + PAGE).unwrap();
        assert_eq!(f.store.get(f.bo).unwrap().binding_count(), 2);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut f = fixture(PAGE);
        let size = f.store.get(f.bo).unwrap().size().as_bytes();
        assert_eq!(f.bind_at(size - 1, 2, USER), Err(Error::OutOfBounds));
        assert_eq!(f.bind_at(u64::MAX, 2, USER), Err(Error::OutOfBounds));
    }

    #[test]
    fn test_misaligned() {
        let mut f = fixture(2 * PAGE);
        assert_eq!(f.bind_at(0, PAGE, USER + 0x1000), Err(Error::MisalignedAddress));
        assert_eq!(f.bind_at(0x100, PAGE, USER), Err(Error::MisalignedAddress));
    }

    #[test]
    fn test_permissions_required() {
        let mut f = fixture(PAGE);
        let mut r = req(&f, 0, PAGE, USER);
        r.flags = 0;
        assert_eq!(bind(&mut f.spaces, &mut f.store, &r), Err(Error::InvalidArgument));
        r.flags = 0x4;
        assert_eq!(bind(&mut f.spaces, &mut f.store, &r), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_address_ranges() {
        let mut f = fixture(2 * PAGE);
        f.bind_at(0, PAGE, SHADER).unwrap();
        assert_eq!(f.bind_at(0, PAGE, 0x1000_0000), Err(Error::AddressOutOfRange));
        let last_user_page = 0x5f_ffff_ffff + 1 - PAGE;
        assert_eq!(f.bind_at(0, 2 * PAGE, last_user_page), Err(Error::AddressOutOfRange));
        assert_eq!(f.bind_at(0, PAGE, 0x60_0000_0000), Err(Error::AddressOutOfRange));
    }

    #[test]
    fn test_unknown_handles() {
        let mut f = fixture(PAGE);
        let mut r = req(&f, 0, PAGE, USER);
        f.store.close(f.bo).unwrap();
        assert_eq!(bind(&mut f.spaces, &mut f.store, &r), Err(Error::InvalidHandle));

        r.buffer = f.store.create(PAGE, 0).unwrap();
        f.spaces.destroy(f.vm).unwrap();
        assert_eq!(
            bind(&mut f.spaces, &mut f.store, &r),
            Err(Error::InvalidAddressSpace)
        );
    }

    #[test]
    fn test_unbind() {
        let mut f = fixture(PAGE);
        f.bind_at(0, PAGE, USER).unwrap();
        assert_eq!(
            unbind(&mut f.spaces, &mut f.store, f.bo, f.vm, GpuAddr::new(USER + PAGE)),
            Err(Error::NotFound)
        );
        unbind(&mut f.spaces, &mut f.store, f.bo, f.vm, GpuAddr::new(USER)).unwrap();
        assert!(f.spaces.get(f.vm).unwrap().bindings().is_empty());
        assert_eq!(f.store.get(f.bo).unwrap().binding_count(), 0);
        assert_eq!(
            unbind(&mut f.spaces, &mut f.store, f.bo, f.vm, GpuAddr::new(USER)),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_unbind_all() {
        let mut f = fixture(2 * PAGE);
        f.bind_at(0, PAGE, USER).unwrap();
        f.bind_at(PAGE, PAGE, SHADER).unwrap();
        assert_eq!(unbind_all(&mut f.spaces, &mut f.store, f.vm), Ok(2));
        let context = f.spaces.get(f.vm).unwrap().context_id();
        assert_eq!(f.backend.mapping_count(context), 0);
        f.spaces.destroy(f.vm).unwrap();
        f.store.close(f.bo).unwrap();
        assert_eq!(f.backend.live_allocations(), 0);
    }
}
