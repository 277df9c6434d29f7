//! # Device Configuration
//!
//! Identity, feature bits, VM layout and table limits of one GPU instance.
//! The configuration is fixed when the device is created and is what the
//! parameter registry reports to clients.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::types::VaRange;

// =============================================================================
// GPU IDENTITY
// =============================================================================

/// GPU identity as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuIdentity {
    /// Architecture generation (13 = G13)
    pub generation: u32,
    /// Variant letter ('G', 'S', 'C', 'D')
    pub variant: u8,
    /// Silicon revision
    pub revision: u32,
    /// SoC chip id
    pub chip_id: u32,
}

impl Default for GpuIdentity {
    fn default() -> Self {
        Self {
            generation: 13,
            variant: b'G',
            revision: 0x11,
            chip_id: 0x8103,
        }
    }
}

// =============================================================================
// FEATURES
// =============================================================================

bitflags! {
    /// Features a client must understand to drive the GPU correctly
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureIncompat: u64 {
        /// Depth/stencil attachments must be compressed
        const MANDATORY_ZS_COMPRESSION = 1 << 0;
    }
}

// =============================================================================
// VM LAYOUT
// =============================================================================

/// Layout of every client GPU address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLayout {
    /// Page size; bindings are aligned to it
    pub page_size: u64,
    /// Range for general client bindings
    pub user: VaRange,
    /// Range for shader code bindings
    pub shader: VaRange,
    /// First address reserved for the driver's own mappings
    pub driver_start: u64,
}

impl Default for VmLayout {
    fn default() -> Self {
        Self {
            page_size: 0x4000,
            user: VaRange::inclusive(0x20_0000_0000, 0x5f_ffff_ffff),
            shader: VaRange::inclusive(0x11_0000_0000, 0x11_ffff_ffff),
            driver_start: 0x60_0000_0000,
        }
    }
}

// =============================================================================
// LIMITS
// =============================================================================

/// Capacity limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Live entries per handle table
    pub max_handles: usize,
    /// Entries in one submission's wait list
    pub max_wait_syncs: usize,
    /// Accepted but unretired submissions per queue
    pub max_inflight_per_queue: usize,
    /// Largest buffer object in bytes
    pub max_buffer_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_handles: 4096,
            max_wait_syncs: 64,
            max_inflight_per_queue: 1024,
            max_buffer_size: 1 << 32,
        }
    }
}

// =============================================================================
// DEVICE CONFIG
// =============================================================================

/// Complete device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceConfig {
    /// GPU identity
    pub identity: GpuIdentity,
    /// Compatible feature bits; none are defined yet
    pub feat_compat: u64,
    /// Incompatible features
    pub feat_incompat: FeatureIncompat,
    /// Address space layout
    pub vm: VmLayout,
    /// Capacity limits
    pub limits: Limits,
}

impl DeviceConfig {
    /// Default config with ZS compression mandatory, as on G13
    pub fn g13() -> Self {
        Self::default().with_incompat(FeatureIncompat::MANDATORY_ZS_COMPRESSION)
    }

    /// Replace the GPU identity
    pub fn with_identity(mut self, identity: GpuIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the incompatible feature set
    pub fn with_incompat(mut self, feat: FeatureIncompat) -> Self {
        self.feat_incompat = feat;
        self
    }

    /// Replace the VM layout
    pub fn with_vm(mut self, vm: VmLayout) -> Self {
        self.vm = vm;
        self
    }

    /// Replace the limits
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let vm = &self.vm;
        if !vm.page_size.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        for range in [vm.user, vm.shader] {
            if range.is_empty()
                || !range.start.is_aligned(vm.page_size)
                || !range.end.is_aligned(vm.page_size)
                || range.end.raw() > vm.driver_start
            {
                return Err(Error::InvalidArgument);
            }
        }
        if vm.user.overlaps(&vm.shader) {
            return Err(Error::InvalidArgument);
        }
        let limits = &self.limits;
        if limits.max_handles == 0
            || limits.max_inflight_per_queue == 0
            || limits.max_buffer_size < vm.page_size
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GpuAddr;

    #[test]
    fn test_default_is_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
        assert!(DeviceConfig::g13().validate().is_ok());
    }

    #[test]
    fn test_g13_layout() {
        let config = DeviceConfig::g13();
        assert_eq!(config.vm.page_size, 16 * 1024);
        assert_eq!(config.vm.user.last(), GpuAddr::new(0x5f_ffff_ffff));
        assert!(config
            .feat_incompat
            .contains(FeatureIncompat::MANDATORY_ZS_COMPRESSION));
    }

    #[test]
    fn test_rejects_overlapping_ranges() {
        let mut vm = VmLayout::default();
        vm.shader = VaRange::inclusive(0x20_0000_0000, 0x20_ffff_ffff);
        assert_eq!(
            DeviceConfig::default().with_vm(vm).validate(),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_rejects_odd_page_size() {
        let mut vm = VmLayout::default();
        vm.page_size = 0x3000;
        assert!(DeviceConfig::default().with_vm(vm).validate().is_err());
    }
}
