//! # Parameter Registry
//!
//! Read-only GPU identity, feature and address-range values that a client
//! queries before creating any object. Range ends are inclusive.

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::UABI_VERSION;

/// Queryable parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Param {
    /// Protocol version; must match between client and driver
    UnstableUabiVersion = 0,
    /// Architecture generation
    GpuGeneration = 1,
    /// Variant letter
    GpuVariant = 2,
    /// Silicon revision
    GpuRevision = 3,
    /// SoC chip id
    ChipId = 4,
    /// Compatible feature bits
    FeatCompat = 5,
    /// Incompatible feature bits
    FeatIncompat = 6,
    /// VM page size
    VmPageSize = 7,
    /// First user address
    VmUserStart = 8,
    /// Last user address
    VmUserEnd = 9,
    /// First shader address
    VmShaderStart = 10,
    /// Last shader address
    VmShaderEnd = 11,
}

impl Param {
    /// Every parameter, in wire order
    pub const ALL: [Param; 12] = [
        Param::UnstableUabiVersion,
        Param::GpuGeneration,
        Param::GpuVariant,
        Param::GpuRevision,
        Param::ChipId,
        Param::FeatCompat,
        Param::FeatIncompat,
        Param::VmPageSize,
        Param::VmUserStart,
        Param::VmUserEnd,
        Param::VmShaderStart,
        Param::VmShaderEnd,
    ];

    /// Decode a wire id
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// Snapshot of every parameter value
#[derive(Debug, Clone)]
pub struct ParamRegistry {
    values: [u64; 12],
}

impl ParamRegistry {
    /// Capture the values of a configuration
    pub fn new(config: &DeviceConfig) -> Self {
        let id = &config.identity;
        let vm = &config.vm;
        Self {
            values: [
                UABI_VERSION,
                id.generation as u64,
                id.variant as u64,
                id.revision as u64,
                id.chip_id as u64,
                config.feat_compat,
                config.feat_incompat.bits(),
                vm.page_size,
                vm.user.start.raw(),
                vm.user.last().raw(),
                vm.shader.start.raw(),
                vm.shader.last().raw(),
            ],
        }
    }

    /// Value of a typed parameter
    pub fn get(&self, param: Param) -> u64 {
        self.values[param as usize]
    }

    /// Value of a wire parameter id
    pub fn query(&self, raw: u32) -> Result<u64> {
        Param::from_raw(raw)
            .map(|param| self.get(param))
            .ok_or(Error::UnknownParameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matches_config() {
        let config = DeviceConfig::g13();
        let params = ParamRegistry::new(&config);
        assert_eq!(params.query(0), Ok(UABI_VERSION));
        assert_eq!(params.get(Param::GpuVariant), b'G' as u64);
        assert_eq!(params.get(Param::VmPageSize), 0x4000);
        assert_eq!(params.get(Param::VmUserStart), 0x20_0000_0000);
        assert_eq!(params.get(Param::VmUserEnd), 0x5f_ffff_ffff);
        assert_eq!(params.get(Param::VmShaderEnd), 0x11_ffff_ffff);
        assert_eq!(params.get(Param::FeatIncompat), 1);
    }

    #[test]
    fn test_unknown_parameter() {
        let params = ParamRegistry::new(&DeviceConfig::default());
        assert_eq!(params.query(12), Err(Error::UnknownParameter));
        assert_eq!(params.query(u32::MAX), Err(Error::UnknownParameter));
    }

    #[test]
    fn test_wire_ids_in_order() {
        for (i, param) in Param::ALL.iter().enumerate() {
            assert_eq!(*param as usize, i);
            assert_eq!(Param::from_raw(i as u32), Some(*param));
        }
    }
}
