//! # Client Memory Access
//!
//! Submissions point at command records and sync arrays in the caller's
//! address space. The driver reads them through [`UserMemory`], which the
//! embedding kernel implements with its copy-from-user primitive.

use tessera_core::{Error, Result};

/// Read access to a client's memory
pub trait UserMemory {
    /// Copy `buf.len()` bytes starting at `addr`
    ///
    /// Fails with `BadAddress` if any byte is not readable.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
}

/// Read a fixed-layout record
pub fn read_record<T: bytemuck::Pod>(user: &dyn UserMemory, addr: u64) -> Result<T> {
    let mut value = T::zeroed();
    user.read(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

/// Read an array of `count` records
pub fn read_array<T: bytemuck::Pod>(user: &dyn UserMemory, addr: u64, count: usize) -> Result<Vec<T>> {
    let mut values = vec![T::zeroed(); count];
    user.read(addr, bytemuck::cast_slice_mut(&mut values))?;
    Ok(values)
}

/// Client memory made of disjoint regions held in host buffers
#[derive(Debug, Default)]
pub struct HostMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl HostMemory {
    /// Empty address space
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bytes` readable at `base`
    pub fn insert(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }

    /// Place a record at `base`
    pub fn insert_record<T: bytemuck::Pod>(&mut self, base: u64, value: &T) {
        self.insert(base, bytemuck::bytes_of(value).to_vec());
    }
}

impl UserMemory for HostMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        let end = addr.checked_add(len).ok_or(Error::BadAddress)?;
        for (base, bytes) in &self.regions {
            let region_end = base + bytes.len() as u64;
            if addr >= *base && end <= region_end {
                let start = (addr - base) as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return Ok(());
            }
        }
        Err(Error::BadAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_inside_region() {
        let mut mem = HostMemory::new();
        mem.insert(0x1000, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        mem.read(0x1001, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn test_read_outside_region() {
        let mut mem = HostMemory::new();
        mem.insert(0x1000, vec![0; 4]);
        let mut buf = [0u8; 4];
        assert_eq!(mem.read(0x1002, &mut buf), Err(Error::BadAddress));
        assert_eq!(mem.read(u64::MAX, &mut buf), Err(Error::BadAddress));
        assert_eq!(mem.read(0, &mut buf), Err(Error::BadAddress));
    }

    #[test]
    fn test_read_array() {
        let mut mem = HostMemory::new();
        let handles: [u32; 3] = [7, 8, 9];
        mem.insert(0x2000, bytemuck::cast_slice(&handles).to_vec());
        assert_eq!(read_array::<u32>(&mem, 0x2000, 3), Ok(vec![7, 8, 9]));
        assert_eq!(read_record::<u32>(&mem, 0x2004), Ok(8));
    }
}
