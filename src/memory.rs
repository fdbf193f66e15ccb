//! Registered memory regions exposed for remote access
//!
//! A node registers a buffer for exactly one transfer, hands the resulting
//! [`MemoryRegionDescriptor`] to its peer, and deregisters it once the peer
//! has committed or acknowledged. Addresses are handed out by a bump
//! allocator over a virtual address space so stale descriptors never alias a
//! live region.

use crate::error::{KvError, Result};
use crate::protocol::MemoryRegionDescriptor;
use bytes::Bytes;
use std::collections::HashMap;

/// Configuration for a region table
#[derive(Clone, Debug)]
pub struct RegionTableConfig {
    /// First address handed out
    pub base_addr: u64,
    /// Alignment of region addresses (default: 4096 for page alignment)
    pub alignment: u64,
    /// Mixed into remote keys so keys from different nodes differ
    pub key_seed: u64,
}

impl Default for RegionTableConfig {
    fn default() -> Self {
        Self {
            base_addr: 0x1000_0000,
            alignment: 4096,
            key_seed: 0x9e37_79b9_7f4a_7c15,
        }
    }
}

struct Region {
    buffer: Vec<u8>,
    rkey: u64,
}

/// Live registered regions of one node, keyed by base address
pub struct RegionTable {
    config: RegionTableConfig,
    next_addr: u64,
    regions: HashMap<u64, Region>,
}

impl RegionTable {
    pub fn new(config: RegionTableConfig) -> Self {
        Self {
            next_addr: config.base_addr,
            config,
            regions: HashMap::new(),
        }
    }

    fn allocate_addr(&mut self, len: usize) -> u64 {
        let align = self.config.alignment.max(1);
        let addr = self.next_addr.div_ceil(align) * align;
        // never reuse an address, even for empty regions
        self.next_addr = addr + (len as u64).max(1);
        addr
    }

    /// Register a zeroed buffer of `len` bytes (the target of a remote write).
    pub fn register(&mut self, len: usize) -> MemoryRegionDescriptor {
        self.register_with(vec![0u8; len])
    }

    /// Register `data` as the source of a remote read.
    pub fn register_with(&mut self, data: Vec<u8>) -> MemoryRegionDescriptor {
        let addr = self.allocate_addr(data.len());
        let rkey = addr.rotate_left(17) ^ self.config.key_seed;
        let length = data.len() as u64;
        self.regions.insert(addr, Region { buffer: data, rkey });
        MemoryRegionDescriptor::new(addr, length, &rkey.to_be_bytes())
    }

    fn region(&self, addr: u64, rkey: u64) -> Result<&Region> {
        let region = self
            .regions
            .get(&addr)
            .ok_or_else(|| KvError::transport(format!("no region registered at {:#x}", addr)))?;
        if region.rkey != rkey {
            return Err(KvError::transport(format!("remote key mismatch for {:#x}", addr)));
        }
        Ok(region)
    }

    fn region_mut(&mut self, addr: u64, rkey: u64) -> Result<&mut Region> {
        let region = self
            .regions
            .get_mut(&addr)
            .ok_or_else(|| KvError::transport(format!("no region registered at {:#x}", addr)))?;
        if region.rkey != rkey {
            return Err(KvError::transport(format!("remote key mismatch for {:#x}", addr)));
        }
        Ok(region)
    }

    pub fn write(&mut self, addr: u64, rkey: u64, data: &[u8]) -> Result<()> {
        let region = self.region_mut(addr, rkey)?;
        if data.len() > region.buffer.len() {
            return Err(KvError::transport(format!(
                "write of {} bytes exceeds region of {} bytes",
                data.len(),
                region.buffer.len()
            )));
        }
        region.buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, addr: u64, rkey: u64, len: usize) -> Result<Bytes> {
        let region = self.region(addr, rkey)?;
        if len > region.buffer.len() {
            return Err(KvError::transport(format!(
                "read of {} bytes exceeds region of {} bytes",
                len,
                region.buffer.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&region.buffer[..len]))
    }

    /// Drop a region and return its contents.
    pub fn deregister(&mut self, addr: u64) -> Option<Vec<u8>> {
        self.regions.remove(&addr).map(|r| r.buffer)
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            regions: self.regions.len(),
            bytes: self.regions.values().map(|r| r.buffer.len()).sum(),
        }
    }
}

/// Region table statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionStats {
    pub regions: usize,
    pub bytes: usize,
}

/// Extract the 8-byte remote key packed into a descriptor.
pub fn unpack_rkey(desc: &MemoryRegionDescriptor) -> Result<u64> {
    let raw: [u8; 8] = desc
        .rkey
        .as_slice()
        .try_into()
        .map_err(|_| KvError::transport(format!("packed rkey has {} bytes", desc.rkey.len())))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alignment() {
        let mut table = RegionTable::new(RegionTableConfig {
            base_addr: 0,
            alignment: 64,
            key_seed: 7,
        });

        let a = table.register(100);
        assert_eq!(a.ptr, 0);
        assert_eq!(a.length, 100);

        let b = table.register(0);
        assert_eq!(b.ptr, 128);
        let c = table.register(1);
        assert!(c.ptr > b.ptr);
        assert_eq!(c.ptr % 64, 0);
    }

    #[test]
    fn test_region_write_read() {
        let mut table = RegionTable::new(RegionTableConfig::default());
        let desc = table.register(16);
        let rkey = unpack_rkey(&desc).unwrap();

        table.write(desc.ptr, rkey, b"Hello, RDMA!").unwrap();
        assert_eq!(&table.read(desc.ptr, rkey, 12).unwrap()[..], b"Hello, RDMA!");

        assert!(table.write(desc.ptr, rkey, &[0u8; 17]).is_err());
        assert!(table.read(desc.ptr, rkey ^ 1, 4).is_err());
        assert_eq!(table.stats(), RegionStats { regions: 1, bytes: 16 });

        let contents = table.deregister(desc.ptr).unwrap();
        assert_eq!(&contents[..12], b"Hello, RDMA!");
        assert!(table.read(desc.ptr, rkey, 1).is_err());
    }
}
