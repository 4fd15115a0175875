//! Memory access to the target process.
//!
//! All access goes through the [`ProcessMemory`] trait so that the hook,
//! scan, and capture layers can run against the mock in tests. No aliasing
//! assumptions are made across the process boundary: every read and write
//! is an explicit "N bytes at address" operation.

use crate::error::{Error, Result};
use crate::process::RemotePtr;

/// OS page-protection flags, carried opaquely so callers can restore a
/// site's original protection after patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProtection(pub u32);

impl PageProtection {
    /// PAGE_EXECUTE_READWRITE on Windows.
    pub const EXECUTE_READWRITE: PageProtection = PageProtection(0x40);
}

/// Read/write access to a foreign address space plus the allocation
/// primitives the stub pages need.
pub trait ProcessMemory: Send + Sync {
    /// Base address of the target's main module.
    fn base_address(&self) -> RemotePtr;

    /// Size of the main module image in bytes.
    fn module_size(&self) -> usize;

    fn pid(&self) -> u32;

    fn read_bytes(&self, addr: RemotePtr, len: usize) -> Result<Vec<u8>>;

    fn write_bytes(&self, addr: RemotePtr, bytes: &[u8]) -> Result<()>;

    /// Allocate one executable page within a 32-bit signed displacement of
    /// `near`, so a 5-byte relative jump at `near` can reach it.
    fn alloc_near(&self, near: RemotePtr, size: usize) -> Result<RemotePtr>;

    /// Release a page returned by [`ProcessMemory::alloc_near`].
    fn free(&self, addr: RemotePtr) -> Result<()>;

    /// Change protection on `len` bytes at `addr`, returning the previous
    /// protection so it can be restored.
    fn protect(&self, addr: RemotePtr, len: usize, prot: PageProtection)
        -> Result<PageProtection>;

    fn read_u32(&self, addr: RemotePtr) -> Result<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes(fixed(addr, &bytes)?))
    }

    fn read_i32(&self, addr: RemotePtr) -> Result<i32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(i32::from_le_bytes(fixed(addr, &bytes)?))
    }

    fn read_f32(&self, addr: RemotePtr) -> Result<f32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(f32::from_le_bytes(fixed(addr, &bytes)?))
    }

    fn read_u64(&self, addr: RemotePtr) -> Result<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        Ok(u64::from_le_bytes(fixed(addr, &bytes)?))
    }

    /// Read an 8-byte pointer out of the target.
    fn read_ptr(&self, addr: RemotePtr) -> Result<RemotePtr> {
        Ok(RemotePtr::new(self.read_u64(addr)?))
    }
}

fn fixed<const N: usize>(addr: RemotePtr, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::MemoryReadFailed {
            address: addr,
            message: format!("short read: {} of {} bytes", bytes.len(), N),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::MockProcessBuilder;

    #[test]
    fn test_typed_reads() {
        let mem = MockProcessBuilder::new(0x1000)
            .image(vec![0u8; 0x100])
            .build();
        let base = mem.base_address();

        mem.write_bytes(base, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        mem.write_bytes(base.offset(8), &1.5f32.to_le_bytes())
            .unwrap();
        mem.write_bytes(base.offset(16), &0x1_4000_0000u64.to_le_bytes())
            .unwrap();

        assert_eq!(mem.read_u32(base).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.read_f32(base.offset(8)).unwrap(), 1.5);
        assert_eq!(
            mem.read_ptr(base.offset(16)).unwrap(),
            RemotePtr::new(0x1_4000_0000)
        );
    }

    #[test]
    fn test_unmapped_read_fails() {
        let mem = MockProcessBuilder::new(0x1000)
            .image(vec![0u8; 0x10])
            .build();
        assert!(mem.read_u32(RemotePtr::new(0xDEAD_0000)).is_err());
    }
}
