//! Address-to-handle translation for handle-based allocators.
//!
//! DPMI-style environments allocate, resize, and free memory by opaque
//! handle, but the loader wants to speak linear addresses exclusively.
//! [`MemTable`] keeps the side table that translates one to the other.

use log::warn;

use super::{Error, Result};

/// A raw handle-based allocator, as the DPMI host exposes one.
pub trait Alloc {
    /// Opaque block handle.
    type Handle: Copy + PartialEq + std::fmt::Debug;

    /// Allocates a block, returning its linear address and handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] when the request cannot be satisfied.
    fn alloc(&mut self, len: u32) -> Result<(u32, Self::Handle)>;

    /// Resizes a block, returning its (possibly moved) address and handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] when the request cannot be satisfied.
    fn resize(&mut self, handle: Self::Handle, len: u32) -> Result<(u32, Self::Handle)>;

    /// Releases a block.
    fn free(&mut self, handle: Self::Handle);
}

/// Translation table pairing each handed-out linear address with the
/// handle the underlying allocator wants back.
#[derive(Debug, Default)]
pub struct MemTable<A: Alloc> {
    alloc: A,
    table: Vec<(u32, A::Handle)>,
}

impl<A: Alloc> MemTable<A> {
    /// Constructs a new `MemTable` over a raw allocator.
    pub fn new(alloc: A) -> Self {
        Self {
            alloc,
            table: Vec::new(),
        }
    }

    /// Allocates a block, returning its linear address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] when the underlying allocator fails.
    pub fn alloc(&mut self, len: u32) -> Result<u32> {
        let (addr, handle) = self.alloc.alloc(len)?;
        self.table.push((addr, handle));
        Ok(addr)
    }

    /// Resizes the block at `addr`, returning its new linear address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] if `addr` was never handed out or the
    /// underlying allocator fails.
    pub fn resize(&mut self, addr: u32, len: u32) -> Result<u32> {
        let entry = self
            .table
            .iter_mut()
            .find(|(ptr, _)| *ptr == addr)
            .ok_or(Error::Memory)?;
        let (moved, handle) = self.alloc.resize(entry.1, len)?;
        *entry = (moved, handle);
        Ok(moved)
    }

    /// Releases the block at `addr`.
    ///
    /// Freeing an address that was never handed out is ignored.
    pub fn free(&mut self, addr: u32) {
        let Some(index) = self.table.iter().position(|(ptr, _)| *ptr == addr) else {
            warn!("free of untracked address {addr:#010x}");
            return;
        };
        let (_, handle) = self.table.swap_remove(index);
        self.alloc.free(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bump allocator with live-handle accounting.
    #[derive(Debug, Default)]
    struct Bump {
        next: u32,
        live: Vec<u32>,
    }

    impl Alloc for Bump {
        type Handle = u32;

        fn alloc(&mut self, len: u32) -> Result<(u32, u32)> {
            self.next += 0x1000;
            let addr = self.next;
            self.next += len;
            self.live.push(addr);
            Ok((addr, addr))
        }

        fn resize(&mut self, handle: u32, len: u32) -> Result<(u32, u32)> {
            self.free(handle);
            self.alloc(len)
        }

        fn free(&mut self, handle: u32) {
            self.live.retain(|&h| h != handle);
        }
    }

    #[test]
    fn free_by_address_releases_handle() {
        let mut mem = MemTable::new(Bump::default());
        let a = mem.alloc(0x100).unwrap();
        let b = mem.alloc(0x100).unwrap();
        assert_ne!(a, b);
        mem.free(a);
        assert_eq!(mem.alloc.live, vec![b]);
    }

    #[test]
    fn resize_retargets_translation() {
        let mut mem = MemTable::new(Bump::default());
        let a = mem.alloc(0x100).unwrap();
        let b = mem.resize(a, 0x200).unwrap();
        // The old address is gone from the table; the new one frees fine.
        mem.free(b);
        assert!(mem.alloc.live.is_empty());
    }
}
