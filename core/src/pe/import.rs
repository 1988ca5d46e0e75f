//! Import table entries.

use super::{read_u32, Result};

/// Thunk flag: the low 31 bits are an export ordinal, not a hint-name RVA.
pub const ORDINAL_FLAG: u32 = 0x8000_0000;

/// One import descriptor; the table is terminated by a zeroed entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportDescriptor {
    /// RVA of the hint (original first thunk) table.
    pub original_first_thunk: u32,
    /// RVA of the NUL-terminated module name.
    pub name: u32,
    /// RVA of the import address table to be patched.
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// On-disk size of one descriptor.
    pub const SIZE: usize = 20;

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            original_first_thunk: read_u32(data, offset)?,
            name: read_u32(data, offset + 12)?,
            first_thunk: read_u32(data, offset + 16)?,
        })
    }

    /// Whether this is the terminating descriptor.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.original_first_thunk == 0
    }
}
