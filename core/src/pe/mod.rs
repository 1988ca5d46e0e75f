//! Portable Executable reader.
//!
//! Byte-exact views over the on-disk i386 PE/COFF format: MZ and NT
//! headers, section table, data directories, import and export tables,
//! base relocations, and COFF symbols. All parsers work on plain byte
//! slices in little-endian order; nothing here touches the host.

use thiserror::Error;

mod coff;
mod export;
mod header;
mod import;
mod reloc;
mod section;

pub use self::coff::{Symbol, SymbolName, CLASS_EXTERNAL, CLASS_STATIC, SYMBOL_SIZE};
pub use self::export::ExportDirectory;
pub use self::header::{DosHeader, FileHeader, NtHeaders, OptionalHeader};
pub use self::import::{ImportDescriptor, ORDINAL_FLAG};
pub use self::reloc::{split_entry, RelocBlock, REL_ABSOLUTE, REL_HIGHLOW};
pub use self::section::{SectionHeader, SEC_UNINITIALIZED};

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// MZ header magic, `"MZ"`.
pub const DOS_MAGIC: u16 = 0x5A4D;

/// NT signature, `"PE\0\0"`.
pub const NT_SIGNATURE: u32 = 0x0000_4550;

/// File-header machine value for the Intel 80386.
pub const MACHINE_I386: u16 = 0x014C;

/// Optional-header magic for PE32 images.
pub const PE32_MAGIC: u16 = 0x010B;

/// File characteristics: relocation info stripped from the file.
pub const FILE_RELOCS_STRIPPED: u16 = 0x0001;

/// File characteristics: the image is executable.
pub const FILE_EXECUTABLE: u16 = 0x0002;

/// File characteristics: the image is a dynamic-link library.
pub const FILE_DLL: u16 = 0x2000;

/// Number of entries in the optional header's data directory.
pub const DATA_DIRECTORIES: usize = 16;

/// Data directory indices used by the loader.
pub mod dir {
    /// Export table.
    pub const EXPORT: usize = 0;
    /// Import table.
    pub const IMPORT: usize = 1;
    /// Base relocation table.
    pub const BASERELOC: usize = 5;
}

/// One data-directory entry: an RVA and a byte count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDir {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDir {
    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            virtual_address: read_u32(data, offset)?,
            size: read_u32(data, offset + 4)?,
        })
    }

    /// Whether the directory is absent from the image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A structural defect found while reading an image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The data ends before the structure does.
    #[error("truncated image data")]
    Truncated,
    /// Bad MZ magic.
    #[error("bad MZ magic {0:#06x}")]
    DosMagic(u16),
    /// Bad NT signature.
    #[error("bad PE signature {0:#010x}")]
    Signature(u32),
    /// The image targets a machine other than the 80386.
    #[error("unsupported machine {0:#06x}")]
    Machine(u16),
    /// The optional header is not PE32.
    #[error("unsupported optional header magic {0:#06x}")]
    OptionalMagic(u16),
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset).copied().ok_or(Error::Truncated)
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data.get(offset..offset + 2).ok_or(Error::Truncated)?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data.get(offset..offset + 4).ok_or(Error::Truncated)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}
