//! MZ and NT image headers.

use super::{
    read_u16, read_u32, DataDir, Error, Result, DATA_DIRECTORIES, DOS_MAGIC, MACHINE_I386,
    NT_SIGNATURE, PE32_MAGIC,
};

/// DOS MZ header; only the magic and the NT header offset matter here.
#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

impl DosHeader {
    /// On-disk size of the header.
    pub const SIZE: usize = 0x40;

    /// Byte offset of the `e_lfanew` field.
    const LFANEW: usize = 0x3C;
}

impl TryFrom<&[u8]> for DosHeader {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        let e_magic = read_u16(data, 0)?;
        if e_magic != DOS_MAGIC {
            return Err(Error::DosMagic(e_magic));
        }
        Ok(Self {
            e_magic,
            e_lfanew: read_u32(data, Self::LFANEW)?,
        })
    }
}

/// COFF file header.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl FileHeader {
    /// On-disk size of the header.
    pub const SIZE: usize = 20;

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            machine: read_u16(data, offset)?,
            number_of_sections: read_u16(data, offset + 2)?,
            pointer_to_symbol_table: read_u32(data, offset + 8)?,
            number_of_symbols: read_u32(data, offset + 12)?,
            size_of_optional_header: read_u16(data, offset + 16)?,
            characteristics: read_u16(data, offset + 18)?,
        })
    }

    /// Whether a characteristics bit is set.
    #[must_use]
    pub fn has(&self, bit: u16) -> bool {
        self.characteristics & bit != 0
    }
}

/// PE32 optional header; only the fields the loader consumes.
#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub data_directory: [DataDir; DATA_DIRECTORIES],
}

impl OptionalHeader {
    /// On-disk size of the PE32 optional header.
    pub const SIZE: usize = 224;

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let magic = read_u16(data, offset)?;
        if magic != PE32_MAGIC {
            return Err(Error::OptionalMagic(magic));
        }
        let mut data_directory = [DataDir::default(); DATA_DIRECTORIES];
        for (index, entry) in data_directory.iter_mut().enumerate() {
            *entry = DataDir::parse(data, offset + 96 + index * 8)?;
        }
        Ok(Self {
            magic,
            address_of_entry_point: read_u32(data, offset + 16)?,
            image_base: read_u32(data, offset + 28)?,
            size_of_image: read_u32(data, offset + 56)?,
            size_of_headers: read_u32(data, offset + 60)?,
            data_directory,
        })
    }
}

/// The NT headers: signature, file header, optional header.
#[derive(Clone, Copy, Debug)]
pub struct NtHeaders {
    pub signature: u32,
    pub file: FileHeader,
    pub optional: OptionalHeader,
}

impl NtHeaders {
    /// On-disk size of the NT headers for a PE32 image.
    pub const SIZE: usize = 4 + FileHeader::SIZE + OptionalHeader::SIZE;

    /// Byte offset of the section table, relative to the NT headers.
    #[must_use]
    pub fn sections_offset(&self) -> usize {
        4 + FileHeader::SIZE + self.file.size_of_optional_header as usize
    }
}

impl TryFrom<&[u8]> for NtHeaders {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        let signature = read_u32(data, 0)?;
        if signature != NT_SIGNATURE {
            return Err(Error::Signature(signature));
        }
        let file = FileHeader::parse(data, 4)?;
        if file.machine != MACHINE_I386 {
            return Err(Error::Machine(file.machine));
        }
        let optional = OptionalHeader::parse(data, 4 + FileHeader::SIZE)?;
        Ok(Self {
            signature,
            file,
            optional,
        })
    }
}
