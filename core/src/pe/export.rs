//! Export directory.

use super::{read_u32, Result};

/// The export directory table.
#[derive(Clone, Copy, Debug)]
pub struct ExportDirectory {
    /// First ordinal exported by the module.
    pub ordinal_base: u32,
    /// Number of entries in the address table.
    pub number_of_functions: u32,
    /// Number of entries in the name and name-ordinal tables.
    pub number_of_names: u32,
    /// RVA of the export address table.
    pub address_of_functions: u32,
    /// RVA of the name-pointer table.
    pub address_of_names: u32,
    /// RVA of the ordinal table paralleling the names.
    pub address_of_name_ordinals: u32,
}

impl ExportDirectory {
    /// On-disk size of the directory table.
    pub const SIZE: usize = 40;

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            ordinal_base: read_u32(data, offset + 16)?,
            number_of_functions: read_u32(data, offset + 20)?,
            number_of_names: read_u32(data, offset + 24)?,
            address_of_functions: read_u32(data, offset + 28)?,
            address_of_names: read_u32(data, offset + 32)?,
            address_of_name_ordinals: read_u32(data, offset + 36)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_parses() {
        let mut data = vec![0u8; ExportDirectory::SIZE];
        data[16..20].copy_from_slice(&1u32.to_le_bytes());
        data[20..24].copy_from_slice(&3u32.to_le_bytes());
        data[24..28].copy_from_slice(&3u32.to_le_bytes());
        data[28..32].copy_from_slice(&0x3000u32.to_le_bytes());
        data[32..36].copy_from_slice(&0x3010u32.to_le_bytes());
        data[36..40].copy_from_slice(&0x3020u32.to_le_bytes());
        let dir = ExportDirectory::parse(&data, 0).unwrap();
        assert_eq!(dir.ordinal_base, 1);
        assert_eq!(dir.number_of_names, 3);
        assert_eq!(dir.address_of_functions, 0x3000);
    }
}
