//! Section table entries.

use super::{read_u32, Error, Result};

/// Section characteristics: contains uninitialized data; no bytes exist in
/// the file for this section.
pub const SEC_UNINITIALIZED: u32 = 0x0000_0080;

/// One entry in the section table.
#[derive(Clone, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// On-disk size of one section header.
    pub const SIZE: usize = 40;

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let name: [u8; 8] = data
            .get(offset..offset + 8)
            .ok_or(Error::Truncated)?
            .try_into()
            .unwrap();
        Ok(Self {
            name,
            virtual_size: read_u32(data, offset + 8)?,
            virtual_address: read_u32(data, offset + 12)?,
            size_of_raw_data: read_u32(data, offset + 16)?,
            pointer_to_raw_data: read_u32(data, offset + 20)?,
            characteristics: read_u32(data, offset + 36)?,
        })
    }

    /// The section name with trailing NULs removed.
    #[must_use]
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Whether the section holds uninitialized (BSS-like) data and has no
    /// bytes in the file.
    #[must_use]
    pub fn uninitialized(&self) -> bool {
        self.characteristics & SEC_UNINITIALIZED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_parses() {
        let mut data = vec![0u8; SectionHeader::SIZE];
        data[..5].copy_from_slice(b".text");
        data[12..16].copy_from_slice(&0x1000u32.to_le_bytes());
        data[16..20].copy_from_slice(&0x200u32.to_le_bytes());
        data[20..24].copy_from_slice(&0x400u32.to_le_bytes());
        data[36..40].copy_from_slice(&0x6000_0020u32.to_le_bytes());
        let sec = SectionHeader::parse(&data, 0).unwrap();
        assert_eq!(sec.name(), ".text");
        assert_eq!(sec.virtual_address, 0x1000);
        assert_eq!(sec.size_of_raw_data, 0x200);
        assert_eq!(sec.pointer_to_raw_data, 0x400);
        assert!(!sec.uninitialized());
    }

    #[test]
    fn bss_is_uninitialized() {
        let mut data = vec![0u8; SectionHeader::SIZE];
        data[36..40].copy_from_slice(&0xC000_0080u32.to_le_bytes());
        assert!(SectionHeader::parse(&data, 0).unwrap().uninitialized());
    }
}
