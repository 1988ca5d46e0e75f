//! Synthetic PE images for loader tests.
//!
//! Builds minimal but structurally valid i386 PE32 files in memory:
//! headers, a section table, and optional import, export, and relocation
//! tables laid out the way a real linker would.

use dx32_core::pe;

/// File alignment of section raw data.
const FILE_ALIGN: u32 = 0x200;

/// Section (virtual) alignment.
const SECT_ALIGN: u32 = 0x1000;

/// An import request against one dependency.
#[derive(Clone, Debug)]
pub enum Want {
    Name(&'static str),
    Ordinal(u16),
}

/// One section to be emitted.
#[derive(Clone, Debug)]
struct Section {
    name: &'static str,
    virtual_address: u32,
    data: Vec<u8>,
    characteristics: u32,
}

/// Builder for synthetic PE32 images.
#[derive(Clone, Debug)]
pub struct Image {
    image_base: u32,
    entry: u32,
    characteristics: u16,
    sections: Vec<Section>,
    import_dir: Option<(u32, u32)>,
    export_dir: Option<(u32, u32)>,
    reloc_dir: Option<(u32, u32)>,
    /// RVAs of the IAT slots laid out by [`imports`](Self::imports), in
    /// declaration order.
    pub iat: Vec<u32>,
}

impl Image {
    /// Starts an executable image preferring `image_base`.
    pub fn exe(image_base: u32) -> Self {
        Self {
            image_base,
            entry: 0,
            characteristics: pe::FILE_EXECUTABLE,
            sections: Vec::new(),
            import_dir: None,
            export_dir: None,
            reloc_dir: None,
            iat: Vec::new(),
        }
    }

    /// Starts a DLL image preferring `image_base`.
    pub fn dll(image_base: u32) -> Self {
        let mut image = Self::exe(image_base);
        image.characteristics |= pe::FILE_DLL;
        image
    }

    /// Marks the image's relocations as stripped.
    pub fn stripped(mut self) -> Self {
        self.characteristics |= pe::FILE_RELOCS_STRIPPED;
        self
    }

    /// Sets the entry point RVA.
    pub fn entry(mut self, rva: u32) -> Self {
        self.entry = rva;
        self
    }

    /// Adds a raw code/data section at `rva`.
    pub fn section(mut self, name: &'static str, rva: u32, data: Vec<u8>) -> Self {
        self.sections.push(Section {
            name,
            virtual_address: rva,
            data,
            characteristics: 0x6000_0020,
        });
        self
    }

    /// Adds an uninitialized (BSS-like) section; no file bytes.
    pub fn bss(mut self, name: &'static str, rva: u32, size: u32) -> Self {
        self.sections.push(Section {
            name,
            virtual_address: rva,
            data: vec![0; size as usize],
            characteristics: 0xC000_0000 | pe::SEC_UNINITIALIZED,
        });
        self
    }

    /// Adds an export section at `rva` exporting `entries` as
    /// `(name, fn_rva)` with the given ordinal base.
    pub fn exports(mut self, rva: u32, ordinal_base: u32, entries: &[(&str, u32)]) -> Self {
        let n = entries.len() as u32;
        let functions = rva + pe::ExportDirectory::SIZE as u32;
        let names = functions + n * 4;
        let ordinals = names + n * 4;
        let mut strings = ordinals + n * 2;

        let mut data = vec![0u8; pe::ExportDirectory::SIZE];
        data[16..20].copy_from_slice(&ordinal_base.to_le_bytes());
        data[20..24].copy_from_slice(&n.to_le_bytes());
        data[24..28].copy_from_slice(&n.to_le_bytes());
        data[28..32].copy_from_slice(&functions.to_le_bytes());
        data[32..36].copy_from_slice(&names.to_le_bytes());
        data[36..40].copy_from_slice(&ordinals.to_le_bytes());

        let mut name_rvas = Vec::new();
        let mut string_pool = Vec::new();
        for (name, _) in entries {
            name_rvas.push(strings);
            string_pool.extend_from_slice(name.as_bytes());
            string_pool.push(0);
            strings += name.len() as u32 + 1;
        }
        // Address table, name table, ordinal table, then the string pool.
        for (_, fn_rva) in entries {
            data.extend_from_slice(&fn_rva.to_le_bytes());
        }
        for name_rva in &name_rvas {
            data.extend_from_slice(&name_rva.to_le_bytes());
        }
        for index in 0..entries.len() as u16 {
            data.extend_from_slice(&index.to_le_bytes());
        }
        data.extend_from_slice(&string_pool);

        let size = data.len() as u32;
        self.export_dir = Some((rva, size));
        self.sections.push(Section {
            name: ".edata",
            virtual_address: rva,
            data,
            characteristics: 0x4000_0040,
        });
        self
    }

    /// Adds an import section at `rva` importing `deps` as
    /// `(dll_name, wants)`. IAT slot RVAs are recorded in [`Self::iat`].
    pub fn imports(mut self, rva: u32, deps: &[(&'static str, Vec<Want>)]) -> Self {
        let desc_bytes = (deps.len() as u32 + 1) * pe::ImportDescriptor::SIZE as u32;
        let mut descriptors = Vec::new();
        let mut tail = Vec::new();
        let tail_base = rva + desc_bytes;

        for (dll, wants) in deps {
            // Hint-name entries first, so thunks can point at them.
            let mut hint_rvas = Vec::new();
            for want in wants {
                if let Want::Name(name) = want {
                    hint_rvas.push(Some(tail_base + tail.len() as u32));
                    tail.extend_from_slice(&[0, 0]); // hint
                    tail.extend_from_slice(name.as_bytes());
                    tail.push(0);
                } else {
                    hint_rvas.push(None);
                }
            }
            // DLL name string.
            let name_rva = tail_base + tail.len() as u32;
            tail.extend_from_slice(dll.as_bytes());
            tail.push(0);
            // Align the thunk tables.
            while (tail_base + tail.len() as u32) % 4 != 0 {
                tail.push(0);
            }
            // Original-first-thunk (hint) table.
            let oft_rva = tail_base + tail.len() as u32;
            for (want, hint_rva) in wants.iter().zip(&hint_rvas) {
                let value = match want {
                    Want::Ordinal(ordinal) => pe::ORDINAL_FLAG | u32::from(*ordinal),
                    Want::Name(_) => hint_rva.unwrap(),
                };
                tail.extend_from_slice(&value.to_le_bytes());
            }
            tail.extend_from_slice(&0u32.to_le_bytes());
            // Import address table, initially a copy of the hint table.
            let iat_rva = tail_base + tail.len() as u32;
            for (want, hint_rva) in wants.iter().zip(&hint_rvas) {
                let value = match want {
                    Want::Ordinal(ordinal) => pe::ORDINAL_FLAG | u32::from(*ordinal),
                    Want::Name(_) => hint_rva.unwrap(),
                };
                tail.extend_from_slice(&value.to_le_bytes());
            }
            tail.extend_from_slice(&0u32.to_le_bytes());
            for index in 0..wants.len() as u32 {
                self.iat.push(iat_rva + index * 4);
            }

            let mut desc = [0u8; 20];
            desc[0..4].copy_from_slice(&oft_rva.to_le_bytes());
            desc[12..16].copy_from_slice(&name_rva.to_le_bytes());
            desc[16..20].copy_from_slice(&iat_rva.to_le_bytes());
            descriptors.extend_from_slice(&desc);
        }
        descriptors.extend_from_slice(&[0u8; 20]); // terminator

        let mut data = descriptors;
        data.extend_from_slice(&tail);
        let size = data.len() as u32;
        self.import_dir = Some((rva, size));
        self.sections.push(Section {
            name: ".idata",
            virtual_address: rva,
            data,
            characteristics: 0xC000_0040,
        });
        self
    }

    /// Adds a relocation section at `rva` holding `blocks` of
    /// `(page_rva, entries)` where each entry is `(type, page_offset)`.
    pub fn relocs(mut self, rva: u32, blocks: &[(u32, Vec<(u8, u16)>)]) -> Self {
        let mut data = Vec::new();
        for (page, entries) in blocks {
            let mut words: Vec<u16> = entries
                .iter()
                .map(|(kind, offset)| (u16::from(*kind) << 12) | (offset & 0x0FFF))
                .collect();
            // Pad to keep blocks word-aligned the way linkers do.
            if words.len() % 2 != 0 {
                words.push(0);
            }
            let size = 8 + words.len() as u32 * 2;
            data.extend_from_slice(&page.to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());
            for word in words {
                data.extend_from_slice(&word.to_le_bytes());
            }
        }
        // Terminating empty block.
        data.extend_from_slice(&[0u8; 8]);

        let size = data.len() as u32;
        self.reloc_dir = Some((rva, size));
        self.sections.push(Section {
            name: ".reloc",
            virtual_address: rva,
            data,
            characteristics: 0x4200_0040,
        });
        self
    }

    /// Serializes the image to file bytes.
    pub fn build(&self) -> Vec<u8> {
        let lfanew: u32 = 0x80;
        let headers_size: u32 = 0x400; // padded well past the section table

        // Assign file offsets to initialized sections.
        let mut offsets = Vec::new();
        let mut cursor = headers_size;
        for section in &self.sections {
            if section.characteristics & pe::SEC_UNINITIALIZED != 0 {
                offsets.push(0);
            } else {
                offsets.push(cursor);
                let len = section.data.len() as u32;
                cursor += len.next_multiple_of(FILE_ALIGN);
            }
        }

        let size_of_image = self
            .sections
            .iter()
            .map(|s| s.virtual_address + (s.data.len() as u32).max(1))
            .max()
            .unwrap_or(SECT_ALIGN)
            .next_multiple_of(SECT_ALIGN);

        let mut file = vec![0u8; cursor as usize];

        // MZ header.
        file[0] = 0x4D;
        file[1] = 0x5A;
        file[0x3C..0x40].copy_from_slice(&lfanew.to_le_bytes());

        // NT headers.
        let nt = lfanew as usize;
        file[nt..nt + 4].copy_from_slice(&pe::NT_SIGNATURE.to_le_bytes());
        let fh = nt + 4;
        file[fh..fh + 2].copy_from_slice(&pe::MACHINE_I386.to_le_bytes());
        file[fh + 2..fh + 4].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
        file[fh + 16..fh + 18].copy_from_slice(&224u16.to_le_bytes());
        file[fh + 18..fh + 20].copy_from_slice(&self.characteristics.to_le_bytes());
        let oh = fh + 20;
        file[oh..oh + 2].copy_from_slice(&pe::PE32_MAGIC.to_le_bytes());
        file[oh + 16..oh + 20].copy_from_slice(&self.entry.to_le_bytes());
        file[oh + 28..oh + 32].copy_from_slice(&self.image_base.to_le_bytes());
        file[oh + 56..oh + 60].copy_from_slice(&size_of_image.to_le_bytes());
        file[oh + 60..oh + 64].copy_from_slice(&headers_size.to_le_bytes());
        let dirs = oh + 96;
        for (index, dir) in [
            (pe::dir::EXPORT, self.export_dir),
            (pe::dir::IMPORT, self.import_dir),
            (pe::dir::BASERELOC, self.reloc_dir),
        ] {
            if let Some((rva, size)) = dir {
                let at = dirs + index * 8;
                file[at..at + 4].copy_from_slice(&rva.to_le_bytes());
                file[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
            }
        }

        // Section table.
        let mut at = oh + 224;
        for (section, offset) in self.sections.iter().zip(&offsets) {
            let name = section.name.as_bytes();
            file[at..at + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            let virtual_size = section.data.len() as u32;
            file[at + 8..at + 12].copy_from_slice(&virtual_size.to_le_bytes());
            file[at + 12..at + 16].copy_from_slice(&section.virtual_address.to_le_bytes());
            let raw = if section.characteristics & pe::SEC_UNINITIALIZED != 0 {
                0
            } else {
                virtual_size
            };
            file[at + 16..at + 20].copy_from_slice(&raw.to_le_bytes());
            file[at + 20..at + 24].copy_from_slice(&offset.to_le_bytes());
            file[at + 36..at + 40].copy_from_slice(&section.characteristics.to_le_bytes());
            at += 40;
        }

        // Section raw data.
        for (section, offset) in self.sections.iter().zip(&offsets) {
            if section.characteristics & pe::SEC_UNINITIALIZED != 0 {
                continue;
            }
            let start = *offset as usize;
            file[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        file
    }
}
