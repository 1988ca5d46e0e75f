//! Image loader.
//!
//! Brings PE images into target memory: reads and validates headers,
//! copies sections, applies base relocations, resolves imports against the
//! module registry (recursively loading dependencies), and invokes entry
//! points with attach/detach semantics.

use log::{debug, warn};
use thiserror::Error;

use crate::host::{self, Entry, File, Host, Whence};
use crate::pe::{
    self, DosHeader, NtHeaders, RelocBlock, SectionHeader, FILE_DLL, FILE_RELOCS_STRIPPED,
    ORDINAL_FLAG, REL_ABSOLUTE, REL_HIGHLOW,
};

mod export;
mod registry;
mod symbol;

pub use self::export::{lookup, Export};
pub use self::registry::{trim, Module, Registry};
pub use self::symbol::symbols;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Longest name string the loader will read out of an image.
const NAME_LIMIT: usize = 256;

/// A successful load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Load {
    /// Runtime base address of the module.
    pub base: u32,
    /// Whether this call brought the module in (as opposed to bumping the
    /// reference count of an already-loaded one).
    pub fresh: bool,
}

/// The image loader and its module registry.
#[derive(Debug, Default)]
pub struct Loader {
    modules: Registry,
}

impl Loader {
    /// Constructs a loader with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The module registry.
    #[must_use]
    pub fn modules(&self) -> &Registry {
        &self.modules
    }

    /// Returns the base address of a loaded module by name.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<u32> {
        self.modules.find(name).map(|module| module.base)
    }

    /// Returns the filename of the module loaded at `base`.
    #[must_use]
    pub fn file_name(&self, base: u32) -> Option<&str> {
        self.modules
            .find_by_base(base)
            .map(|module| module.name.as_str())
    }

    /// Loads a module and everything it imports.
    ///
    /// If the module is already loaded its reference count is bumped and
    /// its existing base returned.
    ///
    /// # Errors
    ///
    /// Returns the first failure encountered; all resources acquired on
    /// the way are released before the error propagates.
    pub fn load<H: Host>(&mut self, host: &mut H, name: &str) -> Result<Load> {
        // Check if it's already loaded.
        if let Some(module) = self.modules.find_mut(name) {
            module.refs += 1;
            return Ok(Load {
                base: module.base,
                fresh: false,
            });
        }
        debug!("loading module `{name}`");

        // Open the file and validate the headers.
        let (file, nt, sections) = open_image(host, name)?;

        // Allocate the image buffer.
        let base = match host.alloc(nt.optional.size_of_image) {
            Ok(base) => base,
            Err(err) => {
                host.close(file);
                return Err(err.into());
            }
        };
        debug!("image `{name}` placed at {base:#010x}");

        // Copy headers and section contents into the buffer.
        if let Err(err) = write_image(host, file, base, &nt, &sections) {
            host.close(file);
            host.free(base);
            return Err(err);
        }
        host.close(file);

        // Apply relocations if the image didn't land on its preferred base.
        let delta = base.wrapping_sub(nt.optional.image_base);
        if delta != 0 {
            if nt.file.has(FILE_RELOCS_STRIPPED) {
                host.free(base);
                return Err(Error::Relocs);
            }
            if let Err(err) = apply_relocs(host, base, &nt, delta) {
                host.free(base);
                return Err(err);
            }
        }

        // Register before resolving imports so the module is visible to
        // cyclic import chains.
        if self.modules.add(name, base).is_err() {
            host.free(base);
            return Err(Error::Memory);
        }

        // Resolve imports, loading dependencies as needed.
        if let Err(err) = self.resolve_imports(host, base, &nt) {
            self.modules.remove(base);
            host.free(base);
            return Err(err);
        }

        // Let a DLL attach; an entry point returning zero unloads it.
        if nt.file.has(FILE_DLL) {
            let entry = base.wrapping_add(nt.optional.address_of_entry_point);
            let attached = match host.call_entry(entry, base, Entry::Attach) {
                Ok(value) => value != 0,
                Err(_) => false,
            };
            if !attached {
                self.modules.remove(base);
                host.free(base);
                return Err(Error::Entry);
            }
        }

        Ok(Load { base, fresh: true })
    }

    /// Releases a reference to the module at `base`.
    ///
    /// When the last reference goes, a DLL's entry point is invoked with
    /// the detach reason and the image buffer is released. Returns whether
    /// the module was found.
    pub fn free<H: Host>(&mut self, host: &mut H, base: u32) -> bool {
        let Some(module) = self.modules.find_by_base(base) else {
            return false;
        };
        let name = module.name.clone();
        let Some(module) = self.modules.find_mut(&name) else {
            return false;
        };
        module.refs -= 1;
        if module.refs > 0 {
            return true;
        }
        debug!("unloading module `{name}`");
        // Only DLLs get a detach call.
        if let Ok((nt, dll)) = image_header(host, base) {
            if dll {
                let entry = base.wrapping_add(nt.optional.address_of_entry_point);
                if host.call_entry(entry, base, Entry::Detach).is_err() {
                    warn!("detach entry of `{name}` faulted");
                }
            }
        }
        self.modules.remove(base);
        host.free(base);
        true
    }

    /// Loads an EXE and runs it, returning the program's exit value.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotExecutable`] for DLL images, or with
    /// whatever [`load`](Self::load) reported.
    pub fn launch<H: Host>(&mut self, host: &mut H, name: &str) -> Result<u32> {
        let load = self.load(host, name)?;
        let (nt, dll) = image_header(host, load.base)?;
        if dll {
            return Err(Error::NotExecutable);
        }
        let entry = load.base.wrapping_add(nt.optional.address_of_entry_point);
        Ok(host.call_entry(entry, load.base, Entry::Main)?)
    }

    /// Patches the import address table, loading dependencies recursively.
    fn resolve_imports<H: Host>(&mut self, host: &mut H, base: u32, nt: &NtHeaders) -> Result<()> {
        let dir = nt.optional.data_directory[pe::dir::IMPORT];
        // No imports, nothing to do.
        if dir.is_empty() {
            return Ok(());
        }

        let mut desc_addr = base.wrapping_add(dir.virtual_address);
        loop {
            let mut raw = [0u8; pe::ImportDescriptor::SIZE];
            host.read_mem(desc_addr, &mut raw)?;
            let desc = pe::ImportDescriptor::parse(&raw, 0).map_err(|_| Error::Format)?;
            if desc.is_null() {
                break;
            }

            // Load the imported module.
            let dep_name = mem_cstr(host, base.wrapping_add(desc.name))?;
            let dep = match self.load(host, &dep_name) {
                Ok(load) => load.base,
                Err(err) => {
                    warn!("dependency `{dep_name}` failed: {err}");
                    return Err(Error::Dependency(dep_name));
                }
            };

            // Walk the hint table and patch each import address slot.
            let mut hint = base.wrapping_add(desc.original_first_thunk);
            let mut iat = base.wrapping_add(desc.first_thunk);
            loop {
                let thunk = mem_u32(host, hint)?;
                if thunk == 0 {
                    break;
                }
                let want = if thunk & ORDINAL_FLAG != 0 {
                    Export::Ordinal((thunk & !ORDINAL_FLAG) as u16)
                } else {
                    // Skip the 16-bit hint to reach the name.
                    Export::Name(mem_cstr(host, base.wrapping_add(thunk).wrapping_add(2))?)
                };
                let Some(addr) = export::lookup(host, dep, &want)? else {
                    warn!("import `{want}` not found in `{dep_name}`");
                    return Err(Error::Import(want.to_string()));
                };
                host.write_mem(iat, &addr.to_le_bytes())?;
                hint = hint.wrapping_add(4);
                iat = iat.wrapping_add(4);
            }

            desc_addr = desc_addr.wrapping_add(pe::ImportDescriptor::SIZE as u32);
        }

        Ok(())
    }
}

/// Opens an image file and validates its headers.
///
/// On success the file is left open with its position unspecified; on
/// failure it is closed.
fn open_image<H: Host>(
    host: &mut H,
    name: &str,
) -> Result<(File, NtHeaders, Vec<SectionHeader>)> {
    let file = host.open(name)?;

    match read_headers(host, file) {
        Ok(parts) => Ok((file, parts.0, parts.1)),
        Err(err) => {
            host.close(file);
            Err(err)
        }
    }
}

/// Reads and parses the MZ header, NT headers, and section table.
fn read_headers<H: Host>(host: &mut H, file: File) -> Result<(NtHeaders, Vec<SectionHeader>)> {
    // Read in the DOS MZ EXE header.
    let mut raw = [0u8; DosHeader::SIZE];
    if read_into(host, file, &mut raw)? < raw.len() {
        return Err(Error::Format);
    }
    let dos = DosHeader::try_from(raw.as_slice()).map_err(|_| Error::Format)?;

    // Seek to and read the NT headers.
    if host.seek(file, Whence::Set(dos.e_lfanew))? != dos.e_lfanew {
        return Err(Error::Format);
    }
    let mut raw = [0u8; NtHeaders::SIZE];
    if read_into(host, file, &mut raw)? < raw.len() {
        return Err(Error::Format);
    }
    let nt = NtHeaders::try_from(raw.as_slice()).map_err(|err| match err {
        pe::Error::Machine(_) => Error::Machine,
        _ => Error::Format,
    })?;

    // Read the section table, which follows the optional header.
    let offset = dos.e_lfanew.wrapping_add(nt.sections_offset() as u32);
    if host.seek(file, Whence::Set(offset))? != offset {
        return Err(Error::Format);
    }
    let count = nt.file.number_of_sections as usize;
    let mut raw = vec![0u8; count * SectionHeader::SIZE];
    if read_into(host, file, &mut raw)? < raw.len() {
        return Err(Error::Format);
    }
    let sections = (0..count)
        .map(|index| SectionHeader::parse(&raw, index * SectionHeader::SIZE))
        .collect::<pe::Result<Vec<_>>>()
        .map_err(|_| Error::Format)?;

    Ok((nt, sections))
}

/// Copies the headers and every initialized section into the image buffer.
fn write_image<H: Host>(
    host: &mut H,
    file: File,
    base: u32,
    nt: &NtHeaders,
    sections: &[SectionHeader],
) -> Result<()> {
    // Headers first, from the start of the file.
    if host.seek(file, Whence::Set(0))? != 0 {
        return Err(Error::Io);
    }
    let mut headers = vec![0u8; nt.optional.size_of_headers as usize];
    if read_into(host, file, &mut headers)? < headers.len() {
        return Err(Error::Io);
    }
    host.write_mem(base, &headers)?;

    // Then each section's raw data.
    for section in sections {
        if section.uninitialized() {
            continue;
        }
        let offset = section.pointer_to_raw_data;
        if host.seek(file, Whence::Set(offset))? != offset {
            return Err(Error::Io);
        }
        let mut data = vec![0u8; section.size_of_raw_data as usize];
        if read_into(host, file, &mut data)? < data.len() {
            return Err(Error::Io);
        }
        host.write_mem(base.wrapping_add(section.virtual_address), &data)?;
    }

    Ok(())
}

/// Walks the base-relocation table, adding `delta` at every HIGHLOW site.
fn apply_relocs<H: Host>(host: &mut H, base: u32, nt: &NtHeaders, delta: u32) -> Result<()> {
    let dir = nt.optional.data_directory[pe::dir::BASERELOC];
    // Fail if there's no relocation table at all.
    if dir.is_empty() {
        return Err(Error::Relocs);
    }

    let mut addr = base.wrapping_add(dir.virtual_address);
    let mut walked = 0;
    while walked < dir.size {
        let mut raw = [0u8; RelocBlock::SIZE];
        host.read_mem(addr, &mut raw)?;
        let block = RelocBlock::parse(&raw, 0).map_err(|_| Error::Format)?;
        if block.virtual_address == 0 {
            break;
        }
        if block.size_of_block < RelocBlock::SIZE as u32 {
            return Err(Error::Format);
        }

        let page = base.wrapping_add(block.virtual_address);
        for index in 0..block.entries() {
            let entry_addr = addr
                .wrapping_add(RelocBlock::SIZE as u32)
                .wrapping_add(index * 2);
            let entry = mem_u16(host, entry_addr)?;
            let (kind, offset) = pe::split_entry(entry);
            match kind {
                REL_ABSOLUTE => (),
                REL_HIGHLOW => {
                    let site = page.wrapping_add(offset);
                    let value = mem_u32(host, site)?;
                    host.write_mem(site, &value.wrapping_add(delta).to_le_bytes())?;
                }
                kind => return Err(Error::RelocType(kind)),
            }
        }

        addr = addr.wrapping_add(block.size_of_block);
        walked += block.size_of_block;
    }

    Ok(())
}

/// Re-reads the NT headers of a loaded image from target memory.
///
/// Returns the headers and whether the image is a DLL.
///
/// # Errors
///
/// Fails if the memory at `base` does not hold a mapped image.
pub fn image_header<H: Host>(host: &H, base: u32) -> Result<(NtHeaders, bool)> {
    let lfanew = mem_u32(host, base.wrapping_add(0x3C))?;
    let mut raw = [0u8; NtHeaders::SIZE];
    host.read_mem(base.wrapping_add(lfanew), &mut raw)?;
    let nt = NtHeaders::try_from(raw.as_slice()).map_err(|_| Error::Format)?;
    let dll = nt.file.has(FILE_DLL);
    Ok((nt, dll))
}

/// Reads until the buffer is full or the file runs out.
fn read_into<H: Host>(host: &mut H, file: File, buf: &mut [u8]) -> host::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let count = host.read(file, &mut buf[total..])?;
        if count == 0 {
            break;
        }
        total += count;
    }
    Ok(total)
}

pub(crate) fn mem_u16<H: Host + ?Sized>(host: &H, addr: u32) -> host::Result<u16> {
    let mut raw = [0u8; 2];
    host.read_mem(addr, &mut raw)?;
    Ok(u16::from_le_bytes(raw))
}

pub(crate) fn mem_u32<H: Host + ?Sized>(host: &H, addr: u32) -> host::Result<u32> {
    let mut raw = [0u8; 4];
    host.read_mem(addr, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

/// Reads a NUL-terminated string out of target memory, bounded to
/// [`NAME_LIMIT`] bytes.
pub(crate) fn mem_cstr<H: Host + ?Sized>(host: &H, addr: u32) -> host::Result<String> {
    let mut name = Vec::new();
    for index in 0..NAME_LIMIT as u32 {
        let mut byte = [0u8; 1];
        host.read_mem(addr.wrapping_add(index), &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        name.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// An error produced while loading an image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The file could not be found.
    #[error("the file could not be found")]
    Missing,
    /// An I/O error prevented reading the file.
    #[error("an i/o error occurred while reading the image")]
    Io,
    /// The file is not a valid i386 PE image.
    #[error("the file is not a valid executable")]
    Format,
    /// The image targets a machine other than the current one.
    #[error("the image is valid, but for a machine type other than the current machine")]
    Machine,
    /// The environment is out of memory.
    #[error("there was insufficient memory to load the image")]
    Memory,
    /// The image must be relocated but its relocations are stripped.
    #[error("valid relocations were not found in the image")]
    Relocs,
    /// The relocation table holds an unsupported entry type.
    #[error("an unsupported relocation of type {0} was found in the image")]
    RelocType(u8),
    /// The module's entry point reported failure.
    #[error("the module failed to initialize")]
    Entry,
    /// An imported module could not be loaded.
    #[error("the module {0} could not be found")]
    Dependency(String),
    /// An imported entry point could not be resolved.
    #[error("the procedure entry point {0} could not be located")]
    Import(String),
    /// The image is a DLL and cannot be launched.
    #[error("the image is not executable")]
    NotExecutable,
}

impl From<host::Error> for Error {
    fn from(err: host::Error) -> Self {
        match err {
            host::Error::NotFound => Self::Missing,
            host::Error::Memory => Self::Memory,
            host::Error::Io | host::Error::Fault(_) => Self::Io,
        }
    }
}
