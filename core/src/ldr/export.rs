//! Export resolution.
//!
//! Walks a loaded module's export directory through target memory and
//! returns the address of an export selected by name or by ordinal.

use std::fmt::Display;

use log::warn;

use super::{mem_cstr, mem_u16, mem_u32};
use crate::host::{self, Host};
use crate::pe::{self, ExportDirectory, FileHeader};

/// An export selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Export {
    /// Select by symbol name.
    Name(String),
    /// Select by export ordinal.
    Ordinal(u16),
}

impl Display for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// Resolves an export from the module loaded at `base`.
///
/// Returns `None` when the module has no export directory, the selector
/// matches nothing, or the match is a forwarded export (out of scope).
///
/// # Errors
///
/// Fails only if target memory cannot be read.
pub fn lookup<H: Host + ?Sized>(
    host: &H,
    base: u32,
    want: &Export,
) -> host::Result<Option<u32>> {
    // Locate the export data directory from the in-memory headers.
    let lfanew = mem_u32(host, base.wrapping_add(0x3C))?;
    let dir_addr = base
        .wrapping_add(lfanew)
        .wrapping_add(4 + FileHeader::SIZE as u32)
        .wrapping_add(96)
        .wrapping_add((pe::dir::EXPORT * 8) as u32);
    let dir_va = mem_u32(host, dir_addr)?;
    let dir_size = mem_u32(host, dir_addr.wrapping_add(4))?;
    // No export directory, nothing to find.
    if dir_size == 0 {
        return Ok(None);
    }

    let mut raw = [0u8; ExportDirectory::SIZE];
    host.read_mem(base.wrapping_add(dir_va), &mut raw)?;
    let Ok(dir) = ExportDirectory::parse(&raw, 0) else {
        return Ok(None);
    };

    let functions = base.wrapping_add(dir.address_of_functions);
    let names = base.wrapping_add(dir.address_of_names);
    let ordinals = base.wrapping_add(dir.address_of_name_ordinals);

    for index in 0..dir.number_of_names {
        let ordinal = mem_u16(host, ordinals.wrapping_add(index * 2))?;
        let fn_rva = mem_u32(host, functions.wrapping_add(u32::from(ordinal) * 4))?;

        let hit = match want {
            Export::Name(name) => {
                let name_rva = mem_u32(host, names.wrapping_add(index * 4))?;
                *name == mem_cstr(host, base.wrapping_add(name_rva))?
            }
            Export::Ordinal(number) => u32::from(*number) == u32::from(ordinal) + 1,
        };
        if !hit {
            continue;
        }

        // A function address inside the export directory is a forwarder
        // string, which this loader does not chase.
        if fn_rva >= dir_va && fn_rva < dir_va.wrapping_add(dir_size) {
            warn!("export {want} is forwarded");
            return Ok(None);
        }
        return Ok(Some(base.wrapping_add(fn_rva)));
    }

    Ok(None)
}
