//! COFF symbol ingestion.
//!
//! Streams the symbol table out of an image file so the debugger can
//! populate its symbol table. Symbols are read record by record; long
//! names resolve through the string table with a hard length bound.

use log::debug;

use super::{read_into, Error, Result};
use crate::host::{File, Host, Whence};
use crate::pe::{self, DosHeader, NtHeaders, Symbol, SymbolName};

/// Longest symbol name accepted from the string table.
const NAME_LIMIT: usize = 256;

/// Visits every debugger-relevant COFF symbol in `path`.
///
/// The visitor receives the symbol's address (image base plus value) and
/// its name. Images without a symbol table visit nothing.
///
/// # Errors
///
/// Fails if the file cannot be opened or a record cannot be read.
pub fn symbols<H: Host>(
    host: &mut H,
    path: &str,
    base: u32,
    visit: &mut dyn FnMut(u32, &str),
) -> Result<()> {
    let file = host.open(path)?;
    let result = walk(host, file, base, visit);
    host.close(file);
    result
}

fn walk<H: Host>(
    host: &mut H,
    file: File,
    base: u32,
    visit: &mut dyn FnMut(u32, &str),
) -> Result<()> {
    // Re-read the headers to find the symbol table.
    let mut raw = [0u8; DosHeader::SIZE];
    if read_into(host, file, &mut raw)? < raw.len() {
        return Err(Error::Format);
    }
    let dos = DosHeader::try_from(raw.as_slice()).map_err(|_| Error::Format)?;
    if host.seek(file, Whence::Set(dos.e_lfanew))? != dos.e_lfanew {
        return Err(Error::Format);
    }
    let mut raw = [0u8; NtHeaders::SIZE];
    if read_into(host, file, &mut raw)? < raw.len() {
        return Err(Error::Format);
    }
    let nt = NtHeaders::try_from(raw.as_slice()).map_err(|_| Error::Format)?;

    let table = nt.file.pointer_to_symbol_table;
    let count = nt.file.number_of_symbols;
    if table == 0 || count == 0 {
        debug!("no symbols in image");
        return Ok(());
    }
    let strings = table.wrapping_add(count.wrapping_mul(pe::SYMBOL_SIZE as u32));

    let mut index = 0;
    while index < count {
        let offset = table.wrapping_add(index * pe::SYMBOL_SIZE as u32);
        if host.seek(file, Whence::Set(offset))? != offset {
            return Err(Error::Io);
        }
        let mut raw = [0u8; pe::SYMBOL_SIZE];
        if read_into(host, file, &mut raw)? < raw.len() {
            return Err(Error::Io);
        }
        let symbol = Symbol::parse(&raw, 0).map_err(|_| Error::Format)?;
        // Auxiliary records follow their parent and are not symbols.
        index += 1 + u32::from(symbol.number_of_aux_symbols);

        if !symbol.interesting() || symbol.section_number <= 0 {
            continue;
        }
        let name = match symbol.name {
            SymbolName::Short(name) => name,
            SymbolName::Long(offset) => read_string(host, file, strings.wrapping_add(offset))?,
        };
        visit(base.wrapping_add(symbol.value), &name);
    }

    Ok(())
}

/// Reads a NUL-terminated string from the file, bounded to [`NAME_LIMIT`].
fn read_string<H: Host>(host: &mut H, file: File, offset: u32) -> Result<String> {
    if host.seek(file, Whence::Set(offset))? != offset {
        return Err(Error::Io);
    }
    let mut raw = [0u8; NAME_LIMIT];
    let got = read_into(host, file, &mut raw)?;
    let end = raw[..got].iter().position(|&b| b == 0).unwrap_or(got);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}
