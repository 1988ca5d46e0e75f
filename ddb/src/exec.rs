//! Command handlers.
//!
//! One function per verb, operating on the debugger state and the
//! suspended target. User-facing output goes straight to stdout; it is
//! the product of these commands, not diagnostics.

use dx32_core::host::Target;
use dx32_core::x86::Reg;
use log::debug;

use crate::bpt::{Access, Slot};
use crate::lang::addr::{Addr, Range};
use crate::lang::{Error as LangError, Keyword, Size};
use crate::{hex, Debugger, Error, Result};

/// Upper bound on a single memory operation, to keep a typo'd range from
/// allocating the world.
const MAX_SPAN: u32 = 0x0010_0000;

fn read_block(tgt: &mut dyn Target, addr: u32, len: u32) -> Result<Vec<u8>> {
    if len > MAX_SPAN {
        return Err(Error::Language(LangError::Range));
    }
    let mut data = vec![0u8; len as usize];
    tgt.read(addr, &mut data)?;
    Ok(data)
}

/// `d[b|w|d]` - display memory.
pub fn dump(
    dbg: &mut Debugger,
    tgt: &mut dyn Target,
    size: Option<Size>,
    range: Option<Range>,
) -> Result<()> {
    // An explicit suffix becomes the new default size.
    if let Some(size) = size {
        dbg.sizes.dump = size;
    }
    let range = range.unwrap_or_else(|| dbg.here(0x10));
    let data = read_block(tgt, range.start.linear, range.len())?;
    println!("{}", hex::dump(range.start.linear, &data, dbg.sizes.dump.bytes()));
    Ok(())
}

/// `e[b|w|d]` - enter memory values.
pub fn enter(
    dbg: &mut Debugger,
    tgt: &mut dyn Target,
    size: Option<Size>,
    addr: Addr,
    values: &[u32],
) -> Result<()> {
    if let Some(size) = size {
        dbg.sizes.enter = size;
    }
    let unit = dbg.sizes.enter.bytes();
    let mut at = addr.linear;
    for &value in values {
        tgt.write(at, &value.to_le_bytes()[..unit])?;
        at = at.wrapping_add(unit as u32);
    }
    // Read back what stuck.
    let data = read_block(tgt, addr.linear, (values.len() * unit) as u32)?;
    println!("{}", hex::dump(addr.linear, &data, unit));
    Ok(())
}

/// `f[b|w|d]` - fill memory with a pattern.
pub fn fill(
    dbg: &mut Debugger,
    tgt: &mut dyn Target,
    size: Option<Size>,
    range: Range,
    pattern: &[u32],
) -> Result<()> {
    if let Some(size) = size {
        dbg.sizes.fill = size;
    }
    let unit = dbg.sizes.fill.bytes();
    if range.len() > MAX_SPAN {
        return Err(Error::Language(LangError::Range));
    }
    let mut at = range.start.linear;
    let mut next = pattern.iter().cycle();
    while at < range.end.linear {
        let value = next.next().copied().unwrap_or(0);
        let take = (unit as u32).min(range.end.linear - at) as usize;
        tgt.write(at, &value.to_le_bytes()[..take])?;
        at = at.wrapping_add(take as u32);
    }
    println!("filled {} bytes at {}", range.len(), range.start);
    Ok(())
}

/// `c` - compare two memory blocks.
pub fn compare(tgt: &mut dyn Target, range: Range, with: Addr) -> Result<()> {
    let left = read_block(tgt, range.start.linear, range.len())?;
    let right = read_block(tgt, with.linear, range.len())?;
    let mut differ = 0u32;
    for (offset, (a, b)) in left.iter().zip(&right).enumerate() {
        if a != b {
            let offset = offset as u32;
            println!(
                "{:08X}  {:02X} {:02X}  {:08X}",
                range.start.linear.wrapping_add(offset),
                a,
                b,
                with.linear.wrapping_add(offset)
            );
            differ += 1;
        }
    }
    if differ == 0 {
        println!("no differences");
    }
    Ok(())
}

/// `s` - search memory for a pattern.
pub fn search(tgt: &mut dyn Target, range: Range, pattern: &[u8]) -> Result<()> {
    let data = read_block(tgt, range.start.linear, range.len())?;
    let mut hits = 0;
    for offset in 0..data.len().saturating_sub(pattern.len() - 1) {
        if &data[offset..offset + pattern.len()] == pattern {
            println!("{:08X}", range.start.linear.wrapping_add(offset as u32));
            hits += 1;
        }
    }
    debug!("search matched {hits} times");
    Ok(())
}

/// `k` - stack trace.
pub fn stack_trace(dbg: &Debugger, tgt: &mut dyn Target) -> Result<()> {
    println!("FramePtr RetAddr");
    let mut fp = dbg.frame.ebp;
    for _ in 0..32 {
        if fp == 0 {
            break;
        }
        let mut raw = [0u8; 8];
        if tgt.read(fp, &mut raw).is_err() {
            break;
        }
        let next = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let ret = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let note = dbg
            .syms
            .annotate(ret)
            .map(|s| format!("  {s}"))
            .unwrap_or_default();
        println!("{fp:08X} {ret:08X}{note}");
        if next <= fp {
            break;
        }
        fp = next;
    }
    Ok(())
}

fn print_slot(dbg: &Debugger, index: usize, slot: &Slot) {
    let mark = if slot.enabled() { '*' } else { ' ' };
    let addr = slot.addr().map(|a| a.to_string()).unwrap_or_default();
    let note = slot
        .addr()
        .and_then(|a| dbg.syms.annotate(a.linear))
        .map(|s| format!("  {s}"))
        .unwrap_or_default();
    match slot {
        Slot::Hard { access, size, dr, .. } => {
            println!("{mark} {index:2}: {addr}  {access}{size} dr{dr}{note}");
        }
        _ => println!("{mark} {index:2}: {addr}{note}"),
    }
}

/// `bp[id]` - set a software breakpoint.
pub fn bp_set(
    dbg: &mut Debugger,
    tgt: &mut dyn Target,
    id: Option<usize>,
    addr: Addr,
) -> Result<()> {
    let index = dbg.bpts.set_soft(tgt, id, addr)?;
    print_slot(dbg, index, dbg.bpts.get(index).ok_or(crate::bpt::Error::NotFound)?);
    Ok(())
}

/// `ba[id]` - set a hardware breakpoint.
pub fn ba_set(
    dbg: &mut Debugger,
    id: Option<usize>,
    access: Access,
    size: u8,
    addr: Addr,
) -> Result<()> {
    let index = dbg.bpts.set_hard(&mut dbg.frame, id, addr, access, size)?;
    print_slot(dbg, index, dbg.bpts.get(index).ok_or(crate::bpt::Error::NotFound)?);
    Ok(())
}

/// `bc` - clear breakpoints.
pub fn bp_clear(dbg: &mut Debugger, tgt: &mut dyn Target, ids: &[usize]) -> Result<()> {
    for &id in ids {
        dbg.bpts.clear(tgt, &mut dbg.frame, id)?;
        println!("breakpoint {id} cleared");
    }
    Ok(())
}

/// `bd` - disable breakpoints.
pub fn bp_disable(dbg: &mut Debugger, tgt: &mut dyn Target, ids: &[usize]) -> Result<()> {
    for &id in ids {
        dbg.bpts.disarm(tgt, &mut dbg.frame, id)?;
        println!("breakpoint {id} disabled");
    }
    Ok(())
}

/// `be` - enable breakpoints.
pub fn bp_enable(dbg: &mut Debugger, tgt: &mut dyn Target, ids: &[usize]) -> Result<()> {
    for &id in ids {
        dbg.bpts.arm(tgt, &mut dbg.frame, id)?;
        println!("breakpoint {id} enabled");
    }
    Ok(())
}

/// `bl` - list breakpoints.
pub fn bp_list(dbg: &Debugger) -> Result<()> {
    let mut any = false;
    for (index, slot) in dbg.bpts.iter() {
        print_slot(dbg, index, slot);
        any = true;
    }
    if !any {
        println!("no breakpoints set");
    }
    Ok(())
}

/// `r` - view or set registers.
pub fn regs(
    dbg: &mut Debugger,
    tgt: &mut dyn Target,
    reg: Option<Reg>,
    value: Option<u32>,
) -> Result<()> {
    match (reg, value) {
        (None, _) => dbg.status(tgt),
        (Some(reg), None) => {
            println!("{reg}={:08X}", dbg.frame.load(reg));
            Ok(())
        }
        (Some(reg), Some(value)) => {
            dbg.frame.store(reg, value);
            println!("{reg}={:08X}", dbg.frame.load(reg));
            Ok(())
        }
    }
}

/// `u` - disassemble.
pub fn unassemble(dbg: &mut Debugger, tgt: &mut dyn Target, range: Option<Range>) -> Result<()> {
    let range = range.unwrap_or_else(|| dbg.here(0x20));
    let data = read_block(tgt, range.start.linear, range.len())?;
    let mut offset = 0usize;
    while offset < data.len() {
        let at = range.start.linear.wrapping_add(offset as u32);
        if let Some(note) = dbg.syms.annotate(at).filter(|n| !n.contains('+')) {
            println!("{note}:");
        }
        let (text, len) = dbg.dis.decode(&data[offset..], at);
        println!("{:04X}:{:08X}    {text}", range.start.selector, range.start.offset as usize + offset);
        offset += len.max(1);
    }
    Ok(())
}

/// `a` - assemble; not wired to an assembler.
pub fn assemble(addr: Option<Addr>) -> Result<()> {
    if let Some(addr) = addr {
        println!("no assembler present for {addr}");
    } else {
        println!("no assembler present");
    }
    Ok(())
}

/// `x` - examine symbols by wildcard.
pub fn examine(dbg: &Debugger, pattern: &str) -> Result<()> {
    let mut any = false;
    for sym in dbg.syms.matches(pattern) {
        println!("{:08X}: {}", sym.addr, sym.name);
        any = true;
    }
    if !any {
        println!("no matching symbols");
    }
    Ok(())
}

/// `lm` - list loaded modules.
pub fn modules(tgt: &mut dyn Target) -> Result<()> {
    for (base, name) in tgt.modules() {
        println!("    {base:08X}: {name}");
    }
    Ok(())
}

/// `ln` - list nearest symbols.
pub fn near(dbg: &Debugger, linear: u32) -> Result<()> {
    let mut any = false;
    if let Some(sym) = dbg.syms.below(linear) {
        println!("{:08X}: {}  (-{:x})", sym.addr, sym.name, linear - sym.addr);
        any = true;
    }
    if let Some(sym) = dbg.syms.above(linear) {
        println!("{:08X}: {}  (+{:x})", sym.addr, sym.name, sym.addr - linear);
        any = true;
    }
    if !any {
        println!("no symbols");
    }
    Ok(())
}

/// `dg` - dump selectors.
pub fn selectors(dbg: &Debugger, tgt: &mut dyn Target, list: &[u16]) -> Result<()> {
    // With no list, show the segment registers.
    let frame = &dbg.frame;
    let list = if list.is_empty() {
        vec![frame.cs, frame.ss, frame.ds, frame.es, frame.fs, frame.gs]
    } else {
        list.to_vec()
    };
    for sel in list {
        match tgt.descriptor(sel) {
            Some(raw) => println!("{sel:04X}  {}", describe(&raw)),
            None => println!("{sel:04X}  NOT PRESENT"),
        }
    }
    Ok(())
}

/// Decodes an 8-byte segment descriptor for display.
fn describe(raw: &[u8; 8]) -> String {
    let base = u32::from(raw[2])
        | u32::from(raw[3]) << 8
        | u32::from(raw[4]) << 16
        | u32::from(raw[7]) << 24;
    let mut limit = u32::from(raw[0]) | u32::from(raw[1]) << 8 | u32::from(raw[6] & 0x0F) << 16;
    if raw[6] & 0x80 != 0 {
        // Page-granular limit.
        limit = limit << 12 | 0xFFF;
    }
    if raw[5] & 0x80 == 0 {
        return "NOT PRESENT".to_string();
    }
    if raw[5] & 0x10 == 0 {
        return "SYSTEM".to_string();
    }
    let kind = if raw[5] & 0x08 != 0 { "CODE" } else { "DATA" };
    let bits = if raw[6] & 0x40 != 0 { 32 } else { 16 };
    let dpl = (raw[5] >> 5) & 3;
    format!("Base={base:08X}  Limit={limit:08X}  {kind}{bits}  Ring{dpl}")
}

/// `didt` - dump interrupt descriptors.
pub fn idt(tgt: &mut dyn Target, list: &[u32]) -> Result<()> {
    let Some(base) = tgt.idt_base() else {
        println!("interrupt descriptor table not available");
        return Ok(());
    };
    let list: Vec<u32> = if list.is_empty() {
        (0..32).collect()
    } else {
        list.to_vec()
    };
    for vector in list {
        let mut raw = [0u8; 8];
        tgt.read(base.wrapping_add(vector * 8), &mut raw)?;
        let offset = u32::from(u16::from_le_bytes([raw[0], raw[1]]))
            | u32::from(u16::from_le_bytes([raw[6], raw[7]])) << 16;
        let selector = u16::from_le_bytes([raw[2], raw[3]]);
        println!("{vector:02X}: {selector:04X}:{offset:08X}");
    }
    Ok(())
}

/// `divt` - dump real-mode interrupt vectors.
pub fn ivt(tgt: &mut dyn Target, list: &[u32]) -> Result<()> {
    let list: Vec<u32> = if list.is_empty() {
        (0..32).collect()
    } else {
        list.to_vec()
    };
    for vector in list {
        let mut raw = [0u8; 4];
        tgt.read(vector * 4, &mut raw)?;
        let offset = u16::from_le_bytes([raw[0], raw[1]]);
        let segment = u16::from_le_bytes([raw[2], raw[3]]);
        println!("{vector:02X}: {segment:04X}:{offset:04X}");
    }
    Ok(())
}

/// `?` with an expression - display its value.
pub fn eval(value: u32) -> Result<()> {
    println!("{value} = {value:08X}");
    Ok(())
}

/// `?` - the help screen.
pub fn help() -> Result<()> {
    for topic in [Keyword::Commands, Keyword::Grammar, Keyword::X86] {
        for line in topic.to_string().lines() {
            println!("{}", line.trim_start());
        }
        println!();
    }
    Ok(())
}
