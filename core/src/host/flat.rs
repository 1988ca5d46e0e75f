//! Flat reference host.
//!
//! Backs native builds and the test suites: files come from an in-memory
//! table with a filesystem fallback, target memory is a set of allocated
//! segments behind a bump pointer, and entry-point invocations are
//! recorded rather than executed (native builds have no 32-bit DOS target
//! to jump into).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;

use log::{debug, warn};

use super::{Entry, Error, Event, File, Host, Result, Resume, Target, Whence};
use crate::x86::Frame;

/// Default linear address of the first allocation.
const BASE: u32 = 0x0040_0000;

/// Allocation granularity.
const ALIGN: u32 = 0x1000;

/// An open file: backing bytes plus a cursor.
#[derive(Debug)]
struct Cursor {
    data: Vec<u8>,
    pos: u32,
}

/// Host implementation over process memory.
#[derive(Debug)]
pub struct FlatHost {
    /// Named in-memory files, consulted before the filesystem.
    images: HashMap<String, Vec<u8>>,
    /// Open-file table; `None` slots are closed handles.
    files: Vec<Option<Cursor>>,
    /// Allocated segments keyed by base address.
    segments: BTreeMap<u32, Vec<u8>>,
    /// Next allocation base.
    next: u32,
    /// Scripted entry-point results, keyed by entry address.
    results: HashMap<u32, u32>,
    /// Record of every entry-point invocation.
    pub calls: Vec<(u32, u32, Entry)>,
}

impl Default for FlatHost {
    fn default() -> Self {
        Self::with_base(BASE)
    }
}

impl FlatHost {
    /// Constructs a host whose first allocation lands at `base`.
    #[must_use]
    pub fn with_base(base: u32) -> Self {
        Self {
            images: HashMap::new(),
            files: Vec::new(),
            segments: BTreeMap::new(),
            next: base,
            results: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// Registers an in-memory file, shadowing the filesystem.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.images.insert(name.to_string(), data);
    }

    /// Scripts the value an entry point at `entry` will return.
    ///
    /// Unscripted entry points return 1.
    pub fn script_entry(&mut self, entry: u32, result: u32) {
        self.results.insert(entry, result);
    }

    /// Returns the allocated segment containing `addr`, if any.
    fn segment(&self, addr: u32) -> Option<(u32, &Vec<u8>)> {
        let (&base, seg) = self.segments.range(..=addr).next_back()?;
        let len = u32::try_from(seg.len()).ok()?;
        (addr < base.checked_add(len)?).then_some((base, seg))
    }

    fn cursor(&mut self, file: File) -> Result<&mut Cursor> {
        self.files
            .get_mut(file.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::Io)
    }
}

impl Host for FlatHost {
    fn open(&mut self, path: &str) -> Result<File> {
        let data = match self.images.get(path) {
            Some(data) => data.clone(),
            None => fs::read(path).map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound,
                _ => Error::Io,
            })?,
        };
        let handle = File(u32::try_from(self.files.len()).map_err(|_| Error::Io)?);
        self.files.push(Some(Cursor { data, pos: 0 }));
        Ok(handle)
    }

    fn read(&mut self, file: File, buf: &mut [u8]) -> Result<usize> {
        let cursor = self.cursor(file)?;
        let pos = cursor.pos as usize;
        let avail = cursor.data.len().saturating_sub(pos);
        let count = avail.min(buf.len());
        buf[..count].copy_from_slice(&cursor.data[pos..pos + count]);
        cursor.pos += u32::try_from(count).map_err(|_| Error::Io)?;
        Ok(count)
    }

    fn seek(&mut self, file: File, whence: Whence) -> Result<u32> {
        let cursor = self.cursor(file)?;
        let len = u32::try_from(cursor.data.len()).map_err(|_| Error::Io)?;
        let pos = match whence {
            Whence::Set(off) => Some(off),
            Whence::Cur(off) => cursor.pos.checked_add_signed(off),
            Whence::End(off) => len.checked_add_signed(off),
        }
        .ok_or(Error::Io)?;
        cursor.pos = pos;
        Ok(pos)
    }

    fn close(&mut self, file: File) {
        if let Some(slot) = self.files.get_mut(file.0 as usize) {
            *slot = None;
        }
    }

    fn alloc(&mut self, len: u32) -> Result<u32> {
        let base = self.next;
        let span = len.max(1).checked_next_multiple_of(ALIGN).ok_or(Error::Memory)?;
        // Leave a guard page between segments.
        self.next = base
            .checked_add(span)
            .and_then(|end| end.checked_add(ALIGN))
            .ok_or(Error::Memory)?;
        self.segments.insert(base, vec![0; len as usize]);
        debug!("alloc {len:#x} bytes at {base:#010x}");
        Ok(base)
    }

    fn resize(&mut self, addr: u32, len: u32) -> Result<u32> {
        let old = self.segments.remove(&addr).ok_or(Error::Memory)?;
        let moved = self.alloc(len)?;
        let keep = old.len().min(len as usize);
        if let Some(seg) = self.segments.get_mut(&moved) {
            seg[..keep].copy_from_slice(&old[..keep]);
        }
        Ok(moved)
    }

    fn free(&mut self, addr: u32) {
        if self.segments.remove(&addr).is_none() {
            warn!("free of unallocated address {addr:#010x}");
        }
    }

    fn read_mem(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let (base, seg) = self.segment(addr).ok_or(Error::Fault(addr))?;
        let off = (addr - base) as usize;
        let end = off.checked_add(buf.len()).ok_or(Error::Fault(addr))?;
        if end > seg.len() {
            return Err(Error::Fault(addr));
        }
        buf.copy_from_slice(&seg[off..end]);
        Ok(())
    }

    fn write_mem(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let (base, _) = self.segment(addr).ok_or(Error::Fault(addr))?;
        let off = (addr - base) as usize;
        let seg = self.segments.get_mut(&base).ok_or(Error::Fault(addr))?;
        let end = off.checked_add(buf.len()).ok_or(Error::Fault(addr))?;
        if end > seg.len() {
            return Err(Error::Fault(addr));
        }
        seg[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn call_entry(&mut self, entry: u32, module: u32, reason: Entry) -> Result<u32> {
        self.calls.push((entry, module, reason));
        Ok(self.results.get(&entry).copied().unwrap_or(1))
    }
}

/// Scripted debug target over flat memory.
///
/// Used by the debugger's test suite and by the native front end to drive
/// the command loop against a fabricated exception context.
#[derive(Debug, Default)]
pub struct FlatTarget {
    /// Target memory segments keyed by base address.
    segments: BTreeMap<u32, Vec<u8>>,
    /// Current thread context.
    pub frame: Frame,
    /// Loaded-module list reported to the debugger.
    pub modules: Vec<(u32, String)>,
    /// Pending scripted events.
    events: VecDeque<Event>,
    /// Resume modes recorded from the debugger, newest last.
    pub resumed: Vec<Resume>,
}

impl FlatTarget {
    /// Constructs an empty target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zero-filled segment at `base`.
    pub fn map(&mut self, base: u32, len: u32) {
        self.segments.insert(base, vec![0; len as usize]);
    }

    /// Queues an event for the debugger to observe.
    pub fn raise(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn locate(&self, addr: u32) -> Option<(u32, usize)> {
        let (&base, seg) = self.segments.range(..=addr).next_back()?;
        let off = (addr - base) as usize;
        (off < seg.len()).then_some((base, off))
    }
}

impl Target for FlatTarget {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let (base, off) = self.locate(addr).ok_or(Error::Fault(addr))?;
        let seg = &self.segments[&base];
        let end = off.checked_add(buf.len()).ok_or(Error::Fault(addr))?;
        if end > seg.len() {
            return Err(Error::Fault(addr));
        }
        buf.copy_from_slice(&seg[off..end]);
        Ok(())
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let (base, off) = self.locate(addr).ok_or(Error::Fault(addr))?;
        let seg = self.segments.get_mut(&base).ok_or(Error::Fault(addr))?;
        let end = off.checked_add(buf.len()).ok_or(Error::Fault(addr))?;
        if end > seg.len() {
            return Err(Error::Fault(addr));
        }
        seg[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn context(&self) -> Frame {
        self.frame.clone()
    }

    fn set_context(&mut self, frame: &Frame) {
        self.frame = frame.clone();
    }

    fn resume(&mut self, mode: Resume) {
        self.resumed.push(mode);
    }

    fn wait(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn modules(&self) -> Vec<(u32, String)> {
        self.modules.clone()
    }
}
