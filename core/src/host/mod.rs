//! Host abstraction.
//!
//! The loader and the debugger never talk to DOS, DPMI, or the BIOS
//! directly; they consume the small synchronous interfaces defined here.
//! The DOS port implements them as thin interrupt thunks, while native
//! builds and the test suites use the [`flat`] reference host.

use thiserror::Error;

use crate::x86::Frame;

mod mem;

pub mod flat;

pub use self::mem::{Alloc, MemTable};

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An opaque handle to an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct File(pub u32);

/// File seek origin.
#[derive(Clone, Copy, Debug)]
pub enum Whence {
    /// Absolute offset from the start of the file.
    Set(u32),
    /// Relative to the current position.
    Cur(i32),
    /// Relative to the end of the file.
    End(i32),
}

/// Reason a module entry point is being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// A DLL is attaching to the process.
    Attach,
    /// A DLL is detaching from the process.
    Detach,
    /// An EXE's main entry point.
    Main,
}

/// Services the loader requires from the operating environment.
///
/// Memory handed out by [`alloc`](Host::alloc) is addressed by linear
/// address; the translation back to whatever handle the environment wants
/// for [`free`](Host::free) is the host's problem (see [`MemTable`]).
pub trait Host {
    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no file exists at `path`, or
    /// [`Error::Io`] for any other failure.
    fn open(&mut self, path: &str) -> Result<File>;

    /// Reads up to `buf.len()` bytes, returning the count actually read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the read fails outright.
    fn read(&mut self, file: File, buf: &mut [u8]) -> Result<usize>;

    /// Repositions the file pointer, returning the new absolute offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the seek fails.
    fn seek(&mut self, file: File, whence: Whence) -> Result<u32>;

    /// Closes an open file.
    fn close(&mut self, file: File);

    /// Allocates a zero-filled block of target memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] when the environment cannot satisfy the
    /// request.
    fn alloc(&mut self, len: u32) -> Result<u32>;

    /// Resizes a block, returning its (possibly moved) linear address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Memory`] when `addr` is not an allocated block or
    /// the environment cannot grow it.
    fn resize(&mut self, addr: u32, len: u32) -> Result<u32>;

    /// Releases a block by the linear address it was allocated at.
    fn free(&mut self, addr: u32);

    /// Reads target memory at a linear address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if any byte of the range is unmapped.
    fn read_mem(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes target memory at a linear address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if any byte of the range is unmapped.
    fn write_mem(&mut self, addr: u32, buf: &[u8]) -> Result<()>;

    /// Transfers control to freshly loaded target code.
    ///
    /// For [`Entry::Attach`] and [`Entry::Detach`] the callee receives the
    /// module base as its argument; the return value is the entry point's
    /// EAX.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if `entry` is not callable.
    fn call_entry(&mut self, entry: u32, module: u32, reason: Entry) -> Result<u32>;
}

/// How a suspended target should be resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Run until the next event.
    Go,
    /// Execute a single instruction.
    Step,
}

/// An exception event delivered by the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Event {
    /// Exception vector number.
    pub vector: u8,
    /// Error code pushed by the processor, if any.
    pub error_code: u32,
    /// Side-channel datum; the faulting linear address for page faults.
    pub aux: u32,
}

/// Services the debugger requires from the environment hosting the target.
///
/// The target is suspended for the whole time the debugger holds control;
/// implementations may assume no concurrent mutation of target state
/// between [`wait`](Target::wait) returning and [`resume`](Target::resume)
/// being called.
pub trait Target {
    /// Reads target memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] for unmapped ranges.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes target memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] for unmapped ranges.
    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<()>;

    /// Returns the target thread's current context.
    fn context(&self) -> Frame;

    /// Replaces the target thread's context.
    fn set_context(&mut self, frame: &Frame);

    /// Marks how the target should continue once the debugger returns.
    fn resume(&mut self, mode: Resume);

    /// Blocks until the target raises the next event.
    ///
    /// Returns `None` once the target has exited.
    fn wait(&mut self) -> Option<Event>;

    /// Enumerates loaded modules as `(base, name)` pairs in load order.
    fn modules(&self) -> Vec<(u32, String)>;

    /// Reads the raw 8-byte descriptor for a selector.
    ///
    /// Hosts without descriptor-table access return `None`.
    fn descriptor(&self, _selector: u16) -> Option<[u8; 8]> {
        None
    }

    /// Returns the linear base of the interrupt descriptor table.
    ///
    /// Hosts without descriptor-table access return `None`.
    fn idt_base(&self) -> Option<u32> {
        None
    }
}

/// An error reported by the host environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The named file does not exist.
    #[error("file not found")]
    NotFound,
    /// A file operation failed.
    #[error("i/o error")]
    Io,
    /// The environment is out of memory.
    #[error("insufficient memory")]
    Memory,
    /// A target memory access touched an unmapped address.
    #[error("bad address {0:#010x}")]
    Fault(u32),
}
