//! # dx32 Core
//!
//! This library implements the core of the dx32 protected-mode extender:
//! the host abstraction, the Portable Executable reader, the module
//! registry, the image loader, and the export resolver, together with the
//! 80386 context model shared with the debugger.

#![warn(clippy::pedantic)]

pub mod host;
pub mod ldr;
pub mod pe;
pub mod x86;

pub use crate::ldr::{Loader, Registry};
pub use crate::x86::Frame;
