//! Debug target over the flat native host.
//!
//! Native builds have no real 32-bit DOS target to run, so this target
//! exposes the loader's address space and a fabricated thread context to
//! the debugger. Resuming drains the scripted event queue; a resumed
//! "run" with no further events ends the session.

use std::collections::VecDeque;

use dx32_core::host::flat::FlatHost;
use dx32_core::host::{Event, Host, Resume, Result, Target};
use dx32_core::x86::Frame;
use log::info;

/// The stand-in target for native sessions.
#[derive(Debug)]
pub struct Session {
    /// The host owning the loaded address space.
    pub host: FlatHost,
    /// Fabricated thread context.
    pub frame: Frame,
    /// Loaded modules, mirrored from the loader registry.
    pub modules: Vec<(u32, String)>,
    /// Pending events.
    pub events: VecDeque<Event>,
}

impl Session {
    /// Wraps a host whose address space holds the loaded image.
    #[must_use]
    pub fn new(host: FlatHost) -> Self {
        Self {
            host,
            frame: Frame::default(),
            modules: Vec::new(),
            events: VecDeque::new(),
        }
    }
}

impl Target for Session {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.host.read_mem(addr, buf)
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        self.host.write_mem(addr, buf)
    }

    fn context(&self) -> Frame {
        self.frame.clone()
    }

    fn set_context(&mut self, frame: &Frame) {
        self.frame = frame.clone();
    }

    fn resume(&mut self, mode: Resume) {
        // Nothing executes for real on a native host.
        info!("target resumed ({mode:?}); no native execution");
    }

    fn wait(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn modules(&self) -> Vec<(u32, String)> {
        self.modules.clone()
    }
}
