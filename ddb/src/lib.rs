//! # DDB
//!
//! Symbolic debugger core for the dx32 extender: classifies processor
//! faults and traps, correlates them with breakpoints, and drives an
//! interactive command loop over a suspended target.

#![warn(clippy::pedantic)]

use dx32_core::host::{Event, Resume, Target};
use dx32_core::x86::{flag, Frame};
use log::{debug, trace};
use thiserror::Error;

use crate::bpt::Breakpoints;
use crate::dis::{Disasm, Raw};
use crate::fault::Exception;
use crate::lang::addr::{Addr, Defaults, Range};
use crate::lang::{Command, Size, Space};
use crate::prompt::Prompt;
use crate::sym::Symbols;

mod exec;

pub mod bpt;
pub mod dis;
pub mod fault;
pub mod hex;
pub mod lang;
pub mod prompt;
pub mod sym;

pub use crate::lang::Scope;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Last-used sizes of the display, enter, and fill commands.
#[derive(Clone, Copy, Debug, Default)]
struct Sizes {
    dump: Size,
    enter: Size,
    fill: Size,
}

/// What became of one debug event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The target was resumed; wait for the next event.
    Running,
    /// The user asked to leave the debugger.
    Quit,
}

/// How a command left the prompt loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    /// Keep prompting.
    Stay,
    /// The target was resumed.
    Resume,
    /// The user asked to quit.
    Quit,
}

/// Interactive debugger object.
#[derive(Debug)]
pub struct Debugger {
    // Frontend
    line: Option<Box<dyn Prompt>>,
    dis: Box<dyn Disasm>,
    // Target state
    frame: Frame,
    space: Space,
    // Internal
    syms: Symbols,
    bpts: Breakpoints,
    sizes: Sizes,
    prev: String,
    hit: Option<usize>,
    steps: u32,
    temp: Option<(u32, u8)>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self {
            line: None,
            dis: Box::new(Raw),
            frame: Frame::default(),
            space: Space::Prot,
            syms: Symbols::new(),
            bpts: Breakpoints::new(),
            sizes: Sizes::default(),
            prev: String::new(),
            hit: None,
            steps: 0,
            temp: None,
        }
    }
}

impl Debugger {
    /// Constructs a new `Debugger` instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prompt handle used to read command lines.
    pub fn prompt(&mut self, line: impl Prompt + 'static) {
        self.line = Some(Box::new(line));
    }

    /// Sets the instruction disassembler.
    pub fn disasm(&mut self, dis: impl Disasm + 'static) {
        self.dis = Box::new(dis);
    }

    /// The debugger's symbol table.
    pub fn symbols_mut(&mut self) -> &mut Symbols {
        &mut self.syms
    }

    /// The working copy of the target's context.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Services debug events until the target exits or the user quits.
    ///
    /// # Errors
    ///
    /// Errors if an event cannot be serviced; recoverable command errors
    /// are reported to the user instead.
    pub fn run(&mut self, tgt: &mut dyn Target) -> Result<()> {
        while let Some(event) = tgt.wait() {
            match self.on_event(tgt, &event)? {
                Outcome::Running => (),
                Outcome::Quit => break,
            }
        }
        Ok(())
    }

    /// Services one debug event: classify, correlate with breakpoints,
    /// prompt, and resume.
    ///
    /// # Errors
    ///
    /// Errors if the prompt is unconfigured or target state cannot be
    /// read back; command-level errors only get reported.
    pub fn on_event(&mut self, tgt: &mut dyn Target, event: &Event) -> Result<Outcome> {
        self.frame = tgt.context();
        self.space = if self.frame.eflags & flag::VM != 0 {
            Space::Real
        } else {
            Space::Prot
        };
        let exception = fault::classify(event, &self.frame);
        trace!("event {event:?} -> {exception:?}");

        let mut announced = false;
        match exception {
            Exception::BreakpointTrap => {
                // A trap: EIP points just past the INT3.
                let back = self.frame.eip.wrapping_sub(1);
                let linear = self.to_linear(back);
                match self.temp {
                    // An internal one-shot breakpoint (step-over, run to
                    // return); restore it quietly.
                    Some((addr, saved)) if addr == linear => {
                        self.temp = None;
                        tgt.write(addr, &[saved])?;
                        self.frame.eip = back;
                        announced = true;
                    }
                    _ => {
                        if let Some(index) = self.bpts.soft_at(linear) {
                            self.frame.eip = back;
                            self.bpts.disarm(tgt, &mut self.frame, index)?;
                            self.hit = Some(index);
                            println!("Breakpoint {index} hit");
                            announced = true;
                        }
                    }
                }
            }
            Exception::SingleStepTrap => {
                self.frame.dr6 = 0;
                if let Some(restore) = self.bpts.take_restore() {
                    // The step past a hit breakpoint has completed;
                    // re-arm it.
                    self.bpts.arm(tgt, &mut self.frame, restore.index)?;
                    debug!("breakpoint {} re-armed", restore.index);
                    if restore.go {
                        self.frame.eflags &= !flag::TF;
                        tgt.set_context(&self.frame);
                        tgt.resume(Resume::Go);
                        return Ok(Outcome::Running);
                    }
                }
                if self.steps > 0 {
                    // Mid trace count; keep stepping without prompting.
                    self.steps -= 1;
                    self.frame.eflags |= flag::TF;
                    tgt.set_context(&self.frame);
                    tgt.resume(Resume::Step);
                    return Ok(Outcome::Running);
                }
                self.frame.eflags &= !flag::TF;
                announced = true;
            }
            ex if ex.is_watch() => {
                if let Some(index) = self.bpts.hard_hit(self.frame.dr6) {
                    self.bpts.disarm(tgt, &mut self.frame, index)?;
                    self.hit = Some(index);
                    println!("Breakpoint {index} hit");
                    announced = true;
                }
                self.frame.dr6 = 0;
            }
            _ => (),
        }

        if !announced {
            println!("{exception}");
        }
        self.steps = 0;
        tgt.set_context(&self.frame);
        self.status(tgt)?;

        // Prompt until a command resumes the target.
        loop {
            let line = match self.readline() {
                Ok(line) => line,
                Err(Error::Quit) => return Ok(Outcome::Quit),
                Err(err) => return Err(err),
            };
            let tokens = match lang::tokenize(&line) {
                Ok(tokens) => tokens,
                Err(err) => {
                    println!("{err}");
                    continue;
                }
            };
            if tokens.is_empty() {
                continue;
            }
            let frame = self.frame.clone();
            let ctx = Ctx {
                frame: &frame,
                syms: &self.syms,
            };
            let cmd = match lang::parse(&tokens, &ctx, &self.defaults()) {
                Ok(cmd) => cmd,
                Err(err) => {
                    println!("{err}");
                    continue;
                }
            };
            match self.exec(tgt, cmd) {
                Ok(Flow::Stay) => (),
                Ok(Flow::Resume) => return Ok(Outcome::Running),
                Ok(Flow::Quit) => return Ok(Outcome::Quit),
                Err(Error::Quit) => return Ok(Outcome::Quit),
                Err(err) => println!("{err}"),
            }
        }
    }

    /// Executes one parsed command.
    #[rustfmt::skip]
    fn exec(&mut self, tgt: &mut dyn Target, cmd: Command) -> Result<Flow> {
        #[allow(clippy::enum_glob_use)]
        use Command::*;

        // Perform the command.
        let stay = |res: Result<()>| res.map(|()| Flow::Stay);
        match cmd {
            Dump { size, range }         => stay(exec::dump(self, tgt, size, range)),
            Enter { size, addr, values } => stay(exec::enter(self, tgt, size, addr, &values)),
            Fill { size, range, pattern} => stay(exec::fill(self, tgt, size, range, &pattern)),
            Compare { range, with }      => stay(exec::compare(tgt, range, with)),
            Search { range, pattern }    => stay(exec::search(tgt, range, &pattern)),
            StackTrace                   => stay(exec::stack_trace(self, tgt)),
            Break { id, addr }           => stay(exec::bp_set(self, tgt, id, addr)),
            Watch { id, access, size, addr }
                                         => stay(exec::ba_set(self, id, access, size, addr)),
            BpClear(ids)                 => stay(exec::bp_clear(self, tgt, &ids)),
            BpDisable(ids)               => stay(exec::bp_disable(self, tgt, &ids)),
            BpEnable(ids)                => stay(exec::bp_enable(self, tgt, &ids)),
            BpList                       => stay(exec::bp_list(self)),
            Go { addr }                  => self.go(tgt, addr),
            GoUp                         => self.go_up(tgt),
            Trace { addr, count }        => self.trace(tgt, addr, count),
            Step { addr, count }         => self.step_over(tgt, addr, count),
            Regs { reg, value }          => stay(exec::regs(self, tgt, reg, value)),
            Unassemble { range }         => stay(exec::unassemble(self, tgt, range)),
            Assemble { addr }            => stay(exec::assemble(addr)),
            Examine { pattern }          => stay(exec::examine(self, &pattern)),
            Modules                      => stay(exec::modules(tgt)),
            Near { linear }              => stay(exec::near(self, linear)),
            Selectors(list)              => stay(exec::selectors(self, tgt, &list)),
            Idt(list)                    => stay(exec::idt(tgt, &list)),
            Ivt(list)                    => stay(exec::ivt(tgt, &list)),
            Eval { value }               => stay(exec::eval(value)),
            Help                         => stay(exec::help()),
            Quit                         => Ok(Flow::Quit),
        }
    }

    /// `g [addr]` - continue execution.
    fn go(&mut self, tgt: &mut dyn Target, addr: Option<Addr>) -> Result<Flow> {
        if let Some(addr) = addr {
            self.seed(addr);
        }
        self.depart(tgt, false);
        Ok(Flow::Resume)
    }

    /// `gu` - run until the current frame returns.
    fn go_up(&mut self, tgt: &mut dyn Target) -> Result<Flow> {
        let mut raw = [0u8; 4];
        tgt.read(self.frame.ebp.wrapping_add(4), &mut raw)?;
        let ret = u32::from_le_bytes(raw);
        self.arm_temp(tgt, ret)?;
        self.depart(tgt, false);
        Ok(Flow::Resume)
    }

    /// `t [=addr] [count]` - single-step into.
    fn trace(&mut self, tgt: &mut dyn Target, addr: Option<Addr>, count: u32) -> Result<Flow> {
        if let Some(addr) = addr {
            self.seed(addr);
        }
        self.steps = count.saturating_sub(1);
        self.depart(tgt, true);
        Ok(Flow::Resume)
    }

    /// `p [=addr] [count]` - step, running calls to completion.
    fn step_over(&mut self, tgt: &mut dyn Target, addr: Option<Addr>, count: u32) -> Result<Flow> {
        if let Some(addr) = addr {
            self.seed(addr);
        }
        let pc = self.to_linear(self.frame.eip);
        let mut code = [0u8; 8];
        let called = tgt.read(pc, &mut code).is_ok() && dis::is_call(&code);
        if called {
            // Break just past the call and run it to completion.
            let (_, len) = self.dis.decode(&code, pc);
            self.arm_temp(tgt, pc.wrapping_add(len as u32))?;
            self.depart(tgt, false);
        } else {
            self.steps = count.saturating_sub(1);
            self.depart(tgt, true);
        }
        Ok(Flow::Resume)
    }

    /// Resumes the target, stepping once first when a hit breakpoint
    /// needs to be re-armed behind us.
    fn depart(&mut self, tgt: &mut dyn Target, tracing: bool) {
        if let Some(index) = self.hit.take() {
            self.bpts.pend_restore(index, !tracing);
            self.frame.eflags |= flag::TF;
            tgt.set_context(&self.frame);
            tgt.resume(Resume::Step);
            return;
        }
        if tracing {
            self.frame.eflags |= flag::TF;
            tgt.set_context(&self.frame);
            tgt.resume(Resume::Step);
        } else {
            self.frame.eflags &= !flag::TF;
            tgt.set_context(&self.frame);
            tgt.resume(Resume::Go);
        }
    }

    /// Plants an internal one-shot breakpoint.
    fn arm_temp(&mut self, tgt: &mut dyn Target, at: u32) -> Result<()> {
        let mut saved = [0u8; 1];
        tgt.read(at, &mut saved)?;
        tgt.write(at, &[0xCC])?;
        self.temp = Some((at, saved[0]));
        Ok(())
    }

    /// Seeds CS:EIP from an explicit address argument.
    fn seed(&mut self, addr: Addr) {
        self.frame.eip = addr.offset;
        if addr.space != Space::Linear {
            self.frame.cs = addr.selector;
        }
    }

    /// Renders the register dump and current instruction.
    fn status(&mut self, tgt: &mut dyn Target) -> Result<()> {
        println!("{}", fault::dump_regs(&self.frame));
        let pc = self.to_linear(self.frame.eip);
        if let Some(note) = self.syms.annotate(pc) {
            println!("{note}:");
        }
        let mut code = [0u8; 16];
        // An unmapped PC still gets a status line.
        let _ = tgt.read(pc, &mut code);
        let (text, _) = self.dis.decode(&code, pc);
        println!("{:04X}:{:08X}    {text}", self.frame.cs, self.frame.eip);
        Ok(())
    }

    /// Reads one command line, substituting the previous line for blank
    /// input.
    fn readline(&mut self) -> Result<String> {
        let line = self.line.as_mut().ok_or(Error::CfgPrompt)?;
        let msg = format!("{:04X}:{:08X}# ", self.frame.cs, self.frame.eip);
        let input = match line.prompt(&msg) {
            Err(prompt::Error::Quit) => return Err(Error::Quit),
            res => res?,
        };
        let input = input.trim();
        if input.is_empty() {
            // Re-use the previous command line.
            debug!("repeat line: `{}`", self.prev);
            Ok(self.prev.clone())
        } else {
            self.prev = input.to_string();
            Ok(self.prev.clone())
        }
    }

    /// Address-parsing defaults for the current stop.
    fn defaults(&self) -> Defaults {
        Defaults {
            space: self.space,
            cs: self.frame.cs,
            eip: self.frame.eip,
        }
    }

    /// The default range at CS:EIP.
    fn here(&self, len: u32) -> Range {
        let start = self.defaults().here();
        Range {
            start,
            end: start.advanced(len),
        }
    }

    /// Flattens a CS-relative offset per the current mode.
    fn to_linear(&self, offset: u32) -> u32 {
        match self.space {
            Space::Real => (u32::from(self.frame.cs) << 4).wrapping_add(offset),
            _ => offset,
        }
    }
}

/// Expression scope over the stopped frame and the symbol table.
struct Ctx<'a> {
    frame: &'a Frame,
    syms: &'a Symbols,
}

impl Scope for Ctx<'_> {
    fn reg(&self, reg: dx32_core::x86::Reg) -> u32 {
        self.frame.load(reg)
    }

    fn symbol(&self, name: &str) -> Option<u32> {
        self.syms.lookup(name)
    }
}

/// An error raised by the debugger core.
#[derive(Debug, Error)]
pub enum Error {
    /// Breakpoint management failed.
    #[error(transparent)]
    Breakpoint(#[from] bpt::Error),
    /// Prompt has not been configured.
    #[error("prompt not configured")]
    CfgPrompt,
    /// The host reported an error.
    #[error(transparent)]
    Host(#[from] dx32_core::host::Error),
    /// The command line failed to parse.
    #[error(transparent)]
    Language(#[from] lang::Error),
    /// Prompt returned an error.
    #[error(transparent)]
    Prompt(#[from] prompt::Error),
    /// Quit requested by user.
    #[error("quit requested by user")]
    Quit,
}
