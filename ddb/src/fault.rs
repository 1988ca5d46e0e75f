//! Fault and trap classification.
//!
//! Turns a raw exception event (vector, error code, side-channel address)
//! into a typed exception kind, decoding selector error codes and page
//! fault bits, and renders the standardized status header.

use std::fmt::Display;

use dx32_core::host::Event;
use dx32_core::x86::{flag, Frame};

/// A selector-format error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selector(pub u16);

impl Selector {
    /// Which descriptor table the selector refers to.
    #[must_use]
    pub fn table(&self) -> &'static str {
        // Bit 1 flags the IDT; otherwise bit 2 picks LDT over GDT.
        if self.0 & 0x2 != 0 {
            "IDT"
        } else if self.0 & 0x4 != 0 {
            "LDT"
        } else {
            "GDT"
        }
    }

    /// The selector index, masked of its table and privilege bits.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.0 & 0xFFF8
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sel={:04X} ({}+{:04X})", self.0, self.table(), self.index())
    }
}

/// Classified processor exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideFault,
    DebugException,
    Nmi,
    BreakpointTrap,
    OverflowTrap,
    BoundFault,
    UndefinedOpcodeFault,
    DeviceUnavailableFault,
    DoubleFault,
    InvalidTssFault(Selector),
    NotPresentFault(Selector),
    StackSegmentFault(Selector),
    GeneralProtectionFault(Selector),
    PageFault {
        write: bool,
        user: bool,
        nx: bool,
        present: bool,
        linear: u32,
    },
    SingleStepTrap,
    FetchFault,
    IoTrap,
    DataReadTrap,
    DataWriteTrap,
    Unknown(u8),
}

/// Classifies an exception event against the frame's debug registers.
#[must_use]
pub fn classify(event: &Event, frame: &Frame) -> Exception {
    let sel = Selector(event.error_code as u16);
    match event.vector {
        0x0 => Exception::DivideFault,
        0x1 => classify_debug(frame),
        0x2 => Exception::Nmi,
        0x3 => Exception::BreakpointTrap,
        0x4 => Exception::OverflowTrap,
        0x5 => Exception::BoundFault,
        0x6 => Exception::UndefinedOpcodeFault,
        0x7 => Exception::DeviceUnavailableFault,
        0x8 => Exception::DoubleFault,
        0xA => Exception::InvalidTssFault(sel),
        0xB => Exception::NotPresentFault(sel),
        0xC => Exception::StackSegmentFault(sel),
        0xD => Exception::GeneralProtectionFault(sel),
        0xE => Exception::PageFault {
            present: event.error_code & 0x01 != 0,
            write: event.error_code & 0x02 != 0,
            user: event.error_code & 0x04 != 0,
            nx: event.error_code & 0x10 != 0,
            linear: event.aux,
        },
        vector => Exception::Unknown(vector),
    }
}

/// Splits vector 1 by what DR6 says happened.
fn classify_debug(frame: &Frame) -> Exception {
    // BS: the trap flag produced this step.
    if frame.dr6 & (1 << 14) != 0 {
        return Exception::SingleStepTrap;
    }
    // B0..B3: a debug-register condition matched; its type is in DR7.
    if let Some(dr) = (0..4u32).find(|dr| frame.dr6 & (1 << dr) != 0) {
        let rw = (frame.dr7 >> (16 + 4 * dr)) & 0b11;
        return match rw {
            0b00 => Exception::FetchFault,
            0b01 => Exception::DataWriteTrap,
            0b10 => Exception::IoTrap,
            _ => Exception::DataReadTrap,
        };
    }
    Exception::DebugException
}

impl Exception {
    /// Whether this exception came from a debug-register match.
    #[must_use]
    pub fn is_watch(&self) -> bool {
        matches!(
            self,
            Self::FetchFault | Self::IoTrap | Self::DataReadTrap | Self::DataWriteTrap
        )
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DivideFault => write!(f, "Divide Fault"),
            Self::DebugException => write!(f, "Unhandled Debug Exception"),
            Self::Nmi => write!(f, "Hotkey struck"),
            Self::BreakpointTrap => write!(f, "Break instruction exception"),
            Self::OverflowTrap => write!(f, "Overflow Trap"),
            Self::BoundFault => write!(f, "Bound Fault"),
            Self::UndefinedOpcodeFault => write!(f, "Undefined Opcode Fault"),
            Self::DeviceUnavailableFault => write!(f, "Device Not Available Fault"),
            Self::DoubleFault => write!(f, "Double Fault"),
            Self::InvalidTssFault(sel) => write!(f, "Invalid TSS Fault: {sel}"),
            Self::NotPresentFault(sel) => write!(f, "Segment Not Present Fault: {sel}"),
            Self::StackSegmentFault(sel) => write!(f, "Stack Segment Fault: {sel}"),
            Self::GeneralProtectionFault(sel) => write!(f, "General Protection Fault: {sel}"),
            Self::PageFault {
                write,
                nx,
                present,
                linear,
                ..
            } => {
                let verb = if *nx {
                    "executing"
                } else if *write {
                    "writing"
                } else {
                    "reading"
                };
                write!(f, "Page Fault {verb} linear address {linear:08X}")?;
                if !present {
                    write!(f, " (NP)")?;
                }
                Ok(())
            }
            Self::SingleStepTrap => write!(f, "Single Step Trap"),
            Self::FetchFault => write!(f, "Instruction Fetch Fault"),
            Self::IoTrap => write!(f, "I/O Access Trap"),
            Self::DataReadTrap => write!(f, "Data Read Trap"),
            Self::DataWriteTrap => write!(f, "Data Write Trap"),
            Self::Unknown(vector) => write!(f, "Exception {vector:02X}h"),
        }
    }
}

/// Renders the EFLAGS mnemonic row.
#[must_use]
pub fn flags(eflags: u32) -> String {
    [
        (flag::OF, "OV", "NV"),
        (flag::DF, "DN", "UP"),
        (flag::IF, "EI", "DI"),
        (flag::SF, "NG", "PL"),
        (flag::ZF, "ZR", "NZ"),
        (flag::AF, "AC", "NA"),
        (flag::PF, "PE", "PO"),
        (flag::CF, "CY", "NC"),
    ]
    .iter()
    .map(|&(mask, set, clear)| if eflags & mask != 0 { set } else { clear })
    .collect::<Vec<_>>()
    .join(" ")
}

/// Renders the three-line register dump.
#[must_use]
pub fn dump_regs(frame: &Frame) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "AX={:08X}  BX={:08X}  CX={:08X}  DX={:08X}  SI={:08X}  DI={:08X}\n",
        frame.eax, frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi
    ));
    out.push_str(&format!(
        "IP={:08X}  SP={:08X}  BP={:08X}  IOPL={}        {}\n",
        frame.eip,
        frame.esp,
        frame.ebp,
        frame.iopl(),
        flags(frame.eflags)
    ));
    out.push_str(&format!(
        "CS={:04X}  SS={:04X}  DS={:04X}  ES={:04X}  FS={:04X}  GS={:04X}  EFL={:08X}",
        frame.cs, frame.ss, frame.ds, frame.es, frame.fs, frame.gs, frame.eflags
    ));
    out
}
