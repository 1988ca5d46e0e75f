//! Breakpoint manager.
//!
//! A fixed array of breakpoint slots: software breakpoints patch the
//! target instruction with INT3 and remember the original byte; hardware
//! breakpoints claim one of the four debug address registers and encode
//! their condition into DR7. The manager also owns the restoration step:
//! after a hit, the breakpoint stays disarmed until the target has been
//! single-stepped past it, then it is re-armed.

use std::fmt::Display;

use dx32_core::host::{self, Target};
use dx32_core::x86::Frame;
use thiserror::Error;

use crate::lang::addr::Addr;

/// Number of breakpoint slots.
pub const SLOTS: usize = 32;

/// The INT3 opcode.
const INT3: u8 = 0xCC;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Hardware breakpoint condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Instruction fetch.
    Execute,
    /// Data write.
    Write,
    /// Data read or write; the 80386 has no read-only condition.
    ReadWrite,
}

impl Access {
    /// Parses the access letter of the `ba` command.
    #[must_use]
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.to_ascii_lowercase().as_str() {
            "e" => Some(Self::Execute),
            "w" => Some(Self::Write),
            "r" => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// The DR7 R/W field encoding.
    fn bits(self) -> u32 {
        match self {
            Self::Execute => 0b00,
            Self::Write => 0b01,
            Self::ReadWrite => 0b11,
        }
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            Self::Execute => 'e',
            Self::Write => 'w',
            Self::ReadWrite => 'r',
        };
        write!(f, "{letter}")
    }
}

/// One breakpoint slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Slot {
    /// Unused.
    #[default]
    Empty,
    /// Software breakpoint: an INT3 patched over `saved`.
    Soft { enabled: bool, addr: Addr, saved: u8 },
    /// Hardware breakpoint in debug register `dr`.
    Hard {
        enabled: bool,
        addr: Addr,
        access: Access,
        size: u8,
        dr: u8,
    },
}

impl Slot {
    /// The breakpoint's address, if the slot is in use.
    #[must_use]
    pub fn addr(&self) -> Option<Addr> {
        match self {
            Self::Empty => None,
            Self::Soft { addr, .. } | Self::Hard { addr, .. } => Some(*addr),
        }
    }

    /// Whether the breakpoint is armed.
    #[must_use]
    pub fn enabled(&self) -> bool {
        matches!(
            self,
            Self::Soft { enabled: true, .. } | Self::Hard { enabled: true, .. }
        )
    }
}

/// In-flight restoration of a breakpoint the target just hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Restore {
    /// Slot of the breakpoint to re-arm.
    pub index: usize,
    /// Whether execution should keep running once re-armed (`g`), as
    /// opposed to stopping back at the prompt (`t`).
    pub go: bool,
}

/// The breakpoint slot table.
#[derive(Debug, Default)]
pub struct Breakpoints {
    slots: [Slot; SLOTS],
    restore: Option<Restore>,
}

impl Breakpoints {
    /// Constructs an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a slot.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Iterates `(index, slot)` over the slots in use.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !matches!(slot, Slot::Empty))
    }

    fn claim(&mut self, want: Option<usize>) -> Result<usize> {
        match want {
            Some(index) if index < SLOTS => {
                // Redefining a live slot would orphan its patch.
                if matches!(self.slots[index], Slot::Empty) {
                    Ok(index)
                } else {
                    Err(Error::Busy)
                }
            }
            Some(_) => Err(Error::Slots),
            None => self
                .slots
                .iter()
                .position(|slot| matches!(slot, Slot::Empty))
                .ok_or(Error::Slots),
        }
    }

    /// Sets and arms a software breakpoint, returning its slot index.
    ///
    /// # Errors
    ///
    /// Fails when no slot is free or the target byte cannot be patched.
    pub fn set_soft(
        &mut self,
        tgt: &mut dyn Target,
        want: Option<usize>,
        addr: Addr,
    ) -> Result<usize> {
        let index = self.claim(want)?;
        let mut saved = [0u8; 1];
        tgt.read(addr.linear, &mut saved)?;
        tgt.write(addr.linear, &[INT3])?;
        self.slots[index] = Slot::Soft {
            enabled: true,
            addr,
            saved: saved[0],
        };
        Ok(index)
    }

    /// Sets and arms a hardware breakpoint, returning its slot index.
    ///
    /// # Errors
    ///
    /// Fails when no slot or debug register is free.
    pub fn set_hard(
        &mut self,
        frame: &mut Frame,
        want: Option<usize>,
        addr: Addr,
        access: Access,
        size: u8,
    ) -> Result<usize> {
        let index = self.claim(want)?;
        let dr = self.free_dr(frame).ok_or(Error::Regs)?;
        set_dr(frame, dr, addr.linear);
        frame.dr7 = dr7_arm(frame.dr7, dr, access, size);
        self.slots[index] = Slot::Hard {
            enabled: true,
            addr,
            access,
            size,
            dr,
        };
        Ok(index)
    }

    /// Finds a debug register not enabled in DR7.
    fn free_dr(&self, frame: &Frame) -> Option<u8> {
        (0..4u8).find(|dr| frame.dr7 & (1 << (2 * dr)) == 0)
    }

    /// Disarms a breakpoint, leaving the slot in place.
    ///
    /// # Errors
    ///
    /// Fails when the slot is empty or the patch cannot be undone.
    pub fn disarm(&mut self, tgt: &mut dyn Target, frame: &mut Frame, index: usize) -> Result<()> {
        match self.slots.get_mut(index) {
            Some(Slot::Soft {
                enabled,
                addr,
                saved,
            }) => {
                if *enabled {
                    tgt.write(addr.linear, &[*saved])?;
                    *enabled = false;
                }
                Ok(())
            }
            Some(Slot::Hard { enabled, dr, .. }) => {
                if *enabled {
                    frame.dr7 &= !(1 << (2 * *dr));
                    *enabled = false;
                }
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Re-arms a disarmed breakpoint.
    ///
    /// Software breakpoints re-read the byte under the patch first; the
    /// program may have legitimately rewritten its own code.
    ///
    /// # Errors
    ///
    /// Fails when the slot is empty or the patch cannot be applied.
    pub fn arm(&mut self, tgt: &mut dyn Target, frame: &mut Frame, index: usize) -> Result<()> {
        match self.slots.get_mut(index) {
            Some(Slot::Soft {
                enabled,
                addr,
                saved,
            }) => {
                if !*enabled {
                    let mut byte = [0u8; 1];
                    tgt.read(addr.linear, &mut byte)?;
                    *saved = byte[0];
                    tgt.write(addr.linear, &[INT3])?;
                    *enabled = true;
                }
                Ok(())
            }
            Some(Slot::Hard {
                enabled,
                addr,
                access,
                size,
                dr,
            }) => {
                if !*enabled {
                    set_dr(frame, *dr, addr.linear);
                    frame.dr7 = dr7_arm(frame.dr7, *dr, *access, *size);
                    *enabled = true;
                }
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Disarms and frees a breakpoint slot.
    ///
    /// # Errors
    ///
    /// Fails when the slot is empty.
    pub fn clear(&mut self, tgt: &mut dyn Target, frame: &mut Frame, index: usize) -> Result<()> {
        self.disarm(tgt, frame, index)?;
        self.slots[index] = Slot::Empty;
        Ok(())
    }

    /// Finds the enabled software breakpoint at a linear address.
    #[must_use]
    pub fn soft_at(&self, linear: u32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Slot::Soft { enabled: true, addr, .. } if addr.linear == linear)
        })
    }

    /// Finds the enabled hardware breakpoint DR6 says was hit.
    #[must_use]
    pub fn hard_hit(&self, dr6: u32) -> Option<usize> {
        let dr = (0..4u8).find(|dr| dr6 & (1 << dr) != 0)?;
        self.slots.iter().position(|slot| {
            matches!(slot, Slot::Hard { enabled: true, dr: slot_dr, .. } if *slot_dr == dr)
        })
    }

    /// Schedules a breakpoint to be re-armed after one single-step.
    pub fn pend_restore(&mut self, index: usize, go: bool) {
        self.restore = Some(Restore { index, go });
    }

    /// Takes the pending restoration, if one is in flight.
    pub fn take_restore(&mut self) -> Option<Restore> {
        self.restore.take()
    }

    /// Whether a restoration is in flight.
    #[must_use]
    pub fn restoring(&self) -> bool {
        self.restore.is_some()
    }
}

/// Writes a debug address register.
fn set_dr(frame: &mut Frame, dr: u8, linear: u32) {
    match dr {
        0 => frame.dr0 = linear,
        1 => frame.dr1 = linear,
        2 => frame.dr2 = linear,
        _ => frame.dr3 = linear,
    }
}

/// Encodes a condition into DR7 and enables the register locally.
fn dr7_arm(dr7: u32, dr: u8, access: Access, size: u8) -> u32 {
    let len = match size {
        2 => 0b01,
        4 => 0b11,
        _ => 0b00,
    };
    let shift = 16 + 4 * u32::from(dr);
    let mut out = dr7 & !(0b1111 << shift);
    out |= access.bits() << shift;
    out |= len << (shift + 2);
    out | 1 << (2 * dr)
}

/// An error raised by breakpoint management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// No breakpoint slot is available.
    #[error("no free breakpoint slot")]
    Slots,
    /// The requested slot is already in use.
    #[error("breakpoint slot in use")]
    Busy,
    /// All four debug registers are armed.
    #[error("all debug registers are in use")]
    Regs,
    /// No breakpoint at that index.
    #[error("breakpoint not found")]
    NotFound,
    /// Target memory could not be patched.
    #[error(transparent)]
    Host(#[from] host::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::addr::Space;
    use dx32_core::host::flat::FlatTarget;

    fn addr(linear: u32) -> Addr {
        Addr::new(Space::Linear, 0, linear)
    }

    fn target() -> FlatTarget {
        let mut tgt = FlatTarget::new();
        tgt.map(0x1000, 0x100);
        tgt.write(0x1000, &[0xF7, 0xF1, 0x90, 0xC3]).unwrap();
        tgt
    }

    #[test]
    fn soft_arm_patches_and_disarm_restores() {
        let mut tgt = target();
        let mut frame = Frame::default();
        let mut bpts = Breakpoints::new();

        let id = bpts.set_soft(&mut tgt, None, addr(0x1001)).unwrap();
        let mut byte = [0u8; 1];
        tgt.read(0x1001, &mut byte).unwrap();
        assert_eq!(byte[0], INT3);

        bpts.disarm(&mut tgt, &mut frame, id).unwrap();
        tgt.read(0x1001, &mut byte).unwrap();
        assert_eq!(byte[0], 0xF1);

        bpts.arm(&mut tgt, &mut frame, id).unwrap();
        tgt.read(0x1001, &mut byte).unwrap();
        assert_eq!(byte[0], INT3);

        bpts.clear(&mut tgt, &mut frame, id).unwrap();
        tgt.read(0x1001, &mut byte).unwrap();
        assert_eq!(byte[0], 0xF1);
        assert_eq!(bpts.iter().count(), 0);
    }

    #[test]
    fn hard_breakpoints_claim_debug_registers() {
        let mut frame = Frame::default();
        let mut bpts = Breakpoints::new();

        let id = bpts
            .set_hard(&mut frame, None, addr(0x2000), Access::Write, 4)
            .unwrap();
        assert_eq!(frame.dr0, 0x2000);
        // L0 set; R/W0 = write; LEN0 = 4 bytes.
        assert_eq!(frame.dr7 & 1, 1);
        assert_eq!((frame.dr7 >> 16) & 0b11, 0b01);
        assert_eq!((frame.dr7 >> 18) & 0b11, 0b11);

        // Three more fill the registers; a fifth fails.
        for _ in 0..3 {
            bpts.set_hard(&mut frame, None, addr(0x3000), Access::Execute, 1)
                .unwrap();
        }
        assert_eq!(
            bpts.set_hard(&mut frame, None, addr(0x4000), Access::Execute, 1)
                .unwrap_err(),
            Error::Regs
        );

        // DR6 reporting bit 0 maps back to the first breakpoint.
        assert_eq!(bpts.hard_hit(0b0001), Some(id));
    }

    #[test]
    fn soft_lookup_matches_linear_address() {
        let mut tgt = target();
        let mut frame = Frame::default();
        let mut bpts = Breakpoints::new();
        let id = bpts.set_soft(&mut tgt, Some(5), addr(0x1002)).unwrap();
        assert_eq!(id, 5);
        assert_eq!(
            bpts.set_soft(&mut tgt, Some(5), addr(0x1003)).unwrap_err(),
            Error::Busy
        );
        assert_eq!(bpts.soft_at(0x1002), Some(5));
        assert_eq!(bpts.soft_at(0x1003), None);
        bpts.disarm(&mut tgt, &mut frame, 5).unwrap();
        // A disarmed breakpoint no longer matches.
        assert_eq!(bpts.soft_at(0x1002), None);
    }

    #[test]
    fn restore_is_one_shot() {
        let mut bpts = Breakpoints::new();
        assert!(!bpts.restoring());
        bpts.pend_restore(3, true);
        assert!(bpts.restoring());
        assert_eq!(bpts.take_restore(), Some(Restore { index: 3, go: true }));
        assert!(bpts.take_restore().is_none());
    }
}
