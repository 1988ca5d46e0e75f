//! Debugger session tests over a scripted target.

use std::collections::VecDeque;

use ddb::prompt::{self, Prompt};
use ddb::{Debugger, Outcome};
use dx32_core::host::flat::FlatTarget;
use dx32_core::host::{Event, Resume, Target};
use dx32_core::x86::flag;

/// Prompt frontend fed from a canned list of lines.
#[derive(Debug)]
struct Script(VecDeque<String>);

impl Script {
    fn new(lines: &[&str]) -> Self {
        Self(lines.iter().map(ToString::to_string).collect())
    }
}

impl Prompt for Script {
    fn prompt(&mut self, _msg: &str) -> prompt::Result<String> {
        self.0.pop_front().ok_or(prompt::Error::Quit)
    }
}

const CODE: u32 = 0x0040_1000;

/// A target paused in flat protected mode with a page of NOPs mapped.
fn target() -> FlatTarget {
    let mut tgt = FlatTarget::new();
    tgt.map(0x0040_0000, 0x2000);
    tgt.write(0x0040_0000, &vec![0x90u8; 0x2000]).unwrap();
    tgt.frame.cs = 0x1B;
    tgt.frame.eip = 0x0040_0F01; // just past an initial INT3
    tgt
}

fn byte_at(tgt: &mut FlatTarget, addr: u32) -> u8 {
    let mut buf = [0u8; 1];
    tgt.read(addr, &mut buf).unwrap();
    buf[0]
}

#[test]
fn breakpoint_round_trip_restores_and_rearms() {
    let mut tgt = target();
    let mut dbg = Debugger::new();

    // Initial break: set a breakpoint and go.
    dbg.prompt(Script::new(&["bp 401000", "g"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 3,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    // Armed: the INT3 patch is in place and the target is running free.
    assert_eq!(byte_at(&mut tgt, CODE), 0xCC);
    assert_eq!(tgt.resumed.last(), Some(&Resume::Go));
    assert_eq!(tgt.frame.eflags & flag::TF, 0);

    // The target executes the INT3 at the breakpoint.
    tgt.frame.eip = CODE + 1;
    dbg.prompt(Script::new(&["g"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 3,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    // Prompted and resumed: EIP backed up onto the breakpoint, the
    // original byte restored, and a restoration step pending under TF.
    assert_eq!(tgt.frame.eip, CODE);
    assert_eq!(byte_at(&mut tgt, CODE), 0x90);
    assert_ne!(tgt.frame.eflags & flag::TF, 0);
    assert_eq!(tgt.resumed.last(), Some(&Resume::Step));

    // The restoration step completes.
    tgt.frame.eip = CODE + 1;
    tgt.frame.dr6 = 1 << 14;
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 1,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    // No prompt was consumed (the script is spent); the breakpoint is
    // re-armed and the target keeps running with TF clear.
    assert_eq!(out, Outcome::Running);
    assert_eq!(byte_at(&mut tgt, CODE), 0xCC);
    assert_eq!(tgt.frame.eflags & flag::TF, 0);
    assert_eq!(tgt.resumed.last(), Some(&Resume::Go));
}

#[test]
fn tracing_past_a_breakpoint_stops_again() {
    let mut tgt = target();
    let mut dbg = Debugger::new();

    dbg.prompt(Script::new(&["bp 401000", "g"]));
    dbg.on_event(
        &mut tgt,
        &Event {
            vector: 3,
            error_code: 0,
            aux: 0,
        },
    )
    .unwrap();

    // Hit the breakpoint, then trace one instruction.
    tgt.frame.eip = CODE + 1;
    dbg.prompt(Script::new(&["t"]));
    dbg.on_event(
        &mut tgt,
        &Event {
            vector: 3,
            error_code: 0,
            aux: 0,
        },
    )
    .unwrap();
    assert_eq!(tgt.resumed.last(), Some(&Resume::Step));

    // The traced step completes: breakpoint re-arms, but this time the
    // debugger prompts again instead of running on.
    tgt.frame.eip = CODE + 1;
    tgt.frame.dr6 = 1 << 14;
    dbg.prompt(Script::new(&["q"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 1,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Quit);
    assert_eq!(byte_at(&mut tgt, CODE), 0xCC);
}

#[test]
fn hardware_breakpoints_round_trip_the_debug_registers() {
    let mut tgt = target();
    let mut dbg = Debugger::new();

    dbg.prompt(Script::new(&["ba0 w 4 401800", "g"]));
    dbg.on_event(
        &mut tgt,
        &Event {
            vector: 3,
            error_code: 0,
            aux: 0,
        },
    )
    .unwrap();
    assert_eq!(tgt.frame.dr0, 0x0040_1800);
    assert_eq!(tgt.frame.dr7 & 1, 1);

    // The watchpoint fires; DR6 reports condition 0.
    tgt.frame.dr6 = 0b0001;
    dbg.prompt(Script::new(&["g"]));
    dbg.on_event(
        &mut tgt,
        &Event {
            vector: 1,
            error_code: 0,
            aux: 0,
        },
    )
    .unwrap();
    // Disarmed for the restoration step.
    assert_eq!(tgt.frame.dr7 & 1, 0);
    assert_ne!(tgt.frame.eflags & flag::TF, 0);

    // Step completes; the debug register is re-enabled.
    tgt.frame.dr6 = 1 << 14;
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 1,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    assert_eq!(tgt.frame.dr7 & 1, 1);
    assert_eq!(tgt.frame.eflags & flag::TF, 0);
}

#[test]
fn blank_lines_repeat_the_previous_command() {
    let mut tgt = target();
    let mut dbg = Debugger::new();

    // Trace, then repeat the trace with a blank line.
    dbg.prompt(Script::new(&["t"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 3,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    assert_eq!(tgt.resumed, vec![Resume::Step]);

    tgt.frame.eip += 1;
    tgt.frame.dr6 = 1 << 14;
    dbg.prompt(Script::new(&[""]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 1,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    assert_eq!(tgt.resumed, vec![Resume::Step, Resume::Step]);
}

#[test]
fn register_writes_reach_the_target() {
    let mut tgt = target();
    let mut dbg = Debugger::new();

    dbg.prompt(Script::new(&["r eax = dead0001", "r ah = 42", "g"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 3,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    assert_eq!(tgt.frame.eax, 0xDEAD_4201);
}

#[test]
fn run_drains_events_until_quit() {
    let mut tgt = target();
    tgt.raise(Event {
        vector: 3,
        error_code: 0,
        aux: 0,
    });
    tgt.raise(Event {
        vector: 0,
        error_code: 0,
        aux: 0,
    });
    let mut dbg = Debugger::new();
    dbg.prompt(Script::new(&["g", "q"]));
    dbg.run(&mut tgt).unwrap();
    assert_eq!(tgt.resumed, vec![Resume::Go]);
}

#[test]
fn step_over_plants_a_one_shot_past_the_call() {
    let mut tgt = target();
    // A near CALL at EIP.
    tgt.frame.eip = CODE;
    tgt.write(CODE, &[0xE8, 0x10, 0x00, 0x00, 0x00]).unwrap();

    let mut dbg = Debugger::new();
    dbg.prompt(Script::new(&["p"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 1,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Running);
    // The fallback disassembler advances one byte at a time, so the
    // one-shot lands right behind the opcode byte.
    assert_eq!(byte_at(&mut tgt, CODE + 1), 0xCC);
    assert_eq!(tgt.resumed.last(), Some(&Resume::Go));

    // Hitting the one-shot removes it and prompts.
    tgt.frame.eip = CODE + 2;
    dbg.prompt(Script::new(&["q"]));
    let out = dbg
        .on_event(
            &mut tgt,
            &Event {
                vector: 3,
                error_code: 0,
                aux: 0,
            },
        )
        .unwrap();
    assert_eq!(out, Outcome::Quit);
    assert_eq!(byte_at(&mut tgt, CODE + 1), 0x10);
    assert_eq!(tgt.frame.eip, CODE + 1);
}
