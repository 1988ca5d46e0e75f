//! dx32 front end: loads a PE image under the flat native host, runs it,
//! or breaks into the debugger over the loaded address space.

#![warn(clippy::pedantic)]

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ddb::Debugger;
use dx32_core::host::flat::FlatHost;
use dx32_core::host::{Event, Host};
use dx32_core::ldr::{self, Loader};
use dx32_core::x86::flag;
use log::{debug, info, warn};

use crate::cli::Cli;
use crate::console::Console;
use crate::target::Session;

mod cli;
mod console;
mod target;

/// Flat code and data selectors handed to the fabricated context.
const FLAT_CS: u16 = 0x001B;
const FLAT_DS: u16 = 0x0023;

fn main() -> ExitCode {
    let args = Cli::parse();

    // Initialize the logger before anything can go wrong.
    let mut log = env_logger::Builder::from_default_env();
    if let Some(filter) = &args.log {
        log.parse_filters(filter);
    }
    log.init();
    debug!("{args:?}");

    match run(&args) {
        Ok(code) => ExitCode::from((code & 0xFF) as u8),
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> anyhow::Result<u32> {
    let mut host = FlatHost::with_base(args.base);
    let mut loader = Loader::new();
    let image = args.image.to_string_lossy().into_owned();

    if args.exit || args.debug {
        return inspect(args, &mut host, &mut loader, &image);
    }

    // Load and run the program; its return value is our exit code. The
    // flat host has no real-mode thunks, so entry points are simulated.
    warn!("no native execution environment; entry points are simulated");
    let value = loader
        .launch(&mut host, &image)
        .with_context(|| image.clone())?;
    info!("`{image}` returned {value}");
    Ok(value)
}

/// Loads the image without running it, then lists modules and optionally
/// enters the debugger.
fn inspect(
    args: &Cli,
    host: &mut FlatHost,
    loader: &mut Loader,
    image: &str,
) -> anyhow::Result<u32> {
    let load = loader
        .load(host, image)
        .with_context(|| image.to_string())?;
    for module in loader.modules().iter() {
        println!("    {:08X}: {}", module.base, module.name);
    }
    if args.exit {
        return Ok(0);
    }

    // Fabricate a context paused at the image's entry point.
    let (nt, _) = ldr::image_header(host, load.base).with_context(|| image.to_string())?;
    let stack = host
        .alloc(0x1_0000)
        .context("could not allocate a stack")?;

    let mut dbg = Debugger::new();
    dbg.prompt(Console::new()?);
    load_symbols(&mut dbg, host, image, load.base);

    let mut session = Session::new(std::mem::replace(host, FlatHost::default()));
    session.modules = loader
        .modules()
        .iter()
        .map(|module| (module.base, module.name.clone()))
        .collect();
    session.frame.cs = FLAT_CS;
    session.frame.ss = FLAT_DS;
    session.frame.ds = FLAT_DS;
    session.frame.es = FLAT_DS;
    session.frame.eip = load.base.wrapping_add(nt.optional.address_of_entry_point);
    session.frame.esp = stack.wrapping_add(0x1_0000);
    session.frame.eflags = flag::IF | 0x2;
    session.events.push_back(Event {
        vector: 3,
        error_code: 0,
        aux: 0,
    });

    dbg.run(&mut session)?;
    Ok(0)
}

/// Feeds the image's COFF symbols into the debugger, prefixed with the
/// module name.
fn load_symbols(dbg: &mut Debugger, host: &mut FlatHost, image: &str, base: u32) {
    let stem = Path::new(image)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.to_string());
    let mut count = 0usize;
    let result = ldr::symbols(host, image, base, &mut |addr, name| {
        dbg.symbols_mut().add(addr, &format!("{stem}!{name}"));
        count += 1;
    });
    match result {
        Ok(()) if count > 0 => println!("({count} coff symbols)"),
        Ok(()) => println!("(no symbols found)"),
        Err(err) => warn!("symbol load failed: {err}"),
    }
}
