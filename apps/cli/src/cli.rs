//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// 32-bit protected-mode extender and 80386 debugger.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// PE executable to launch.
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub image: PathBuf,

    /// Logging level.
    ///
    /// A comma-separated list of logging directives, parsed after
    /// `RUST_LOG`.
    #[arg(short, long)]
    #[arg(env = "RUST_LOG")]
    pub log: Option<String>,

    /// Exit after loading the image.
    ///
    /// Loads the image and its dependencies, prints the module list, and
    /// returns without transferring control.
    #[arg(short = 'x', long)]
    pub exit: bool,

    /// Break into the debugger after loading.
    #[arg(short, long)]
    pub debug: bool,

    /// Linear address the allocator starts handing out memory at, in
    /// hexadecimal.
    #[arg(long, value_parser = parse_hex, default_value = "400000")]
    pub base: u32,
}

/// Parses a bare hexadecimal number.
fn parse_hex(text: &str) -> Result<u32, String> {
    u32::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|err| err.to_string())
}
