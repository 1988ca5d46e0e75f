//! Debugger command language.
//!
//! A line is tokenized, the first token selects a verb by prefix, and the
//! remaining tokens parse into addresses, ranges, and expressions against
//! the target's live register state.

use displaydoc::Display;
use dx32_core::x86::Reg;
use thiserror::Error;

use crate::bpt::Access;

pub mod addr;
pub mod expr;
pub mod token;

pub use self::addr::{Addr, Defaults, Range, Space};
pub use self::expr::Scope;
pub use self::token::{tokenize, Kind, Token};

use self::addr::{extent, parse_addr, parse_range, resolve};

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Memory access granularity of the display/enter/fill commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Size {
    /// One byte.
    #[default]
    Byte,
    /// 16-bit word.
    Word,
    /// 32-bit doubleword.
    Dword,
}

impl Size {
    /// Width in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    fn from_suffix(suffix: &str) -> Option<Option<Self>> {
        match suffix {
            "" => Some(None),
            "b" => Some(Some(Self::Byte)),
            "w" => Some(Some(Self::Word)),
            "d" => Some(Some(Self::Dword)),
            _ => None,
        }
    }
}

/// A parsed debugger command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `d[b|w|d] [range]`
    Dump {
        size: Option<Size>,
        range: Option<Range>,
    },
    /// `e[b|w|d] addr values...`
    Enter {
        size: Option<Size>,
        addr: Addr,
        values: Vec<u32>,
    },
    /// `f[b|w|d] range values...`
    Fill {
        size: Option<Size>,
        range: Range,
        pattern: Vec<u32>,
    },
    /// `c range addr`
    Compare { range: Range, with: Addr },
    /// `s range pattern`
    Search { range: Range, pattern: Vec<u8> },
    /// `k`
    StackTrace,
    /// `bp[id] addr`
    Break { id: Option<usize>, addr: Addr },
    /// `ba[id] access size addr`
    Watch {
        id: Option<usize>,
        access: Access,
        size: u8,
        addr: Addr,
    },
    /// `bc ids...`
    BpClear(Vec<usize>),
    /// `bd ids...`
    BpDisable(Vec<usize>),
    /// `be ids...`
    BpEnable(Vec<usize>),
    /// `bl`
    BpList,
    /// `g [addr]`
    Go { addr: Option<Addr> },
    /// `gu`
    GoUp,
    /// `t [=addr] [count]`
    Trace { addr: Option<Addr>, count: u32 },
    /// `p [=addr] [count]`
    Step { addr: Option<Addr>, count: u32 },
    /// `r [reg [= value]]`
    Regs {
        reg: Option<Reg>,
        value: Option<u32>,
    },
    /// `u [range]`
    Unassemble { range: Option<Range> },
    /// `a [addr]`
    Assemble { addr: Option<Addr> },
    /// `x pattern`
    Examine { pattern: String },
    /// `lm`
    Modules,
    /// `ln expr`
    Near { linear: u32 },
    /// `dg [selectors...]`
    Selectors(Vec<u16>),
    /// `didt [vectors...]`
    Idt(Vec<u32>),
    /// `divt [vectors...]`
    Ivt(Vec<u32>),
    /// `? expr`
    Eval { value: u32 },
    /// `?`
    Help,
    /// `q`
    Quit,
}

/// Parses one tokenized command line.
///
/// # Errors
///
/// Fails with [`Error::Unknown`] for unrecognized verbs, and with
/// [`Error::Parse`]/[`Error::Range`] for malformed arguments.
pub fn parse(tokens: &[Token], scope: &dyn Scope, dfl: &Defaults) -> Result<Command> {
    let Some(verb) = tokens.first() else {
        return Err(Error::Unknown);
    };
    let rest = 1;

    if verb.kind != Kind::Ident {
        return Err(Error::Unknown);
    }
    let name = verb.text.to_ascii_lowercase();

    // Exact verbs first; the d-family suffix match would eat these.
    match name.as_str() {
        "?" => return question(tokens, rest, scope),
        "q" => return Ok(Command::Quit),
        "k" => return Ok(Command::StackTrace),
        "lm" => return Ok(Command::Modules),
        "g" => {
            let addr = parse_addr(tokens, rest, scope, dfl)?.map(|(addr, _)| addr);
            return Ok(Command::Go { addr });
        }
        "gu" => return Ok(Command::GoUp),
        "t" | "p" => {
            let (addr, count) = step_args(tokens, rest, scope, dfl)?;
            return Ok(if name == "t" {
                Command::Trace { addr, count }
            } else {
                Command::Step { addr, count }
            });
        }
        "r" => return regs(tokens, rest, scope),
        "u" => {
            let range = parse_range(tokens, rest, scope, dfl, 0x20)?.map(|(range, _)| range);
            return Ok(Command::Unassemble { range });
        }
        "a" => {
            let addr = parse_addr(tokens, rest, scope, dfl)?.map(|(addr, _)| addr);
            return Ok(Command::Assemble { addr });
        }
        "x" => {
            // The tokenizer splits `mod!sym*` at the operators; stitch
            // the pattern back together.
            if tokens.len() == rest {
                return Err(Error::Parse);
            }
            let pattern = tokens[rest..]
                .iter()
                .map(|t| t.text.trim_matches('"'))
                .collect::<String>();
            return Ok(Command::Examine { pattern });
        }
        "ln" => {
            let end = extent(tokens, rest);
            if end == rest {
                return Err(Error::Parse);
            }
            let linear = resolve(&tokens[rest..end], scope)?;
            return Ok(Command::Near { linear });
        }
        "dg" => {
            let list = values(tokens, rest, scope)?;
            let list = list
                .into_iter()
                .map(|v| u16::try_from(v).map_err(|_| Error::Parse))
                .collect::<Result<_>>()?;
            return Ok(Command::Selectors(list));
        }
        "didt" => return Ok(Command::Idt(values(tokens, rest, scope)?)),
        "divt" => return Ok(Command::Ivt(values(tokens, rest, scope)?)),
        "c" => {
            let (range, next) = parse_range(tokens, rest, scope, dfl, 0x10)?.ok_or(Error::Parse)?;
            let (with, _) = parse_addr(tokens, next, scope, dfl)?.ok_or(Error::Parse)?;
            return Ok(Command::Compare { range, with });
        }
        "s" => {
            let (range, next) = parse_range(tokens, rest, scope, dfl, 0x10)?.ok_or(Error::Parse)?;
            let pattern = bytes(tokens, next, scope)?;
            if pattern.is_empty() {
                return Err(Error::Parse);
            }
            return Ok(Command::Search { range, pattern });
        }
        "bl" => return Ok(Command::BpList),
        "bc" | "bd" | "be" => {
            let ids = values(tokens, rest, scope)?
                .into_iter()
                .map(|v| v as usize)
                .collect();
            return Ok(match name.as_str() {
                "bc" => Command::BpClear(ids),
                "bd" => Command::BpDisable(ids),
                _ => Command::BpEnable(ids),
            });
        }
        _ => (),
    }

    // `bp[id]` and `ba[id]` carry the slot index in the verb itself.
    if let Some(suffix) = name.strip_prefix("bp") {
        let id = slot_id(suffix)?;
        let (addr, _) = parse_addr(tokens, rest, scope, dfl)?.ok_or(Error::Parse)?;
        return Ok(Command::Break { id, addr });
    }
    if let Some(suffix) = name.strip_prefix("ba") {
        let id = slot_id(suffix)?;
        let access = tokens
            .get(rest)
            .and_then(|t| Access::from_letter(t.text))
            .ok_or(Error::Parse)?;
        let size_end = extent(tokens, rest + 1);
        if size_end == rest + 1 {
            return Err(Error::Parse);
        }
        let size = resolve(&tokens[rest + 1..size_end], scope)?;
        if !matches!(size, 1 | 2 | 4) {
            return Err(Error::Parse);
        }
        let (addr, _) = parse_addr(tokens, size_end, scope, dfl)?.ok_or(Error::Parse)?;
        return Ok(Command::Watch {
            id,
            access,
            size: size as u8,
            addr,
        });
    }

    // The d/e/f families take a size suffix.
    if let Some(suffix) = name.strip_prefix('d') {
        if let Some(size) = Size::from_suffix(suffix) {
            let range = parse_range(tokens, rest, scope, dfl, 0x10)?.map(|(range, _)| range);
            return Ok(Command::Dump { size, range });
        }
    }
    if let Some(suffix) = name.strip_prefix('e') {
        if let Some(size) = Size::from_suffix(suffix) {
            let (addr, next) = parse_addr(tokens, rest, scope, dfl)?.ok_or(Error::Parse)?;
            let values = values(tokens, next, scope)?;
            return Ok(Command::Enter { size, addr, values });
        }
    }
    if let Some(suffix) = name.strip_prefix('f') {
        if let Some(size) = Size::from_suffix(suffix) {
            let (range, next) = parse_range(tokens, rest, scope, dfl, 0x10)?.ok_or(Error::Parse)?;
            let pattern = values(tokens, next, scope)?;
            if pattern.is_empty() {
                return Err(Error::Parse);
            }
            return Ok(Command::Fill {
                size,
                range,
                pattern,
            });
        }
    }

    Err(Error::Unknown)
}

/// Parses `? [expr]`.
fn question(tokens: &[Token], at: usize, scope: &dyn Scope) -> Result<Command> {
    let end = extent(tokens, at);
    if end == at {
        return Ok(Command::Help);
    }
    let value = resolve(&tokens[at..end], scope)?;
    Ok(Command::Eval { value })
}

/// Parses the optional slot index glued onto `bp`/`ba`.
fn slot_id(suffix: &str) -> Result<Option<usize>> {
    if suffix.is_empty() {
        return Ok(None);
    }
    suffix.parse().map(Some).map_err(|_| Error::Parse)
}

/// Parses `[=addr] [count]` for the trace and step commands.
fn step_args(
    tokens: &[Token],
    at: usize,
    scope: &dyn Scope,
    dfl: &Defaults,
) -> Result<(Option<Addr>, u32)> {
    let mut at = at;
    let mut addr = None;

    if let Some((seed, next)) = eq_addr(tokens, at, scope, dfl)? {
        addr = Some(seed);
        at = next;
    }

    let end = extent(tokens, at);
    let count = if end == at {
        1
    } else {
        resolve(&tokens[at..end], scope)?.max(1)
    };
    Ok((addr, count))
}

/// Parses a `=addr` argument; the `=` may be glued to the expression.
fn eq_addr(
    tokens: &[Token],
    at: usize,
    scope: &dyn Scope,
    dfl: &Defaults,
) -> Result<Option<(Addr, usize)>> {
    let Some(first) = tokens.get(at) else {
        return Ok(None);
    };
    if first.kind != Kind::Ident || !first.text.starts_with('=') {
        return Ok(None);
    }
    if first.text == "=" {
        let parsed = parse_addr(tokens, at + 1, scope, dfl)?.ok_or(Error::Parse)?;
        return Ok(Some(parsed));
    }
    // The `=` is glued; re-point the first token past it.
    let mut temp: Vec<Token> = Vec::with_capacity(tokens.len() - at);
    temp.push(Token {
        text: &first.text[1..],
        kind: Kind::Ident,
    });
    temp.extend_from_slice(&tokens[at + 1..]);
    let (addr, used) = parse_addr(&temp, 0, scope, dfl)?.ok_or(Error::Parse)?;
    Ok(Some((addr, at + used)))
}

/// Parses `r [reg [= value]]`.
fn regs(tokens: &[Token], at: usize, scope: &dyn Scope) -> Result<Command> {
    let Some(name) = tokens.get(at) else {
        return Ok(Command::Regs {
            reg: None,
            value: None,
        });
    };
    let reg: Reg = name.text.parse().map_err(|()| Error::Parse)?;

    let Some(next) = tokens.get(at + 1) else {
        return Ok(Command::Regs {
            reg: Some(reg),
            value: None,
        });
    };
    // Accept both `r eax = expr` and `r eax =expr`.
    let value = if next.text == "=" {
        let end = extent(tokens, at + 2);
        if end == at + 2 {
            return Err(Error::Parse);
        }
        resolve(&tokens[at + 2..end], scope)?
    } else if let Some(glued) = next.text.strip_prefix('=') {
        let mut temp: Vec<Token> = vec![Token {
            text: glued,
            kind: Kind::Ident,
        }];
        temp.extend_from_slice(&tokens[at + 2..]);
        let end = extent(&temp, 0);
        if end == 0 {
            return Err(Error::Parse);
        }
        resolve(&temp[..end], scope)?
    } else {
        return Err(Error::Parse);
    };
    Ok(Command::Regs {
        reg: Some(reg),
        value: Some(value),
    })
}

/// Parses a list of expressions, comma- or space-separated.
fn values(tokens: &[Token], at: usize, scope: &dyn Scope) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut at = at;
    while at < tokens.len() {
        if tokens[at].is_op(',') {
            at += 1;
            continue;
        }
        let end = extent(tokens, at);
        if end == at {
            return Err(Error::Parse);
        }
        out.push(resolve(&tokens[at..end], scope)?);
        at = end;
    }
    Ok(out)
}

/// Parses a search pattern: byte values and quoted strings.
fn bytes(tokens: &[Token], at: usize, scope: &dyn Scope) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut at = at;
    while at < tokens.len() {
        let token = &tokens[at];
        if token.is_op(',') {
            at += 1;
            continue;
        }
        if token.kind == Kind::Str {
            let inner = token.text.trim_matches('"');
            out.extend_from_slice(inner.as_bytes());
            at += 1;
            continue;
        }
        let end = extent(tokens, at);
        if end == at {
            return Err(Error::Parse);
        }
        let value = resolve(&tokens[at..end], scope)?;
        out.push(value as u8);
        at = end;
    }
    Ok(out)
}

/// Help topics; the doc comments are the user-visible text.
#[derive(Clone, Copy, Debug, Display)]
pub enum Keyword {
    /**
     * A [<address>] - assemble
     * B[C|D|E] [<bps>] - clear/disable/enable breakpoint(s)
     * BL - list breakpoints
     * BA[id] <access> <size> <addr> - set processor breakpoint
     * BP[id] <address> - set soft breakpoint
     * C <range> <address> - compare memory
     * D[type] [<range>] - display memory
     * E[type] <address> [<values>] - enter memory values
     * F[type] <range> <list> - fill memory with pattern
     * G [<address>] - go
     * GU - go up (run to return)
     * K - stacktrace
     * LM - list loaded modules
     * LN <expr> - list nearest symbols
     * P [=<addr>] [<count=1>] - program step
     * Q - quit
     * R [<reg> [=<expr>]] - view or set registers
     * S <range> <list> - search memory for pattern
     * T [=<addr>] [<count=1>] - trace / step in
     * U [<range>] - unassemble
     * X <wildcard> - view symbols
     * ? <expr> - display expression
     */
    Commands,
    /**
     * <expr> unary ops: - ~
     *        binary ops: + - * << >> & ^ |
     *        operands: number in hexadecimal, public symbol, <reg>
     * <type> : b (byte), w (word), d (doubleword)
     * <range>: <address> <address>
     *          <address> L <count>
     */
    Grammar,
    /**
     * x86 options:
     * DG [<list>] - dump selectors
     * DIDT [<list>] - dump interrupt descriptors
     * DIVT [<list>] - dump interrupt vectors
     * <reg> : [e]ax, [e]bx, [e]cx, [e]dx, [e]si, [e]di, [e]bp, [e]sp,
     *         al, ah, bl, bh, cl, ch, dl, dh, cs, ds, es, fs, gs, ss
     * <addr>: %<protect-mode [seg:]address>
     *         &<real/V86-mode [seg:]address>
     *         @<linear address>
     */
    X86,
}

/// An error raised while parsing or running a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The line exceeds the token limit.
    #[error("Too many tokens")]
    TooMany,
    /// Malformed expression or arguments.
    #[error("Syntax error")]
    Parse,
    /// Malformed or inverted memory range.
    #[error("Range error")]
    Range,
    /// Unrecognized verb.
    #[error("Unknown")]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fix;

    impl Scope for Fix {
        fn reg(&self, reg: Reg) -> u32 {
            match reg {
                Reg::Ebx => 0x2000,
                Reg::Esi => 0x4,
                _ => 0,
            }
        }

        fn symbol(&self, _name: &str) -> Option<u32> {
            None
        }
    }

    const DFL: Defaults = Defaults {
        space: Space::Linear,
        cs: 0,
        eip: 0x1000,
    };

    fn parse_line(line: &str) -> Result<Command> {
        let tokens = tokenize(line)?;
        parse(&tokens, &Fix, &DFL)
    }

    #[test]
    fn eval_command_computes() {
        assert_eq!(parse_line("? 1+2*3").unwrap(), Command::Eval { value: 7 });
        assert_eq!(
            parse_line("? ~0").unwrap(),
            Command::Eval { value: 0xFFFF_FFFF }
        );
        assert_eq!(parse_line("? (1+2)*3").unwrap(), Command::Eval { value: 9 });
        assert_eq!(parse_line("?").unwrap(), Command::Help);
    }

    #[test]
    fn dump_accepts_sizes_and_ranges() {
        let Command::Dump { size, range } = parse_line("dd 1000 l 40").unwrap() else {
            panic!("not a dump");
        };
        assert_eq!(size, Some(Size::Dword));
        let range = range.unwrap();
        assert_eq!(range.start.linear, 0x1000);
        assert_eq!(range.len(), 0x40);

        assert_eq!(
            parse_line("d").unwrap(),
            Command::Dump {
                size: None,
                range: None
            }
        );
    }

    #[test]
    fn dump_with_register_operand() {
        let Command::Dump { range, .. } = parse_line("d EBX+ESI*4+10").unwrap() else {
            panic!("not a dump");
        };
        assert_eq!(range.unwrap().start.linear, 0x2000 + 0x4 * 4 + 0x10);
    }

    #[test]
    fn breakpoint_verbs_carry_slot_ids() {
        assert_eq!(
            parse_line("bp 401000").unwrap(),
            Command::Break {
                id: None,
                addr: Addr::new(Space::Linear, 0, 0x0040_1000)
            }
        );
        let Command::Break { id, .. } = parse_line("bp3 401000").unwrap() else {
            panic!("not a break");
        };
        assert_eq!(id, Some(3));

        let Command::Watch {
            id,
            access,
            size,
            addr,
        } = parse_line("ba1 w 4 2000").unwrap()
        else {
            panic!("not a watch");
        };
        assert_eq!(id, Some(1));
        assert_eq!(access, Access::Write);
        assert_eq!(size, 4);
        assert_eq!(addr.linear, 0x2000);
    }

    #[test]
    fn breakpoint_lists_parse() {
        assert_eq!(parse_line("bc 0 1").unwrap(), Command::BpClear(vec![0, 1]));
        assert_eq!(parse_line("bl").unwrap(), Command::BpList);
        assert_eq!(parse_line("be 2").unwrap(), Command::BpEnable(vec![2]));
    }

    #[test]
    fn step_args_parse() {
        assert_eq!(
            parse_line("t").unwrap(),
            Command::Trace {
                addr: None,
                count: 1
            }
        );
        let Command::Trace { addr, count } = parse_line("t =1000 5").unwrap() else {
            panic!("not a trace");
        };
        assert_eq!(addr.unwrap().linear, 0x1000);
        assert_eq!(count, 5);
        let Command::Step { addr, count } = parse_line("p = 1000").unwrap() else {
            panic!("not a step");
        };
        assert_eq!(addr.unwrap().linear, 0x1000);
        assert_eq!(count, 1);
    }

    #[test]
    fn register_commands_parse() {
        assert_eq!(
            parse_line("r").unwrap(),
            Command::Regs {
                reg: None,
                value: None
            }
        );
        assert_eq!(
            parse_line("r eax").unwrap(),
            Command::Regs {
                reg: Some(Reg::Eax),
                value: None
            }
        );
        assert_eq!(
            parse_line("r eax = 1234").unwrap(),
            Command::Regs {
                reg: Some(Reg::Eax),
                value: Some(0x1234)
            }
        );
        assert_eq!(
            parse_line("r eax =5+5").unwrap(),
            Command::Regs {
                reg: Some(Reg::Eax),
                value: Some(0xA)
            }
        );
    }

    #[test]
    fn enter_and_fill_take_value_lists() {
        let Command::Enter { size, addr, values } = parse_line("ew 1000 1234, 5678").unwrap()
        else {
            panic!("not an enter");
        };
        assert_eq!(size, Some(Size::Word));
        assert_eq!(addr.linear, 0x1000);
        assert_eq!(values, vec![0x1234, 0x5678]);

        let Command::Fill { pattern, .. } = parse_line("f 1000 l 10 cc").unwrap() else {
            panic!("not a fill");
        };
        assert_eq!(pattern, vec![0xCC]);
    }

    #[test]
    fn search_accepts_strings() {
        let Command::Search { pattern, .. } = parse_line("s 1000 l 100 \"PE\" 0").unwrap() else {
            panic!("not a search");
        };
        assert_eq!(pattern, b"PE\0");
    }

    #[test]
    fn examine_patterns_reassemble() {
        assert_eq!(
            parse_line("x app!_m*").unwrap(),
            Command::Examine {
                pattern: "app!_m*".into()
            }
        );
    }

    #[test]
    fn unknown_verbs_are_unknown() {
        assert_eq!(parse_line("zzz").unwrap_err(), Error::Unknown);
        assert_eq!(parse_line("dq 0").unwrap_err(), Error::Unknown);
    }

    #[test]
    fn help_text_lists_the_verbs() {
        let help = Keyword::Commands.to_string();
        assert!(help.contains("BP[id]"));
        assert!(help.contains("display memory"));
    }
}
