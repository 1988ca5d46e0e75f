//! Address and range parsing.
//!
//! An address is one of three spaces: linear (`@`), protected-mode
//! segmented (`%`), or real/V86-mode segmented (`&`), optionally written
//! `selector:offset`. Every address carries its flat linear form,
//! computed on construction. A range is `start end` or `start l count`.

use std::fmt::Display;

use super::expr::{self, Eval, RegCount, Scope};
use super::token::{Kind, Token};
use super::Error;

/// Address space of an [`Addr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    /// Flat linear address.
    Linear,
    /// Protected-mode `selector:offset`.
    Prot,
    /// Real or V86-mode `segment:offset`.
    Real,
}

/// A parsed address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addr {
    pub space: Space,
    pub selector: u16,
    pub offset: u32,
    pub linear: u32,
}

impl Addr {
    /// Constructs an address, computing its linear form.
    ///
    /// Real-mode addresses use the classic `(segment << 4) + offset`;
    /// protected-mode addresses assume the flat model, so the selector
    /// contributes nothing and is kept only for display.
    #[must_use]
    pub fn new(space: Space, selector: u16, offset: u32) -> Self {
        let linear = match space {
            Space::Linear => offset,
            Space::Prot => offset,
            Space::Real => (u32::from(selector) << 4).wrapping_add(offset),
        };
        Self {
            space,
            selector,
            offset,
            linear,
        }
    }

    /// This address advanced by `count` bytes.
    #[must_use]
    pub fn advanced(&self, count: u32) -> Self {
        Self {
            space: self.space,
            selector: self.selector,
            offset: self.offset.wrapping_add(count),
            linear: self.linear.wrapping_add(count),
        }
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.space {
            Space::Linear => write!(f, "@{:08X}", self.linear),
            Space::Prot => write!(f, "%{:04X}:{:08X}", self.selector, self.offset),
            Space::Real => write!(f, "&{:04X}:{:08X}", self.selector, self.offset),
        }
    }
}

/// A memory range; `end.linear` is never below `start.linear`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: Addr,
    pub end: Addr,
}

impl Range {
    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.end.linear - self.start.linear
    }

    /// Whether the range is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parsing defaults taken from the target's current state.
#[derive(Clone, Copy, Debug)]
pub struct Defaults {
    /// Space assumed when no prefix is written.
    pub space: Space,
    /// Selector assumed when no `selector:` is written.
    pub cs: u16,
    /// Offset assumed when no address is written at all.
    pub eip: u32,
}

impl Defaults {
    /// The default address: current CS:EIP.
    #[must_use]
    pub fn here(&self) -> Addr {
        Addr::new(self.space, self.cs, self.eip)
    }
}

/// Expression operators, as opposed to the full delimiter set.
fn is_expr_op(ch: char) -> bool {
    matches!(ch, '+' | '-' | '*' | '<' | '>' | '&' | '|' | '~' | '^')
}

/// Finds where the expression starting at `at` ends (exclusive).
///
/// Walks the operand/operator alternation, treating a parenthesized group
/// as one operand; anything that breaks the alternation (another operand,
/// `:`, `,`, a string) terminates the expression.
pub(crate) fn extent(tokens: &[Token], at: usize) -> usize {
    #[derive(PartialEq)]
    enum Mode {
        Operand,
        Operator,
        Paren,
    }

    if at >= tokens.len() {
        return at;
    }
    let mut depth = 0i32;
    let mut mode = match tokens[at].head() {
        '(' => {
            depth = 1;
            Mode::Paren
        }
        '~' | '-' => Mode::Operand,
        _ => Mode::Operator,
    };

    for (index, token) in tokens.iter().enumerate().skip(at + 1) {
        let ch = token.head();
        match mode {
            Mode::Operand => match ch {
                '~' | '-' => (),
                '(' => {
                    depth = 1;
                    mode = Mode::Paren;
                }
                _ => mode = Mode::Operator,
            },
            Mode::Operator => {
                if token.kind == Kind::Op && is_expr_op(ch) {
                    mode = Mode::Operand;
                } else {
                    return index;
                }
            }
            Mode::Paren => {
                if ch == '(' {
                    depth += 1;
                } else if ch == ')' {
                    depth -= 1;
                    if depth == 0 {
                        mode = Mode::Operator;
                    }
                }
            }
        }
    }

    tokens.len()
}

/// Evaluates the token view to a flat number, resolving any register
/// decomposition against live register values.
pub(crate) fn resolve(view: &[Token], scope: &dyn Scope) -> Result<u32, Error> {
    let mut cnt = RegCount::default();
    match expr::eval_mem(view, scope, &mut cnt)? {
        Eval::Value(value) => Ok(value),
        Eval::Index(disp) => Ok(cnt.iter().fold(disp, |acc, (base, scale)| {
            acc.wrapping_add(scope.reg(base.reg()).wrapping_mul(scale))
        })),
    }
}

/// Parses one address starting at token `at`.
///
/// Returns the address and the index of the first token after it, or
/// `None` when there is nothing to parse there.
///
/// # Errors
///
/// Fails with [`Error::Parse`] on a malformed expression.
pub fn parse_addr(
    tokens: &[Token],
    at: usize,
    scope: &dyn Scope,
    dfl: &Defaults,
) -> Result<Option<(Addr, usize)>, Error> {
    let mut i = at;
    if i >= tokens.len() {
        return Ok(None);
    }

    // Space prefix, if any.
    let space = match tokens[i].head() {
        '@' if tokens[i].kind == Kind::Op => Some(Space::Linear),
        '%' if tokens[i].kind == Kind::Op => Some(Space::Prot),
        '&' if tokens[i].kind == Kind::Op => Some(Space::Real),
        _ => None,
    };
    let prefixed = space.is_some();
    if prefixed {
        i += 1;
    }
    let space = space.unwrap_or(dfl.space);

    let end = extent(tokens, i);
    if end == i {
        // A bare prefix with no expression behind it is malformed.
        return if prefixed { Err(Error::Parse) } else { Ok(None) };
    }
    let first = resolve(&tokens[i..end], scope)?;

    if space == Space::Linear {
        return Ok(Some((Addr::new(space, 0, first), end)));
    }

    // A `:` makes the first expression the selector.
    if tokens.get(end).is_some_and(|t| t.is_op(':')) {
        let from = end + 1;
        let stop = extent(tokens, from);
        if stop == from {
            return Err(Error::Parse);
        }
        let offset = resolve(&tokens[from..stop], scope)?;
        let selector = u16::try_from(first).map_err(|_| Error::Parse)?;
        Ok(Some((Addr::new(space, selector, offset), stop)))
    } else {
        Ok(Some((Addr::new(space, dfl.cs, first), end)))
    }
}

/// Parses a range starting at token `at`.
///
/// Accepts `start end` and `start l count`; a lone `start` covers
/// `fallback` bytes. Returns `None` when there is no range at all.
///
/// # Errors
///
/// Fails with [`Error::Parse`] on malformed expressions and with
/// [`Error::Range`] when the end lies below the start.
pub fn parse_range(
    tokens: &[Token],
    at: usize,
    scope: &dyn Scope,
    dfl: &Defaults,
    fallback: u32,
) -> Result<Option<(Range, usize)>, Error> {
    let Some((start, next)) = parse_addr(tokens, at, scope, dfl)? else {
        return Ok(None);
    };

    // `start l count` form.
    if tokens
        .get(next)
        .is_some_and(|t| t.kind == Kind::Ident && t.text.eq_ignore_ascii_case("l"))
    {
        let from = next + 1;
        let stop = extent(tokens, from);
        if stop == from {
            return Err(Error::Parse);
        }
        let count = resolve(&tokens[from..stop], scope)?;
        let end = start.advanced(count);
        if end.linear < start.linear {
            return Err(Error::Range);
        }
        return Ok(Some((Range { start, end }, stop)));
    }

    // `start end` form.
    if let Some((end, stop)) = parse_addr(tokens, next, scope, dfl)? {
        if end.linear < start.linear {
            return Err(Error::Range);
        }
        return Ok(Some((Range { start, end }, stop)));
    }

    // Lone start; cover the fallback window.
    Ok(Some((
        Range {
            start,
            end: start.advanced(fallback),
        },
        next,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::token::tokenize;
    use dx32_core::x86::Reg;

    struct Fix;

    impl Scope for Fix {
        fn reg(&self, reg: Reg) -> u32 {
            match reg {
                Reg::Ebx => 0x2000,
                Reg::Esi => 0x10,
                _ => 0,
            }
        }

        fn symbol(&self, _name: &str) -> Option<u32> {
            None
        }
    }

    const DFL: Defaults = Defaults {
        space: Space::Real,
        cs: 0x01A7,
        eip: 0x1234,
    };

    fn addr(line: &str) -> Addr {
        let tokens = tokenize(line).unwrap();
        parse_addr(&tokens, 0, &Fix, &DFL).unwrap().unwrap().0
    }

    #[test]
    fn linear_addresses_pass_through() {
        let a = addr("@12345");
        assert_eq!(a.space, Space::Linear);
        assert_eq!(a.linear, 0x12345);
    }

    #[test]
    fn real_mode_shifts_the_selector() {
        let a = addr("&1a7:100");
        assert_eq!(a.space, Space::Real);
        assert_eq!(a.selector, 0x01A7);
        assert_eq!(a.offset, 0x100);
        assert_eq!(a.linear, 0x1B70);
    }

    #[test]
    fn protected_mode_is_flat() {
        let a = addr("%30:4000");
        assert_eq!(a.space, Space::Prot);
        assert_eq!(a.selector, 0x30);
        assert_eq!(a.linear, 0x4000);
    }

    #[test]
    fn bare_offsets_use_cs() {
        let a = addr("400");
        assert_eq!(a.space, Space::Real);
        assert_eq!(a.selector, DFL.cs);
        assert_eq!(a.linear, (u32::from(DFL.cs) << 4) + 0x400);
    }

    #[test]
    fn register_operands_resolve() {
        let a = addr("@EBX+ESI*4+10");
        assert_eq!(a.linear, 0x2000 + 0x10 * 4 + 0x10);
    }

    #[test]
    fn missing_expression_after_prefix_fails() {
        let tokens = tokenize("@").unwrap();
        assert!(parse_addr(&tokens, 0, &Fix, &DFL).is_err());
    }

    #[test]
    fn range_with_count() {
        let tokens = tokenize("@1000 l 20").unwrap();
        let (range, next) = parse_range(&tokens, 0, &Fix, &DFL, 16).unwrap().unwrap();
        assert_eq!(range.start.linear, 0x1000);
        assert_eq!(range.end.linear, 0x1020);
        assert_eq!(next, tokens.len());
    }

    #[test]
    fn range_with_two_addresses() {
        let tokens = tokenize("@1000 @1080").unwrap();
        let (range, _) = parse_range(&tokens, 0, &Fix, &DFL, 16).unwrap().unwrap();
        assert_eq!(range.len(), 0x80);
    }

    #[test]
    fn backwards_ranges_fail() {
        let tokens = tokenize("@1000 @800").unwrap();
        assert_eq!(
            parse_range(&tokens, 0, &Fix, &DFL, 16).unwrap_err(),
            Error::Range
        );
    }

    #[test]
    fn lone_start_covers_the_fallback() {
        let tokens = tokenize("@1000").unwrap();
        let (range, _) = parse_range(&tokens, 0, &Fix, &DFL, 16).unwrap().unwrap();
        assert_eq!(range.end.linear, 0x1010);
    }

    #[test]
    fn expression_extent_stops_at_delimiters() {
        let tokens = tokenize("1a7:100").unwrap();
        assert_eq!(extent(&tokens, 0), 1);
        let tokens = tokenize("(1+2)*3 400").unwrap();
        assert_eq!(extent(&tokens, 0), 7);
    }
}
