//! Expression evaluator.
//!
//! Evaluates C-style integer expressions over token views by scanning for
//! the lowest-precedence operator at paren depth zero, splitting there,
//! and recursing on both halves. Numbers are hexadecimal; registers and
//! user symbols resolve through a [`Scope`] supplied by the caller.
//!
//! Two modes exist. In value mode every operand is a number. In
//! memory-operand mode register identifiers accumulate into a
//! [`RegCount`] instead of producing their live value, decomposing forms
//! like `EBX+ESI*4+10` into base, scaled index, and displacement; only
//! addition and register-times-constant may involve a register there.

use dx32_core::x86::Reg;

use super::token::{Kind, Token};
use super::Error;

/// Resolves registers and symbols for the evaluator.
pub trait Scope {
    /// Current value of a register.
    fn reg(&self, reg: Reg) -> u32;

    /// Address of a user symbol, if known.
    fn symbol(&self, name: &str) -> Option<u32>;
}

/// Registers legal as a memory-operand base or index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Base {
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    Bx, Bp, Si, Di,
}

/// Number of [`Base`] registers.
pub const BASES: usize = 12;

impl Base {
    #[rustfmt::skip]
    const ALL: [Base; BASES] = [
        Base::Eax, Base::Ecx, Base::Edx, Base::Ebx,
        Base::Esp, Base::Ebp, Base::Esi, Base::Edi,
        Base::Bx, Base::Bp, Base::Si, Base::Di,
    ];

    fn from_name(name: &str) -> Option<Self> {
        #[rustfmt::skip]
        const NAMES: [&str; BASES] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi",
            "bx", "bp", "si", "di",
        ];
        let name = name.to_ascii_lowercase();
        NAMES
            .iter()
            .position(|&n| n == name)
            .map(|index| Self::ALL[index])
    }

    /// The register this base indexes.
    #[must_use]
    #[rustfmt::skip]
    pub fn reg(self) -> Reg {
        match self {
            Self::Eax => Reg::Eax, Self::Ecx => Reg::Ecx,
            Self::Edx => Reg::Edx, Self::Ebx => Reg::Ebx,
            Self::Esp => Reg::Esp, Self::Ebp => Reg::Ebp,
            Self::Esi => Reg::Esi, Self::Edi => Reg::Edi,
            Self::Bx => Reg::Bx, Self::Bp => Reg::Bp,
            Self::Si => Reg::Si, Self::Di => Reg::Di,
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|&b| b == self).unwrap_or(0)
    }
}

/// Per-register counters for memory-operand decomposition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegCount {
    counts: [u32; BASES],
}

impl RegCount {
    fn add(&mut self, base: Base, scale: u32) {
        self.counts[base.index()] += scale;
    }

    /// The accumulated scale of a base register.
    #[must_use]
    pub fn get(&self, base: Base) -> u32 {
        self.counts[base.index()]
    }

    /// Whether any register participated.
    #[must_use]
    pub fn any(&self) -> bool {
        self.counts.iter().any(|&c| c != 0)
    }

    /// Iterates `(base, scale)` pairs with nonzero scale.
    pub fn iter(&self) -> impl Iterator<Item = (Base, u32)> + '_ {
        Base::ALL
            .iter()
            .zip(&self.counts)
            .filter(|(_, &scale)| scale != 0)
            .map(|(&base, &scale)| (base, scale))
    }
}

/// Result of a memory-operand evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eval {
    /// Plain numeric value; no registers involved.
    Value(u32),
    /// Registers participated; this is the displacement, with the
    /// register contribution in the caller's [`RegCount`].
    Index(u32),
}

/// Evaluation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Value,
    Memory,
}

/// Intermediate node: a number, or a register awaiting combination.
#[derive(Clone, Copy, Debug)]
enum Node {
    Num(u32),
    Reg(Option<Base>),
}

/// Evaluates an expression to a number.
///
/// # Errors
///
/// Fails with [`Error::Parse`] on any malformed expression.
pub fn eval(tokens: &[Token], scope: &dyn Scope) -> Result<u32, Error> {
    let mut cnt = RegCount::default();
    match parse(tokens, Mode::Value, &mut cnt, scope)? {
        Node::Num(value) => Ok(value),
        Node::Reg(_) => Err(Error::Parse),
    }
}

/// Evaluates an expression in memory-operand mode.
///
/// Register contributions accumulate into `cnt`; the return value carries
/// the displacement.
///
/// # Errors
///
/// Fails with [`Error::Parse`] on malformed expressions, or when a
/// register meets an operator other than `+` or a constant `*`.
pub fn eval_mem(tokens: &[Token], scope: &dyn Scope, cnt: &mut RegCount) -> Result<Eval, Error> {
    match parse(tokens, Mode::Memory, cnt, scope)? {
        Node::Num(value) => {
            if cnt.any() {
                Ok(Eval::Index(value))
            } else {
                Ok(Eval::Value(value))
            }
        }
        Node::Reg(Some(base)) => {
            cnt.add(base, 1);
            Ok(Eval::Index(0))
        }
        Node::Reg(None) => Err(Error::Parse),
    }
}

/// Operator precedence levels, lowest binding first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Or,
    Xor,
    And,
    Shift,
    AddSub,
    Mul,
    Unary,
}

const LEVELS: [Level; 7] = [
    Level::Or,
    Level::Xor,
    Level::And,
    Level::Shift,
    Level::AddSub,
    Level::Mul,
    Level::Unary,
];

fn parse(
    view: &[Token],
    mode: Mode,
    cnt: &mut RegCount,
    scope: &dyn Scope,
) -> Result<Node, Error> {
    if view.is_empty() {
        return Err(Error::Parse);
    }
    if view.len() == 1 {
        return atom(&view[0], mode, scope);
    }

    // Peel a paren spanning the whole view.
    if view[0].is_op('(') && matching_paren(view, 0) == Some(view.len() - 1) {
        return parse(&view[1..view.len() - 1], mode, cnt, scope);
    }

    for level in LEVELS {
        match level {
            Level::Or | Level::Xor | Level::And => {
                let op = match level {
                    Level::Or => '|',
                    Level::Xor => '^',
                    _ => '&',
                };
                if let Some(at) = rscan(view, |t| t.is_op(op)) {
                    let left = parse(&view[..at], mode, cnt, scope)?;
                    let right = parse(&view[at + 1..], mode, cnt, scope)?;
                    return combine(op, left, right, mode, cnt);
                }
            }
            Level::Mul => {
                // Scan left to right so register scale chains accumulate
                // into the register's counter.
                if let Some(at) = lscan(view, |t| t.is_op('*')) {
                    let left = parse(&view[..at], mode, cnt, scope)?;
                    let right = parse(&view[at + 1..], mode, cnt, scope)?;
                    return combine('*', left, right, mode, cnt);
                }
            }
            Level::Shift => {
                if let Some(at) = rscan(view, |t| t.is_op('<') || t.is_op('>')) {
                    let ch = view[at].head();
                    // A doubled character is the same operator; fuse it.
                    let lo = if at > 0 && view[at - 1].is_op(ch) {
                        at - 1
                    } else {
                        at
                    };
                    let left = parse(&view[..lo], mode, cnt, scope)?;
                    let right = parse(&view[at + 1..], mode, cnt, scope)?;
                    return combine(ch, left, right, mode, cnt);
                }
            }
            Level::AddSub => {
                // Scan right to left for left associativity; a candidate
                // whose left half fails to parse is a unary sign, so keep
                // scanning.
                let mut from = view.len();
                while let Some(at) = rscan(&view[..from], |t| t.is_op('+') || t.is_op('-')) {
                    if at == 0 {
                        break;
                    }
                    if let Ok(left) = parse(&view[..at], mode, cnt, scope) {
                        let right = parse(&view[at + 1..], mode, cnt, scope)?;
                        return combine(view[at].head(), left, right, mode, cnt);
                    }
                    from = at;
                }
            }
            Level::Unary => {
                if view[0].is_op('~') || view[0].is_op('-') {
                    let right = parse(&view[1..], mode, cnt, scope)?;
                    let Node::Num(value) = right else {
                        return Err(Error::Parse);
                    };
                    let value = if view[0].is_op('~') {
                        !value
                    } else {
                        value.wrapping_neg()
                    };
                    return Ok(Node::Num(value));
                }
            }
        }
    }

    Err(Error::Parse)
}

/// Finds the leftmost token at paren depth zero satisfying `hit`.
fn lscan(view: &[Token], hit: impl Fn(&Token) -> bool) -> Option<usize> {
    let mut depth = 0i32;
    for (at, token) in view.iter().enumerate() {
        if token.is_op('(') {
            depth += 1;
        } else if token.is_op(')') {
            depth -= 1;
        } else if depth == 0 && hit(token) {
            return Some(at);
        }
    }
    None
}

/// Finds the rightmost token at paren depth zero satisfying `hit`.
fn rscan(view: &[Token], hit: impl Fn(&Token) -> bool) -> Option<usize> {
    let mut depth = 0i32;
    for (at, token) in view.iter().enumerate().rev() {
        if token.is_op(')') {
            depth += 1;
        } else if token.is_op('(') {
            depth -= 1;
        } else if depth == 0 && hit(token) {
            return Some(at);
        }
    }
    None
}

/// Finds the close paren matching an open paren at `at`.
fn matching_paren(view: &[Token], at: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (index, token) in view.iter().enumerate().skip(at) {
        if token.is_op('(') {
            depth += 1;
        } else if token.is_op(')') {
            depth -= 1;
            if depth == 0 {
                return Some(index);
            }
        }
    }
    None
}

/// Applies a binary operator under the mode's register rules.
fn combine(op: char, left: Node, right: Node, mode: Mode, cnt: &mut RegCount) -> Result<Node, Error> {
    // Register operands only ever appear in memory-operand mode.
    debug_assert!(mode == Mode::Memory || matches!((left, right), (Node::Num(_), Node::Num(_))));

    match (op, left, right) {
        // Plain arithmetic on numbers.
        ('|', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l | r)),
        ('^', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l ^ r)),
        ('&', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l & r)),
        ('<', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l.wrapping_shl(r))),
        ('>', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l.wrapping_shr(r))),
        ('+', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l.wrapping_add(r))),
        ('-', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l.wrapping_sub(r))),
        ('*', Node::Num(l), Node::Num(r)) => Ok(Node::Num(l.wrapping_mul(r))),
        // A register may be added to anything addable.
        ('+', Node::Reg(base), Node::Num(n)) | ('+', Node::Num(n), Node::Reg(base)) => {
            cnt.add(base.ok_or(Error::Parse)?, 1);
            Ok(Node::Num(n))
        }
        ('+', Node::Reg(l), Node::Reg(r)) => {
            cnt.add(l.ok_or(Error::Parse)?, 1);
            cnt.add(r.ok_or(Error::Parse)?, 1);
            Ok(Node::Num(0))
        }
        // A register may be scaled by a constant.
        ('*', Node::Reg(base), Node::Num(scale)) | ('*', Node::Num(scale), Node::Reg(base)) => {
            cnt.add(base.ok_or(Error::Parse)?, scale);
            Ok(Node::Num(0))
        }
        // Anything else involving a register is not an effective address.
        _ => Err(Error::Parse),
    }
}

/// Evaluates a single-token operand.
fn atom(token: &Token, mode: Mode, scope: &dyn Scope) -> Result<Node, Error> {
    if token.kind != Kind::Ident {
        return Err(Error::Parse);
    }
    let text = token.text;

    // Register?
    if let Ok(reg) = text.parse::<Reg>() {
        return Ok(match mode {
            Mode::Value => Node::Num(scope.reg(reg)),
            Mode::Memory => Node::Reg(Base::from_name(text)),
        });
    }
    // User symbol?
    if let Some(addr) = scope.symbol(text) {
        return Ok(Node::Num(addr));
    }
    // Character literal?
    let chars: Vec<char> = text.chars().collect();
    if chars.len() == 3 && chars[0] == '\'' && chars[2] == '\'' {
        return Ok(Node::Num(chars[1] as u32));
    }
    // Otherwise a hexadecimal number.
    u32::from_str_radix(text, 16)
        .map(Node::Num)
        .map_err(|_| Error::Parse)
}
