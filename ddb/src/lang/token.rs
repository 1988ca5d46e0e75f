//! Command-line tokenizer.
//!
//! Splits an input line into identifiers, one-character operators, and
//! quoted strings. Tokens borrow from the input line.

use super::Error;

/// Hard cap on tokens per line.
pub const MAX_TOKENS: usize = 256;

/// Characters that tokenize as one-character operator tokens.
const OPERATORS: &[char] = &[
    ':', '!', '(', ')', '[', ']', '+', '-', '*', '<', '>', ',', '@', '%', '&', '|', '~', '^',
];

/// Token classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A name or a number.
    Ident,
    /// A single operator character.
    Op,
    /// A double-quoted string, quotes included.
    Str,
}

/// One token; a window into the input line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub kind: Kind,
}

impl<'a> Token<'a> {
    /// The token's first character.
    #[must_use]
    pub fn head(&self) -> char {
        self.text.chars().next().unwrap_or('\0')
    }

    /// Whether this is the operator `op`.
    #[must_use]
    pub fn is_op(&self, op: char) -> bool {
        self.kind == Kind::Op && self.head() == op
    }
}

/// Whether `ch` is an operator character.
#[must_use]
pub fn is_operator(ch: char) -> bool {
    OPERATORS.contains(&ch)
}

/// Tokenizes one command line.
///
/// Tokenization stops at a newline or NUL. Strings keep their quotes.
///
/// # Errors
///
/// Fails with [`Error::TooMany`] when the line exceeds [`MAX_TOKENS`]
/// tokens; nothing is silently dropped.
pub fn tokenize(line: &str) -> Result<Vec<Token<'_>>, Error> {
    let mut tokens = Vec::new();
    let bytes = line.char_indices().collect::<Vec<_>>();
    let mut at = 0;

    fn push<'a>(token: Token<'a>, tokens: &mut Vec<Token<'a>>) -> Result<(), Error> {
        if tokens.len() == MAX_TOKENS {
            return Err(Error::TooMany);
        }
        tokens.push(token);
        Ok(())
    }

    while at < bytes.len() {
        let (start, ch) = bytes[at];
        if ch == '\n' || ch == '\0' {
            break;
        }
        if ch == ' ' {
            at += 1;
            continue;
        }
        if is_operator(ch) {
            push(
                Token {
                    text: &line[start..start + ch.len_utf8()],
                    kind: Kind::Op,
                },
                &mut tokens,
            )?;
            at += 1;
            continue;
        }
        if ch == '"' {
            // Scan to the closing quote; keep both quotes in the token.
            let mut end = at + 1;
            while end < bytes.len() && bytes[end].1 != '"' {
                end += 1;
            }
            let stop = if end < bytes.len() {
                bytes[end].0 + 1
            } else {
                line.len()
            };
            push(
                Token {
                    text: &line[start..stop],
                    kind: Kind::Str,
                },
                &mut tokens,
            )?;
            at = end + 1;
            continue;
        }
        // An identifier runs to the next space, operator, or quote.
        let mut end = at;
        while end < bytes.len() {
            let c = bytes[end].1;
            if c == ' ' || c == '"' || c == '\n' || c == '\0' || is_operator(c) {
                break;
            }
            end += 1;
        }
        let stop = if end < bytes.len() {
            bytes[end].0
        } else {
            line.len()
        };
        push(
            Token {
                text: &line[start..stop],
                kind: Kind::Ident,
            },
            &mut tokens,
        )?;
        at = end;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(tokens: &[Token<'a>]) -> Vec<&'a str> {
        tokens.iter().map(|t| t.text).collect()
    }

    #[test]
    fn identifiers_and_operators_split() {
        let tokens = tokenize("d EBX+ESI*4+10").unwrap();
        assert_eq!(texts(&tokens), ["d", "EBX", "+", "ESI", "*", "4", "+", "10"]);
        assert_eq!(tokens[0].kind, Kind::Ident);
        assert_eq!(tokens[2].kind, Kind::Op);
    }

    #[test]
    fn operators_are_single_characters() {
        let tokens = tokenize("1<<2").unwrap();
        assert_eq!(texts(&tokens), ["1", "<", "<", "2"]);
        assert!(tokens[1].is_op('<'));
    }

    #[test]
    fn strings_keep_their_quotes() {
        let tokens = tokenize("s 0 l 10 \"ab cd\"").unwrap();
        assert_eq!(texts(&tokens), ["s", "0", "l", "10", "\"ab cd\""]);
        assert_eq!(tokens[4].kind, Kind::Str);
    }

    #[test]
    fn blank_lines_produce_nothing() {
        assert!(tokenize("").unwrap().is_empty());
        assert!(tokenize("    ").unwrap().is_empty());
        assert!(tokenize("  \n d 100").unwrap().is_empty());
    }

    #[test]
    fn retokenizing_is_stable() {
        let line = "? (1+2)*3 & ~ff";
        let tokens = tokenize(line).unwrap();
        let joined = texts(&tokens).join(" ");
        let again = tokenize(&joined).unwrap();
        assert_eq!(texts(&tokens), texts(&again));
    }

    #[test]
    fn token_overflow_is_an_error() {
        let line = "+".repeat(MAX_TOKENS + 1);
        assert_eq!(tokenize(&line).unwrap_err(), Error::TooMany);
    }
}
