// SPDX-License-Identifier: Apache-2.0
//! Filter expressions: tokenizer, recursive-descent parser, evaluator.
//!
//! Grammar (loosest binding first):
//! ```text
//! expr    := and ( "||" and )*
//! and     := term ( "&&" term )*
//! term    := "(" expr ")" | "true" | "false" | comparison
//! cmp     := field ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) literal
//!          | field "=~" string
//! literal := integer | string | "true" | "false"
//! ```
//! Strings are double-quoted with `\"` and `\\` escapes. The `=~` pattern
//! language is globs: `*` matches any run, `?` one character.
//!
//! Evaluation semantics for a field the record does not carry: `!=` holds,
//! everything else fails. Comparisons across incompatible kinds fail rather
//! than erroring, so one filter can span rectypes with different schemas.

use std::collections::BTreeMap;

use cairn_schema::FieldValue;
use thiserror::Error;

/// Parse errors, positioned by byte offset into the expression string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// A character no token starts with.
    #[error("unexpected character {ch:?} at byte {pos}")]
    UnexpectedChar {
        /// Byte offset.
        pos: usize,
        /// Offending character.
        ch: char,
    },
    /// A string literal with no closing quote.
    #[error("unterminated string starting at byte {pos}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        pos: usize,
    },
    /// A token that does not fit the grammar at this point.
    #[error("unexpected {found} at byte {pos}")]
    UnexpectedToken {
        /// Byte offset.
        pos: usize,
        /// Token description.
        found: &'static str,
    },
    /// Input ended mid-expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    /// An integer literal out of `i64` range.
    #[error("integer out of range at byte {pos}")]
    IntOutOfRange {
        /// Byte offset.
        pos: usize,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Bool(bool),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp {
        field: String,
        op: CmpOp,
        rhs: Operand,
    },
    Match {
        field: String,
        pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    AndAnd,
    OrOr,
    LParen,
    RParen,
    Cmp(CmpOp),
    Matches,
}

impl Token {
    fn describe(&self) -> &'static str {
        match self {
            Self::Ident(_) => "identifier",
            Self::Int(_) => "integer",
            Self::Str(_) => "string",
            Self::AndAnd => "`&&`",
            Self::OrOr => "`||`",
            Self::LParen => "`(`",
            Self::RParen => "`)`",
            Self::Cmp(_) => "comparison operator",
            Self::Matches => "`=~`",
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push((pos, Token::LParen));
            }
            ')' => {
                chars.next();
                out.push((pos, Token::RParen));
            }
            '&' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '&').is_none() {
                    return Err(ExprError::UnexpectedChar { pos, ch });
                }
                out.push((pos, Token::AndAnd));
            }
            '|' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '|').is_none() {
                    return Err(ExprError::UnexpectedChar { pos, ch });
                }
                out.push((pos, Token::OrOr));
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => out.push((pos, Token::Cmp(CmpOp::Eq))),
                    Some((_, '~')) => out.push((pos, Token::Matches)),
                    _ => return Err(ExprError::UnexpectedChar { pos, ch }),
                }
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_none() {
                    return Err(ExprError::UnexpectedChar { pos, ch });
                }
                out.push((pos, Token::Cmp(CmpOp::Ne)));
            }
            '<' => {
                chars.next();
                let op = if chars.next_if(|&(_, c)| c == '=').is_some() {
                    CmpOp::Le
                } else {
                    CmpOp::Lt
                };
                out.push((pos, Token::Cmp(op)));
            }
            '>' => {
                chars.next();
                let op = if chars.next_if(|&(_, c)| c == '=').is_some() {
                    CmpOp::Ge
                } else {
                    CmpOp::Gt
                };
                out.push((pos, Token::Cmp(op)));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(ExprError::UnterminatedString { pos }),
                        Some((_, '"')) => break,
                        Some((esc_pos, '\\')) => match chars.next() {
                            Some((_, '"')) => s.push('"'),
                            Some((_, '\\')) => s.push('\\'),
                            Some((_, other)) => {
                                return Err(ExprError::UnexpectedChar {
                                    pos: esc_pos,
                                    ch: other,
                                });
                            }
                            None => return Err(ExprError::UnterminatedString { pos }),
                        },
                        Some((_, other)) => s.push(other),
                    }
                }
                out.push((pos, Token::Str(s)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                if c == '-' {
                    text.push('-');
                    chars.next();
                }
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if text == "-" {
                    return Err(ExprError::UnexpectedChar { pos, ch });
                }
                let n: i64 = text
                    .parse()
                    .map_err(|_| ExprError::IntOutOfRange { pos })?;
                out.push((pos, Token::Int(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push((pos, Token::Ident(name)));
            }
            other => return Err(ExprError::UnexpectedChar { pos, ch: other }),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.at).cloned();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while matches!(self.peek(), Some((_, Token::OrOr))) {
            self.next();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        while matches!(self.peek(), Some((_, Token::AndAnd))) {
            self.next();
            let right = self.term()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            None => Err(ExprError::UnexpectedEnd),
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, token)) => Err(ExprError::UnexpectedToken {
                        pos,
                        found: token.describe(),
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some((_, Token::Ident(name))) if name == "true" => Ok(Expr::Bool(true)),
            Some((_, Token::Ident(name))) if name == "false" => Ok(Expr::Bool(false)),
            Some((_, Token::Ident(field))) => self.comparison(field),
            Some((pos, token)) => Err(ExprError::UnexpectedToken {
                pos,
                found: token.describe(),
            }),
        }
    }

    fn comparison(&mut self, field: String) -> Result<Expr, ExprError> {
        match self.next() {
            Some((_, Token::Cmp(op))) => {
                let rhs = self.literal()?;
                Ok(Expr::Cmp { field, op, rhs })
            }
            Some((pos, Token::Matches)) => match self.next() {
                Some((_, Token::Str(pattern))) => Ok(Expr::Match { field, pattern }),
                Some((after, token)) => Err(ExprError::UnexpectedToken {
                    pos: after,
                    found: token.describe(),
                }),
                None => Err(ExprError::UnexpectedToken {
                    pos,
                    found: "`=~` without a string pattern",
                }),
            },
            Some((pos, token)) => Err(ExprError::UnexpectedToken {
                pos,
                found: token.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn literal(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some((_, Token::Int(n))) => Ok(Operand::Int(n)),
            Some((_, Token::Str(s))) => Ok(Operand::Str(s)),
            Some((_, Token::Ident(name))) if name == "true" => Ok(Operand::Bool(true)),
            Some((_, Token::Ident(name))) if name == "false" => Ok(Operand::Bool(false)),
            Some((pos, token)) => Err(ExprError::UnexpectedToken {
                pos,
                found: token.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Parses a filter expression.
pub(crate) fn parse(input: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        at: 0,
    };
    let expr = parser.expr()?;
    match parser.next() {
        None => Ok(expr),
        Some((pos, token)) => Err(ExprError::UnexpectedToken {
            pos,
            found: token.describe(),
        }),
    }
}

/// Evaluates a parsed expression against one record's fields.
pub(crate) fn eval(expr: &Expr, fields: &BTreeMap<String, FieldValue>) -> bool {
    match expr {
        Expr::Bool(b) => *b,
        Expr::And(l, r) => eval(l, fields) && eval(r, fields),
        Expr::Or(l, r) => eval(l, fields) || eval(r, fields),
        Expr::Cmp { field, op, rhs } => {
            let Some(value) = fields.get(field) else {
                // Absent field: nothing equals it, everything differs.
                return *op == CmpOp::Ne;
            };
            match compare(value, rhs) {
                None => *op == CmpOp::Ne,
                Some(ordering) => match op {
                    CmpOp::Eq => ordering.is_eq(),
                    CmpOp::Ne => ordering.is_ne(),
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                },
            }
        }
        Expr::Match { field, pattern } => fields
            .get(field)
            .and_then(FieldValue::as_text)
            .is_some_and(|text| glob_match(pattern, text)),
    }
}

/// Ordering of a field value relative to a literal; `None` when the kinds
/// are incomparable.
fn compare(value: &FieldValue, rhs: &Operand) -> Option<core::cmp::Ordering> {
    match rhs {
        Operand::Int(n) => value.as_number().map(|v| v.cmp(n)),
        Operand::Str(s) => value.as_text().map(|v| v.cmp(s.as_str())),
        Operand::Bool(b) => match value {
            FieldValue::Bool(v) => Some(v.cmp(b)),
            _ => None,
        },
    }
}

/// Glob matching: `*` for any run, `?` for one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_at(&p, &t)
}

fn glob_at(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => {
            // Try every split point, shortest first.
            (0..=t.len()).any(|skip| glob_at(&p[1..], &t[skip..]))
        }
        Some('?') => !t.is_empty() && glob_at(&p[1..], &t[1..]),
        Some(&c) => t.first() == Some(&c) && glob_at(&p[1..], &t[1..]),
    }
}
