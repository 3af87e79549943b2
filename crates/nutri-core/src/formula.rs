//! # Measure Formulas
//!
//! Arithmetic expressions over measure codes, used for calculated
//! measures such as BMI or waist-to-height ratio.
//!
//! ## Grammar
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := power (('*' | '/') power)*
//! power   := unary ('^' power)?            -- right associative
//! unary   := '-' unary | primary
//! primary := NUMBER | IDENT | IDENT '(' args ')' | '(' expr ')'
//! args    := expr (',' expr)*
//! ```
//!
//! Identifiers are `[a-z_][a-z0-9_]*`; functions are `sqrt`, `abs`,
//! `round` (1 or 2 args: value, decimals), `min` and `max` (2+ args).

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted formula length in bytes.
pub const MAX_FORMULA_LEN: usize = 512;

/// Formula parse and evaluation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// The formula is empty.
    #[error("formula is empty")]
    Empty,

    /// The formula exceeds [`MAX_FORMULA_LEN`].
    #[error("formula exceeds 512 characters")]
    TooLong,

    /// Unexpected character at a byte offset.
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar {
        /// The offending character.
        ch: char,
        /// Byte offset.
        pos: usize,
    },

    /// Unexpected token or end of input.
    #[error("syntax error at position {pos}: {message}")]
    Syntax {
        /// Byte offset.
        pos: usize,
        /// What was expected.
        message: String,
    },

    /// A function name is not supported or has the wrong arity.
    #[error("function '{name}': {message}")]
    Function {
        /// Function name.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// A referenced variable has no value.
    #[error("missing value for '{0}'")]
    MissingVariable(String),

    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// The result is NaN or infinite.
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sqrt,
    Abs,
    Round,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str, arity: usize) -> Result<Self, FormulaError> {
        let (func, ok) = match name {
            "sqrt" => (Self::Sqrt, arity == 1),
            "abs" => (Self::Abs, arity == 1),
            "round" => (Self::Round, arity == 1 || arity == 2),
            "min" => (Self::Min, arity >= 2),
            "max" => (Self::Max, arity >= 2),
            _ => {
                return Err(FormulaError::Function {
                    name: name.to_string(),
                    message: "unknown function".to_string(),
                })
            }
        };
        if ok {
            Ok(func)
        } else {
            Err(FormulaError::Function {
                name: name.to_string(),
                message: format!("wrong number of arguments ({arity})"),
            })
        }
    }
}

/// A parsed, validated formula.
///
/// Serializes as its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse and validate `source`.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(FormulaError::Empty);
        }
        if trimmed.len() > MAX_FORMULA_LEN {
            return Err(FormulaError::TooLong);
        }
        let tokens = tokenize(trimmed)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some((pos, _)) = parser.peek() {
            return Err(FormulaError::Syntax {
                pos,
                message: "unexpected trailing input".to_string(),
            });
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variable names referenced by the formula, sorted.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_vars(&self.expr, &mut out);
        out
    }

    /// Evaluate the formula with the given variable values.
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        let v = eval(&self.expr, values)?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(FormulaError::NonFinite)
        }
    }
}

impl TryFrom<String> for Formula {
    type Error = FormulaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Formula> for String {
    fn from(f: Formula) -> Self {
        f.source
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Lexer ───────────────────────────────────────────────────────────────────

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push((i, Token::Op(c)));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &src[start..i];
                let n: f64 = text.parse().map_err(|_| FormulaError::Syntax {
                    pos: start,
                    message: format!("invalid number '{text}'"),
                })?;
                tokens.push((start, Token::Number(n)));
            }
            'a'..='z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_lowercase() || bytes[i].is_ascii_digit() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(src[start..i].to_string())));
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or(c);
                return Err(FormulaError::UnexpectedChar { ch, pos: i });
            }
        }
    }
    Ok(tokens)
}

// ── Parser ──────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(p, t)| (*p, t))
    }

    fn end_pos(&self) -> usize {
        self.tokens.last().map(|(p, _)| p + 1).unwrap_or(0)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some((_, Token::Op(c))) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.power()?;
        while let Some(op) = self.eat_op(&['*', '/']) {
            let rhs = self.power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.unary()?;
        if self.eat_op(&['^']).is_some() {
            let exp = self.power()?;
            return Ok(Expr::Binary('^', Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.eat_op(&['-']).is_some() {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let end = self.end_pos();
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Ident(name))) => {
                if matches!(self.peek(), Some((_, Token::LParen))) {
                    self.pos += 1;
                    let mut args = vec![self.expr()?];
                    loop {
                        match self.next() {
                            Some((_, Token::Comma)) => args.push(self.expr()?),
                            Some((_, Token::RParen)) => break,
                            Some((pos, _)) => {
                                return Err(FormulaError::Syntax {
                                    pos,
                                    message: "expected ',' or ')'".to_string(),
                                })
                            }
                            None => {
                                return Err(FormulaError::Syntax {
                                    pos: end,
                                    message: "unclosed function call".to_string(),
                                })
                            }
                        }
                    }
                    let func = Func::lookup(&name, args.len())?;
                    Ok(Expr::Call(func, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, _)) => Err(FormulaError::Syntax {
                        pos,
                        message: "expected ')'".to_string(),
                    }),
                    None => Err(FormulaError::Syntax {
                        pos: end,
                        message: "unclosed parenthesis".to_string(),
                    }),
                }
            }
            Some((pos, _)) => Err(FormulaError::Syntax {
                pos,
                message: "expected a number, name or '('".to_string(),
            }),
            None => Err(FormulaError::Syntax {
                pos: end,
                message: "unexpected end of formula".to_string(),
            }),
        }
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

fn collect_vars(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Neg(inner) => collect_vars(inner, out),
        Expr::Binary(_, l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_vars(a, out)),
    }
}

fn eval(expr: &Expr, values: &HashMap<String, f64>) -> Result<f64, FormulaError> {
    Ok(match expr {
        Expr::Number(n) => *n,
        Expr::Var(name) => *values
            .get(name)
            .ok_or_else(|| FormulaError::MissingVariable(name.clone()))?,
        Expr::Neg(inner) => -eval(inner, values)?,
        Expr::Binary(op, l, r) => {
            let a = eval(l, values)?;
            let b = eval(r, values)?;
            match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => {
                    if b == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    a / b
                }
                _ => a.powf(b),
            }
        }
        Expr::Call(func, args) => {
            let vals = args
                .iter()
                .map(|a| eval(a, values))
                .collect::<Result<Vec<_>, _>>()?;
            match func {
                Func::Sqrt => vals[0].sqrt(),
                Func::Abs => vals[0].abs(),
                Func::Round => {
                    let decimals = vals.get(1).copied().unwrap_or(0.0).clamp(0.0, 10.0) as i32;
                    let factor = 10f64.powi(decimals);
                    (vals[0] * factor).round() / factor
                }
                Func::Min => vals.iter().copied().fold(f64::INFINITY, f64::min),
                Func::Max => vals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        }
    })
}
