//! Deterministic arithmetic evaluation.
//!
//! Backs the math execution tool: numeric checks are far cheaper than another
//! model call. Supports `+ - * / ^` (`**` as a synonym), unary signs,
//! parentheses, implicit multiplication (`2(3)`, `2pi`), the constants `pi`
//! and `e`, and the one-argument functions listed in [`FUNCTIONS`].
//!
//! Anything outside that grammar is a syntax error; the evaluator never
//! guesses.

use std::collections::BTreeMap;
use thiserror::Error;

/// Recognised one-argument functions.
pub const FUNCTIONS: [&str; 8] = ["sqrt", "abs", "ln", "log", "sin", "cos", "tan", "exp"];

const MAX_DEPTH: usize = 64;

/// Errors from expression evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unexpected token {0}")]
    UnexpectedToken(String),

    #[error("Unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("Expression nested too deeply")]
    TooDeep,

    #[error("Result is not a finite number")]
    NonFinite,

    #[error("Expected exactly one '=' in equation")]
    NotAnEquation,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Ident(s) => s.clone(),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Caret => "'^'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }

    /// Whether this token can begin a factor (used for implicit multiplication).
    fn starts_factor(&self) -> bool {
        matches!(self, Token::Number(_) | Token::Ident(_) | Token::LParen)
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedChar(c, start))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect::<String>().to_lowercase()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Caret);
                i += 2;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' | '\u{2212}' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' | '\u{00d7}' | '\u{00b7}' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' | '\u{00f7}' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' | '[' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' | ']' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    bindings: &'a BTreeMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(ExpressionError::TooDeep)
        } else {
            Ok(())
        }
    }

    fn expr(&mut self) -> Result<f64, ExpressionError> {
        self.enter()?;
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        self.depth -= 1;
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, ExpressionError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value /= self.unary()?;
                }
                Some(t) if t.starts_factor() => {
                    value *= self.power()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let value = -self.unary()?;
                self.depth -= 1;
                Ok(value)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary()?;
                self.depth -= 1;
                Ok(value)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, ExpressionError> {
        let base = self.primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            self.enter()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(name)) => self.identifier(name),
            Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn identifier(&mut self, name: String) -> Result<f64, ExpressionError> {
        if FUNCTIONS.contains(&name.as_str()) {
            let arg = self.power()?;
            return Ok(apply_function(&name, arg));
        }

        match name.as_str() {
            "pi" => Ok(std::f64::consts::PI),
            "e" => Ok(std::f64::consts::E),
            _ => self
                .bindings
                .get(&name)
                .copied()
                .ok_or(ExpressionError::UnknownIdentifier(name)),
        }
    }
}

fn apply_function(name: &str, arg: f64) -> f64 {
    match name {
        "sqrt" => arg.sqrt(),
        "abs" => arg.abs(),
        "ln" => arg.ln(),
        "log" => arg.log10(),
        "sin" => arg.sin(),
        "cos" => arg.cos(),
        "tan" => arg.tan(),
        "exp" => arg.exp(),
        _ => f64::NAN,
    }
}

/// Evaluate an expression with no free variables.
pub fn evaluate(input: &str) -> Result<f64, ExpressionError> {
    evaluate_with(input, &BTreeMap::new())
}

/// Evaluate an expression, resolving free variables from `bindings`.
pub fn evaluate_with(input: &str, bindings: &BTreeMap<String, f64>) -> Result<f64, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
        depth: 0,
        bindings,
    };

    let value = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(ExpressionError::UnexpectedToken(extra.describe()));
    }
    if !value.is_finite() {
        return Err(ExpressionError::NonFinite);
    }
    Ok(value)
}

/// Identifiers in `input` that are neither constants nor functions.
pub fn free_variables(input: &str) -> Result<Vec<String>, ExpressionError> {
    let mut names: Vec<String> = tokenize(input)?
        .into_iter()
        .filter_map(|t| match t {
            Token::Ident(name)
                if name != "pi" && name != "e" && !FUNCTIONS.contains(&name.as_str()) =>
            {
                Some(name)
            }
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Split `lhs = rhs` into its two sides.
pub fn split_equation(input: &str) -> Result<(&str, &str), ExpressionError> {
    let mut parts = input.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(lhs), Some(rhs), None) if !lhs.trim().is_empty() && !rhs.trim().is_empty() => {
            Ok((lhs.trim(), rhs.trim()))
        }
        _ => Err(ExpressionError::NotAnEquation),
    }
}

/// Evaluate both sides of `lhs = rhs` with `bindings` for the unknowns.
pub fn evaluate_equation(
    equation: &str,
    bindings: &BTreeMap<String, f64>,
) -> Result<(f64, f64), ExpressionError> {
    let (lhs, rhs) = split_equation(equation)?;
    Ok((evaluate_with(lhs, bindings)?, evaluate_with(rhs, bindings)?))
}

/// The equation stated in free text, e.g. `x^2 - 5x + 6 = 0` in
/// "Solve x^2 - 5x + 6 = 0 for x."
///
/// Words are collected outwards from a single `=` while they read as math:
/// numbers, operators, one-letter unknowns, constants and the known
/// functions. Text with no `=` or several of them yields `None`.
pub fn find_equation(text: &str) -> Option<String> {
    let mut sides = text.split('=');
    let (before, after) = match (sides.next(), sides.next(), sides.next()) {
        (Some(before), Some(after), None) => (before, after),
        _ => return None,
    };

    let mut lhs: Vec<&str> = before
        .split_whitespace()
        .rev()
        .take_while(|word| is_math_word(word))
        .collect();
    lhs.reverse();

    let mut rhs = Vec::new();
    for word in after.split_whitespace() {
        let trimmed = word.trim_end_matches(['.', ',', '?', '!', ';', ':']);
        if !is_math_word(trimmed) {
            break;
        }
        rhs.push(trimmed);
        if trimmed.len() != word.len() {
            break;
        }
    }

    if lhs.is_empty() || rhs.is_empty() {
        return None;
    }
    Some(format!("{} = {}", lhs.join(" "), rhs.join(" ")))
}

fn is_math_word(word: &str) -> bool {
    match tokenize(word) {
        Ok(tokens) if !tokens.is_empty() => tokens.iter().all(|token| match token {
            Token::Ident(name) => {
                name.chars().count() == 1 || name == "pi" || FUNCTIONS.contains(&name.as_str())
            }
            _ => true,
        }),
        _ => false,
    }
}

/// Whether two evaluated values are equal within a relative tolerance.
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}
