//! Per-step hyperparameter schedules
//!
//! A schedule maps every step of the full diffusion trajectory to one value.
//! Step 0 is the noisiest step and `MAX_DIFFUSION_STEPS - 1` the cleanest.
//!
//! Inputs are either scalars (broadcast to every step) or small list-building
//! expressions such as `"[12]*400+[4]*600"`:
//!
//! ```text
//! expr    ::= term ("+" term)*
//! term    ::= "[" literal ("," literal)* "]" "*" int
//! literal ::= number | "True" | "False" | "true" | "false"
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of every resolved schedule
pub const MAX_DIFFUSION_STEPS: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("invalid schedule expression at byte {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("schedule resolves to {actual} values, expected {expected}")]
    Length { expected: usize, actual: usize },
}

/// Raw schedule value as it appears in a run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleInput {
    Bool(bool),
    Int(i64),
    Float(f64),
    Expr(String),
    List(Vec<f64>),
}

impl From<bool> for ScheduleInput {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ScheduleInput {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ScheduleInput {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ScheduleInput {
    fn from(value: &str) -> Self {
        Self::Expr(value.to_string())
    }
}

impl From<String> for ScheduleInput {
    fn from(value: String) -> Self {
        Self::Expr(value)
    }
}

impl From<Vec<f64>> for ScheduleInput {
    fn from(values: Vec<f64>) -> Self {
        Self::List(values)
    }
}

/// A resolved, immutable per-step schedule
///
/// Booleans are stored as `1.0` / `0.0`. Cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    values: Arc<[f64]>,
}

impl Schedule {
    /// Broadcast a single value to every step
    pub fn constant(value: f64) -> Self {
        Self {
            values: vec![value; MAX_DIFFUSION_STEPS].into(),
        }
    }

    /// Build from explicit per-step values
    pub fn from_values(values: Vec<f64>) -> Result<Self, ScheduleError> {
        if values.len() != MAX_DIFFUSION_STEPS {
            return Err(ScheduleError::Length {
                expected: MAX_DIFFUSION_STEPS,
                actual: values.len(),
            });
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// Value at `step`; steps past the end read the last value
    pub fn value(&self, step: usize) -> f64 {
        self.values[step.min(MAX_DIFFUSION_STEPS - 1)]
    }

    /// Boolean reading of the value at `step`
    pub fn flag(&self, step: usize) -> bool {
        self.value(step) != 0.0
    }

    /// Non-negative count reading of the value at `step`
    pub fn count(&self, step: usize) -> usize {
        let value = self.value(step);
        if value.is_finite() && value > 0.0 {
            value.round() as usize
        } else {
            0
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolve a schedule input without caching
pub fn resolve(input: &ScheduleInput) -> Result<Schedule, ScheduleError> {
    match input {
        ScheduleInput::Bool(b) => Ok(Schedule::constant(if *b { 1.0 } else { 0.0 })),
        ScheduleInput::Int(i) => Ok(Schedule::constant(*i as f64)),
        ScheduleInput::Float(f) => Ok(Schedule::constant(*f)),
        ScheduleInput::Expr(expr) => resolve_str(expr),
        ScheduleInput::List(values) => Schedule::from_values(values.clone()),
    }
}

/// Resolve a string input
///
/// A bare literal (`"0.5"`, `"True"`) broadcasts like a scalar, anything
/// else must be a list expression.
pub fn resolve_str(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    if !trimmed.starts_with('[') {
        let mut parser = ExprParser::new(trimmed);
        let value = parser.literal()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        return Ok(Schedule::constant(value));
    }
    Schedule::from_values(ExprParser::new(trimmed).parse()?)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Expr(String),
    List(Vec<u64>),
}

impl From<&ScheduleInput> for CacheKey {
    fn from(input: &ScheduleInput) -> Self {
        match input {
            ScheduleInput::Bool(b) => Self::Bool(*b),
            ScheduleInput::Int(i) => Self::Int(*i),
            ScheduleInput::Float(f) => Self::Float(f.to_bits()),
            ScheduleInput::Expr(s) => Self::Expr(s.trim().to_string()),
            ScheduleInput::List(v) => Self::List(v.iter().map(|f| f.to_bits()).collect()),
        }
    }
}

/// Caching schedule resolver
///
/// Identical inputs resolve to the same shared [`Schedule`].
#[derive(Debug, Default)]
pub struct ScheduleResolver {
    cache: HashMap<CacheKey, Schedule>,
}

impl ScheduleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, input: &ScheduleInput) -> Result<Schedule, ScheduleError> {
        let key = CacheKey::from(input);
        if let Some(schedule) = self.cache.get(&key) {
            return Ok(schedule.clone());
        }
        let schedule = resolve(input)?;
        self.cache.insert(key, schedule.clone());
        Ok(schedule)
    }

    /// Number of distinct inputs resolved so far
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

// ============================================================================
// Expression parser
// ============================================================================

struct ExprParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ScheduleError {
        ScheduleError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ScheduleError> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c == want => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(format!("expected '{}', found end of input", want))),
        }
    }

    fn parse(mut self) -> Result<Vec<f64>, ScheduleError> {
        let mut values = Vec::with_capacity(MAX_DIFFUSION_STEPS);
        loop {
            self.term(&mut values)?;
            self.skip_ws();
            match self.peek() {
                None => break,
                Some('+') => self.pos += 1,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
        Ok(values)
    }

    fn term(&mut self, out: &mut Vec<f64>) -> Result<(), ScheduleError> {
        self.expect('[')?;
        let mut items = vec![self.literal()?];
        loop {
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    items.push(self.literal()?);
                }
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => return Err(self.error(format!("unexpected '{}' in list", c))),
                None => return Err(self.error("unterminated list")),
            }
        }
        self.expect('*')?;
        let repeat = self.integer()?;

        // Reject oversized input before allocating it
        let total = items
            .len()
            .checked_mul(repeat)
            .and_then(|n| n.checked_add(out.len()))
            .unwrap_or(usize::MAX);
        if total > MAX_DIFFUSION_STEPS {
            return Err(ScheduleError::Length {
                expected: MAX_DIFFUSION_STEPS,
                actual: total,
            });
        }

        for _ in 0..repeat {
            out.extend_from_slice(&items);
        }
        Ok(())
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_') {
                // A '+' only belongs to a number right after an exponent marker
                if c == '+' && !self.src[start..self.pos].ends_with(['e', 'E']) {
                    break;
                }
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }

    fn literal(&mut self) -> Result<f64, ScheduleError> {
        self.skip_ws();
        let start = self.pos;
        let word = self.word();
        match word {
            "" => Err(self.error("expected a literal")),
            "True" | "true" => Ok(1.0),
            "False" | "false" => Ok(0.0),
            _ => word.replace('_', "").parse::<f64>().map_err(|_| ScheduleError::Parse {
                position: start,
                message: format!("'{}' is not a number or boolean", word),
            }),
        }
    }

    fn integer(&mut self) -> Result<usize, ScheduleError> {
        self.skip_ws();
        let start = self.pos;
        let word = self.word();
        word.parse::<usize>().map_err(|_| ScheduleError::Parse {
            position: start,
            message: format!("'{}' is not a repeat count", word),
        })
    }
}
