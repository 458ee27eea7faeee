//! Runtime values produced while interpreting predicates

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use rls_common::{Error, Result};

use crate::expr::{ArithmeticOp, Literal};

/// A value flowing through predicate evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Interval(Duration),
    List(Vec<Datum>),
    Json(Value),
}

impl Datum {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(Datum::Int)
                .or_else(|| n.as_f64().map(Datum::Float))
                .unwrap_or(Datum::Null),
            Value::String(s) => Datum::Text(s.clone()),
            Value::Array(items) => Datum::List(items.iter().map(Datum::from_json).collect()),
            Value::Object(_) => Datum::Json(value.clone()),
        }
    }

    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Datum::Null,
            Literal::Bool(b) => Datum::Bool(*b),
            Literal::Int(i) => Datum::Int(*i),
            Literal::Float(x) => Datum::Float(*x),
            Literal::Text(s) => Datum::Text(s.clone()),
            Literal::Interval(d) => Datum::Interval(*d),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "boolean",
            Datum::Int(_) => "integer",
            Datum::Float(_) => "double precision",
            Datum::Text(_) => "text",
            Datum::Timestamp(_) => "timestamptz",
            Datum::Interval(_) => "interval",
            Datum::List(_) => "set",
            Datum::Json(_) => "json",
        }
    }

    /// Interpret as a three-valued boolean (`None` is unknown)
    ///
    /// # Errors
    /// Returns `PredicateEvaluationError` for non-boolean values.
    pub fn as_tristate(&self) -> Result<Option<bool>> {
        match self {
            Datum::Null => Ok(None),
            Datum::Bool(b) => Ok(Some(*b)),
            other => Err(Error::evaluation(format!(
                "expected boolean, got {}",
                other.type_name()
            ))),
        }
    }

    /// Render as text for string functions
    pub fn to_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Bool(b) => Some(b.to_string()),
            Datum::Int(i) => Some(i.to_string()),
            Datum::Float(x) => Some(x.to_string()),
            Datum::Text(s) => Some(s.clone()),
            Datum::Timestamp(t) => Some(t.to_rfc3339()),
            Datum::Interval(d) => Some(format!("{} seconds", d.num_seconds())),
            Datum::List(_) | Datum::Json(_) => Some(self.to_json().to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Int(i) => Value::from(*i),
            Datum::Float(x) => Value::from(*x),
            Datum::Text(s) => Value::String(s.clone()),
            Datum::Timestamp(t) => Value::String(t.to_rfc3339()),
            Datum::Interval(d) => Value::from(d.num_seconds()),
            Datum::List(items) => Value::Array(items.iter().map(Datum::to_json).collect()),
            Datum::Json(v) => v.clone(),
        }
    }

    /// SQL comparison; `None` when either side is null
    ///
    /// # Errors
    /// Returns `PredicateEvaluationError` for incomparable types.
    pub fn compare(&self, other: &Datum) -> Result<Option<Ordering>> {
        let ordering = match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => return Ok(None),
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Interval(a), Datum::Interval(b)) => a.cmp(b),
            (Datum::Json(a), Datum::Json(b)) if a == b => Ordering::Equal,
            (Datum::Timestamp(a), Datum::Text(s)) => a.cmp(&parse_timestamp(s)?),
            (Datum::Text(s), Datum::Timestamp(b)) => parse_timestamp(s)?.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
                    Error::evaluation("cannot compare NaN".to_string())
                })?,
                _ => {
                    return Err(Error::evaluation(format!(
                        "cannot compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    )))
                }
            },
        };
        Ok(Some(ordering))
    }

    /// SQL equality, reusing [`Datum::compare`]
    ///
    /// # Errors
    /// Returns `PredicateEvaluationError` for incomparable types.
    pub fn sql_eq(&self, other: &Datum) -> Result<Option<bool>> {
        Ok(self.compare(other)?.map(Ordering::is_eq))
    }

    /// Numeric view, accepting numeric-looking text
    fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int(i) => Some(*i as f64),
            Datum::Float(x) => Some(*x),
            Datum::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Datum::Timestamp(t) => Some(*t),
            Datum::Text(s) => parse_timestamp(s).ok(),
            _ => None,
        }
    }

    /// Apply an arithmetic operator
    ///
    /// # Errors
    /// Returns `PredicateEvaluationError` on type mismatch, overflow or
    /// division by zero.
    pub fn arithmetic(&self, op: ArithmeticOp, other: &Datum) -> Result<Datum> {
        if self.is_null() || other.is_null() {
            return Ok(Datum::Null);
        }

        if op == ArithmeticOp::Concat {
            let left = self.to_text().unwrap_or_default();
            let right = other.to_text().unwrap_or_default();
            return Ok(Datum::Text(left + &right));
        }

        let mismatch = || {
            Error::evaluation(format!(
                "operator {op} is not defined for {} and {}",
                self.type_name(),
                other.type_name()
            ))
        };

        match (self, other, op) {
            (Datum::Int(a), Datum::Int(b), _) => {
                let result = match op {
                    ArithmeticOp::Plus => a.checked_add(*b),
                    ArithmeticOp::Minus => a.checked_sub(*b),
                    ArithmeticOp::Multiply => a.checked_mul(*b),
                    ArithmeticOp::Divide if *b == 0 => {
                        return Err(Error::evaluation("division by zero".to_string()))
                    }
                    ArithmeticOp::Divide => a.checked_div(*b),
                    ArithmeticOp::Concat => None,
                };
                result
                    .map(Datum::Int)
                    .ok_or_else(|| Error::evaluation("integer out of range".to_string()))
            }
            (Datum::Interval(a), Datum::Interval(b), ArithmeticOp::Plus) => a
                .checked_add(b)
                .map(Datum::Interval)
                .ok_or_else(|| Error::evaluation("interval out of range".to_string())),
            (Datum::Interval(a), Datum::Interval(b), ArithmeticOp::Minus) => a
                .checked_sub(b)
                .map(Datum::Interval)
                .ok_or_else(|| Error::evaluation("interval out of range".to_string())),
            (Datum::Interval(d), t, ArithmeticOp::Plus) => {
                let t = t.as_timestamp().ok_or_else(mismatch)?;
                t.checked_add_signed(*d)
                    .map(Datum::Timestamp)
                    .ok_or_else(|| Error::evaluation("timestamp out of range".to_string()))
            }
            (t, Datum::Interval(d), ArithmeticOp::Plus | ArithmeticOp::Minus) => {
                let t = t.as_timestamp().ok_or_else(mismatch)?;
                let shifted = if op == ArithmeticOp::Plus {
                    t.checked_add_signed(*d)
                } else {
                    t.checked_sub_signed(*d)
                };
                shifted
                    .map(Datum::Timestamp)
                    .ok_or_else(|| Error::evaluation("timestamp out of range".to_string()))
            }
            (Datum::Timestamp(a), b, ArithmeticOp::Minus) => b
                .as_timestamp()
                .map(|b| Datum::Interval(*a - b))
                .ok_or_else(mismatch),
            (a, b, _) => {
                let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                    return Err(mismatch());
                };
                match op {
                    ArithmeticOp::Plus => Ok(Datum::Float(x + y)),
                    ArithmeticOp::Minus => Ok(Datum::Float(x - y)),
                    ArithmeticOp::Multiply => Ok(Datum::Float(x * y)),
                    ArithmeticOp::Divide if y == 0.0 => {
                        Err(Error::evaluation("division by zero".to_string()))
                    }
                    ArithmeticOp::Divide => Ok(Datum::Float(x / y)),
                    ArithmeticOp::Concat => Err(mismatch()),
                }
            }
        }
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::evaluation(format!("invalid timestamp '{text}'")))
}

/// SQL `LIKE` matching with `%` and `_` wildcards
pub fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text.to_string(), pattern.to_string())
    };
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // matches[j]: pattern[..i] matches text[..j]
    let mut matches = vec![false; text.len() + 1];
    matches[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= matches[j];
                    next[j] = seen;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = matches[j - 1];
                }
            }
            c => {
                for j in 1..=text.len() {
                    next[j] = matches[j - 1] && text[j - 1] == *c;
                }
            }
        }
        matches = next;
    }
    matches[text.len()]
}
