//! Field extraction from opaque upstream JSON.
//!
//! Every lookup distinguishes a field that is absent from one that is present
//! but malformed, so callers can count shape problems instead of silently
//! storing a default value.

use serde_json::Value;

/// Outcome of reading one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted<T> {
    Present(T),
    Absent,
    Malformed(String),
}

impl<T> Extracted<T> {
    /// The value when present; `None` for absent and malformed fields.
    pub fn present(self) -> Option<T> {
        match self {
            Extracted::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Extracted::Malformed(_))
    }
}

fn lookup<'a>(item: &'a Value, pointer: &str) -> Option<&'a Value> {
    match item.pointer(pointer) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    }
}

/// Reads a string field. Numbers are accepted and rendered as text, since
/// upstream ids are often numeric.
pub fn extract_string(item: &Value, pointer: &str) -> Extracted<String> {
    match lookup(item, pointer) {
        None => Extracted::Absent,
        Some(Value::String(s)) => Extracted::Present(s.trim().to_string()),
        Some(Value::Number(n)) => Extracted::Present(n.to_string()),
        Some(other) => Extracted::Malformed(format!("{} is not a string: {}", pointer, other)),
    }
}

/// Reads an integer amount. Accepts JSON integers, floats without a
/// fractional part and strings with thousands separators (`"1,200"`).
pub fn extract_i64(item: &Value, pointer: &str) -> Extracted<i64> {
    match lookup(item, pointer) {
        None => Extracted::Absent,
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Extracted::Present(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Extracted::Present(f as i64)
                    }
                    _ => Extracted::Malformed(format!("{} is not an integer: {}", pointer, n)),
                }
            }
        }
        Some(Value::String(s)) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            cleaned
                .parse::<i64>()
                .map(Extracted::Present)
                .unwrap_or_else(|_| {
                    Extracted::Malformed(format!("{} is not an integer: {:?}", pointer, s))
                })
        }
        Some(other) => Extracted::Malformed(format!("{} is not a number: {}", pointer, other)),
    }
}

/// Reads a floating point field (areas, coordinates).
pub fn extract_f64(item: &Value, pointer: &str) -> Extracted<f64> {
    match lookup(item, pointer) {
        None => Extracted::Absent,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.is_finite() => Extracted::Present(f),
            _ => Extracted::Malformed(format!("{} is not finite: {}", pointer, n)),
        },
        Some(Value::String(s)) => match s.trim().replace(',', "").parse::<f64>() {
            Ok(f) if f.is_finite() => Extracted::Present(f),
            _ => Extracted::Malformed(format!("{} is not a number: {:?}", pointer, s)),
        },
        Some(other) => Extracted::Malformed(format!("{} is not a number: {}", pointer, other)),
    }
}
