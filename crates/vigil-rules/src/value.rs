use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, RuleError};

// =============================================================================
// WildcardString — expected string values with `*` / `?` support
// =============================================================================
//
// Expected values use `*` for any-length and `?` for single-character
// wildcards. Backslash escapes the next wildcard or another backslash.

/// A wildcard token inside a [`WildcardString`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Wildcard {
    /// `*`
    Multi,
    /// `?`
    Single,
}

/// A segment of a [`WildcardString`]: literal text or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StringPart {
    Plain(String),
    Wildcard(Wildcard),
}

/// An expected string value that may contain wildcards.
///
/// | Input | Parsed as |
/// |-------|-----------|
/// | `\*`  | literal `*` |
/// | `\?`  | literal `?` |
/// | `\\`  | literal `\` |
/// | `\W`  | literal `\W` (both kept) |
///
/// A backslash before any other character is kept, so Windows paths such as
/// `C:\Windows\` survive unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WildcardString {
    pub parts: Vec<StringPart>,
    pub original: String,
}

impl WildcardString {
    /// Parse `s`, interpreting `*` and `?` as wildcards and `\` as escape.
    pub fn new(s: &str) -> Self {
        let mut parts = Vec::new();
        let mut acc = String::new();
        let mut escaped = false;

        for c in s.chars() {
            if escaped {
                if !matches!(c, '*' | '?' | '\\') {
                    acc.push('\\');
                }
                acc.push(c);
                escaped = false;
                continue;
            }
            let wildcard = match c {
                '\\' => {
                    escaped = true;
                    continue;
                }
                '*' => Wildcard::Multi,
                '?' => Wildcard::Single,
                _ => {
                    acc.push(c);
                    continue;
                }
            };
            if !acc.is_empty() {
                parts.push(StringPart::Plain(std::mem::take(&mut acc)));
            }
            parts.push(StringPart::Wildcard(wildcard));
        }

        if escaped {
            acc.push('\\');
        }
        if !acc.is_empty() {
            parts.push(StringPart::Plain(acc));
        }

        WildcardString {
            parts,
            original: s.to_string(),
        }
    }

    /// Wrap `s` verbatim, without wildcard interpretation (regex patterns).
    pub fn raw(s: &str) -> Self {
        WildcardString {
            parts: if s.is_empty() {
                Vec::new()
            } else {
                vec![StringPart::Plain(s.to_string())]
            },
            original: s.to_string(),
        }
    }

    pub fn is_plain(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, StringPart::Plain(_)))
    }

    /// The literal text with escapes resolved, or `None` if wildcards are present.
    pub fn as_plain(&self) -> Option<String> {
        if !self.is_plain() {
            return None;
        }
        Some(
            self.parts
                .iter()
                .filter_map(|p| match p {
                    StringPart::Plain(s) => Some(s.as_str()),
                    StringPart::Wildcard(_) => None,
                })
                .collect(),
        )
    }

    /// Literal text when plain, otherwise the original source text.
    pub fn text(&self) -> String {
        self.as_plain().unwrap_or_else(|| self.original.clone())
    }
}

impl fmt::Display for WildcardString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

// =============================================================================
// ExpectedValue — right-hand side of a selection entry
// =============================================================================

/// A typed expected value from a selection block entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExpectedValue {
    String(WildcardString),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl ExpectedValue {
    /// Convert a scalar YAML node. Mappings and sequences return `None`.
    pub fn from_yaml(v: &serde_yaml::Value) -> Option<Self> {
        Some(match v {
            serde_yaml::Value::String(s) => ExpectedValue::String(WildcardString::new(s)),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => ExpectedValue::Integer(i),
                None => ExpectedValue::Float(n.as_f64()?),
            },
            serde_yaml::Value::Bool(b) => ExpectedValue::Bool(*b),
            serde_yaml::Value::Null => ExpectedValue::Null,
            serde_yaml::Value::Tagged(t) => return Self::from_yaml(&t.value),
            serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_) => return None,
        })
    }

    /// `true` for YAML null and the literal string `null`.
    pub fn is_null_literal(&self) -> bool {
        match self {
            ExpectedValue::Null => true,
            ExpectedValue::String(s) => s.original == "null",
            _ => false,
        }
    }
}

impl fmt::Display for ExpectedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedValue::String(s) => write!(f, "{s}"),
            ExpectedValue::Integer(n) => write!(f, "{n}"),
            ExpectedValue::Float(n) => write!(f, "{n}"),
            ExpectedValue::Bool(b) => write!(f, "{b}"),
            ExpectedValue::Null => f.write_str("null"),
        }
    }
}

// =============================================================================
// Timespan — aggregation window length
// =============================================================================

/// A window length such as `30s`, `5m`, `1h` or `7d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timespan {
    pub seconds: u64,
    pub original: String,
}

impl Timespan {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || RuleError::InvalidTimespan(s.to_string());
        let Some(unit) = s.chars().last() else {
            return Err(invalid());
        };
        let count: u64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        let multiplier = match unit {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return Err(invalid()),
        };
        if count == 0 {
            return Err(invalid());
        }
        let seconds = count.checked_mul(multiplier).ok_or_else(invalid)?;

        Ok(Timespan {
            seconds,
            original: s.to_string(),
        })
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}
