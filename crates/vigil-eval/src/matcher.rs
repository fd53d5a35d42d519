//! Compiled matchers: the per-field modifier executor.
//!
//! Each `CompiledMatcher` is built once per (field, expected value) when a
//! rule is compiled. Evaluation only compares; the one fallible operation is
//! a regex that could not be built within the configured size limit.

use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;

use vigil_rules::{StringPart, Wildcard};

use crate::error::EvalError;
use crate::event::StructuredEvent;
use crate::registry::RegexFailureRegistry;
use crate::resolver::{DomainControllerSet, Resolved, resolve};

/// A pre-compiled matcher for a single value comparison.
///
/// String matchers store their expected value lowercased when
/// `case_insensitive` is set; the input is folded before comparison.
#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    // -- String matchers --
    Exact {
        value: String,
        case_insensitive: bool,
    },
    Contains {
        value: String,
        case_insensitive: bool,
    },
    StartsWith {
        value: String,
        case_insensitive: bool,
    },
    EndsWith {
        value: String,
        case_insensitive: bool,
    },
    /// Wildcard string lowered to an anchored regex.
    Wildcard(Regex),

    /// `re` modifier pattern.
    Regex(RegexMatcher),

    // -- Network --
    Cidr(IpNet),

    // -- Numeric --
    /// `None` when the expected value is not an integer: never matches.
    Numeric { op: NumericOp, value: Option<i64> },

    // -- Special --
    /// `true` = field must be present, `false` = must be missing.
    Exists(bool),
    /// Expected `null`: matches only a missing field.
    IsNull,
    /// Compare against the value of another field.
    FieldRef {
        field: String,
        kind: FieldRefKind,
        /// Treat a missing side as satisfied.
        null_matches: bool,
    },
    /// `expand: '%DomainControllers%'`.
    DomainController(Arc<DomainControllerSet>),
    /// Value length (in characters) at least this long.
    MinLength(usize),

    // -- Composite --
    /// Inner matcher must hold for every logical value of the field.
    AllValues(Box<CompiledMatcher>),
    AnyOf(Vec<CompiledMatcher>),
    AllOf(Vec<CompiledMatcher>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl NumericOp {
    pub fn apply(self, lhs: i64, rhs: i64) -> bool {
        match self {
            NumericOp::Gt => lhs > rhs,
            NumericOp::Gte => lhs >= rhs,
            NumericOp::Lt => lhs < rhs,
            NumericOp::Lte => lhs <= rhs,
        }
    }
}

/// How a `fieldref` compares the two resolved values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRefKind {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

// =============================================================================
// Regex with failure tracking
// =============================================================================

/// A `re` pattern plus the shared failure registry.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: String,
    state: RegexState,
    failures: Arc<RegexFailureRegistry>,
}

#[derive(Debug, Clone)]
enum RegexState {
    Ready(Regex),
    /// Could not be built within limits; fails on first use.
    Deferred(String),
}

impl RegexMatcher {
    pub fn ready(pattern: String, regex: Regex, failures: Arc<RegexFailureRegistry>) -> Self {
        RegexMatcher {
            pattern,
            state: RegexState::Ready(regex),
            failures,
        }
    }

    pub fn deferred(
        pattern: String,
        reason: String,
        failures: Arc<RegexFailureRegistry>,
    ) -> Self {
        RegexMatcher {
            pattern,
            state: RegexState::Deferred(reason),
            failures,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn is_match(&self, s: &str) -> Result<bool, EvalError> {
        if self.failures.contains(&self.pattern) {
            return Ok(false);
        }
        match &self.state {
            RegexState::Ready(re) => Ok(re.is_match(s)),
            RegexState::Deferred(reason) => {
                if self.failures.record(&self.pattern, reason) {
                    Err(EvalError::Regex {
                        pattern: self.pattern.clone(),
                        reason: reason.clone(),
                    })
                } else {
                    Ok(false)
                }
            }
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

impl CompiledMatcher {
    /// Check the matcher against a resolved field value.
    ///
    /// A missing value satisfies only `Exists(false)`, `IsNull` and a
    /// `FieldRef` with `null_matches`. Abnormal values match when any
    /// logical value does, except under `AllValues`.
    pub fn matches(
        &self,
        resolved: &Resolved<'_>,
        event: &StructuredEvent,
    ) -> Result<bool, EvalError> {
        match self {
            CompiledMatcher::AnyOf(matchers) => {
                for m in matchers {
                    if m.matches(resolved, event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CompiledMatcher::AllOf(matchers) => {
                for m in matchers {
                    if !m.matches(resolved, event)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledMatcher::Exists(expect) => Ok(resolved.value.is_some() == *expect),
            CompiledMatcher::IsNull => Ok(resolved.is_null()),
            CompiledMatcher::FieldRef { .. } if resolved.is_null() => {
                Ok(self.field_ref(None, event))
            }
            CompiledMatcher::AllValues(inner) => {
                if resolved.is_null() {
                    return Ok(false);
                }
                for part in resolved.parts() {
                    if !inner.matches_str(part, event)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => {
                for part in resolved.parts() {
                    if self.matches_str(part, event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Check the matcher against one present, logical value.
    pub fn matches_str(&self, s: &str, event: &StructuredEvent) -> Result<bool, EvalError> {
        Ok(match self {
            CompiledMatcher::Exact {
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    fold(s) == value.as_str()
                } else {
                    s == value.as_str()
                }
            }
            CompiledMatcher::Contains {
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    fold(s).contains(value.as_str())
                } else {
                    s.contains(value.as_str())
                }
            }
            CompiledMatcher::StartsWith {
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    fold(s).starts_with(value.as_str())
                } else {
                    s.starts_with(value.as_str())
                }
            }
            CompiledMatcher::EndsWith {
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    fold(s).ends_with(value.as_str())
                } else {
                    s.ends_with(value.as_str())
                }
            }
            CompiledMatcher::Wildcard(re) => re.is_match(s),
            CompiledMatcher::Regex(re) => re.is_match(s)?,

            CompiledMatcher::Cidr(net) => s
                .trim()
                .parse::<IpAddr>()
                .is_ok_and(|ip| net.contains(&ip)),

            CompiledMatcher::Numeric { op, value } => match value {
                Some(expected) => s
                    .trim()
                    .parse::<i64>()
                    .is_ok_and(|actual| op.apply(actual, *expected)),
                None => false,
            },

            CompiledMatcher::Exists(expect) => *expect,
            CompiledMatcher::IsNull => false,
            CompiledMatcher::FieldRef { .. } => self.field_ref(Some(s), event),
            CompiledMatcher::DomainController(dcs) => dcs.contains(s),
            CompiledMatcher::MinLength(min) => s.chars().count() >= *min,

            CompiledMatcher::AllValues(inner) => inner.matches_str(s, event)?,
            CompiledMatcher::AnyOf(matchers) => {
                for m in matchers {
                    if m.matches_str(s, event)? {
                        return Ok(true);
                    }
                }
                false
            }
            CompiledMatcher::AllOf(matchers) => {
                for m in matchers {
                    if !m.matches_str(s, event)? {
                        return Ok(false);
                    }
                }
                true
            }
        })
    }

    fn field_ref(&self, lhs: Option<&str>, event: &StructuredEvent) -> bool {
        let CompiledMatcher::FieldRef {
            field,
            kind,
            null_matches,
        } = self
        else {
            return false;
        };
        let other = resolve(field, None, event);
        let (Some(lhs), false) = (lhs, other.is_null()) else {
            return *null_matches;
        };
        let lhs = fold(lhs);
        other.parts().any(|rhs| {
            let rhs = fold(rhs);
            match kind {
                FieldRefKind::Equals => lhs == rhs,
                FieldRefKind::StartsWith => lhs.starts_with(&*rhs),
                FieldRefKind::EndsWith => lhs.ends_with(&*rhs),
                FieldRefKind::Contains => lhs.contains(&*rhs),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercase `s` for case-insensitive comparison, borrowing when possible.
pub fn fold(s: &str) -> Cow<'_, str> {
    if s.is_ascii() {
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(s.to_ascii_lowercase())
        } else {
            Cow::Borrowed(s)
        }
    } else {
        Cow::Owned(s.to_lowercase())
    }
}

/// Convert wildcard parts to a regex pattern.
///
/// `*` becomes `.*`, `?` becomes `.`, literal text is escaped. Anchors are
/// added on the sides that are not open (`contains` opens both, `startswith`
/// the end, `endswith` the start).
pub fn wildcard_to_regex(
    parts: &[StringPart],
    case_insensitive: bool,
    anchor_start: bool,
    anchor_end: bool,
) -> String {
    let mut pattern = String::from(if case_insensitive { "(?is)" } else { "(?s)" });
    if anchor_start {
        pattern.push('^');
    }
    for part in parts {
        match part {
            StringPart::Plain(text) => pattern.push_str(&regex::escape(text)),
            StringPart::Wildcard(Wildcard::Multi) => pattern.push_str(".*"),
            StringPart::Wildcard(Wildcard::Single) => pattern.push('.'),
        }
    }
    if anchor_end {
        pattern.push('$');
    }
    pattern
}
