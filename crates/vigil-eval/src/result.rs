//! Detection payloads handed to the match sink.

use std::sync::Arc;

use serde::Serialize;
use vigil_rules::RuleMetadata;

use crate::event::StructuredEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Standard,
    Aggregation,
}

/// A rule firing on an event (standard) or on a window (aggregation).
#[derive(Debug, Clone, Serialize)]
pub struct DetectionMatch {
    pub rule: Arc<RuleMetadata>,
    /// Rule id, or its title when no id is declared.
    pub rule_key: String,
    pub kind: RuleKind,
    /// Blocks that matched; empty for aggregation matches.
    pub matched_selections: Vec<String>,
    pub matched_fields: Vec<FieldMatch>,
    /// The triggering event, or the row synthesized by the windowed store.
    pub event: StructuredEvent,
}

/// An extracted output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMatch {
    pub field: String,
    pub value: String,
}
