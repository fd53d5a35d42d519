//! Typed model of a rule definition: metadata, selection blocks, condition
//! expressions and aggregation declarations.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::value::{ExpectedValue, Timespan};

// =============================================================================
// Enumerations
// =============================================================================

/// Rule maturity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stable,
    Test,
    Experimental,
    Deprecated,
    Unsupported,
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Status::Stable),
            "test" => Ok(Status::Test),
            "experimental" => Ok(Status::Experimental),
            "deprecated" => Ok(Status::Deprecated),
            "unsupported" => Ok(Status::Unsupported),
            _ => Err(()),
        }
    }
}

/// Severity level reported with a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "informational" | "info" => Ok(Level::Informational),
            "low" => Ok(Level::Low),
            "medium" => Ok(Level::Medium),
            "high" => Ok(Level::High),
            "critical" => Ok(Level::Critical),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Field Modifiers
// =============================================================================

/// Pipe-delimited field modifiers (`CommandLine|contains|all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Contains,
    StartsWith,
    EndsWith,
    All,

    Base64,
    Base64Offset,
    Wide,
    Utf16Be,
    Utf16,
    WinDash,

    Re,
    #[serde(rename = "i")]
    IgnoreCase,
    #[serde(rename = "m")]
    Multiline,
    #[serde(rename = "s")]
    DotAll,

    Cidr,
    Cased,
    Exists,
    Expand,
    FieldRef,

    Gt,
    Gte,
    Lt,
    Lte,
}

impl FromStr for Modifier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "contains" => Modifier::Contains,
            "startswith" => Modifier::StartsWith,
            "endswith" => Modifier::EndsWith,
            "all" => Modifier::All,
            "base64" => Modifier::Base64,
            "base64offset" => Modifier::Base64Offset,
            "wide" | "utf16le" => Modifier::Wide,
            "utf16be" => Modifier::Utf16Be,
            "utf16" => Modifier::Utf16,
            "windash" => Modifier::WinDash,
            "re" => Modifier::Re,
            "i" | "ignorecase" => Modifier::IgnoreCase,
            "m" | "multiline" => Modifier::Multiline,
            "s" | "dotall" => Modifier::DotAll,
            "cidr" => Modifier::Cidr,
            "cased" => Modifier::Cased,
            "exists" => Modifier::Exists,
            "expand" => Modifier::Expand,
            "fieldref" | "equalsfield" => Modifier::FieldRef,
            "gt" => Modifier::Gt,
            "gte" => Modifier::Gte,
            "lt" => Modifier::Lt,
            "lte" => Modifier::Lte,
            _ => return Err(()),
        })
    }
}

// =============================================================================
// Field Specification
// =============================================================================

/// Field name plus its ordered modifiers, parsed from a selection key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    /// `None` for keyword entries without a field.
    pub name: Option<String>,
    pub modifiers: Vec<Modifier>,
}

impl FieldSpec {
    pub fn new(name: Option<String>, modifiers: Vec<Modifier>) -> Self {
        FieldSpec { name, modifiers }
    }

    pub fn has_modifier(&self, m: Modifier) -> bool {
        self.modifiers.contains(&m)
    }
}

// =============================================================================
// Condition Expression AST
// =============================================================================

/// Boolean combination of selection block references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConditionExpr {
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    Not(Box<ConditionExpr>),
    /// Reference to a named selection block.
    Identifier(String),
    /// `1 of selection_*`, `all of them`, `2 of filter*`.
    Selector {
        quantifier: Quantifier,
        pattern: SelectorPattern,
    },
}

impl fmt::Display for ConditionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionExpr::And(args) | ConditionExpr::Or(args) => {
                let joiner = if matches!(self, ConditionExpr::And(_)) {
                    " and "
                } else {
                    " or "
                };
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
            ConditionExpr::Not(arg) => write!(f, "not {arg}"),
            ConditionExpr::Identifier(id) => f.write_str(id),
            ConditionExpr::Selector {
                quantifier,
                pattern,
            } => write!(f, "{quantifier} of {pattern}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quantifier {
    /// `1 of` / `any of`
    Any,
    /// `all of`
    All,
    /// `N of`
    Count(u64),
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantifier::Any => f.write_str("1"),
            Quantifier::All => f.write_str("all"),
            Quantifier::Count(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SelectorPattern {
    /// Every block whose name does not start with `_`.
    Them,
    /// Glob over block names (`*` wildcard).
    Pattern(String),
}

impl fmt::Display for SelectorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorPattern::Them => f.write_str("them"),
            SelectorPattern::Pattern(p) => f.write_str(p),
        }
    }
}

// =============================================================================
// Detection Section
// =============================================================================

/// What a selection entry compares against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ItemTarget {
    /// Scalar expected values: OR-linked, or AND-linked under `|all`.
    Values(Vec<ExpectedValue>),
    /// A nested block; its entries resolve against the enclosing field.
    Nested(Detection),
}

/// One `field|modifiers: value(s)` entry of a selection block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionItem {
    pub field: FieldSpec,
    pub target: ItemTarget,
}

/// A selection block, or a branch of one.
///
/// Mappings lower to `AllOf`, lists of mappings to `AnyOf`, and lists of
/// scalars to `Keywords`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Detection {
    AllOf(Vec<DetectionItem>),
    AnyOf(Vec<Detection>),
    Keywords(Vec<ExpectedValue>),
}

/// The `detection:` section of a rule document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detections {
    /// Named selection blocks, in declaration order.
    pub named: Vec<(String, Detection)>,
    /// Parsed condition; `None` when the rule omitted it.
    pub condition: Option<ConditionExpr>,
    /// Raw condition text as written.
    pub condition_string: Option<String>,
    /// Legacy `timeframe` declared inside the detection section.
    pub timeframe: Option<Timespan>,
}

impl Detections {
    pub fn get(&self, name: &str) -> Option<&Detection> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.iter().map(|(n, _)| n.as_str())
    }
}

// =============================================================================
// Aggregation
// =============================================================================

/// Threshold comparison operator of an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Gte,
    Gt,
    Lte,
    Lt,
}

impl ConditionOperator {
    /// Parse the symbolic form used in `| count() > 5` pipes.
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "==" | "=" => Some(ConditionOperator::Eq),
            ">=" => Some(ConditionOperator::Gte),
            ">" => Some(ConditionOperator::Gt),
            "<=" => Some(ConditionOperator::Lte),
            "<" => Some(ConditionOperator::Lt),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ConditionOperator::Eq => "==",
            ConditionOperator::Gte => ">=",
            ConditionOperator::Gt => ">",
            ConditionOperator::Lte => "<=",
            ConditionOperator::Lt => "<",
        }
    }
}

impl FromStr for ConditionOperator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(ConditionOperator::Eq),
            "gte" => Ok(ConditionOperator::Gte),
            "gt" => Ok(ConditionOperator::Gt),
            "lte" => Ok(ConditionOperator::Lte),
            "lt" => Ok(ConditionOperator::Lt),
            _ => Err(()),
        }
    }
}

/// A count-over-window declaration, from a `correlation:` section or a
/// legacy `| count(field) by a, b > N` condition pipe.
///
/// The correlation type and threshold are kept as written; validating them
/// is part of rule compilation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationSpec {
    /// `event_count`, `value_count`, or whatever the author wrote.
    pub correlation_type: String,
    /// Field whose distinct values are counted.
    pub property: Option<String>,
    pub group_by: Vec<String>,
    pub operator: ConditionOperator,
    pub threshold: String,
    /// Window declared alongside the correlation, if any.
    pub timespan: Option<Timespan>,
}

/// Condition string split into its boolean part and optional aggregation pipe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCondition {
    pub expr: ConditionExpr,
    pub aggregation: Option<AggregationSpec>,
}

// =============================================================================
// Documents
// =============================================================================

/// Descriptive rule metadata carried into every detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleMetadata {
    pub title: String,
    pub id: Option<String>,
    pub status: Option<Status>,
    pub level: Option<Level>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub references: Vec<String>,
    /// Output fields extracted from matching events.
    pub fields: Vec<String>,
}

/// One document of a rule definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDocument {
    pub metadata: RuleMetadata,
    pub detection: Detections,
    pub aggregation: Option<AggregationSpec>,
    /// Document-level `timeframe`.
    pub timeframe: Option<Timespan>,
}

impl RuleDocument {
    /// Window length from the correlation, the document or the detection
    /// section, in that order.
    pub fn window(&self) -> Option<&Timespan> {
        self.aggregation
            .as_ref()
            .and_then(|a| a.timespan.as_ref())
            .or(self.timeframe.as_ref())
            .or(self.detection.timeframe.as_ref())
    }
}

/// A rule definition: one or more documents sharing a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleDefinition {
    pub documents: Vec<RuleDocument>,
}

/// Definitions loaded from files, with per-file errors collected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleLibrary {
    pub definitions: Vec<RuleDefinition>,
    #[serde(skip)]
    pub errors: Vec<String>,
}

impl RuleLibrary {
    pub fn document_count(&self) -> usize {
        self.definitions.iter().map(|d| d.documents.len()).sum()
    }
}
