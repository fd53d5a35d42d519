//! # vigil-rules
//!
//! Typed model of vigil detection rule definitions.
//!
//! A rule definition is a deserialized tree (one or more YAML documents)
//! holding metadata, named selection blocks and a condition string. This
//! crate lowers that tree into strongly-typed values the evaluator compiles:
//!
//! - **Selection blocks**: field → value mappings, lists of mappings, keyword
//!   lists and nested field blocks
//! - **Field specs**: pipe-delimited modifiers (`CommandLine|contains|all`)
//! - **Condition expressions**: `and`, `or`, `not`, parentheses, `1 of`,
//!   `all of`, `N of <glob>`, `them`
//! - **Aggregations**: `correlation:` sections and legacy
//!   `| count(field) by a, b > N` pipes
//! - **Values**: wildcard strings, numbers, booleans, null, timespans
//!
//! ## Quick Start
//!
//! ```rust
//! use vigil_rules::parse_rule_yaml;
//!
//! let yaml = r#"
//! title: Failed Network Logon
//! level: medium
//! detection:
//!     selection:
//!         EventID: 4625
//!         LogonType: 3
//!     condition: selection
//! "#;
//!
//! let definition = parse_rule_yaml(yaml).unwrap();
//! assert_eq!(definition.documents.len(), 1);
//! assert_eq!(definition.documents[0].metadata.title, "Failed Network Logon");
//! ```

pub mod ast;
pub mod condition;
pub mod error;
pub mod parser;
pub mod value;

pub use ast::{
    AggregationSpec, ConditionExpr, ConditionOperator, Detection, DetectionItem, Detections,
    FieldSpec, ItemTarget, Level, Modifier, Quantifier, RuleCondition, RuleDefinition,
    RuleDocument, RuleLibrary, RuleMetadata, SelectorPattern, Status,
};
pub use condition::{parse_condition, parse_rule_condition};
pub use error::{Result, RuleError};
pub use parser::{
    parse_detection, parse_field_spec, parse_rule_directory, parse_rule_file, parse_rule_values,
    parse_rule_yaml,
};
pub use value::{ExpectedValue, StringPart, Timespan, Wildcard, WildcardString};
