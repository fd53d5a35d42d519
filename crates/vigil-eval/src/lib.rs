//! # vigil-eval
//!
//! Compile-once evaluator for vigil detection rules.
//!
//! Rule definitions from [`vigil_rules`] are compiled into predicates over
//! [`StructuredEvent`]s. Field names are alias-substituted, modifiers are
//! interpreted and block globs are resolved once, at compile time; the hot
//! path only resolves fields and runs matchers.
//!
//! ## Architecture
//!
//! - **Standard rules** (stateless): the predicate decides on the event
//!   alone and a match is delivered immediately.
//! - **Aggregation rules** (windowed): the predicate selects candidates,
//!   which are micro-batched into a [`WindowStore`]. A threshold query over
//!   the rule's window decides whether the rule fires.
//! - **Routing**: rules pinned to literal `EventID` + `Channel` /
//!   `Provider_Name` values only see events with those headers.
//!
//! ## Quick Start
//!
//! ```rust
//! use vigil_eval::{Engine, StructuredEvent};
//! use vigil_rules::parse_rule_yaml;
//!
//! let yaml = r#"
//! title: Failed Network Logon
//! detection:
//!     selection:
//!         EventID: 4625
//!         LogonType: 3
//!     condition: selection
//! level: medium
//! "#;
//!
//! let engine = Engine::default();
//! engine.upsert(&parse_rule_yaml(yaml).unwrap()).unwrap();
//!
//! let event = StructuredEvent::new()
//!     .with_event_id(4625)
//!     .with_data("LogonType", "3");
//! let evaluation = engine.evaluate(&event);
//! assert_eq!(evaluation.detections.len(), 1);
//! assert_eq!(evaluation.detections[0].rule.title, "Failed Network Logon");
//! ```

pub mod batcher;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod matcher;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod result;
pub mod router;
pub mod rule;
pub mod store;

pub use batcher::{MicroBatcher, SubmitError};
pub use compiler::{
    CompileContext, CompileOptions, CompiledCondition, CompiledDetection, CompiledPredicate,
    DetailsExtractor, RoutingSets, compile_condition, compile_detection, compile_predicate,
};
pub use config::{BatchSettings, CompileSettings, EngineConfig, RegexSettings};
pub use engine::{Engine, Evaluation, LoadReport, RuleSet};
pub use error::{DefinitionError, EvalError, Result, StoreError};
pub use event::StructuredEvent;
pub use matcher::CompiledMatcher;
pub use pipeline::{DetectionPipeline, MatchSink};
pub use query::{EMPTY_QUERY, MATCHES_TABLE, build_query};
pub use registry::RegexFailureRegistry;
pub use resolver::{AliasTable, DomainControllerSet, Resolved, resolve};
pub use result::{DetectionMatch, FieldMatch, RuleKind};
pub use router::RuleRouter;
pub use rule::{
    AggregationRule, CompiledAggregation, CompiledRule, RuleCore, StandardRule, compile_definition,
    compile_rule,
};
pub use store::{AggregationCycle, Candidate, WindowStore};
