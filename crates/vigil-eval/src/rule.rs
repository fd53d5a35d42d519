//! Compiled rules and their matching protocol.
//!
//! A definition document compiles into one of two rule kinds. Standard rules
//! are stateless: the predicate decides on the event alone. Aggregation
//! rules use the same predicate as a pre-filter, and fire only when the
//! windowed count over their candidates crosses the threshold.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use vigil_rules::{AggregationSpec, ConditionOperator, RuleDefinition, RuleDocument, RuleMetadata};

use crate::compiler::{
    CompileContext, CompiledPredicate, DetailsExtractor, RoutingSets, collect_fields,
    compile_predicate, routing_sets,
};
use crate::error::{DefinitionError, EvalError, Result};
use crate::event::StructuredEvent;
use crate::query::build_query;
use crate::result::{DetectionMatch, RuleKind};
use crate::store::WindowStore;

const EVENT_COUNT: &str = "event_count";
const VALUE_COUNT: &str = "value_count";

// =============================================================================
// Shared core
// =============================================================================

/// Parts every compiled rule carries.
#[derive(Debug, Clone)]
pub struct RuleCore {
    /// Rule id, or the title when the document has no id.
    pub key: String,
    pub metadata: Arc<RuleMetadata>,
    pub predicate: CompiledPredicate,
    pub details: DetailsExtractor,
    pub routes: RoutingSets,
    /// Canonical names of every field the rule reads.
    pub fields: BTreeSet<String>,
}

impl RuleCore {
    fn detection(
        &self,
        kind: RuleKind,
        matched_selections: Vec<String>,
        event: StructuredEvent,
    ) -> DetectionMatch {
        DetectionMatch {
            rule: Arc::clone(&self.metadata),
            rule_key: self.key.clone(),
            kind,
            matched_selections,
            matched_fields: self.details.extract(&event),
            event,
        }
    }
}

// =============================================================================
// Standard rules
// =============================================================================

#[derive(Debug, Clone)]
pub struct StandardRule {
    pub core: RuleCore,
}

impl StandardRule {
    /// Evaluate the predicate once; extract details only on a match.
    pub fn try_match(
        &self,
        event: &StructuredEvent,
    ) -> std::result::Result<Option<DetectionMatch>, EvalError> {
        let Some(selections) = self.core.predicate.evaluate_with_selections(event)? else {
            return Ok(None);
        };
        Ok(Some(self.core.detection(
            RuleKind::Standard,
            selections,
            event.clone(),
        )))
    }
}

// =============================================================================
// Aggregation rules
// =============================================================================

/// Validated count-over-window declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledAggregation {
    pub window: Duration,
    pub operator: ConditionOperator,
    pub threshold: i64,
    /// Field whose distinct values are counted (`value_count`).
    pub property: Option<String>,
    pub dimensions: Vec<String>,
}

impl CompiledAggregation {
    /// Threshold query against the columns the store currently has.
    pub fn query(&self, contains_column: impl Fn(&str) -> bool) -> String {
        build_query(
            self.operator,
            self.threshold,
            self.property.as_deref(),
            &self.dimensions,
            contains_column,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AggregationRule {
    pub core: RuleCore,
    pub aggregation: CompiledAggregation,
}

impl AggregationRule {
    /// First phase: does the event belong in this rule's window?
    pub fn is_candidate(&self, event: &StructuredEvent) -> std::result::Result<bool, EvalError> {
        self.core.predicate.evaluate(event)
    }

    /// Second phase: query the window and synthesize one match per row.
    ///
    /// A failing store is logged and yields no match for this cycle.
    pub fn try_fire(&self, store: &dyn WindowStore) -> Vec<DetectionMatch> {
        let key = self.core.key.as_str();
        let sql = self
            .aggregation
            .query(|column| store.contains_column(key, column));

        let rows = match store.query(key, &sql) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(rule = key, error = %e, "aggregation query failed");
                return Vec::new();
            }
        };

        rows.into_iter()
            .map(|row| {
                let event = store.matched(key, row);
                self.core.detection(RuleKind::Aggregation, Vec::new(), event)
            })
            .collect()
    }
}

// =============================================================================
// Tagged union
// =============================================================================

/// A compiled rule, decided at compile time by the presence of a window.
#[derive(Debug, Clone)]
pub enum CompiledRule {
    Standard(StandardRule),
    Aggregation(AggregationRule),
}

impl CompiledRule {
    pub fn core(&self) -> &RuleCore {
        match self {
            CompiledRule::Standard(r) => &r.core,
            CompiledRule::Aggregation(r) => &r.core,
        }
    }

    pub fn key(&self) -> &str {
        &self.core().key
    }

    pub fn metadata(&self) -> &RuleMetadata {
        &self.core().metadata
    }

    pub fn routes(&self) -> &RoutingSets {
        &self.core().routes
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.core().fields
    }

    pub fn is_aggregation(&self) -> bool {
        matches!(self, CompiledRule::Aggregation(_))
    }

    pub fn as_aggregation(&self) -> Option<&AggregationRule> {
        match self {
            CompiledRule::Aggregation(r) => Some(r),
            CompiledRule::Standard(_) => None,
        }
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// Compile every document of a definition; the first error rejects all.
pub fn compile_definition(
    definition: &RuleDefinition,
    cx: &CompileContext,
) -> Result<Vec<CompiledRule>> {
    definition
        .documents
        .iter()
        .map(|doc| compile_rule(doc, cx))
        .collect()
}

/// Compile one document into a standard or aggregation rule.
pub fn compile_rule(doc: &RuleDocument, cx: &CompileContext) -> Result<CompiledRule> {
    let metadata = &doc.metadata;
    let key = metadata.id.clone().unwrap_or_else(|| metadata.title.clone());

    let predicate = compile_predicate(&doc.detection, cx)?;
    let mut fields = collect_fields(&predicate);
    let routes = routing_sets(&predicate);

    let aggregation = match (&doc.aggregation, doc.window()) {
        (Some(spec), window) => Some(compile_aggregation(&key, spec, window, cx)?),
        (None, Some(_)) => return Err(DefinitionError::MissingAggregation(key)),
        (None, None) => None,
    };
    if let Some(agg) = &aggregation {
        fields.extend(agg.dimensions.iter().cloned());
        fields.extend(agg.property.iter().cloned());
    }

    let details = DetailsExtractor::new(&metadata.fields, &fields, &cx.aliases);
    let core = RuleCore {
        key,
        metadata: Arc::new(metadata.clone()),
        predicate,
        details,
        routes,
        fields,
    };

    tracing::debug!(
        rule = %core.key,
        blocks = core.predicate.blocks.len(),
        fields = core.fields.len(),
        routable = core.routes.is_routable(),
        aggregation = aggregation.is_some(),
        "compiled rule"
    );

    Ok(match aggregation {
        Some(aggregation) => CompiledRule::Aggregation(AggregationRule { core, aggregation }),
        None => CompiledRule::Standard(StandardRule { core }),
    })
}

fn compile_aggregation(
    key: &str,
    spec: &AggregationSpec,
    window: Option<&vigil_rules::Timespan>,
    cx: &CompileContext,
) -> Result<CompiledAggregation> {
    let property = match spec.correlation_type.as_str() {
        EVENT_COUNT => None,
        VALUE_COUNT => match &spec.property {
            Some(p) => Some(cx.aliases.canonical(p).to_string()),
            None => {
                return Err(DefinitionError::InvalidCorrelation(format!(
                    "rule '{key}': value_count requires a field"
                )));
            }
        },
        other => return Err(DefinitionError::UnknownCorrelationType(other.to_string())),
    };

    let threshold = spec
        .threshold
        .trim()
        .parse::<i64>()
        .map_err(|_| DefinitionError::InvalidThreshold(spec.threshold.clone()))?;

    let Some(window) = window else {
        return Err(DefinitionError::MissingWindow(key.to_string()));
    };

    Ok(CompiledAggregation {
        window: window.as_duration(),
        operator: spec.operator,
        threshold,
        property,
        dimensions: spec
            .group_by
            .iter()
            .map(|d| cx.aliases.canonical(d).to_string())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::AliasTable;
    use vigil_rules::parse_rule_yaml;

    fn compile_one(yaml: &str) -> Result<CompiledRule> {
        compile_one_with(yaml, &CompileContext::new())
    }

    fn compile_one_with(yaml: &str, cx: &CompileContext) -> Result<CompiledRule> {
        let def = parse_rule_yaml(yaml)?;
        let mut rules = compile_definition(&def, cx)?;
        assert_eq!(rules.len(), 1);
        Ok(rules.remove(0))
    }

    const FAILED_LOGON: &str = r#"
title: Failed Network Logon
id: 1b3c2a4d-0000-4000-8000-000000000001
level: medium
fields:
    - TargetUserName
detection:
    selection:
        EventID: 4625
        LogonType: 3
    condition: selection
"#;

    #[test]
    fn standard_rule_keyed_by_id() {
        let rule = compile_one(FAILED_LOGON).unwrap();
        assert!(!rule.is_aggregation());
        assert_eq!(rule.key(), "1b3c2a4d-0000-4000-8000-000000000001");
        assert!(rule.fields().contains("EventID"));
        assert!(rule.fields().contains("LogonType"));
    }

    #[test]
    fn key_falls_back_to_title() {
        let rule = compile_one(
            r#"
title: No Id
detection:
    selection:
        EventID: 1
    condition: selection
"#,
        )
        .unwrap();
        assert_eq!(rule.key(), "No Id");
    }

    #[test]
    fn standard_match_reports_selections_and_fields() {
        let CompiledRule::Standard(rule) = compile_one(FAILED_LOGON).unwrap() else {
            panic!("expected standard rule");
        };
        let event = StructuredEvent::new()
            .with_event_id(4625)
            .with_data("LogonType", "3")
            .with_data("TargetUserName", "alice");

        let m = rule.try_match(&event).unwrap().unwrap();
        assert_eq!(m.kind, RuleKind::Standard);
        assert_eq!(m.matched_selections, vec!["selection".to_string()]);
        assert_eq!(m.matched_fields.len(), 1);
        assert_eq!(m.matched_fields[0].field, "TargetUserName");
        assert_eq!(m.matched_fields[0].value, "alice");

        let other = StructuredEvent::new()
            .with_event_id(4625)
            .with_data("LogonType", "2");
        assert!(rule.try_match(&other).unwrap().is_none());
    }

    #[test]
    fn correlation_section_compiles_to_aggregation() {
        let rule = compile_one(
            r#"
title: Brute Force
detection:
    selection:
        EventID: 4625
    condition: selection
correlation:
    type: event_count
    group-by:
        - TargetUserName
    timespan: 5m
    condition:
        gte: 10
"#,
        )
        .unwrap();
        let agg = rule.as_aggregation().unwrap();
        assert_eq!(agg.aggregation.window, Duration::from_secs(300));
        assert_eq!(agg.aggregation.threshold, 10);
        assert_eq!(agg.aggregation.operator, ConditionOperator::Gte);
        assert_eq!(agg.aggregation.dimensions, vec!["TargetUserName".to_string()]);
        assert!(agg.aggregation.property.is_none());
        assert!(rule.fields().contains("TargetUserName"));
    }

    #[test]
    fn legacy_pipe_with_timeframe() {
        let rule = compile_one(
            r#"
title: Spray
detection:
    selection:
        EventID: 4625
    timeframe: 1h
    condition: selection | count(TargetUserName) by IpAddress > 20
"#,
        )
        .unwrap();
        let agg = rule.as_aggregation().unwrap();
        assert_eq!(agg.aggregation.window, Duration::from_secs(3600));
        assert_eq!(agg.aggregation.property.as_deref(), Some("TargetUserName"));
        assert_eq!(agg.aggregation.dimensions, vec!["IpAddress".to_string()]);
        assert_eq!(agg.aggregation.operator, ConditionOperator::Gt);
    }

    #[test]
    fn aggregation_names_are_aliased() {
        let cx = CompileContext::new().with_aliases(
            [("user", "TargetUserName"), ("src", "IpAddress")]
                .into_iter()
                .collect::<AliasTable>(),
        );
        let rule = compile_one_with(
            r#"
title: Aliased
detection:
    selection:
        EventID: 4625
    timeframe: 10m
    condition: selection | count(user) by src >= 3
"#,
            &cx,
        )
        .unwrap();
        let agg = rule.as_aggregation().unwrap();
        assert_eq!(agg.aggregation.property.as_deref(), Some("TargetUserName"));
        assert_eq!(agg.aggregation.dimensions, vec!["IpAddress".to_string()]);
    }

    #[test]
    fn unknown_correlation_type_rejected() {
        let err = compile_one(
            r#"
title: Bad Type
detection:
    selection:
        EventID: 1
    condition: selection
correlation:
    type: temporal
    timespan: 5m
    condition:
        gte: 2
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownCorrelationType(t) if t == "temporal"));
    }

    #[test]
    fn value_count_requires_field() {
        let err = compile_one(
            r#"
title: No Field
detection:
    selection:
        EventID: 1
    condition: selection
correlation:
    type: value_count
    timespan: 5m
    condition:
        gte: 2
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidCorrelation(_)));
    }

    #[test]
    fn non_integer_threshold_rejected() {
        let err = compile_one(
            r#"
title: Fractional
detection:
    selection:
        EventID: 1
    condition: selection
correlation:
    type: event_count
    timespan: 5m
    condition:
        gte: 2.5
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidThreshold(_)));
    }

    #[test]
    fn count_without_window_rejected() {
        let err = compile_one(
            r#"
title: No Window
detection:
    selection:
        EventID: 1
    condition: selection | count() > 5
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::MissingWindow(_)));
    }

    #[test]
    fn window_without_count_rejected() {
        let err = compile_one(
            r#"
title: Dangling Window
detection:
    selection:
        EventID: 1
    timeframe: 5m
    condition: selection
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::MissingAggregation(_)));
    }

    #[test]
    fn aggregation_query_follows_store_columns() {
        let rule = compile_one(
            r#"
title: Grouped
detection:
    selection:
        EventID: 4625
    timeframe: 5m
    condition: selection | count() by TargetUserName >= 3
"#,
        )
        .unwrap();
        let agg = &rule.as_aggregation().unwrap().aggregation;
        assert_eq!(
            agg.query(|c| c == "TargetUserName"),
            "SELECT \"TargetUserName\", COUNT(*) AS Count FROM Matches \
             GROUP BY \"TargetUserName\" HAVING Count >= 3"
        );
        assert_eq!(agg.query(|_| false), crate::query::EMPTY_QUERY);
    }
}
