//! Condition expression parser using a pest PEG grammar + Pratt parser.
//!
//! Parses condition strings like:
//! - `"selection and not filter"`
//! - `"1 of selection_* and not 1 of filter_*"`
//! - `"all of them"`
//! - `"selection | count(TargetUserName) by IpAddress >= 5"` (aggregation pipe)

use pest::Parser;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest_derive::Parser;

use crate::ast::{AggregationSpec, ConditionExpr, ConditionOperator, Quantifier, RuleCondition, SelectorPattern};
use crate::error::{Result, RuleError};

// ---------------------------------------------------------------------------
// Pest parser (generated from condition.pest)
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[grammar = "src/condition.pest"]
struct ConditionParser;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a boolean condition expression. Aggregation pipes are rejected.
///
/// ```
/// use vigil_rules::parse_condition;
///
/// let expr = parse_condition("selection and not 1 of filter_*").unwrap();
/// assert_eq!(expr.to_string(), "(selection and not 1 of filter_*)");
/// ```
pub fn parse_condition(input: &str) -> Result<ConditionExpr> {
    let parsed = parse_rule_condition(input)?;
    if parsed.aggregation.is_some() {
        return Err(RuleError::Condition(format!(
            "aggregation pipe not allowed here: {input}"
        )));
    }
    Ok(parsed.expr)
}

/// Parse a rule condition, including an optional trailing aggregation pipe
/// (`| count(field) by a, b <op> N`).
pub fn parse_rule_condition(input: &str) -> Result<RuleCondition> {
    let mut pairs = ConditionParser::parse(Rule::condition, input)
        .map_err(|e| RuleError::Condition(e.to_string()))?;

    let pratt = PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::prefix(Rule::not_op));

    // condition = { SOI ~ expr ~ aggregation? ~ EOI }
    let condition_pair = pairs
        .next()
        .ok_or_else(|| RuleError::Condition(format!("empty condition: {input}")))?;

    let mut expr = None;
    let mut aggregation = None;
    for p in condition_pair.into_inner() {
        match p.as_rule() {
            Rule::expr => expr = Some(parse_expr(p, &pratt)?),
            Rule::aggregation => aggregation = Some(parse_aggregation(p)?),
            _ => {}
        }
    }

    let expr = expr.ok_or_else(|| RuleError::Condition(format!("missing expression: {input}")))?;
    Ok(RuleCondition { expr, aggregation })
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

fn parse_expr(pair: Pair<'_, Rule>, pratt: &PrattParser<Rule>) -> Result<ConditionExpr> {
    pratt
        .map_primary(|primary| match primary.as_rule() {
            Rule::ident => Ok(ConditionExpr::Identifier(primary.as_str().to_string())),
            Rule::selector => parse_selector(primary),
            Rule::expr => parse_expr(primary, pratt),
            other => Err(unexpected(other)),
        })
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::not_op => Ok(ConditionExpr::Not(Box::new(rhs?))),
            other => Err(unexpected(other)),
        })
        .map_infix(|lhs, op, rhs| match op.as_rule() {
            Rule::and_op => Ok(merge_binary(true, lhs?, rhs?)),
            Rule::or_op => Ok(merge_binary(false, lhs?, rhs?)),
            other => Err(unexpected(other)),
        })
        .parse(pair.into_inner())
}

fn unexpected(rule: Rule) -> RuleError {
    RuleError::Condition(format!("unexpected grammar rule {rule:?}"))
}

/// Flatten nested operators of the same kind:
/// `a and (b and c)` becomes `And[a, b, c]`.
fn merge_binary(is_and: bool, lhs: ConditionExpr, rhs: ConditionExpr) -> ConditionExpr {
    let mut args = Vec::new();
    for side in [lhs, rhs] {
        match side {
            ConditionExpr::And(children) if is_and => args.extend(children),
            ConditionExpr::Or(children) if !is_and => args.extend(children),
            other => args.push(other),
        }
    }
    if is_and {
        ConditionExpr::And(args)
    } else {
        ConditionExpr::Or(args)
    }
}

fn parse_selector(pair: Pair<'_, Rule>) -> Result<ConditionExpr> {
    // of_kw_inner is atomic and leaks into the tree; skip it
    let mut quantifier = None;
    let mut pattern = None;

    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::quantifier => quantifier = Some(parse_quantifier(p)?),
            Rule::selector_target => pattern = Some(parse_selector_target(p)?),
            _ => {}
        }
    }

    match (quantifier, pattern) {
        (Some(quantifier), Some(pattern)) => Ok(ConditionExpr::Selector {
            quantifier,
            pattern,
        }),
        _ => Err(RuleError::Condition("incomplete selector".into())),
    }
}

fn parse_quantifier(pair: Pair<'_, Rule>) -> Result<Quantifier> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| RuleError::Condition("empty quantifier".into()))?;
    match inner.as_rule() {
        Rule::all_kw => Ok(Quantifier::All),
        Rule::any_kw => Ok(Quantifier::Any),
        Rule::uint => {
            let n: u64 = inner
                .as_str()
                .parse()
                .map_err(|_| RuleError::Condition(format!("invalid count '{}'", inner.as_str())))?;
            match n {
                0 => Err(RuleError::Condition("'0 of' never matches".into())),
                1 => Ok(Quantifier::Any),
                n => Ok(Quantifier::Count(n)),
            }
        }
        other => Err(unexpected(other)),
    }
}

fn parse_selector_target(pair: Pair<'_, Rule>) -> Result<SelectorPattern> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| RuleError::Condition("empty selector target".into()))?;
    match inner.as_rule() {
        Rule::them_kw => Ok(SelectorPattern::Them),
        Rule::ident_pattern => Ok(SelectorPattern::Pattern(inner.as_str().to_string())),
        other => Err(unexpected(other)),
    }
}

/// `count()` counts events, `count(field)` counts distinct field values; any
/// other function name is passed through and rejected at compile time.
fn parse_aggregation(pair: Pair<'_, Rule>) -> Result<AggregationSpec> {
    let mut function = String::new();
    let mut property = None;
    let mut group_by = Vec::new();
    let mut operator = None;
    let mut threshold = String::new();

    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::agg_function => function = p.as_str().to_ascii_lowercase(),
            Rule::agg_field => property = Some(p.as_str().to_string()),
            Rule::group_clause => {
                group_by.extend(
                    p.into_inner()
                        .filter(|g| g.as_rule() == Rule::group_field)
                        .map(|g| g.as_str().to_string()),
                );
            }
            Rule::cmp_op => operator = ConditionOperator::from_symbol(p.as_str()),
            Rule::threshold => threshold = p.as_str().to_string(),
            _ => {}
        }
    }

    let operator =
        operator.ok_or_else(|| RuleError::Condition("aggregation is missing an operator".into()))?;
    let correlation_type = match (function.as_str(), &property) {
        ("count", None) => "event_count".to_string(),
        ("count", Some(_)) => "value_count".to_string(),
        _ => function,
    };

    Ok(AggregationSpec {
        correlation_type,
        property,
        group_by,
        operator,
        threshold,
        timespan: None,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConditionExpr {
        ConditionExpr::Identifier(s.to_string())
    }

    #[test]
    fn simple_identifier() {
        assert_eq!(parse_condition("selection").unwrap(), id("selection"));
    }

    #[test]
    fn and_not() {
        let expr = parse_condition("selection and not filter").unwrap();
        assert_eq!(
            expr,
            ConditionExpr::And(vec![id("selection"), ConditionExpr::Not(Box::new(id("filter")))])
        );
    }

    #[test]
    fn precedence_not_and_or() {
        // a or ((not b) and c)
        let expr = parse_condition("a or not b and c").unwrap();
        assert_eq!(
            expr,
            ConditionExpr::Or(vec![
                id("a"),
                ConditionExpr::And(vec![ConditionExpr::Not(Box::new(id("b"))), id("c")]),
            ])
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse_condition("(a or b) and c").unwrap();
        assert_eq!(
            expr,
            ConditionExpr::And(vec![ConditionExpr::Or(vec![id("a"), id("b")]), id("c")])
        );
    }

    #[test]
    fn same_operator_chains_flatten() {
        assert_eq!(
            parse_condition("a and b and c").unwrap(),
            ConditionExpr::And(vec![id("a"), id("b"), id("c")])
        );
        assert_eq!(
            parse_condition("a or (b or c)").unwrap(),
            ConditionExpr::Or(vec![id("a"), id("b"), id("c")])
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            parse_condition("a AND NOT b").unwrap(),
            ConditionExpr::And(vec![id("a"), ConditionExpr::Not(Box::new(id("b")))])
        );
    }

    #[test]
    fn identifier_containing_keyword() {
        assert_eq!(parse_condition("selection_and_filter").unwrap(), id("selection_and_filter"));
        assert_eq!(parse_condition("order").unwrap(), id("order"));
    }

    #[test]
    fn selectors() {
        assert_eq!(
            parse_condition("1 of selection_*").unwrap(),
            ConditionExpr::Selector {
                quantifier: Quantifier::Any,
                pattern: SelectorPattern::Pattern("selection_*".into()),
            }
        );
        assert_eq!(
            parse_condition("all of them").unwrap(),
            ConditionExpr::Selector {
                quantifier: Quantifier::All,
                pattern: SelectorPattern::Them,
            }
        );
        assert_eq!(
            parse_condition("3 of sel*").unwrap(),
            ConditionExpr::Selector {
                quantifier: Quantifier::Count(3),
                pattern: SelectorPattern::Pattern("sel*".into()),
            }
        );
        assert_eq!(
            parse_condition("any of filter").unwrap(),
            ConditionExpr::Selector {
                quantifier: Quantifier::Any,
                pattern: SelectorPattern::Pattern("filter".into()),
            }
        );
    }

    #[test]
    fn zero_of_is_rejected() {
        assert!(parse_condition("0 of sel*").is_err());
    }

    #[test]
    fn malformed_conditions_fail() {
        assert!(parse_condition("").is_err());
        assert!(parse_condition("a and").is_err());
        assert!(parse_condition("(a or b").is_err());
        assert!(parse_condition("and b").is_err());
    }

    #[test]
    fn aggregation_event_count() {
        let parsed = parse_rule_condition("selection | count() > 5").unwrap();
        assert_eq!(parsed.expr, id("selection"));
        let agg = parsed.aggregation.unwrap();
        assert_eq!(agg.correlation_type, "event_count");
        assert_eq!(agg.property, None);
        assert!(agg.group_by.is_empty());
        assert_eq!(agg.operator, ConditionOperator::Gt);
        assert_eq!(agg.threshold, "5");
    }

    #[test]
    fn aggregation_value_count_grouped() {
        let parsed = parse_rule_condition(
            "selection and not filter | count(TargetUserName) by IpAddress, Computer >= 10",
        )
        .unwrap();
        let agg = parsed.aggregation.unwrap();
        assert_eq!(agg.correlation_type, "value_count");
        assert_eq!(agg.property.as_deref(), Some("TargetUserName"));
        assert_eq!(agg.group_by, vec!["IpAddress", "Computer"]);
        assert_eq!(agg.operator, ConditionOperator::Gte);
        assert_eq!(agg.threshold, "10");
    }

    #[test]
    fn aggregation_keeps_unparsed_threshold_and_function() {
        let agg = parse_rule_condition("sel | sum(Bytes) == lots")
            .unwrap()
            .aggregation
            .unwrap();
        assert_eq!(agg.correlation_type, "sum");
        assert_eq!(agg.operator, ConditionOperator::Eq);
        assert_eq!(agg.threshold, "lots");
    }

    #[test]
    fn plain_parse_rejects_pipe() {
        assert!(parse_condition("selection | count() > 1").is_err());
    }
}
