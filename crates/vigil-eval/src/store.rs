//! Windowed store boundary and the aggregation cycle.
//!
//! The store itself lives outside this crate. It keeps, per aggregation
//! rule, the candidate events still inside the rule's window as a relation
//! named `Matches` and runs the threshold queries built by
//! [`crate::query`].

use std::collections::BTreeMap;
use std::time::Duration;

use crate::engine::RuleSet;
use crate::error::StoreError;
use crate::event::StructuredEvent;
use crate::result::DetectionMatch;

/// Per-rule windowed event storage.
pub trait WindowStore {
    /// Append candidates to a rule's window.
    fn add(
        &mut self,
        rule_id: &str,
        window: Duration,
        events: &[StructuredEvent],
    ) -> Result<(), StoreError>;

    /// Drop events that fell out of the listed rules' windows.
    fn trim_expired(&mut self, rule_ids: &[&str]) -> Result<(), StoreError>;

    /// Run a threshold query; every returned row is a firing.
    fn query(&self, rule_id: &str, sql: &str) -> Result<Vec<StructuredEvent>, StoreError>;

    /// Whether the rule's relation has a column for `name`.
    fn contains_column(&self, rule_id: &str, name: &str) -> bool;

    /// Turn a result row into the event reported with the detection.
    fn matched(&self, rule_id: &str, row: StructuredEvent) -> StructuredEvent;
}

/// An event that passed an aggregation rule's predicate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub rule_key: String,
    pub event: StructuredEvent,
}

impl Candidate {
    pub fn new(rule_key: impl Into<String>, event: StructuredEvent) -> Self {
        Candidate {
            rule_key: rule_key.into(),
            event,
        }
    }
}

/// One add → trim → query pass over a batch of candidates.
pub struct AggregationCycle<'a> {
    rules: &'a RuleSet,
}

impl<'a> AggregationCycle<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        AggregationCycle { rules }
    }

    /// Store the batch, trim the touched windows once, then fire.
    ///
    /// Candidates whose rule is no longer installed are dropped. Store
    /// failures are logged and cost only the affected rule this cycle.
    pub fn run(&self, store: &mut dyn WindowStore, batch: Vec<Candidate>) -> Vec<DetectionMatch> {
        let mut grouped: BTreeMap<String, Vec<StructuredEvent>> = BTreeMap::new();
        for candidate in batch {
            grouped
                .entry(candidate.rule_key)
                .or_default()
                .push(candidate.event);
        }

        let mut touched = Vec::with_capacity(grouped.len());
        for (key, events) in &grouped {
            let Some(rule) = self.rules.aggregation(key) else {
                tracing::debug!(rule = %key, dropped = events.len(), "rule no longer installed");
                continue;
            };
            if let Err(e) = store.add(key, rule.aggregation.window, events) {
                tracing::warn!(rule = %key, error = %e, "failed to store candidates");
            }
            touched.push(rule);
        }
        if touched.is_empty() {
            return Vec::new();
        }

        let ids: Vec<&str> = touched.iter().map(|r| r.core.key.as_str()).collect();
        if let Err(e) = store.trim_expired(&ids) {
            tracing::warn!(error = %e, rules = ids.len(), "failed to trim windows");
        }

        let store: &dyn WindowStore = &*store;
        touched
            .into_iter()
            .flat_map(|rule| rule.try_fire(store))
            .collect()
    }
}
