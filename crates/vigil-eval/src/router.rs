//! Pre-filter events to the rules that can possibly match them.
//!
//! Rules whose predicate pins `EventID` together with `Channel` or
//! `Provider_Name` to literal values are indexed by those pairs; every
//! other rule is evaluated against every event.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::StructuredEvent;
use crate::matcher::fold;
use crate::resolver::resolve;
use crate::rule::CompiledRule;

#[derive(Debug, Clone, Default)]
pub struct RuleRouter {
    by_channel: HashMap<(String, u32), Vec<usize>>,
    by_provider: HashMap<(String, u32), Vec<usize>>,
    unrouted: Vec<usize>,
}

impl RuleRouter {
    pub fn build(rules: &[Arc<CompiledRule>]) -> Self {
        let mut router = RuleRouter::default();
        for (idx, rule) in rules.iter().enumerate() {
            let routes = rule.routes();
            let (index, pairs) = match (&routes.channel_event, &routes.provider_event) {
                (Some(pairs), _) => (&mut router.by_channel, pairs),
                (None, Some(pairs)) => (&mut router.by_provider, pairs),
                (None, None) => {
                    router.unrouted.push(idx);
                    continue;
                }
            };
            for pair in pairs {
                index.entry(pair.clone()).or_default().push(idx);
            }
        }
        router
    }

    /// Indices of the rules to evaluate for `event`, ascending.
    pub fn candidates(&self, event: &StructuredEvent) -> Vec<usize> {
        let mut out = self.unrouted.clone();
        if !self.by_channel.is_empty() || !self.by_provider.is_empty() {
            let ids: Vec<u32> = resolve("EventID", None, event)
                .parts()
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !ids.is_empty() {
                lookup(&self.by_channel, "Channel", &ids, event, &mut out);
                lookup(&self.by_provider, "Provider_Name", &ids, event, &mut out);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn routed_len(&self) -> usize {
        self.by_channel
            .values()
            .chain(self.by_provider.values())
            .map(Vec::len)
            .sum()
    }

    pub fn unrouted_len(&self) -> usize {
        self.unrouted.len()
    }
}

fn lookup(
    index: &HashMap<(String, u32), Vec<usize>>,
    field: &str,
    ids: &[u32],
    event: &StructuredEvent,
    out: &mut Vec<usize>,
) {
    if index.is_empty() {
        return;
    }
    let resolved = resolve(field, None, event);
    for name in resolved.parts() {
        let name = fold(name).into_owned();
        for id in ids {
            if let Some(rules) = index.get(&(name.clone(), *id)) {
                out.extend_from_slice(rules);
            }
        }
    }
}
