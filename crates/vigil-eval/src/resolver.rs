//! Field-value resolution and the read-only lookup tables compiled rules
//! close over.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::event::{StructuredEvent, is_abnormal, split_values};

/// Nested keywords that decorate the enclosing field's value.
const RESERVED_NESTED_KEYS: [&str; 2] = ["value", "min_length"];

/// Prefix addressing a raw attribute without dotted traversal.
const ATTRIBUTE_PREFIX: char = '@';

const SYSTEM_PREFIX: &str = "Event.System.";
const EVENT_DATA_PREFIX: &str = "Event.EventData.";

// =============================================================================
// Resolution
// =============================================================================

/// A field value resolved from an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    /// `None` when the field is missing.
    pub value: Option<Cow<'a, str>>,
    /// Whether the raw value encodes several logical values.
    pub abnormal: bool,
}

impl<'a> Resolved<'a> {
    pub fn missing() -> Self {
        Resolved {
            value: None,
            abnormal: false,
        }
    }

    pub fn of(value: Cow<'a, str>) -> Self {
        let abnormal = is_abnormal(&value);
        Resolved {
            value: Some(value),
            abnormal,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Logical values, split lazily. Empty when the field is missing.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.value.as_deref().into_iter().flat_map(|v| {
            let split = self.abnormal.then(|| split_values(v));
            let whole = (!self.abnormal).then_some(v);
            split.into_iter().flatten().chain(whole)
        })
    }
}

/// Resolve `field` against `event`.
///
/// `parent` is the enclosing field of a nested block; the reserved keys
/// `value` and `min_length` read that field instead of themselves. Missing
/// fields resolve to `None`, never an error.
pub fn resolve<'a>(field: &str, parent: Option<&str>, event: &'a StructuredEvent) -> Resolved<'a> {
    let key = match parent {
        Some(p) if RESERVED_NESTED_KEYS.contains(&field) => p,
        _ => field,
    };
    lookup(key, event).map_or_else(Resolved::missing, Resolved::of)
}

fn lookup<'a>(key: &str, event: &'a StructuredEvent) -> Option<Cow<'a, str>> {
    if let Some(attr) = key.strip_prefix(ATTRIBUTE_PREFIX) {
        return borrowed(event.system.get(attr).or_else(|| event.event_data.get(attr)));
    }

    if key.contains('.') {
        if let Some(v) = event.system.get(key).or_else(|| event.event_data.get(key)) {
            return Some(Cow::Borrowed(v));
        }
        if let Some(rest) = key.strip_prefix(SYSTEM_PREFIX) {
            return borrowed(event.system.get(rest)).or_else(|| event.header(rest));
        }
        if let Some(rest) = key.strip_prefix(EVENT_DATA_PREFIX) {
            return borrowed(event.event_data.get(rest));
        }
        return None;
    }

    borrowed(event.system.get(key).or_else(|| event.event_data.get(key)))
        .or_else(|| event.header(key))
}

fn borrowed(v: Option<&String>) -> Option<Cow<'_, str>> {
    v.map(|s| Cow::Borrowed(s.as_str()))
}

// =============================================================================
// Alias table
// =============================================================================

/// Field-name → canonical-name map applied when rules are compiled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    aliases: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// The canonical name for `name`, or `name` itself.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map_or(name, String::as_str)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AliasTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = AliasTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

// =============================================================================
// Domain controllers
// =============================================================================

/// Host names of the domain controllers, for `expand: '%DomainControllers%'`.
///
/// Names compare case-insensitively with a trailing `$` (machine account)
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct DomainControllerSet {
    hosts: HashSet<String>,
}

impl DomainControllerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str) {
        self.hosts.insert(normalize_host(host));
    }

    pub fn contains(&self, host: &str) -> bool {
        !self.hosts.is_empty() && self.hosts.contains(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for DomainControllerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = DomainControllerSet::new();
        for host in iter {
            set.insert(host.as_ref());
        }
        set
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('$').to_lowercase()
}
