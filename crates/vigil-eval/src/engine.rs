//! Rule set and evaluation engine.
//!
//! A [`RuleSet`] is an immutable, routed collection of compiled rules.
//! The [`Engine`] owns the current rule set behind an `Arc` swap: rules are
//! compiled and the next set (router included) is built outside the lock,
//! then installed with a short write. Writers are serialized among
//! themselves; evaluators take a snapshot and run lock-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use vigil_rules::{RuleDefinition, RuleLibrary};

use crate::compiler::CompileContext;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::event::StructuredEvent;
use crate::result::DetectionMatch;
use crate::router::RuleRouter;
use crate::rule::{AggregationRule, CompiledRule, compile_definition};
use crate::store::Candidate;

// =============================================================================
// Rule set
// =============================================================================

/// Outcome of evaluating one event.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Standard rule detections, ready for the sink.
    pub detections: Vec<DetectionMatch>,
    /// Aggregation candidates, bound for the windowed store.
    pub candidates: Vec<Candidate>,
}

/// Immutable set of compiled rules, keyed and routed.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<CompiledRule>>,
    by_key: HashMap<String, usize>,
    router: RuleRouter,
}

impl RuleSet {
    /// Build a set; a later rule with the same key replaces an earlier one.
    pub fn new(rules: impl IntoIterator<Item = Arc<CompiledRule>>) -> Self {
        let mut ordered: Vec<Arc<CompiledRule>> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for rule in rules {
            match by_key.get(rule.key()) {
                Some(&idx) => ordered[idx] = rule,
                None => {
                    by_key.insert(rule.key().to_string(), ordered.len());
                    ordered.push(rule);
                }
            }
        }
        let router = RuleRouter::build(&ordered);
        RuleSet {
            rules: ordered,
            by_key,
            router,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn get(&self, key: &str) -> Option<&Arc<CompiledRule>> {
        self.by_key.get(key).map(|&idx| &self.rules[idx])
    }

    pub fn aggregation(&self, key: &str) -> Option<&AggregationRule> {
        self.get(key).and_then(|r| r.as_aggregation())
    }

    /// Run every routed rule against the event.
    ///
    /// A rule whose regex fails is logged and skipped; the remaining rules
    /// still run.
    pub fn evaluate(&self, event: &StructuredEvent) -> Evaluation {
        let mut out = Evaluation::default();
        for idx in self.router.candidates(event) {
            let rule = &self.rules[idx];
            let outcome = match rule.as_ref() {
                CompiledRule::Standard(r) => r.try_match(event).map(|m| {
                    out.detections.extend(m);
                }),
                CompiledRule::Aggregation(r) => r.is_candidate(event).map(|hit| {
                    if hit {
                        out.candidates
                            .push(Candidate::new(r.core.key.clone(), event.clone()));
                    }
                }),
            };
            if let Err(e) = outcome {
                tracing::warn!(rule = rule.key(), error = %e, "rule evaluation failed");
            }
        }
        out
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Outcome of loading a rule library.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub installed: usize,
    /// One line per rejected file or definition.
    pub errors: Vec<String>,
}

/// Holds the live rule set and the shared compile context.
///
/// # Example
///
/// ```rust
/// use vigil_eval::{Engine, StructuredEvent};
/// use vigil_rules::parse_rule_yaml;
///
/// let definition = parse_rule_yaml(r#"
/// title: Whoami
/// detection:
///     selection:
///         CommandLine|contains: whoami
///     condition: selection
/// "#).unwrap();
///
/// let engine = Engine::default();
/// engine.upsert(&definition).unwrap();
///
/// let event = StructuredEvent::new().with_data("CommandLine", "cmd /c WHOAMI");
/// let evaluation = engine.evaluate(&event);
/// assert_eq!(evaluation.detections.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Engine {
    context: CompileContext,
    current: RwLock<Arc<RuleSet>>,
    /// Held across read-modify-swap so concurrent writers do not drop
    /// each other's rules. Never taken by readers.
    writer: Mutex<()>,
}

impl Engine {
    pub fn new(context: CompileContext) -> Self {
        Engine {
            context,
            current: RwLock::new(Arc::new(RuleSet::default())),
            writer: Mutex::new(()),
        }
    }

    /// Engine whose compile options come from configuration.
    pub fn from_config(context: CompileContext, config: &EngineConfig) -> Self {
        Self::new(context.with_options(config.compile_options()))
    }

    pub fn context(&self) -> &CompileContext {
        &self.context
    }

    /// Compile without touching the live set.
    pub fn compile(&self, definition: &RuleDefinition) -> Result<Vec<CompiledRule>> {
        compile_definition(definition, &self.context)
    }

    /// Replace the live set.
    pub fn install(&self, rules: RuleSet) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap(rules);
    }

    fn swap(&self, rules: RuleSet) {
        let rules = Arc::new(rules);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = rules;
    }

    /// Compile a definition and add or replace its rules. Returns their keys.
    pub fn upsert(&self, definition: &RuleDefinition) -> Result<Vec<String>> {
        let compiled: Vec<Arc<CompiledRule>> = self
            .compile(definition)?
            .into_iter()
            .map(Arc::new)
            .collect();
        let keys: Vec<String> = compiled.iter().map(|r| r.key().to_string()).collect();

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        self.swap(RuleSet::new(current.rules().iter().cloned().chain(compiled)));

        tracing::debug!(rules = ?keys, "installed rules");
        Ok(keys)
    }

    /// Remove a rule by key. Returns whether it was installed.
    pub fn remove(&self, key: &str) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        if current.get(key).is_none() {
            return false;
        }
        self.swap(RuleSet::new(current.rules().iter().filter(|r| r.key() != key).cloned()));
        true
    }

    /// The rule set in force right now.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn evaluate(&self, event: &StructuredEvent) -> Evaluation {
        self.snapshot().evaluate(event)
    }

    /// Compile a whole library and install what compiled.
    ///
    /// A definition with any failing document is skipped as a whole.
    pub fn load_library(&self, library: &RuleLibrary) -> LoadReport {
        let mut report = LoadReport {
            errors: library.errors.clone(),
            ..LoadReport::default()
        };
        let mut compiled = Vec::new();
        for definition in &library.definitions {
            match self.compile(definition) {
                Ok(rules) => compiled.extend(rules.into_iter().map(Arc::new)),
                Err(e) => {
                    let title = definition
                        .documents
                        .first()
                        .map(|d| d.metadata.title.as_str())
                        .unwrap_or("<empty>");
                    tracing::warn!(rule = title, error = %e, "rule rejected");
                    report.errors.push(format!("{title}: {e}"));
                }
            }
        }
        report.installed = compiled.len();
        self.install(RuleSet::new(compiled));
        tracing::debug!(
            installed = report.installed,
            rejected = report.errors.len(),
            "loaded rule library"
        );
        report
    }
}
