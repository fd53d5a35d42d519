//! Compile rule detections into executable predicates.
//!
//! The compiler lowers the typed detection tree (`Detection`,
//! `DetectionItem`) and condition expression into a [`CompiledPredicate`]:
//! compiled selection blocks plus an index-based condition tree. Modifier
//! interpretation happens here; field names are alias-substituted once and
//! block globs are resolved against the block names once.
//!
//! The same pass derives the static routing sets and the flat field set a
//! rule reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as Base64Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ipnet::IpNet;
use regex::RegexBuilder;

use vigil_rules::{
    ConditionExpr, Detection, DetectionItem, Detections, ExpectedValue, ItemTarget, Modifier,
    Quantifier, RuleError, SelectorPattern, StringPart, Wildcard, WildcardString,
};

use crate::error::{DefinitionError, EvalError, Result};
use crate::event::StructuredEvent;
use crate::matcher::{
    CompiledMatcher, FieldRefKind, NumericOp, RegexMatcher, fold, wildcard_to_regex,
};
use crate::registry::RegexFailureRegistry;
use crate::resolver::{AliasTable, DomainControllerSet, resolve};
use crate::result::FieldMatch;

/// The only placeholder `expand` understands.
pub const DOMAIN_CONTROLLERS_PLACEHOLDER: &str = "%DomainControllers%";

/// Nested keyword comparing the parent value's length.
const MIN_LENGTH_KEY: &str = "min_length";

/// Replacement characters for `windash`: `-`, `/`, en dash, em dash and
/// horizontal bar.
pub const WINDASH_CHARS: [char; 5] = ['-', '/', '\u{2013}', '\u{2014}', '\u{2015}'];

/// Regex programs larger than this are deferred as evaluation failures.
pub const DEFAULT_REGEX_SIZE_LIMIT: usize = 10 * (1 << 20);

// =============================================================================
// Compile context
// =============================================================================

/// Knobs that change how values compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Legacy `fieldref` behavior: a missing side counts as a match.
    pub fieldref_null_matches: bool,
    /// Size limit handed to the regex builder for `re` patterns.
    pub regex_size_limit: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            fieldref_null_matches: false,
            regex_size_limit: DEFAULT_REGEX_SIZE_LIMIT,
        }
    }
}

/// Shared, read-mostly state every compiled predicate closes over.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    pub aliases: Arc<AliasTable>,
    pub domain_controllers: Arc<DomainControllerSet>,
    pub regex_failures: Arc<RegexFailureRegistry>,
    pub options: CompileOptions,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = Arc::new(aliases);
        self
    }

    pub fn with_domain_controllers(mut self, dcs: DomainControllerSet) -> Self {
        self.domain_controllers = Arc::new(dcs);
        self
    }

    pub fn with_regex_failures(mut self, registry: Arc<RegexFailureRegistry>) -> Self {
        self.regex_failures = registry;
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    fn canonical(&self, name: &str) -> String {
        self.aliases.canonical(name).to_string()
    }
}

// =============================================================================
// Compiled types
// =============================================================================

/// A compiled selection block, or a branch of one.
#[derive(Debug, Clone)]
pub enum CompiledDetection {
    /// AND-linked entries (from a mapping).
    AllOf(Vec<CompiledEntry>),
    /// OR-linked branches (from a list of mappings).
    AnyOf(Vec<CompiledDetection>),
    /// Keyword search over every event-data value.
    Keywords(CompiledMatcher),
}

#[derive(Debug, Clone)]
pub enum CompiledEntry {
    Item(CompiledDetectionItem),
    /// Nested block whose entries read the enclosing field.
    Nested(CompiledDetection),
}

/// A field + matcher.
#[derive(Debug, Clone)]
pub struct CompiledDetectionItem {
    /// Canonical field name; `None` for field-less keyword entries.
    pub field: Option<String>,
    /// Enclosing field of a nested block.
    pub parent: Option<String>,
    pub matcher: CompiledMatcher,
}

/// Condition tree over block indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledCondition {
    Block(usize),
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
    /// `N of <glob>` with the glob already resolved.
    Quantified {
        quantifier: Quantifier,
        blocks: Vec<usize>,
    },
}

/// A rule's executable predicate.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    /// Named blocks in declaration order.
    pub blocks: Vec<(String, CompiledDetection)>,
    pub condition: CompiledCondition,
}

impl CompiledPredicate {
    pub fn evaluate(&self, event: &StructuredEvent) -> std::result::Result<bool, EvalError> {
        let mut scratch = Vec::new();
        eval_condition(&self.condition, &self.blocks, event, &mut scratch)
    }

    /// Evaluate and report the names of the blocks that matched.
    pub fn evaluate_with_selections(
        &self,
        event: &StructuredEvent,
    ) -> std::result::Result<Option<Vec<String>>, EvalError> {
        let mut matched = Vec::new();
        if !eval_condition(&self.condition, &self.blocks, event, &mut matched)? {
            return Ok(None);
        }
        matched.sort_unstable();
        matched.dedup();
        Ok(Some(
            matched
                .into_iter()
                .map(|i| self.blocks[i].0.clone())
                .collect(),
        ))
    }
}

/// The (channel, event id) and (provider, event id) pairs a rule can match.
///
/// `None` means the rule is unroutable and must see every event. Channel
/// and provider names are lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSets {
    pub channel_event: Option<BTreeSet<(String, u32)>>,
    pub provider_event: Option<BTreeSet<(String, u32)>>,
}

impl RoutingSets {
    pub fn is_routable(&self) -> bool {
        self.channel_event.is_some() || self.provider_event.is_some()
    }
}

/// Extracts output fields from a matching event.
#[derive(Debug, Clone, Default)]
pub struct DetailsExtractor {
    fields: Vec<String>,
}

impl DetailsExtractor {
    /// Use the rule's declared output fields, or every field it reads.
    pub fn new(declared: &[String], read: &BTreeSet<String>, aliases: &AliasTable) -> Self {
        let fields = if declared.is_empty() {
            read.iter().cloned().collect()
        } else {
            declared
                .iter()
                .map(|f| aliases.canonical(f).to_string())
                .collect()
        };
        DetailsExtractor { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Present fields in order; abnormal patterns are joined with `, `.
    pub fn extract(&self, event: &StructuredEvent) -> Vec<FieldMatch> {
        self.fields
            .iter()
            .filter_map(|field| {
                let resolved = resolve(field, None, event);
                resolved.value.as_ref()?;
                Some(FieldMatch {
                    field: field.clone(),
                    value: resolved.parts().collect::<Vec<_>>().join(", "),
                })
            })
            .collect()
    }
}

// =============================================================================
// Modifier context
// =============================================================================

/// Parsed modifier flags for a single field specification.
#[derive(Clone, Copy, Default)]
struct ModCtx {
    contains: bool,
    startswith: bool,
    endswith: bool,
    all: bool,
    base64: bool,
    base64offset: bool,
    wide: bool,
    utf16be: bool,
    utf16: bool,
    windash: bool,
    re: bool,
    ignore_case: bool,
    multiline: bool,
    dotall: bool,
    cidr: bool,
    cased: bool,
    exists: bool,
    expand: bool,
    fieldref: bool,
    gt: bool,
    gte: bool,
    lt: bool,
    lte: bool,
    /// `all` was the only modifier.
    bare_all: bool,
}

impl ModCtx {
    fn from_modifiers(modifiers: &[Modifier]) -> Self {
        let mut ctx = ModCtx::default();
        for m in modifiers {
            match m {
                Modifier::Contains => ctx.contains = true,
                Modifier::StartsWith => ctx.startswith = true,
                Modifier::EndsWith => ctx.endswith = true,
                Modifier::All => ctx.all = true,
                Modifier::Base64 => ctx.base64 = true,
                Modifier::Base64Offset => ctx.base64offset = true,
                Modifier::Wide => ctx.wide = true,
                Modifier::Utf16Be => ctx.utf16be = true,
                Modifier::Utf16 => ctx.utf16 = true,
                Modifier::WinDash => ctx.windash = true,
                Modifier::Re => ctx.re = true,
                Modifier::IgnoreCase => ctx.ignore_case = true,
                Modifier::Multiline => ctx.multiline = true,
                Modifier::DotAll => ctx.dotall = true,
                Modifier::Cidr => ctx.cidr = true,
                Modifier::Cased => ctx.cased = true,
                Modifier::Exists => ctx.exists = true,
                Modifier::Expand => ctx.expand = true,
                Modifier::FieldRef => ctx.fieldref = true,
                Modifier::Gt => ctx.gt = true,
                Modifier::Gte => ctx.gte = true,
                Modifier::Lt => ctx.lt = true,
                Modifier::Lte => ctx.lte = true,
            }
        }
        ctx.bare_all = ctx.all && modifiers.iter().all(|m| *m == Modifier::All);
        ctx
    }

    fn is_case_insensitive(&self) -> bool {
        !self.cased
    }

    fn numeric_op(&self) -> Option<NumericOp> {
        if self.gt {
            Some(NumericOp::Gt)
        } else if self.gte {
            Some(NumericOp::Gte)
        } else if self.lt {
            Some(NumericOp::Lt)
        } else if self.lte {
            Some(NumericOp::Lte)
        } else {
            None
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        let invalid = |what: &str| {
            Err(DefinitionError::InvalidModifiers(format!(
                "{field}: {what}"
            )))
        };
        let position = [self.contains, self.startswith, self.endswith];
        if position.iter().filter(|b| **b).count() > 1 {
            return invalid("contains, startswith and endswith are mutually exclusive");
        }
        let numeric = [self.gt, self.gte, self.lt, self.lte];
        if numeric.iter().filter(|b| **b).count() > 1 {
            return invalid("only one of gt, gte, lt, lte may be used");
        }
        if (self.ignore_case || self.multiline || self.dotall) && !self.re {
            return invalid("regex flags require re");
        }
        if self.re && (self.contains || self.startswith || self.endswith || self.windash) {
            return invalid("re cannot be combined with string modifiers");
        }
        if self.base64 && self.base64offset {
            return invalid("base64 and base64offset are mutually exclusive");
        }
        if (self.wide || self.utf16be || self.utf16) && !(self.base64 || self.base64offset) {
            return invalid("utf16 encodings require base64 or base64offset");
        }
        if self.cidr && (self.contains || self.startswith || self.endswith || self.re) {
            return invalid("cidr cannot be combined with string modifiers");
        }
        if self.numeric_op().is_some() && (self.contains || self.startswith || self.endswith) {
            return invalid("numeric comparison cannot be combined with string modifiers");
        }
        Ok(())
    }
}

// =============================================================================
// Predicate compilation
// =============================================================================

/// Compile a detection section into a predicate.
///
/// A missing condition selects the only block; with several blocks it is an
/// error.
pub fn compile_predicate(detections: &Detections, cx: &CompileContext) -> Result<CompiledPredicate> {
    let mut blocks = Vec::with_capacity(detections.named.len());
    for (name, detection) in &detections.named {
        blocks.push((name.clone(), compile_detection(detection, None, cx)?));
    }

    let condition = match &detections.condition {
        Some(expr) => compile_condition(expr, &blocks)?,
        None if blocks.len() == 1 => CompiledCondition::Block(0),
        None => {
            return Err(RuleError::Condition(
                "condition is required when more than one block is declared".into(),
            )
            .into());
        }
    };

    Ok(CompiledPredicate { blocks, condition })
}

/// Resolve identifiers and globs to block indices.
pub fn compile_condition(
    expr: &ConditionExpr,
    blocks: &[(String, CompiledDetection)],
) -> Result<CompiledCondition> {
    Ok(match expr {
        ConditionExpr::Identifier(name) => CompiledCondition::Block(
            blocks
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| DefinitionError::UnknownDetection(name.clone()))?,
        ),
        ConditionExpr::And(args) => CompiledCondition::And(
            args.iter()
                .map(|a| compile_condition(a, blocks))
                .collect::<Result<_>>()?,
        ),
        ConditionExpr::Or(args) => CompiledCondition::Or(
            args.iter()
                .map(|a| compile_condition(a, blocks))
                .collect::<Result<_>>()?,
        ),
        ConditionExpr::Not(inner) => {
            CompiledCondition::Not(Box::new(compile_condition(inner, blocks)?))
        }
        ConditionExpr::Selector {
            quantifier,
            pattern,
        } => {
            let indices: Vec<usize> = blocks
                .iter()
                .enumerate()
                .filter(|(_, (name, _))| match pattern {
                    SelectorPattern::Them => !name.starts_with('_'),
                    SelectorPattern::Pattern(glob) => glob_matches(glob, name),
                })
                .map(|(i, _)| i)
                .collect();
            if indices.is_empty() {
                return Err(DefinitionError::EmptySelector(pattern.to_string()));
            }
            CompiledCondition::Quantified {
                quantifier: *quantifier,
                blocks: indices,
            }
        }
    })
}

// =============================================================================
// Detection compilation
// =============================================================================

/// Compile a selection block. `parent` is the enclosing field of a nested
/// block.
pub fn compile_detection(
    detection: &Detection,
    parent: Option<&str>,
    cx: &CompileContext,
) -> Result<CompiledDetection> {
    match detection {
        Detection::AllOf(items) => {
            if items.is_empty() {
                return Err(DefinitionError::InvalidModifiers(
                    "selection block must not be empty".into(),
                ));
            }
            let entries = items
                .iter()
                .map(|item| compile_entry(item, parent, cx))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledDetection::AllOf(entries))
        }
        Detection::AnyOf(branches) => {
            if branches.is_empty() {
                return Err(DefinitionError::InvalidModifiers(
                    "list of mappings must not be empty".into(),
                ));
            }
            let compiled = branches
                .iter()
                .map(|d| compile_detection(d, parent, cx))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledDetection::AnyOf(compiled))
        }
        Detection::Keywords(values) => Ok(CompiledDetection::Keywords(compile_keywords(
            values, cx,
        )?)),
    }
}

fn compile_entry(
    item: &DetectionItem,
    parent: Option<&str>,
    cx: &CompileContext,
) -> Result<CompiledEntry> {
    let field = item.field.name.as_deref().map(|n| cx.canonical(n));

    let values = match &item.target {
        ItemTarget::Nested(nested) => {
            let Some(name) = field else {
                return Err(DefinitionError::IncompatibleValue(
                    "nested block requires a field name".into(),
                ));
            };
            if !item.field.modifiers.is_empty() {
                return Err(DefinitionError::InvalidModifiers(format!(
                    "{name}: modifiers are not allowed on a nested block"
                )));
            }
            return Ok(CompiledEntry::Nested(compile_detection(
                nested,
                Some(&name),
                cx,
            )?));
        }
        ItemTarget::Values(values) => values,
    };

    let Some(field) = field else {
        return Ok(CompiledEntry::Item(CompiledDetectionItem {
            field: None,
            parent: None,
            matcher: compile_keywords(values, cx)?,
        }));
    };

    let ctx = ModCtx::from_modifiers(&item.field.modifiers);
    ctx.validate(&field)?;

    if values.is_empty() {
        return Err(DefinitionError::IncompatibleValue(format!(
            "{field}: no expected values"
        )));
    }

    let matcher = if ctx.exists {
        CompiledMatcher::Exists(exists_expectation(&values[0]))
    } else if field == MIN_LENGTH_KEY && item.field.modifiers.is_empty() {
        combine(
            values
                .iter()
                .map(|v| min_length(v).map(CompiledMatcher::MinLength))
                .collect::<Result<_>>()?,
            false,
        )
    } else if ctx.bare_all {
        let contains = ModCtx {
            contains: true,
            ..ctx
        };
        let matchers = values
            .iter()
            .map(|v| {
                compile_value(v, &field, &contains, cx).map(|m| match m {
                    CompiledMatcher::IsNull => m,
                    other => CompiledMatcher::AllValues(Box::new(other)),
                })
            })
            .collect::<Result<_>>()?;
        combine(matchers, true)
    } else {
        let matchers = values
            .iter()
            .map(|v| compile_value(v, &field, &ctx, cx))
            .collect::<Result<_>>()?;
        combine(matchers, ctx.all)
    };

    Ok(CompiledEntry::Item(CompiledDetectionItem {
        field: Some(field),
        parent: parent.map(str::to_string),
        matcher,
    }))
}

/// One matcher as-is, several as AND (`all`) or OR.
fn combine(mut matchers: Vec<CompiledMatcher>, all: bool) -> CompiledMatcher {
    if matchers.len() == 1 {
        if let Some(m) = matchers.pop() {
            return m;
        }
    }
    if all {
        CompiledMatcher::AllOf(matchers)
    } else {
        CompiledMatcher::AnyOf(matchers)
    }
}

fn compile_keywords(values: &[ExpectedValue], cx: &CompileContext) -> Result<CompiledMatcher> {
    let ctx = ModCtx {
        contains: true,
        ..ModCtx::default()
    };
    let matchers = values
        .iter()
        .map(|v| {
            if v.is_null_literal() {
                return Err(DefinitionError::IncompatibleValue(
                    "null is not a valid keyword".into(),
                ));
            }
            compile_string(&scalar_string(v), &ctx, cx)
        })
        .collect::<Result<_>>()?;
    Ok(combine(matchers, false))
}

// =============================================================================
// Value compilation (modifier interpretation)
// =============================================================================

/// Compile one expected value under the field's modifiers.
fn compile_value(
    value: &ExpectedValue,
    field: &str,
    ctx: &ModCtx,
    cx: &CompileContext,
) -> Result<CompiledMatcher> {
    if value.is_null_literal() {
        return Ok(CompiledMatcher::IsNull);
    }

    if ctx.expand {
        let text = scalar_string(value).text();
        if !text.eq_ignore_ascii_case(DOMAIN_CONTROLLERS_PLACEHOLDER) {
            return Err(DefinitionError::UnsupportedPlaceholder(text));
        }
        return Ok(CompiledMatcher::DomainController(Arc::clone(
            &cx.domain_controllers,
        )));
    }

    if ctx.fieldref {
        let target = cx.canonical(&scalar_string(value).text());
        let kind = if ctx.startswith {
            FieldRefKind::StartsWith
        } else if ctx.endswith {
            FieldRefKind::EndsWith
        } else if ctx.contains {
            FieldRefKind::Contains
        } else {
            FieldRefKind::Equals
        };
        if cx.options.fieldref_null_matches {
            tracing::debug!(field, reference = %target, "fieldref treats a missing side as a match");
        }
        return Ok(CompiledMatcher::FieldRef {
            field: target,
            kind,
            null_matches: cx.options.fieldref_null_matches,
        });
    }

    if ctx.re {
        return build_regex(&scalar_string(value).text(), ctx, cx);
    }

    if ctx.cidr {
        return parse_cidr(&scalar_string(value).text()).map(CompiledMatcher::Cidr);
    }

    if let Some(op) = ctx.numeric_op() {
        let expected = integer_value(value);
        if expected.is_none() {
            tracing::warn!(field, value = %value, "non-integer operand for numeric comparison never matches");
        }
        return Ok(CompiledMatcher::Numeric {
            op,
            value: expected,
        });
    }

    let ws = scalar_string(value);

    // Transformation chain: utf16 → base64 / base64offset → windash → string match
    if ctx.base64 || ctx.base64offset {
        let mut bytes = ws.text().into_bytes();
        if ctx.wide {
            bytes = to_utf16le_bytes(&bytes);
        }
        if ctx.utf16be {
            bytes = to_utf16be_bytes(&bytes);
        }
        if ctx.utf16 {
            bytes = to_utf16_bom_bytes(&bytes);
        }

        if ctx.base64 {
            let encoded = BASE64_STANDARD.encode(&bytes);
            return Ok(compile_plain(&encoded, ctx));
        }

        let contains = ModCtx {
            contains: true,
            ..*ctx
        };
        let matchers = base64_offset_patterns(&bytes)
            .iter()
            .map(|p| compile_plain(p, &contains))
            .collect();
        return Ok(CompiledMatcher::AnyOf(matchers));
    }

    if ctx.windash && ws.parts.iter().any(has_dash) {
        return compile_windash(&ws, ctx, cx);
    }

    compile_string(&ws, ctx, cx)
}

/// Compile a wildcard string using the position modifiers.
fn compile_string(ws: &WildcardString, ctx: &ModCtx, cx: &CompileContext) -> Result<CompiledMatcher> {
    if let Some(plain) = ws.as_plain() {
        return Ok(compile_plain(&plain, ctx));
    }
    let pattern = wildcard_to_regex(
        &ws.parts,
        ctx.is_case_insensitive(),
        !ctx.contains && !ctx.endswith,
        !ctx.contains && !ctx.startswith,
    );
    let regex = RegexBuilder::new(&pattern)
        .size_limit(cx.options.regex_size_limit)
        .build()?;
    Ok(CompiledMatcher::Wildcard(regex))
}

/// Compile a plain string value (no wildcards) using the modifier context.
fn compile_plain(plain: &str, ctx: &ModCtx) -> CompiledMatcher {
    let case_insensitive = ctx.is_case_insensitive();
    let value = if case_insensitive {
        fold(plain).into_owned()
    } else {
        plain.to_string()
    };
    if ctx.contains {
        CompiledMatcher::Contains {
            value,
            case_insensitive,
        }
    } else if ctx.startswith {
        CompiledMatcher::StartsWith {
            value,
            case_insensitive,
        }
    } else if ctx.endswith {
        CompiledMatcher::EndsWith {
            value,
            case_insensitive,
        }
    } else {
        CompiledMatcher::Exact {
            value,
            case_insensitive,
        }
    }
}

/// Every `-` accepts any of [`WINDASH_CHARS`], so one regex covers all
/// dash permutations.
fn compile_windash(ws: &WildcardString, ctx: &ModCtx, cx: &CompileContext) -> Result<CompiledMatcher> {
    let class: String = WINDASH_CHARS
        .iter()
        .map(|c| regex::escape(&c.to_string()))
        .collect();
    let class = format!("[{class}]");

    let mut pattern = String::from(if ctx.is_case_insensitive() {
        "(?is)"
    } else {
        "(?s)"
    });
    if !ctx.contains && !ctx.endswith {
        pattern.push('^');
    }
    for part in &ws.parts {
        match part {
            StringPart::Plain(text) => {
                let pieces: Vec<String> = text.split('-').map(regex::escape).collect();
                pattern.push_str(&pieces.join(class.as_str()));
            }
            StringPart::Wildcard(Wildcard::Multi) => pattern.push_str(".*"),
            StringPart::Wildcard(Wildcard::Single) => pattern.push('.'),
        }
    }
    if !ctx.contains && !ctx.startswith {
        pattern.push('$');
    }

    let regex = RegexBuilder::new(&pattern)
        .size_limit(cx.options.regex_size_limit)
        .build()?;
    Ok(CompiledMatcher::Wildcard(regex))
}

/// Build a `re` matcher. A pattern that does not build (bad syntax, or a
/// program over the size limit) is deferred: its first evaluation reports
/// the error, every later one is a non-match.
fn build_regex(pattern: &str, ctx: &ModCtx, cx: &CompileContext) -> Result<CompiledMatcher> {
    let mut flags = String::new();
    if ctx.ignore_case {
        flags.push('i');
    }
    if ctx.multiline {
        flags.push('m');
    }
    if ctx.dotall {
        flags.push('s');
    }
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };

    let failures = Arc::clone(&cx.regex_failures);
    match RegexBuilder::new(&full)
        .size_limit(cx.options.regex_size_limit)
        .build()
    {
        Ok(regex) => Ok(CompiledMatcher::Regex(RegexMatcher::ready(full, regex, failures))),
        Err(e) => {
            let reason = match e {
                regex::Error::CompiledTooBig(limit) => {
                    format!("compiled program exceeds the size limit of {limit} bytes")
                }
                other => other.to_string(),
            };
            tracing::warn!(pattern = %full, %reason, "regex deferred");
            Ok(CompiledMatcher::Regex(RegexMatcher::deferred(
                full, reason, failures,
            )))
        }
    }
}

// =============================================================================
// Condition evaluation
// =============================================================================

/// Evaluate a condition tree. Indices of the blocks that made it true are
/// pushed to `matched`; blocks of a failed branch or under a negation are
/// not reported.
fn eval_condition(
    cond: &CompiledCondition,
    blocks: &[(String, CompiledDetection)],
    event: &StructuredEvent,
    matched: &mut Vec<usize>,
) -> std::result::Result<bool, EvalError> {
    match cond {
        CompiledCondition::Block(i) => {
            let hit = eval_detection(&blocks[*i].1, None, event)?;
            if hit {
                matched.push(*i);
            }
            Ok(hit)
        }
        CompiledCondition::And(args) => {
            let mut branch = Vec::new();
            for a in args {
                if !eval_condition(a, blocks, event, &mut branch)? {
                    return Ok(false);
                }
            }
            matched.append(&mut branch);
            Ok(true)
        }
        CompiledCondition::Or(args) => {
            for a in args {
                let mut branch = Vec::new();
                if eval_condition(a, blocks, event, &mut branch)? {
                    matched.append(&mut branch);
                    return Ok(true);
                }
            }
            Ok(false)
        }
        CompiledCondition::Not(inner) => {
            let mut ignored = Vec::new();
            Ok(!eval_condition(inner, blocks, event, &mut ignored)?)
        }
        CompiledCondition::Quantified {
            quantifier,
            blocks: indices,
        } => {
            let mut hits = Vec::new();
            for i in indices {
                if eval_detection(&blocks[*i].1, None, event)? {
                    hits.push(*i);
                }
            }
            let count = hits.len() as u64;
            let satisfied = match quantifier {
                Quantifier::Any => count >= 1,
                Quantifier::All => count == indices.len() as u64,
                Quantifier::Count(n) => count >= *n,
            };
            if satisfied {
                matched.append(&mut hits);
            }
            Ok(satisfied)
        }
    }
}

fn eval_detection(
    detection: &CompiledDetection,
    parent: Option<&str>,
    event: &StructuredEvent,
) -> std::result::Result<bool, EvalError> {
    match detection {
        CompiledDetection::AllOf(entries) => {
            for entry in entries {
                let hit = match entry {
                    CompiledEntry::Item(item) => eval_item(item, event)?,
                    CompiledEntry::Nested(nested) => eval_detection(nested, parent, event)?,
                };
                if !hit {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        CompiledDetection::AnyOf(branches) => {
            for branch in branches {
                if eval_detection(branch, parent, event)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        CompiledDetection::Keywords(matcher) => eval_keywords(matcher, event),
    }
}

fn eval_item(
    item: &CompiledDetectionItem,
    event: &StructuredEvent,
) -> std::result::Result<bool, EvalError> {
    match &item.field {
        Some(field) => {
            let resolved = resolve(field, item.parent.as_deref(), event);
            item.matcher.matches(&resolved, event)
        }
        None => eval_keywords(&item.matcher, event),
    }
}

fn eval_keywords(
    matcher: &CompiledMatcher,
    event: &StructuredEvent,
) -> std::result::Result<bool, EvalError> {
    for value in event.keyword_values() {
        if matcher.matches_str(value, event)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// =============================================================================
// Static shape: field set and routing sets
// =============================================================================

/// Every field name the predicate reads, canonical.
pub fn collect_fields(predicate: &CompiledPredicate) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for (_, block) in &predicate.blocks {
        collect_detection_fields(block, &mut out);
    }
    out
}

fn collect_detection_fields(detection: &CompiledDetection, out: &mut BTreeSet<String>) {
    match detection {
        CompiledDetection::AllOf(entries) => {
            for entry in entries {
                match entry {
                    CompiledEntry::Item(item) => {
                        let read = match (&item.parent, item.field.as_deref()) {
                            (Some(p), Some("value" | MIN_LENGTH_KEY)) => Some(p.clone()),
                            (_, f) => f.map(str::to_string),
                        };
                        out.extend(read);
                        collect_matcher_fields(&item.matcher, out);
                    }
                    CompiledEntry::Nested(nested) => collect_detection_fields(nested, out),
                }
            }
        }
        CompiledDetection::AnyOf(branches) => {
            for b in branches {
                collect_detection_fields(b, out);
            }
        }
        CompiledDetection::Keywords(_) => {}
    }
}

fn collect_matcher_fields(matcher: &CompiledMatcher, out: &mut BTreeSet<String>) {
    match matcher {
        CompiledMatcher::FieldRef { field, .. } => {
            out.insert(field.clone());
        }
        CompiledMatcher::AllValues(inner) => collect_matcher_fields(inner, out),
        CompiledMatcher::AnyOf(ms) | CompiledMatcher::AllOf(ms) => {
            for m in ms {
                collect_matcher_fields(m, out);
            }
        }
        _ => {}
    }
}

/// Possible values of one header dimension; `None` = unconstrained.
type Constraint = Option<BTreeSet<String>>;

#[derive(Debug, Clone, Default)]
struct Shape {
    event_ids: Constraint,
    channels: Constraint,
    providers: Constraint,
}

impl Shape {
    fn intersect(self, other: Shape) -> Shape {
        fn meet(a: Constraint, b: Constraint) -> Constraint {
            match (a, b) {
                (None, x) | (x, None) => x,
                (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
            }
        }
        Shape {
            event_ids: meet(self.event_ids, other.event_ids),
            channels: meet(self.channels, other.channels),
            providers: meet(self.providers, other.providers),
        }
    }

    fn union(self, other: Shape) -> Shape {
        fn join(a: Constraint, b: Constraint) -> Constraint {
            match (a, b) {
                (Some(mut a), Some(b)) => {
                    a.extend(b);
                    Some(a)
                }
                _ => None,
            }
        }
        Shape {
            event_ids: join(self.event_ids, other.event_ids),
            channels: join(self.channels, other.channels),
            providers: join(self.providers, other.providers),
        }
    }
}

/// Derive the routing sets from plain literal `EventID`, `Channel` and
/// `Provider_Name` constraints.
pub fn routing_sets(predicate: &CompiledPredicate) -> RoutingSets {
    let shape = condition_shape(&predicate.condition, &predicate.blocks);
    let Some(ids) = shape.event_ids else {
        return RoutingSets::default();
    };
    let ids: Option<BTreeSet<u32>> = ids.iter().map(|id| id.parse().ok()).collect();
    let Some(ids) = ids else {
        return RoutingSets::default();
    };
    let pairs = |names: Option<BTreeSet<String>>| {
        names.map(|names| {
            names
                .iter()
                .flat_map(|n| ids.iter().map(move |id| (n.clone(), *id)))
                .collect::<BTreeSet<_>>()
        })
    };
    RoutingSets {
        channel_event: pairs(shape.channels),
        provider_event: pairs(shape.providers),
    }
}

fn condition_shape(cond: &CompiledCondition, blocks: &[(String, CompiledDetection)]) -> Shape {
    match cond {
        CompiledCondition::Block(i) => detection_shape(&blocks[*i].1),
        CompiledCondition::And(args) => args
            .iter()
            .map(|a| condition_shape(a, blocks))
            .fold(Shape::default(), Shape::intersect),
        CompiledCondition::Or(args) => fold_union(args.iter().map(|a| condition_shape(a, blocks))),
        CompiledCondition::Not(_) => Shape::default(),
        CompiledCondition::Quantified {
            quantifier,
            blocks: indices,
        } => {
            let shapes = indices.iter().map(|i| detection_shape(&blocks[*i].1));
            match quantifier {
                Quantifier::All => shapes.fold(Shape::default(), Shape::intersect),
                Quantifier::Any | Quantifier::Count(_) => fold_union(shapes),
            }
        }
    }
}

fn fold_union(mut shapes: impl Iterator<Item = Shape>) -> Shape {
    let Some(first) = shapes.next() else {
        return Shape::default();
    };
    shapes.fold(first, Shape::union)
}

fn detection_shape(detection: &CompiledDetection) -> Shape {
    match detection {
        CompiledDetection::AllOf(entries) => entries
            .iter()
            .map(|entry| match entry {
                CompiledEntry::Item(item) => item_shape(item),
                CompiledEntry::Nested(_) => Shape::default(),
            })
            .fold(Shape::default(), Shape::intersect),
        CompiledDetection::AnyOf(branches) => fold_union(branches.iter().map(detection_shape)),
        CompiledDetection::Keywords(_) => Shape::default(),
    }
}

fn item_shape(item: &CompiledDetectionItem) -> Shape {
    let mut shape = Shape::default();
    if item.parent.is_some() {
        return shape;
    }
    let Some(values) = literal_values(&item.matcher) else {
        return shape;
    };
    match item.field.as_deref() {
        Some("EventID") => shape.event_ids = Some(values),
        Some("Channel") => shape.channels = Some(values),
        Some("Provider_Name") => shape.providers = Some(values),
        _ => {}
    }
    shape
}

/// Values of a case-insensitive exact matcher or an OR of them.
fn literal_values(matcher: &CompiledMatcher) -> Option<BTreeSet<String>> {
    match matcher {
        CompiledMatcher::Exact {
            value,
            case_insensitive: true,
        } => Some(BTreeSet::from([value.clone()])),
        CompiledMatcher::AnyOf(ms) => {
            let mut out = BTreeSet::new();
            for m in ms {
                out.extend(literal_values(m)?);
            }
            Some(out)
        }
        _ => None,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Check a block name against a selector glob (`*` matches any run).
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Expected value as a wildcard string; numbers and booleans compare as text.
fn scalar_string(value: &ExpectedValue) -> WildcardString {
    match value {
        ExpectedValue::String(s) => s.clone(),
        other => WildcardString::raw(&other.to_string()),
    }
}

fn integer_value(value: &ExpectedValue) -> Option<i64> {
    match value {
        ExpectedValue::Integer(n) => Some(*n),
        ExpectedValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Some(*f as i64)
        }
        ExpectedValue::String(s) => s.as_plain()?.trim().parse().ok(),
        _ => None,
    }
}

fn min_length(value: &ExpectedValue) -> Result<usize> {
    integer_value(value)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            DefinitionError::IncompatibleValue(format!(
                "min_length requires a non-negative integer, got {value}"
            ))
        })
}

/// `exists` expects `true` unless the value says otherwise.
fn exists_expectation(value: &ExpectedValue) -> bool {
    match value {
        ExpectedValue::Bool(b) => *b,
        ExpectedValue::String(s) => !matches!(
            s.as_plain().map(|p| p.to_ascii_lowercase()).as_deref(),
            Some("false" | "no")
        ),
        _ => true,
    }
}

fn parse_cidr(text: &str) -> Result<IpNet> {
    let text = text.trim();
    let parsed = if text.contains('/') {
        text.parse::<IpNet>().ok()
    } else {
        text.parse::<std::net::IpAddr>().ok().map(IpNet::from)
    };
    parsed.ok_or_else(|| DefinitionError::InvalidCidr(text.to_string()))
}

fn has_dash(part: &StringPart) -> bool {
    matches!(part, StringPart::Plain(text) if text.contains('-'))
}

// =============================================================================
// Encoding helpers
// =============================================================================

/// Convert bytes to UTF-16LE representation (wide string / utf16le).
fn to_utf16le_bytes(bytes: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(bytes)
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn to_utf16be_bytes(bytes: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(bytes)
        .encode_utf16()
        .flat_map(u16::to_be_bytes)
        .collect()
}

/// UTF-16LE with the `FF FE` byte-order mark.
fn to_utf16_bom_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut result = vec![0xFF, 0xFE];
    result.extend_from_slice(&to_utf16le_bytes(bytes));
    result
}

/// The three base64 encodings of `value` at byte offsets 0, 1 and 2,
/// trimmed to the characters that do not depend on neighboring bytes.
fn base64_offset_patterns(value: &[u8]) -> Vec<String> {
    let mut patterns = Vec::with_capacity(3);
    for offset in 0..3usize {
        let mut padded = vec![0u8; offset];
        padded.extend_from_slice(value);
        let encoded = BASE64_STANDARD.encode(&padded);

        let start = (offset * 4).div_ceil(3);
        let trimmed = encoded.trim_end_matches('=');
        // Drop the trailing character when the final group is partial.
        let end = if (offset + value.len()) % 3 == 0 {
            trimmed.len()
        } else {
            trimmed.len().saturating_sub(1)
        };
        if start < end {
            patterns.push(trimmed[start..end].to_string());
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_rules::{FieldSpec, parse_condition, parse_detection};

    fn cx() -> CompileContext {
        CompileContext::new()
    }

    fn item(name: &str, modifiers: &[Modifier], values: Vec<ExpectedValue>) -> DetectionItem {
        DetectionItem {
            field: FieldSpec::new(Some(name.to_string()), modifiers.to_vec()),
            target: ItemTarget::Values(values),
        }
    }

    fn s(v: &str) -> ExpectedValue {
        ExpectedValue::String(WildcardString::new(v))
    }

    fn block(yaml: &str) -> CompiledDetection {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        compile_detection(&parse_detection(&value).unwrap(), None, &cx()).unwrap()
    }

    fn hit(det: &CompiledDetection, event: &StructuredEvent) -> bool {
        eval_detection(det, None, event).unwrap()
    }

    fn single(item: DetectionItem) -> CompiledDetection {
        compile_detection(&Detection::AllOf(vec![item]), None, &cx()).unwrap()
    }

    fn data(pairs: &[(&str, &str)]) -> StructuredEvent {
        pairs
            .iter()
            .fold(StructuredEvent::new(), |e, (k, v)| e.with_data(*k, *v))
    }

    fn predicate(yaml: &str) -> CompiledPredicate {
        let def = vigil_rules::parse_rule_yaml(yaml).unwrap();
        compile_predicate(&def.documents[0].detection, &cx()).unwrap()
    }

    #[test]
    fn block_entries_are_anded_values_ored() {
        let det = block("{User: [alice, bob], LogonType: 3}");
        assert!(hit(&det, &data(&[("User", "Alice"), ("LogonType", "3")])));
        assert!(hit(&det, &data(&[("User", "bob"), ("LogonType", "3")])));
        assert!(!hit(&det, &data(&[("User", "bob"), ("LogonType", "2")])));
        assert!(!hit(&det, &data(&[("User", "carol"), ("LogonType", "3")])));
    }

    #[test]
    fn list_of_maps_matches_any_map() {
        let det = block("[{Image: a.exe}, {ParentImage: b.exe}]");
        assert!(hit(&det, &data(&[("ParentImage", "B.EXE")])));
        assert!(!hit(&det, &data(&[("Image", "b.exe")])));
    }

    #[test]
    fn contains_all_requires_every_value() {
        let det = single(item(
            "CommandLine",
            &[Modifier::Contains, Modifier::All],
            vec![s("-enc"), s("hidden")],
        ));
        assert!(hit(&det, &data(&[("CommandLine", "ps -w hidden -enc AAA")])));
        assert!(!hit(&det, &data(&[("CommandLine", "ps -enc AAA")])));
    }

    #[test]
    fn bare_all_checks_every_logical_value() {
        let det = single(item("Domains", &[Modifier::All], vec![s("corp")]));
        let both = StructuredEvent::new().with_data_values("Domains", ["a.corp.local", "corp"]);
        let mixed = StructuredEvent::new().with_data_values("Domains", ["a.corp.local", "home"]);
        assert!(hit(&det, &both));
        assert!(!hit(&det, &mixed));
    }

    #[test]
    fn wildcard_respects_position_modifiers() {
        let starts = single(item("Image", &[Modifier::StartsWith], vec![s("C:\\Win*\\")]));
        assert!(hit(&starts, &data(&[("Image", "c:\\windows\\cmd.exe")])));
        assert!(!hit(&starts, &data(&[("Image", "D:\\windows\\cmd.exe")])));

        let exact = single(item("Image", &[], vec![s("*.exe")]));
        assert!(hit(&exact, &data(&[("Image", "a.EXE")])));
        assert!(!hit(&exact, &data(&[("Image", "a.exe.bak")])));
    }

    #[test]
    fn cased_is_case_sensitive() {
        let det = single(item("Name", &[Modifier::Cased], vec![s("ABC")]));
        assert!(hit(&det, &data(&[("Name", "ABC")])));
        assert!(!hit(&det, &data(&[("Name", "abc")])));
    }

    #[test]
    fn null_expected_matches_missing_field() {
        let det = single(item("Parent", &[], vec![ExpectedValue::Null]));
        assert!(hit(&det, &data(&[])));
        assert!(!hit(&det, &data(&[("Parent", "x")])));

        let literal = single(item("Parent", &[], vec![s("null")]));
        assert!(hit(&literal, &data(&[])));
    }

    #[test]
    fn exists_modifier() {
        let present = single(item("User", &[Modifier::Exists], vec![ExpectedValue::Bool(true)]));
        let absent = single(item("User", &[Modifier::Exists], vec![ExpectedValue::Bool(false)]));
        let with_user = data(&[("User", "")]);
        assert!(hit(&present, &with_user));
        assert!(!hit(&absent, &with_user));
        assert!(hit(&absent, &data(&[])));
    }

    #[test]
    fn numeric_modifiers_compare_integers() {
        let det = single(item("Count", &[Modifier::Gt], vec![ExpectedValue::Integer(10)]));
        assert!(hit(&det, &data(&[("Count", "11")])));
        assert!(!hit(&det, &data(&[("Count", "10")])));
        assert!(!hit(&det, &data(&[("Count", "eleven")])));

        let never = single(item("Count", &[Modifier::Lt], vec![s("ten")]));
        assert!(!hit(&never, &data(&[("Count", "1")])));
    }

    #[test]
    fn cidr_bare_address_is_host_network() {
        let det = single(item("IpAddress", &[Modifier::Cidr], vec![s("::1")]));
        assert!(hit(&det, &data(&[("IpAddress", "::1")])));
        assert!(!hit(&det, &data(&[("IpAddress", "::2")])));

        let err = compile_detection(
            &Detection::AllOf(vec![item("Ip", &[Modifier::Cidr], vec![s("nope")])]),
            None,
            &cx(),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidCidr(_)));
    }

    #[test]
    fn windash_accepts_every_dash() {
        let det = single(item(
            "CommandLine",
            &[Modifier::Contains, Modifier::WinDash],
            vec![s("-exec bypass")],
        ));
        for dash in WINDASH_CHARS {
            let cmd = format!("powershell {dash}exec bypass");
            assert!(hit(&det, &data(&[("CommandLine", cmd.as_str())])), "{cmd}");
        }
        assert!(!hit(&det, &data(&[("CommandLine", "powershell +exec bypass")])));
    }

    #[test]
    fn base64offset_contains() {
        let det = single(item(
            "CommandLine",
            &[Modifier::Base64Offset, Modifier::Contains],
            vec![s("http://")],
        ));
        for prefix in ["", "a", "ab"] {
            let encoded = BASE64_STANDARD.encode(format!("{prefix}http://evil"));
            assert!(hit(&det, &data(&[("CommandLine", encoded.as_str())])), "{encoded}");
        }
        assert!(!hit(&det, &data(&[("CommandLine", "aGVsbG8=")])));
    }

    #[test]
    fn base64_wide_encodes_utf16() {
        let det = single(item(
            "Payload",
            &[Modifier::Wide, Modifier::Base64, Modifier::Contains],
            vec![s("ps")],
        ));
        let encoded = BASE64_STANDARD.encode([b'p', 0, b's', 0]);
        assert!(hit(&det, &data(&[("Payload", encoded.as_str())])));
    }

    #[test]
    fn expand_domain_controllers() {
        let context = cx().with_domain_controllers(["DC01"].into_iter().collect());
        let det = compile_detection(
            &Detection::AllOf(vec![item(
                "WorkstationName",
                &[Modifier::Expand],
                vec![s("%DomainControllers%")],
            )]),
            None,
            &context,
        )
        .unwrap();
        assert!(hit(&det, &data(&[("WorkstationName", "DC01$")])));
        assert!(!hit(&det, &data(&[("WorkstationName", "WS01$")])));

        let err = compile_detection(
            &Detection::AllOf(vec![item(
                "WorkstationName",
                &[Modifier::Expand],
                vec![s("%Workstations%")],
            )]),
            None,
            &context,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnsupportedPlaceholder(_)));
    }

    #[test]
    fn fieldref_uses_alias_for_target() {
        let context = cx().with_aliases([("TargetAlias", "Target")].into_iter().collect());
        let det = compile_detection(
            &Detection::AllOf(vec![item(
                "Subject",
                &[Modifier::FieldRef],
                vec![s("TargetAlias")],
            )]),
            None,
            &context,
        )
        .unwrap();
        assert!(hit(&det, &data(&[("Subject", "Bob"), ("Target", "bob")])));
        assert!(!hit(&det, &data(&[("Subject", "Bob")])));
    }

    #[test]
    fn nested_block_reads_parent_field() {
        let det = block("{CommandLine: {value: '*whoami*', min_length: 10}}");
        assert!(hit(&det, &data(&[("CommandLine", "cmd /c whoami")])));
        assert!(!hit(&det, &data(&[("CommandLine", "whoami")])));
    }

    #[test]
    fn keywords_search_event_data() {
        let det = block("[mimikatz, 'sekurlsa::*']");
        assert!(hit(&det, &data(&[("CommandLine", "run MIMIKATZ.exe")])));
        assert!(hit(&det, &data(&[("Other", "x sekurlsa::logonpasswords")])));
        assert!(!hit(&det, &data(&[("CommandLine", "notepad")])));
    }

    #[test]
    fn aliases_apply_to_field_names() {
        let context = cx().with_aliases([("ProcessName", "Image")].into_iter().collect());
        let det = compile_detection(
            &Detection::AllOf(vec![item("ProcessName", &[Modifier::EndsWith], vec![s("\\cmd.exe")])]),
            None,
            &context,
        )
        .unwrap();
        assert!(hit(&det, &data(&[("Image", "C:\\Windows\\cmd.exe")])));
    }

    #[test]
    fn invalid_modifier_combinations() {
        let cases: [&[Modifier]; 4] = [
            &[Modifier::Contains, Modifier::StartsWith],
            &[Modifier::Gt, Modifier::Lt],
            &[Modifier::IgnoreCase],
            &[Modifier::Wide, Modifier::Contains],
        ];
        for mods in cases {
            let err = compile_detection(
                &Detection::AllOf(vec![item("F", mods, vec![s("x")])]),
                None,
                &cx(),
            )
            .unwrap_err();
            assert!(matches!(err, DefinitionError::InvalidModifiers(_)), "{mods:?}");
        }
    }

    #[test]
    fn regex_syntax_error_fails_once_then_never_matches() {
        let cx = cx();
        let det = compile_detection(
            &Detection::AllOf(vec![item("F", &[Modifier::Re], vec![s("[unclosed")])]),
            None,
            &cx,
        )
        .unwrap();
        let event = data(&[("F", "[unclosed")]);

        let err = eval_detection(&det, None, &event).unwrap_err();
        assert!(matches!(err, EvalError::Regex { ref pattern, .. } if pattern == "[unclosed"));
        assert_eq!(cx.regex_failures.len(), 1);

        assert!(!hit(&det, &event));
        assert!(!hit(&det, &data(&[("F", "anything")])));
        assert_eq!(cx.regex_failures.len(), 1);
    }

    #[test]
    fn regex_flags() {
        let det = single(item(
            "F",
            &[Modifier::Re, Modifier::IgnoreCase],
            vec![ExpectedValue::String(WildcardString::raw("^abc$"))],
        ));
        assert!(hit(&det, &data(&[("F", "ABC")])));
        let plain = single(item(
            "F",
            &[Modifier::Re],
            vec![ExpectedValue::String(WildcardString::raw("^abc$"))],
        ));
        assert!(!hit(&plain, &data(&[("F", "ABC")])));
    }

    #[test]
    fn selector_globs_resolve_at_compile_time() {
        let p = predicate(
            r#"
title: t
detection:
    selection_a: {A: 1}
    selection_b: {B: 2}
    filter: {C: 3}
    condition: 1 of selection_* and not filter
"#,
        );
        assert_eq!(
            p.condition,
            CompiledCondition::And(vec![
                CompiledCondition::Quantified {
                    quantifier: Quantifier::Any,
                    blocks: vec![0, 1],
                },
                CompiledCondition::Not(Box::new(CompiledCondition::Block(2))),
            ])
        );
        let selections = p
            .evaluate_with_selections(&data(&[("B", "2")]))
            .unwrap()
            .unwrap();
        assert_eq!(selections, vec!["selection_b".to_string()]);
        assert!(!p.evaluate(&data(&[("B", "2"), ("C", "3")])).unwrap());
    }

    #[test]
    fn failed_branches_do_not_report_their_blocks() {
        let p = predicate(
            r#"
title: t
detection:
    a: {A: 1}
    b: {B: 2}
    c: {C: 3}
    condition: (a and b) or c
"#,
        );
        let selections = p
            .evaluate_with_selections(&data(&[("A", "1"), ("C", "3")]))
            .unwrap()
            .unwrap();
        assert_eq!(selections, vec!["c".to_string()]);

        let selections = p
            .evaluate_with_selections(&data(&[("A", "1"), ("B", "2"), ("C", "3")]))
            .unwrap()
            .unwrap();
        assert_eq!(selections, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unsatisfied_quantifier_does_not_report_its_hits() {
        let p = predicate(
            r#"
title: t
detection:
    sel_a: {A: 1}
    sel_b: {B: 2}
    other: {C: 3}
    condition: all of sel_* or other
"#,
        );
        let selections = p
            .evaluate_with_selections(&data(&[("A", "1"), ("C", "3")]))
            .unwrap()
            .unwrap();
        assert_eq!(selections, vec!["other".to_string()]);
    }

    #[test]
    fn them_skips_underscore_blocks() {
        let p = predicate(
            r#"
title: t
detection:
    a: {A: 1}
    _helper: {H: 1}
    condition: all of them
"#,
        );
        assert_eq!(
            p.condition,
            CompiledCondition::Quantified {
                quantifier: Quantifier::All,
                blocks: vec![0],
            }
        );
    }

    #[test]
    fn unknown_identifier_and_empty_glob_are_errors() {
        let def = vigil_rules::parse_rule_yaml(
            "title: t\ndetection:\n    a: {A: 1}\n    condition: a and b\n",
        )
        .unwrap();
        let err = compile_predicate(&def.documents[0].detection, &cx()).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDetection(ref n) if n == "b"));

        let def = vigil_rules::parse_rule_yaml(
            "title: t\ndetection:\n    a: {A: 1}\n    condition: 1 of sel*\n",
        )
        .unwrap();
        let err = compile_predicate(&def.documents[0].detection, &cx()).unwrap_err();
        assert!(matches!(err, DefinitionError::EmptySelector(_)));
    }

    #[test]
    fn missing_condition_with_single_block() {
        let p = predicate("title: t\ndetection:\n    only: {A: 1}\n");
        assert_eq!(p.condition, CompiledCondition::Block(0));
    }

    #[test]
    fn count_quantifier() {
        let p = predicate(
            r#"
title: t
detection:
    s1: {A: 1}
    s2: {B: 1}
    s3: {C: 1}
    condition: 2 of s*
"#,
        );
        assert!(!p.evaluate(&data(&[("A", "1")])).unwrap());
        assert!(p.evaluate(&data(&[("A", "1"), ("C", "1")])).unwrap());
    }

    #[test]
    fn routing_sets_from_literals() {
        let p = predicate(
            r#"
title: t
detection:
    selection:
        Channel: Security
        EventID: [4624, 4625]
    condition: selection
"#,
        );
        let routes = routing_sets(&p);
        assert_eq!(
            routes.channel_event,
            Some(BTreeSet::from([
                ("security".to_string(), 4624),
                ("security".to_string(), 4625)
            ]))
        );
        assert_eq!(routes.provider_event, None);
    }

    #[test]
    fn routing_sets_intersect_and_union() {
        let p = predicate(
            r#"
title: t
detection:
    a: {Provider_Name: Sysmon, EventID: [1, 3]}
    b: {EventID: 3}
    c: {Provider_Name: Sysmon, EventID: 11}
    condition: (a and b) or c
"#,
        );
        let routes = routing_sets(&p);
        assert_eq!(
            routes.provider_event,
            Some(BTreeSet::from([
                ("sysmon".to_string(), 3),
                ("sysmon".to_string(), 11)
            ]))
        );
    }

    #[test]
    fn negation_and_wildcards_are_unroutable() {
        let negated = predicate(
            "title: t\ndetection:\n    a: {EventID: 1}\n    condition: not a\n",
        );
        assert!(!routing_sets(&negated).is_routable());

        let wildcard = predicate(
            "title: t\ndetection:\n    a: {EventID: 1, Channel: 'Micro*'}\n    condition: a\n",
        );
        assert!(!routing_sets(&wildcard).is_routable());
    }

    #[test]
    fn field_set_includes_parents_and_fieldrefs() {
        let p = predicate(
            r#"
title: t
detection:
    a:
        CommandLine: {value: x}
        Subject|fieldref: Target
    condition: a
"#,
        );
        let fields: Vec<String> = collect_fields(&p).into_iter().collect();
        assert_eq!(fields, vec!["CommandLine", "Subject", "Target"]);
    }

    #[test]
    fn details_extractor_prefers_declared_fields() {
        let read = BTreeSet::from(["A".to_string(), "B".to_string()]);
        let event = data(&[("A", "1"), ("B", "2"), ("C", "3")]);
        let declared = DetailsExtractor::new(&["C".to_string()], &read, &AliasTable::new());
        assert_eq!(declared.extract(&event)[0].value, "3");
        let fallback = DetailsExtractor::new(&[], &read, &AliasTable::new());
        assert_eq!(fallback.extract(&event).len(), 2);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_matches("selection_*", "selection_1"));
        assert!(glob_matches("*_filter", "main_filter"));
        assert!(glob_matches("sel*tion*", "selection_x"));
        assert!(glob_matches("*", "anything"));
        assert!(!glob_matches("filter*", "selection"));
        assert!(!glob_matches("a*b", "ac"));
    }

    #[test]
    fn base64_offset_patterns_are_stable() {
        let patterns = base64_offset_patterns(b"http://");
        assert_eq!(patterns.len(), 3);
        for p in &patterns {
            assert!(!p.contains('='));
        }
    }
}
