//! Lowers deserialized rule trees into the typed model.
//!
//! Handles:
//! - Multi-document YAML (`---` separator, `action: global/reset/repeat`)
//! - Selection blocks: mappings, lists of mappings, keyword lists, nested
//!   field blocks
//! - Field specs with pipe-delimited modifiers
//! - `correlation:` sections and legacy `| count()` condition pipes
//! - Directory-based rule loading

use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::ast::*;
use crate::condition::parse_rule_condition;
use crate::error::{Result, RuleError};
use crate::value::{ExpectedValue, Timespan};

// =============================================================================
// Public API
// =============================================================================

/// Parse YAML text holding one rule definition (one or more documents).
///
/// `action: global` documents are merged into every following document until
/// `action: reset`; `action: repeat` re-emits the previous document with
/// overrides.
pub fn parse_rule_yaml(yaml: &str) -> Result<RuleDefinition> {
    let mut values = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        values.push(Value::deserialize(doc)?);
    }
    parse_rule_values(values)
}

/// Lower already-deserialized documents into a [`RuleDefinition`].
pub fn parse_rule_values(values: impl IntoIterator<Item = Value>) -> Result<RuleDefinition> {
    let mut definition = RuleDefinition::default();
    let mut global: Option<Value> = None;
    let mut previous: Option<Value> = None;

    for value in values {
        if value.is_null() {
            continue;
        }
        let Some(mapping) = value.as_mapping() else {
            return Err(RuleError::InvalidDocument("document is not a YAML mapping".into()));
        };

        let action = get_str(mapping, "action").map(str::to_string);
        let value = without_key(value, "action");
        let merged = match action.as_deref() {
            None => value,
            Some("global") => {
                global = Some(value);
                continue;
            }
            Some("reset") => {
                global = None;
                continue;
            }
            Some("repeat") => {
                let Some(prev) = previous.take() else {
                    return Err(RuleError::InvalidDocument(
                        "'action: repeat' without a previous document".into(),
                    ));
                };
                deep_merge(prev, value)
            }
            Some(other) => {
                return Err(RuleError::InvalidDocument(format!("unknown action '{other}'")));
            }
        };

        let merged = match &global {
            Some(g) => deep_merge(g.clone(), merged),
            None => merged,
        };
        definition.documents.push(parse_document(&merged)?);
        previous = Some(merged);
    }

    if definition.documents.is_empty() {
        return Err(RuleError::InvalidDocument("definition has no rule documents".into()));
    }
    Ok(definition)
}

/// Parse a single rule file.
pub fn parse_rule_file(path: &Path) -> Result<RuleDefinition> {
    let content = std::fs::read_to_string(path).map_err(|e| RuleError::read(path, e))?;
    parse_rule_yaml(&content)
}

/// Load every `.yml` / `.yaml` file under `dir`, collecting per-file errors.
pub fn parse_rule_directory(dir: &Path) -> Result<RuleLibrary> {
    fn walk(dir: &Path, library: &mut RuleLibrary) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .and_then(|entries| entries.collect::<std::io::Result<Vec<_>>>())
            .map_err(|e| RuleError::read(dir, e))?;
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, library)?;
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml" | "yaml")
            ) {
                match parse_rule_file(&path) {
                    Ok(def) => library.definitions.push(def),
                    Err(e) => library.errors.push(format!("{}: {e}", path.display())),
                }
            }
        }
        Ok(())
    }

    let mut library = RuleLibrary::default();
    walk(dir, &mut library)?;
    Ok(library)
}

// =============================================================================
// Documents
// =============================================================================

fn parse_document(value: &Value) -> Result<RuleDocument> {
    let m = value
        .as_mapping()
        .ok_or_else(|| RuleError::InvalidDocument("expected a YAML mapping".into()))?;

    let title = get_str(m, "title")
        .ok_or_else(|| RuleError::MissingField("title".into()))?
        .to_string();

    let detection_val = m
        .get("detection")
        .ok_or_else(|| RuleError::MissingField("detection".into()))?;
    let (detection, pipe) = parse_detections(detection_val)?;

    let correlation = m.get("correlation").map(parse_correlation).transpose()?;
    let aggregation = match (correlation, pipe) {
        (Some(_), Some(_)) => {
            return Err(RuleError::InvalidCorrelation(
                "both a correlation section and an aggregation pipe are declared".into(),
            ));
        }
        (c, p) => c.or(p),
    };

    let timeframe = get_str(m, "timeframe").map(Timespan::parse).transpose()?;

    let metadata = RuleMetadata {
        title,
        id: get_scalar(m, "id"),
        status: get_str(m, "status").and_then(|s| s.parse().ok()),
        level: get_str(m, "level").and_then(|s| s.parse().ok()),
        description: get_str(m, "description").map(str::to_string),
        author: get_str(m, "author").map(str::to_string),
        tags: get_str_list(m, "tags"),
        references: get_str_list(m, "references"),
        fields: get_str_list(m, "fields"),
    };

    Ok(RuleDocument {
        metadata,
        detection,
        aggregation,
        timeframe,
    })
}

// =============================================================================
// Detection Section
// =============================================================================

/// Parse the `detection:` section. Everything other than `condition` and
/// `timeframe` is a named selection block.
fn parse_detections(value: &Value) -> Result<(Detections, Option<AggregationSpec>)> {
    let m = value
        .as_mapping()
        .ok_or_else(|| RuleError::InvalidSelection("detection section must be a mapping".into()))?;

    let condition_string = match m.get("condition") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Sequence(seq)) if seq.len() == 1 => seq[0].as_str().map(str::to_string),
        Some(_) => {
            return Err(RuleError::InvalidSelection(
                "condition must be a single string".into(),
            ));
        }
    };

    let (condition, pipe) = match &condition_string {
        Some(s) => {
            let parsed = parse_rule_condition(s)?;
            (Some(parsed.expr), parsed.aggregation)
        }
        None => (None, None),
    };

    let timeframe = get_str(m, "timeframe").map(Timespan::parse).transpose()?;

    let mut named = Vec::new();
    for (key, val) in m {
        let Some(name) = key.as_str() else {
            return Err(RuleError::InvalidSelection(format!(
                "selection name must be a string, got {key:?}"
            )));
        };
        if name == "condition" || name == "timeframe" {
            continue;
        }
        named.push((name.to_string(), parse_detection(val)?));
    }

    if named.is_empty() {
        return Err(RuleError::InvalidSelection("no selection blocks".into()));
    }

    Ok((
        Detections {
            named,
            condition,
            condition_string,
            timeframe,
        },
        pipe,
    ))
}

/// Lower a selection block.
///
/// 1. mapping → AND-linked entries
/// 2. list of scalars (or a lone scalar) → keyword search
/// 3. list of mappings → any one mapping
pub fn parse_detection(value: &Value) -> Result<Detection> {
    match value {
        Value::Mapping(m) => {
            let items = m
                .iter()
                .map(|(k, v)| {
                    let key = k.as_str().ok_or_else(|| {
                        RuleError::InvalidSelection(format!("field name must be a string: {k:?}"))
                    })?;
                    parse_detection_item(key, v)
                })
                .collect::<Result<Vec<_>>>()?;
            if items.is_empty() {
                return Err(RuleError::InvalidSelection("empty selection block".into()));
            }
            Ok(Detection::AllOf(items))
        }
        Value::Sequence(seq) => {
            if seq.is_empty() {
                return Err(RuleError::InvalidSelection("empty selection list".into()));
            }
            if seq.iter().all(|v| v.is_mapping()) {
                let subs = seq.iter().map(parse_detection).collect::<Result<Vec<_>>>()?;
                Ok(Detection::AnyOf(subs))
            } else {
                Ok(Detection::Keywords(scalar_list(seq)?))
            }
        }
        other => Ok(Detection::Keywords(vec![scalar(other)?])),
    }
}

/// Lower one `field|modifiers: value` entry.
///
/// A field mapped to a mapping (or list of mappings) becomes a nested block
/// whose entries resolve against the field.
fn parse_detection_item(key: &str, value: &Value) -> Result<DetectionItem> {
    let field = parse_field_spec(key)?;
    let raw = field.has_modifier(Modifier::Re);

    let target = match value {
        Value::Mapping(_) => ItemTarget::Nested(parse_detection(value)?),
        Value::Sequence(seq) if !seq.is_empty() && seq.iter().all(|v| v.is_mapping()) => {
            ItemTarget::Nested(parse_detection(value)?)
        }
        Value::Sequence(seq) => {
            if seq.is_empty() {
                return Err(RuleError::InvalidSelection(format!(
                    "'{key}' has an empty value list"
                )));
            }
            let values = if raw {
                seq.iter().map(raw_scalar).collect::<Result<Vec<_>>>()?
            } else {
                scalar_list(seq)?
            };
            ItemTarget::Values(values)
        }
        other if raw => ItemTarget::Values(vec![raw_scalar(other)?]),
        other => ItemTarget::Values(vec![scalar(other)?]),
    };

    Ok(DetectionItem { field, target })
}

fn scalar(v: &Value) -> Result<ExpectedValue> {
    ExpectedValue::from_yaml(v)
        .ok_or_else(|| RuleError::InvalidSelection(format!("expected a scalar value, got {v:?}")))
}

fn scalar_list(seq: &[Value]) -> Result<Vec<ExpectedValue>> {
    seq.iter().map(scalar).collect()
}

/// Regex patterns keep `*` and `?` verbatim.
fn raw_scalar(v: &Value) -> Result<ExpectedValue> {
    match v {
        Value::String(s) => Ok(ExpectedValue::String(crate::value::WildcardString::raw(s))),
        other => scalar(other),
    }
}

/// Parse a selection key such as `TargetObject|endswith`.
///
/// `equalsfield` and `endswithfield` are shorthands for `fieldref` and
/// `fieldref|endswith`.
pub fn parse_field_spec(key: &str) -> Result<FieldSpec> {
    let mut parts = key.split('|');
    let name = match parts.next() {
        Some("") | None => None,
        Some(n) => Some(n.to_string()),
    };

    let mut modifiers = Vec::new();
    for m in parts {
        if m.is_empty() {
            return Err(RuleError::InvalidFieldSpec(format!("empty modifier in '{key}'")));
        }
        if m == "endswithfield" {
            modifiers.extend([Modifier::FieldRef, Modifier::EndsWith]);
            continue;
        }
        let modifier = m
            .parse::<Modifier>()
            .map_err(|_| RuleError::UnknownModifier(m.to_string()))?;
        modifiers.push(modifier);
    }

    if name.is_none() && !modifiers.is_empty() {
        return Err(RuleError::InvalidFieldSpec(format!(
            "modifiers without a field name in '{key}'"
        )));
    }

    Ok(FieldSpec::new(name, modifiers))
}

// =============================================================================
// Correlation Section
// =============================================================================

/// Parse an embedded `correlation:` mapping:
///
/// ```yaml
/// correlation:
///     type: value_count
///     group-by: [IpAddress]
///     timespan: 5m
///     condition:
///         gte: 10
///         field: TargetUserName
/// ```
fn parse_correlation(value: &Value) -> Result<AggregationSpec> {
    let corr = value
        .as_mapping()
        .ok_or_else(|| RuleError::InvalidCorrelation("correlation must be a mapping".into()))?;

    let correlation_type = get_str(corr, "type")
        .ok_or_else(|| RuleError::InvalidCorrelation("missing correlation type".into()))?
        .to_string();

    let group_by = get_str_or_str_list(corr, "group-by");
    let timespan = get_str(corr, "timespan").map(Timespan::parse).transpose()?;

    let cond = corr
        .get("condition")
        .and_then(Value::as_mapping)
        .ok_or_else(|| RuleError::InvalidCorrelation("condition must be a mapping".into()))?;

    let mut operator = None;
    let mut threshold = String::new();
    for op_str in ["eq", "gte", "gt", "lte", "lt"] {
        if let Some(val) = cond.get(op_str) {
            operator = op_str.parse().ok();
            threshold = match val {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => format!("{other:?}"),
            };
            break;
        }
    }
    let operator = operator.ok_or_else(|| {
        RuleError::InvalidCorrelation(
            "condition must have one of the operators eq, gte, gt, lte, lt".into(),
        )
    })?;

    let property = get_str(cond, "field")
        .or_else(|| get_str(corr, "field"))
        .map(str::to_string);

    Ok(AggregationSpec {
        correlation_type,
        property,
        group_by,
        operator,
        threshold,
        timespan,
    })
}

// =============================================================================
// YAML Helpers
// =============================================================================

fn get_str<'a>(m: &'a Mapping, key: &str) -> Option<&'a str> {
    m.get(key).and_then(Value::as_str)
}

/// String or number, rendered as text (rule ids are sometimes numeric).
fn get_scalar(m: &Mapping, key: &str) -> Option<String> {
    match m.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn get_str_list(m: &Mapping, key: &str) -> Vec<String> {
    match m.get(key) {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn get_str_or_str_list(m: &Mapping, key: &str) -> Vec<String> {
    match m.get(key) {
        Some(Value::String(s)) => vec![s.clone()],
        _ => get_str_list(m, key),
    }
}

fn without_key(mut value: Value, key: &str) -> Value {
    if let Some(m) = value.as_mapping_mut() {
        m.remove(key);
    }
    value
}

/// Deep-merge two YAML values; `src` wins, mappings merge recursively.
fn deep_merge(dest: Value, src: Value) -> Value {
    match (dest, src) {
        (Value::Mapping(mut dest_map), Value::Mapping(src_map)) => {
            for (k, v) in src_map {
                let merged = match dest_map.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                dest_map.insert(k, merged);
            }
            Value::Mapping(dest_map)
        }
        (_, src) => src,
    }
}

// =============================================================================
// Tests
// =============================================================================
