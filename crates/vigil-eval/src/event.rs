//! Structured audit-log record.
//!
//! An event carries two string-keyed maps (`system` and `event_data`) plus a
//! typed header. Values that the source repeated are joined with
//! [`ABNORMAL_SEPARATOR`] and only split when a matcher asks for them.

use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Joins the logical values of a repeated field ("abnormal pattern").
pub const ABNORMAL_SEPARATOR: char = '\u{1f}';

/// Header keys lifted out of flat JSON input into typed fields.
const HEADER_KEYS: [&str; 7] = [
    "EventID",
    "Channel",
    "Computer",
    "Provider_Name",
    "Provider_Guid",
    "TimeCreated",
    "Timestamp",
];

/// An immutable audit-log record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredEvent {
    pub system: HashMap<String, String>,
    pub event_data: HashMap<String, String>,
    pub event_id: u32,
    pub provider_name: String,
    pub provider_guid: Option<String>,
    pub channel: String,
    pub computer: String,
    pub timestamp: DateTime<Utc>,
}

impl StructuredEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.event_data.insert(key.into(), value.into());
        self
    }

    /// Store several logical values under one key as an abnormal pattern.
    pub fn with_data_values<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = join_values(values);
        self.event_data.insert(key.into(), joined);
        self
    }

    pub fn with_event_id(mut self, id: u32) -> Self {
        self.event_id = id;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_provider(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    pub fn with_provider_guid(mut self, guid: impl Into<String>) -> Self {
        self.provider_guid = Some(guid.into());
        self
    }

    pub fn with_computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = computer.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build an event from JSON.
    ///
    /// Objects carrying a `system` or `event_data` key deserialize as a
    /// structured event. Any other object is treated as flat event data:
    /// header keys (`EventID`, `Channel`, `Computer`, `Provider_Name`,
    /// `Provider_Guid`, `TimeCreated`/`Timestamp`) fill the typed header,
    /// nested objects flatten to dotted keys and arrays become abnormal
    /// patterns. Returns `None` for non-objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.contains_key("system") || obj.contains_key("event_data") {
            return serde_json::from_value(value.clone()).ok();
        }

        let mut event = StructuredEvent::new();
        for (key, v) in obj {
            if HEADER_KEYS.contains(&key.as_str()) {
                event.set_header(key, v);
                continue;
            }
            flatten_into(key, v, &mut event.event_data);
        }
        Some(event)
    }

    fn set_header(&mut self, key: &str, v: &Value) {
        let Some(text) = scalar_text(v) else {
            return;
        };
        match key {
            "EventID" => {
                if let Ok(id) = text.trim().parse() {
                    self.event_id = id;
                }
            }
            "Channel" => self.channel = text,
            "Computer" => self.computer = text,
            "Provider_Name" => self.provider_name = text,
            "Provider_Guid" => self.provider_guid = Some(text),
            _ => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
                    self.timestamp = ts.with_timezone(&Utc);
                }
            }
        }
    }

    /// Typed header value by its field name.
    ///
    /// Empty string headers read as absent.
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        let text = match name {
            "EventID" => return Some(Cow::Owned(self.event_id.to_string())),
            "Channel" => self.channel.as_str(),
            "Provider_Name" => self.provider_name.as_str(),
            "Provider_Guid" => self.provider_guid.as_deref()?,
            "Computer" => self.computer.as_str(),
            _ => return None,
        };
        (!text.is_empty()).then_some(Cow::Borrowed(text))
    }

    /// Every logical `event_data` value, abnormal patterns split.
    pub fn keyword_values(&self) -> impl Iterator<Item = &str> {
        self.event_data.values().flat_map(|v| split_values(v))
    }
}

/// Whether `value` encodes several logical values.
pub fn is_abnormal(value: &str) -> bool {
    value.contains(ABNORMAL_SEPARATOR)
}

/// Lazily iterate the logical values of `value`.
pub fn split_values(value: &str) -> std::str::Split<'_, char> {
    value.split(ABNORMAL_SEPARATOR)
}

/// Join logical values into one abnormal-pattern string.
pub fn join_values<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = String::new();
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            joined.push(ABNORMAL_SEPARATOR);
        }
        joined.push_str(v.as_ref());
    }
    joined
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flatten_into(key: &str, v: &Value, out: &mut HashMap<String, String>) {
    match v {
        Value::Null => {}
        Value::Object(map) => {
            for (k, child) in map {
                flatten_into(&format!("{key}.{k}"), child, out);
            }
        }
        Value::Array(items) => {
            let joined = join_values(items.iter().filter_map(scalar_text));
            out.insert(key.to_string(), joined);
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                out.insert(key.to_string(), text);
            }
        }
    }
}
