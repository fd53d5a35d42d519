#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use vigil_eval::{
    AggregationCycle, CompileContext, DetectionMatch, Engine, Evaluation, StoreError,
    StructuredEvent, WindowStore,
};
use vigil_rules::parse_rule_yaml;

pub fn engine_from_yaml(yaml: &str) -> Engine {
    engine_with_context(yaml, CompileContext::new())
}

pub fn engine_with_context(yaml: &str, context: CompileContext) -> Engine {
    let definition = parse_rule_yaml(yaml).unwrap();
    let engine = Engine::new(context);
    engine.upsert(&definition).unwrap();
    engine
}

pub fn eval(yaml: &str, event: &StructuredEvent) -> Evaluation {
    engine_from_yaml(yaml).evaluate(event)
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

/// Evaluate events and run one aggregation cycle over their candidates.
pub fn cycle(
    engine: &Engine,
    store: &mut dyn WindowStore,
    events: &[StructuredEvent],
) -> Vec<DetectionMatch> {
    let candidates = events
        .iter()
        .flat_map(|e| engine.evaluate(e).candidates)
        .collect();
    let rules = engine.snapshot();
    AggregationCycle::new(&rules).run(store, candidates)
}

// =============================================================================
// SQLite windowed store
// =============================================================================

const TIME_COLUMN: &str = "_time";
const HEADERS: [&str; 4] = ["EventID", "Channel", "Provider_Name", "Computer"];

struct RuleWindow {
    conn: Connection,
    window: Duration,
    columns: BTreeSet<String>,
}

/// In-memory store with one `Matches` table per rule and one column per
/// event field, created as fields are first seen.
#[derive(Default)]
pub struct SqliteWindowStore {
    windows: HashMap<String, RuleWindow>,
}

impl SqliteWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, rule_id: &str) -> i64 {
        self.windows.get(rule_id).map_or(0, |w| {
            w.conn
                .query_row("SELECT COUNT(*) FROM Matches", [], |r| r.get(0))
                .unwrap()
        })
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn event_columns(event: &StructuredEvent) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = HEADERS
        .iter()
        .filter_map(|h| event.header(h).map(|v| (h.to_string(), v.into_owned())))
        .collect();
    out.extend(event.system.iter().map(|(k, v)| (k.clone(), v.clone())));
    out.extend(event.event_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

impl RuleWindow {
    fn open(window: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        conn.execute_batch(&format!(
            "CREATE TABLE Matches ({} INTEGER NOT NULL)",
            quote(TIME_COLUMN)
        ))
        .map_err(unavailable)?;
        Ok(RuleWindow {
            conn,
            window,
            columns: BTreeSet::new(),
        })
    }

    fn ensure_column(&mut self, name: &str) -> Result<(), StoreError> {
        if self.columns.contains(name) {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!("ALTER TABLE Matches ADD COLUMN {} TEXT", quote(name)))
            .map_err(unavailable)?;
        self.columns.insert(name.to_string());
        Ok(())
    }

    fn insert(&mut self, event: &StructuredEvent) -> Result<(), StoreError> {
        let fields = event_columns(event);
        for (name, _) in &fields {
            self.ensure_column(name)?;
        }
        let mut names = vec![quote(TIME_COLUMN)];
        let mut values = vec![SqlValue::Integer(event.timestamp.timestamp_millis())];
        for (name, value) in fields {
            names.push(quote(&name));
            values.push(SqlValue::Text(value));
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO Matches ({}) VALUES ({placeholders})",
            names.join(", ")
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(unavailable)?;
        Ok(())
    }

    fn trim(&self) -> Result<(), StoreError> {
        let newest: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT MAX({}) FROM Matches", quote(TIME_COLUMN)),
                [],
                |r| r.get(0),
            )
            .map_err(unavailable)?;
        if let Some(newest) = newest {
            let cutoff = newest - self.window.as_millis() as i64;
            self.conn
                .execute(
                    &format!("DELETE FROM Matches WHERE {} <= ?1", quote(TIME_COLUMN)),
                    [cutoff],
                )
                .map_err(unavailable)?;
        }
        Ok(())
    }
}

impl WindowStore for SqliteWindowStore {
    fn add(
        &mut self,
        rule_id: &str,
        window: Duration,
        events: &[StructuredEvent],
    ) -> Result<(), StoreError> {
        if !self.windows.contains_key(rule_id) {
            self.windows
                .insert(rule_id.to_string(), RuleWindow::open(window)?);
        }
        let Some(w) = self.windows.get_mut(rule_id) else {
            return Err(StoreError::Unavailable(rule_id.to_string()));
        };
        for event in events {
            w.insert(event)?;
        }
        Ok(())
    }

    fn trim_expired(&mut self, rule_ids: &[&str]) -> Result<(), StoreError> {
        for id in rule_ids {
            if let Some(w) = self.windows.get(*id) {
                w.trim()?;
            }
        }
        Ok(())
    }

    fn query(&self, rule_id: &str, sql: &str) -> Result<Vec<StructuredEvent>, StoreError> {
        let Some(w) = self.windows.get(rule_id) else {
            return Ok(Vec::new());
        };
        let mut stmt = w.conn.prepare(sql).map_err(unavailable)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([]).map_err(unavailable)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(unavailable)? {
            let mut event = StructuredEvent::new();
            for (i, name) in names.iter().enumerate() {
                let text = match row.get::<_, SqlValue>(i).map_err(unavailable)? {
                    SqlValue::Null => continue,
                    SqlValue::Integer(n) => n.to_string(),
                    SqlValue::Real(f) => f.to_string(),
                    SqlValue::Text(s) => s,
                    SqlValue::Blob(_) => continue,
                };
                event = event.with_data(name.clone(), text);
            }
            out.push(event);
        }
        Ok(out)
    }

    fn contains_column(&self, rule_id: &str, name: &str) -> bool {
        self.windows
            .get(rule_id)
            .is_some_and(|w| w.columns.contains(name))
    }

    fn matched(&self, rule_id: &str, row: StructuredEvent) -> StructuredEvent {
        row.with_system("RuleId", rule_id)
    }
}

/// A store that is always down.
pub struct FailingStore;

impl WindowStore for FailingStore {
    fn add(&mut self, _: &str, _: Duration, _: &[StructuredEvent]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn trim_expired(&mut self, _: &[&str]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn query(&self, _: &str, _: &str) -> Result<Vec<StructuredEvent>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn contains_column(&self, _: &str, _: &str) -> bool {
        true
    }

    fn matched(&self, _: &str, row: StructuredEvent) -> StructuredEvent {
        row
    }
}
