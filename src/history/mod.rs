//! State transition history
//!
//! Bounded append-only ring of every accepted or rejected transition,
//! charge-point level and connector level alike. Queryable with simple
//! filters, aggregable into statistics, exportable as JSON or CSV.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1000;

/// What kind of entity transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEntity {
    ChargePoint,
    Connector,
}

impl HistoryEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChargePoint => "chargePoint",
            Self::Connector => "connector",
        }
    }
}

/// Severity attached to the validation outcome of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub level: ValidationLevel,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { level: ValidationLevel::Info, message: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { level: ValidationLevel::Error, message: Some(message.into()) }
    }
}

/// One recorded transition attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub entity: HistoryEntity,
    /// Connector id; `None` for charge-point entries.
    pub entity_id: Option<u32>,
    pub transition_type: String,
    pub from_state: String,
    pub to_state: String,
    /// Free-form context (tag id, transaction id, error code…).
    pub context: serde_json::Value,
    pub validation: ValidationResult,
    pub success: bool,
    pub error_message: Option<String>,
}

impl StateHistoryEntry {
    pub fn accepted(
        timestamp: DateTime<Utc>,
        entity: HistoryEntity,
        entity_id: Option<u32>,
        transition_type: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            entity,
            entity_id,
            transition_type: transition_type.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            context,
            validation: ValidationResult::ok(),
            success: true,
            error_message: None,
        }
    }

    pub fn rejected(
        timestamp: DateTime<Utc>,
        entity: HistoryEntity,
        entity_id: Option<u32>,
        transition_type: impl Into<String>,
        from_state: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let from_state = from_state.into();
        let error_message = error_message.into();
        Self {
            id: Uuid::new_v4(),
            timestamp,
            entity,
            entity_id,
            transition_type: transition_type.into(),
            to_state: from_state.clone(),
            from_state,
            context: serde_json::Value::Null,
            validation: ValidationResult::rejected(error_message.clone()),
            success: false,
            error_message: Some(error_message),
        }
    }
}

/// Query filter; all fields optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub entity: Option<HistoryEntity>,
    pub entity_id: Option<u32>,
    pub from_ts: Option<DateTime<Utc>>,
    pub to_ts: Option<DateTime<Utc>>,
    pub transition_type: Option<String>,
    /// Return only the last `limit` matches.
    pub limit: Option<usize>,
}

/// Aggregate statistics over the recorded window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub per_entity: BTreeMap<String, usize>,
    pub per_transition: BTreeMap<String, usize>,
    pub errors: usize,
    pub warnings: usize,
    /// Average transitions per minute since the oldest retained entry.
    pub avg_per_minute: f64,
}

/// Bounded ring of state transitions.
pub struct StateHistory {
    entries: Mutex<VecDeque<StateHistoryEntry>>,
    capacity: usize,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&self, entry: StateHistoryEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Entries matching `query`, oldest first.
    pub fn query(&self, query: &HistoryQuery) -> Vec<StateHistoryEntry> {
        let entries = self.entries.lock().unwrap();
        let matches: Vec<StateHistoryEntry> = entries
            .iter()
            .filter(|e| query.entity.map_or(true, |ent| e.entity == ent))
            .filter(|e| query.entity_id.map_or(true, |id| e.entity_id == Some(id)))
            .filter(|e| query.from_ts.map_or(true, |ts| e.timestamp >= ts))
            .filter(|e| query.to_ts.map_or(true, |ts| e.timestamp <= ts))
            .filter(|e| {
                query
                    .transition_type
                    .as_deref()
                    .map_or(true, |t| e.transition_type == t)
            })
            .cloned()
            .collect();

        match query.limit {
            Some(limit) if matches.len() > limit => {
                matches[matches.len() - limit..].to_vec()
            }
            _ => matches,
        }
    }

    pub fn stats(&self) -> HistoryStats {
        let entries = self.entries.lock().unwrap();
        let mut per_entity: BTreeMap<String, usize> = BTreeMap::new();
        let mut per_transition: BTreeMap<String, usize> = BTreeMap::new();
        let mut errors = 0;
        let mut warnings = 0;

        for e in entries.iter() {
            *per_entity.entry(e.entity.as_str().to_string()).or_default() += 1;
            *per_transition.entry(e.transition_type.clone()).or_default() += 1;
            match e.validation.level {
                ValidationLevel::Error => errors += 1,
                ValidationLevel::Warning => warnings += 1,
                ValidationLevel::Info => {}
            }
        }

        let avg_per_minute = match (entries.front(), entries.back()) {
            (Some(first), Some(_)) => {
                let elapsed_min =
                    (Utc::now() - first.timestamp).num_milliseconds() as f64 / 60_000.0;
                if elapsed_min > 0.0 {
                    entries.len() as f64 / elapsed_min
                } else {
                    entries.len() as f64
                }
            }
            _ => 0.0,
        };

        HistoryStats {
            total: entries.len(),
            per_entity,
            per_transition,
            errors,
            warnings,
            avg_per_minute,
        }
    }

    /// All retained entries as a JSON array.
    pub fn export_json(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let v: Vec<&StateHistoryEntry> = entries.iter().collect();
        // entries are plain serializable records
        serde_json::to_string_pretty(&v).unwrap()
    }

    /// All retained entries as CSV, header included, same ordering as the
    /// JSON export.
    pub fn export_csv(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut out = String::from(
            "id,timestamp,entity,entityId,transitionType,fromState,toState,success,errorMessage\n",
        );
        for e in entries.iter() {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{}\n",
                e.id,
                e.timestamp.to_rfc3339(),
                e.entity.as_str(),
                e.entity_id.map(|id| id.to_string()).unwrap_or_default(),
                csv_field(&e.transition_type),
                csv_field(&e.from_state),
                csv_field(&e.to_state),
                e.success,
                csv_field(e.error_message.as_deref().unwrap_or("")),
            ));
        }
        out
    }
}

impl Default for StateHistory {
    fn default() -> Self {
        Self::new()
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector_entry(connector_id: u32, transition: &str) -> StateHistoryEntry {
        StateHistoryEntry::accepted(
            Utc::now(),
            HistoryEntity::Connector,
            Some(connector_id),
            transition,
            "Available",
            "Preparing",
            serde_json::Value::Null,
        )
    }

    #[test]
    fn ring_is_bounded() {
        let history = StateHistory::with_capacity(5);
        for i in 0..8 {
            history.record(connector_entry(1, &format!("T{i}")));
        }
        assert_eq!(history.len(), 5);
        let all = history.query(&HistoryQuery::default());
        assert_eq!(all[0].transition_type, "T3");
        assert_eq!(all[4].transition_type, "T7");
    }

    #[test]
    fn query_filters_combine() {
        let history = StateHistory::new();
        history.record(connector_entry(1, "Plugin"));
        history.record(connector_entry(2, "Plugin"));
        history.record(connector_entry(1, "Authorize"));
        history.record(StateHistoryEntry::accepted(
            Utc::now(),
            HistoryEntity::ChargePoint,
            None,
            "StatusChange",
            "Available",
            "Unavailable",
            serde_json::Value::Null,
        ));

        let q = HistoryQuery {
            entity: Some(HistoryEntity::Connector),
            entity_id: Some(1),
            ..Default::default()
        };
        assert_eq!(history.query(&q).len(), 2);

        let q = HistoryQuery {
            transition_type: Some("Plugin".into()),
            ..Default::default()
        };
        assert_eq!(history.query(&q).len(), 2);

        let q = HistoryQuery { limit: Some(1), ..Default::default() };
        let last = history.query(&q);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].transition_type, "StatusChange");
    }

    #[test]
    fn rejected_entries_count_as_errors() {
        let history = StateHistory::new();
        history.record(connector_entry(1, "Plugin"));
        history.record(StateHistoryEntry::rejected(
            Utc::now(),
            HistoryEntity::Connector,
            Some(1),
            "StopTransaction",
            "Available",
            "invalid transition",
        ));

        let stats = history.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.per_entity.get("connector"), Some(&2));
    }

    #[test]
    fn csv_and_json_exports_agree_on_count_and_order() {
        let history = StateHistory::new();
        for i in 0..4 {
            history.record(connector_entry(1, &format!("T{i}")));
        }
        let json: Vec<serde_json::Value> =
            serde_json::from_str(&history.export_json()).unwrap();
        let csv = history.export_csv();
        let csv_rows: Vec<&str> = csv.lines().skip(1).collect();

        assert_eq!(json.len(), csv_rows.len());
        for (j, row) in json.iter().zip(&csv_rows) {
            assert!(row.contains(j["transitionType"].as_str().unwrap()));
        }
    }

    #[test]
    fn csv_escapes_commas() {
        let history = StateHistory::new();
        history.record(StateHistoryEntry::rejected(
            Utc::now(),
            HistoryEntity::Connector,
            Some(1),
            "Error",
            "Charging",
            "failed, badly",
        ));
        let csv = history.export_csv();
        assert!(csv.contains("\"failed, badly\""));
    }
}
