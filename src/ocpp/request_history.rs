//! In-flight request correlation
//!
//! Maps outbound CALL message ids to what was asked, so CALLRESULT and
//! CALLERROR frames can be routed to the right result handler with the
//! originating context (action, payload, connector). Entries live until
//! their response arrives or the socket resets.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

/// An outbound CALL awaiting its response.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
    /// Connector the request concerns, when it concerns one.
    pub connector_id: Option<u32>,
    pub sent_at: DateTime<Utc>,
}

/// Pending-request book, keyed by message id.
#[derive(Default)]
pub struct RequestHistory {
    entries: DashMap<String, InFlightRequest>,
}

impl RequestHistory {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    pub fn record(&self, request: InFlightRequest) {
        self.entries.insert(request.message_id.clone(), request);
    }

    /// Remove and return the request for `message_id`.
    pub fn take(&self, message_id: &str) -> Option<InFlightRequest> {
        self.entries.remove(message_id).map(|(_, v)| v)
    }

    pub fn get_action(&self, message_id: &str) -> Option<String> {
        self.entries.get(message_id).map(|r| r.action.clone())
    }

    /// Drop everything; called on socket reset and on disconnect.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, action: &str) -> InFlightRequest {
        InFlightRequest {
            message_id: id.into(),
            action: action.into(),
            payload: json!({}),
            connector_id: Some(1),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn take_removes_the_entry() {
        let history = RequestHistory::new();
        history.record(request("m1", "StartTransaction"));
        assert_eq!(history.len(), 1);

        let taken = history.take("m1").unwrap();
        assert_eq!(taken.action, "StartTransaction");
        assert_eq!(taken.connector_id, Some(1));
        assert!(history.take("m1").is_none());
        assert!(history.is_empty());
    }

    #[test]
    fn clear_empties_the_book() {
        let history = RequestHistory::new();
        history.record(request("m1", "Heartbeat"));
        history.record(request("m2", "MeterValues"));
        history.clear();
        assert!(history.is_empty());
    }
}
