//! Reservations
//!
//! Reservation lifecycle for a single charge point. Connector id 0 means
//! "any connector". A background sweeper drops overdue entries every
//! 60 seconds; lookups sweep implicitly so callers never observe an
//! expired reservation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::events::{EventBus, SimEvent};
use crate::support::clock::SharedClock;

/// How often the sweeper fires.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An advance booking of a connector for an id tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: i32,
    /// 0 = any connector.
    pub connector_id: u32,
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub expiry_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Reservation book with expiry sweeping.
pub struct ReservationManager {
    entries: Mutex<HashMap<i32, Reservation>>,
    bus: EventBus,
    clock: SharedClock,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReservationManager {
    pub fn new(bus: EventBus, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Insert a reservation. Validation (connector state, duplicates,
    /// expiry in the future) is the ReserveNow handler's job.
    pub fn insert(&self, reservation: Reservation) {
        info!(
            reservation_id = reservation.id,
            connector_id = reservation.connector_id,
            expiry = %reservation.expiry_date,
            "reservation created"
        );
        self.bus.publish(SimEvent::ReservationCreated {
            reservation_id: reservation.id,
            connector_id: reservation.connector_id,
        });
        self.entries.lock().unwrap().insert(reservation.id, reservation);
    }

    /// Remove a reservation by id.
    pub fn remove(&self, reservation_id: i32) -> Option<Reservation> {
        let removed = self.entries.lock().unwrap().remove(&reservation_id);
        if let Some(ref r) = removed {
            self.bus.publish(SimEvent::ReservationCancelled {
                reservation_id: r.id,
                connector_id: r.connector_id,
            });
        }
        removed
    }

    pub fn get(&self, reservation_id: i32) -> Option<Reservation> {
        self.sweep();
        self.entries.lock().unwrap().get(&reservation_id).cloned()
    }

    /// The reservation covering `connector_id`: an exact match wins, and
    /// for a real connector (id ≠ 0) an any-connector reservation also
    /// counts.
    pub fn reservation_for_connector(&self, connector_id: u32) -> Option<Reservation> {
        self.sweep();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .find(|r| r.connector_id == connector_id)
            .or_else(|| {
                (connector_id != 0).then(|| entries.values().find(|r| r.connector_id == 0)).flatten()
            })
            .cloned()
    }

    /// Consume the reservation covering `connector_id` when a transaction
    /// starts with a matching tag.
    pub fn consume_for_connector(&self, connector_id: u32, id_tag: &str) -> Option<Reservation> {
        let candidate = self.reservation_for_connector(connector_id)?;
        let matches = candidate.id_tag == id_tag
            || candidate.parent_id_tag.as_deref() == Some(id_tag);
        if !matches {
            return None;
        }
        self.remove(candidate.id)
    }

    /// Drop every entry past its expiry.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, r| r.expiry_date > now);
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, "expired reservations swept");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Start the periodic sweeper. Holds only a weak reference, so the
    /// manager can be dropped without stopping the task first.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.sweep(),
                    None => break,
                }
            }
        }));
    }

    /// Stop the periodic sweeper. Idempotent.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper.lock().unwrap().is_some()
    }
}

impl Drop for ReservationManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::clock::{Clock, FixedClock};
    use chrono::Duration as ChronoDuration;

    fn manager_with_clock() -> (Arc<ReservationManager>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let manager = Arc::new(ReservationManager::new(EventBus::new(), clock.clone()));
        (manager, clock)
    }

    fn reservation(id: i32, connector_id: u32, expires_in_min: i64, now: DateTime<Utc>) -> Reservation {
        Reservation {
            id,
            connector_id,
            id_tag: format!("TAG-{id}"),
            parent_id_tag: None,
            expiry_date: now + ChronoDuration::minutes(expires_in_min),
            created_at: now,
        }
    }

    #[test]
    fn exact_connector_match_wins_over_wildcard() {
        let (m, clock) = manager_with_clock();
        let now = clock.now();
        m.insert(reservation(1, 0, 10, now));
        m.insert(reservation(2, 1, 10, now));

        assert_eq!(m.reservation_for_connector(1).unwrap().id, 2);
        // connector 2 only matched by the wildcard
        assert_eq!(m.reservation_for_connector(2).unwrap().id, 1);
    }

    #[test]
    fn wildcard_not_returned_for_connector_zero_query() {
        let (m, clock) = manager_with_clock();
        m.insert(reservation(1, 1, 10, clock.now()));
        assert!(m.reservation_for_connector(0).is_none());
    }

    #[test]
    fn lookups_sweep_expired_entries() {
        let (m, clock) = manager_with_clock();
        let now = clock.now();
        m.insert(reservation(1, 1, 5, now));
        assert!(m.reservation_for_connector(1).is_some());

        clock.advance(ChronoDuration::minutes(6));
        assert!(m.reservation_for_connector(1).is_none());
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn consume_requires_matching_tag() {
        let (m, clock) = manager_with_clock();
        let now = clock.now();
        m.insert(Reservation {
            id: 7,
            connector_id: 1,
            id_tag: "OWNER".into(),
            parent_id_tag: Some("FLEET".into()),
            expiry_date: now + ChronoDuration::minutes(10),
            created_at: now,
        });

        assert!(m.consume_for_connector(1, "STRANGER").is_none());
        assert_eq!(m.len(), 1);

        assert_eq!(m.consume_for_connector(1, "FLEET").unwrap().id, 7);
        assert!(m.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_overdue_entries() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let m = Arc::new(ReservationManager::new(EventBus::new(), clock.clone()));
        let now = clock.now();
        m.insert(reservation(1, 1, 1, now));

        m.start_sweeper();
        clock.advance(ChronoDuration::minutes(2));
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(m.len(), 0);
        m.stop_sweeper();
        assert!(!m.sweeper_running());
    }
}
