//! Connector entity
//!
//! A physical socket on the simulated charge point. Owns its status, the
//! administrative availability flag, the meter register, the optional
//! transaction and any stored charging profiles. All state changes go
//! through [`Connector::apply`], the single site where a transition is
//! validated, recorded in the state history and published on the bus.
//!
//! The connector holds non-owning references to the charge point's event
//! bus and history only; the charge point owns the connector exclusively.

use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::types::ChargingProfile;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::fsm::{
    self, Availability, ConnectorEvent, ConnectorStatus, FsmContext, InvalidTransition,
};
use crate::events::{EventBus, SimEvent};
use crate::history::{HistoryEntity, StateHistory, StateHistoryEntry};
use crate::support::clock::SharedClock;
use std::sync::Arc;

/// A single plug-in-to-plug-out charging session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// 0 until the StartTransaction response assigns the real id.
    pub id: i32,
    pub connector_id: u32,
    pub tag_id: String,
    pub meter_start: i64,
    pub meter_stop: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Whether a MeterValues CALL went out for this transaction.
    pub meter_sent: bool,
    pub battery_capacity_kwh: Option<f64>,
    pub initial_soc: Option<f64>,
}

/// Outcome of an accepted transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionOutcome {
    pub old: ConnectorStatus,
    pub new: ConnectorStatus,
}

/// Read-only view of the connector for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSnapshot {
    pub id: u32,
    pub status: ConnectorStatus,
    pub availability: Availability,
    pub meter_value: i64,
    pub soc: Option<f64>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug)]
struct ConnectorInner {
    status: ConnectorStatus,
    availability: Availability,
    authorized: bool,
    tag_id: Option<String>,
    meter_value: i64,
    soc: Option<f64>,
    transaction: Option<Transaction>,
    charging_profiles: Vec<ChargingProfile>,
    /// Guards the one-in-flight-StartTransaction invariant.
    start_in_flight: bool,
}

/// Cancellable handle of the auto-meter task.
pub(crate) struct AutoMeterHandle {
    pub task: JoinHandle<()>,
}

/// A connector on the simulated charge point.
pub struct Connector {
    pub id: u32,
    inner: RwLock<ConnectorInner>,
    bus: EventBus,
    history: Arc<StateHistory>,
    clock: SharedClock,
    auto_meter: Mutex<Option<AutoMeterHandle>>,
}

impl Connector {
    pub fn new(id: u32, bus: EventBus, history: Arc<StateHistory>, clock: SharedClock) -> Self {
        Self {
            id,
            inner: RwLock::new(ConnectorInner {
                status: ConnectorStatus::Available,
                availability: Availability::Operative,
                authorized: false,
                tag_id: None,
                meter_value: 0,
                soc: None,
                transaction: None,
                charging_profiles: Vec::new(),
                start_in_flight: false,
            }),
            bus,
            history,
            clock,
            auto_meter: Mutex::new(None),
        }
    }

    // ── State machine ──────────────────────────────────────

    /// Drive the connector with `event`.
    ///
    /// On acceptance the effects are applied, exactly one history entry
    /// is recorded and exactly one `StatusChanged` event is published.
    /// On refusal nothing mutates; the rejection is recorded with an
    /// ERROR validation level and returned to the caller.
    pub fn apply(&self, event: ConnectorEvent) -> Result<TransitionOutcome, InvalidTransition> {
        let now = self.clock.now();
        let (outcome, context) = {
            let mut inner = self.inner.write().unwrap();
            let ctx = FsmContext {
                availability: inner.availability,
                authorized: inner.authorized,
            };
            let old = inner.status;

            let new = match fsm::next_status(old, &ctx, &event) {
                Ok(new) => new,
                Err(err) => {
                    drop(inner);
                    self.history.record(StateHistoryEntry::rejected(
                        now,
                        HistoryEntity::Connector,
                        Some(self.id),
                        event.name(),
                        old.as_str(),
                        err.to_string(),
                    ));
                    warn!(connector_id = self.id, %err, "transition refused");
                    return Err(err);
                }
            };

            let context = Self::apply_effects(&mut inner, &event, new);
            inner.status = new;
            (TransitionOutcome { old, new }, context)
        };

        self.history.record(StateHistoryEntry::accepted(
            now,
            HistoryEntity::Connector,
            Some(self.id),
            event.name(),
            outcome.old.as_str(),
            outcome.new.as_str(),
            context,
        ));

        debug!(
            connector_id = self.id,
            from = %outcome.old,
            to = %outcome.new,
            event = event.name(),
            "transition accepted"
        );

        self.bus.publish(SimEvent::StatusChanged {
            connector_id: self.id,
            old: outcome.old,
            new: outcome.new,
        });

        Ok(outcome)
    }

    /// Mutations that ride along with an accepted transition.
    fn apply_effects(
        inner: &mut ConnectorInner,
        event: &ConnectorEvent,
        new: ConnectorStatus,
    ) -> serde_json::Value {
        let context = match event {
            ConnectorEvent::Plugin => {
                inner.authorized = false;
                serde_json::Value::Null
            }
            ConnectorEvent::Authorize { tag_id } => {
                inner.authorized = true;
                inner.tag_id = Some(tag_id.clone());
                json!({ "tagId": tag_id })
            }
            ConnectorEvent::StartTransaction { transaction_id } => {
                if let Some(tx) = inner.transaction.as_mut() {
                    tx.id = *transaction_id;
                }
                json!({ "transactionId": transaction_id })
            }
            ConnectorEvent::StopTransaction { reason } => {
                // Transaction object survives until the connector goes
                // back to Available; only authorization is cleared here.
                inner.authorized = false;
                match reason {
                    Some(r) => json!({ "reason": r }),
                    None => serde_json::Value::Null,
                }
            }
            ConnectorEvent::Plugout => {
                inner.authorized = false;
                inner.tag_id = None;
                serde_json::Value::Null
            }
            ConnectorEvent::Error { code } => json!({ "errorCode": code }),
            ConnectorEvent::Reserve { reservation_id } => {
                json!({ "reservationId": reservation_id })
            }
            ConnectorEvent::Reset => {
                inner.authorized = false;
                inner.tag_id = None;
                inner.transaction = None;
                inner.start_in_flight = false;
                inner.soc = None;
                serde_json::Value::Null
            }
            ConnectorEvent::SetUnavailable => {
                inner.availability = Availability::Inoperative;
                serde_json::Value::Null
            }
            ConnectorEvent::SetAvailable => {
                inner.availability = Availability::Operative;
                serde_json::Value::Null
            }
            ConnectorEvent::SuspendEvse { reason } => match reason {
                Some(r) => json!({ "reason": r }),
                None => serde_json::Value::Null,
            },
            ConnectorEvent::CancelReservation
            | ConnectorEvent::SuspendEv
            | ConnectorEvent::Resume => serde_json::Value::Null,
        };

        // Entering Available drops the finished transaction.
        if new == ConnectorStatus::Available {
            inner.transaction = None;
            inner.start_in_flight = false;
        }

        context
    }

    // ── Accessors ──────────────────────────────────────────

    pub fn status(&self) -> ConnectorStatus {
        self.inner.read().unwrap().status
    }

    pub fn availability(&self) -> Availability {
        self.inner.read().unwrap().availability
    }

    pub fn meter_value(&self) -> i64 {
        self.inner.read().unwrap().meter_value
    }

    pub fn soc(&self) -> Option<f64> {
        self.inner.read().unwrap().soc
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.inner.read().unwrap().transaction.clone()
    }

    pub fn tag_id(&self) -> Option<String> {
        self.inner.read().unwrap().tag_id.clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.read().unwrap().authorized
    }

    pub fn snapshot(&self) -> ConnectorSnapshot {
        let inner = self.inner.read().unwrap();
        ConnectorSnapshot {
            id: self.id,
            status: inner.status,
            availability: inner.availability,
            meter_value: inner.meter_value,
            soc: inner.soc,
            transaction: inner.transaction.clone(),
        }
    }

    /// True while a transaction object is attached (any phase).
    pub fn has_transaction(&self) -> bool {
        self.inner.read().unwrap().transaction.is_some()
    }

    // ── Transaction bookkeeping (driven by the charge point) ──

    pub(crate) fn attach_transaction(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.transaction.is_some() || inner.start_in_flight {
            return false;
        }
        inner.start_in_flight = true;
        inner.transaction = Some(tx);
        true
    }

    pub(crate) fn clear_start_in_flight(&self) {
        self.inner.write().unwrap().start_in_flight = false;
    }

    pub(crate) fn start_in_flight(&self) -> bool {
        self.inner.read().unwrap().start_in_flight
    }

    pub(crate) fn clear_transaction(&self) -> Option<Transaction> {
        let mut inner = self.inner.write().unwrap();
        inner.start_in_flight = false;
        inner.transaction.take()
    }

    pub(crate) fn stamp_transaction_stop(&self, stop_time: DateTime<Utc>) -> Option<Transaction> {
        let mut inner = self.inner.write().unwrap();
        let meter = inner.meter_value;
        let tx = inner.transaction.as_mut()?;
        tx.stop_time = Some(stop_time);
        tx.meter_stop = Some(meter);
        Some(tx.clone())
    }

    pub(crate) fn mark_meter_sent(&self) {
        if let Some(tx) = self.inner.write().unwrap().transaction.as_mut() {
            tx.meter_sent = true;
        }
    }

    // ── Meter register ─────────────────────────────────────

    /// Set the meter register. Within a transaction the register is
    /// monotonic: a lower value is refused with a warning.
    pub fn set_meter_value(&self, value: i64) -> i64 {
        let accepted = {
            let mut inner = self.inner.write().unwrap();
            if inner.transaction.is_some() && value < inner.meter_value {
                warn!(
                    connector_id = self.id,
                    current = inner.meter_value,
                    requested = value,
                    "meter value may not decrease within a transaction"
                );
                None
            } else {
                inner.meter_value = value;
                Some(value)
            }
        };

        match accepted {
            Some(value) => {
                self.bus.publish(SimEvent::MeterValueChanged {
                    connector_id: self.id,
                    value,
                });
                value
            }
            None => self.meter_value(),
        }
    }

    /// Set the state of charge. Monotonic while Charging.
    pub fn set_soc(&self, soc: f64) {
        let accepted = {
            let mut inner = self.inner.write().unwrap();
            let charging = matches!(inner.status, ConnectorStatus::Charging);
            if charging && inner.soc.map_or(false, |current| soc < current) {
                warn!(connector_id = self.id, "soc may not decrease while charging");
                false
            } else {
                inner.soc = Some(soc.clamp(0.0, 100.0));
                true
            }
        };
        if accepted {
            self.bus.publish(SimEvent::SocChanged { connector_id: self.id, soc });
        }
    }

    // ── Charging profiles ──────────────────────────────────

    pub fn set_charging_profile(&self, profile: ChargingProfile) {
        let mut inner = self.inner.write().unwrap();
        inner
            .charging_profiles
            .retain(|p| p.charging_profile_id != profile.charging_profile_id);
        inner.charging_profiles.push(profile);
    }

    /// Remove profiles matching the given filters; `None` matches all.
    /// Returns how many were removed.
    pub fn clear_charging_profiles(
        &self,
        id: Option<i32>,
        purpose: Option<&rust_ocpp::v1_6::types::ChargingProfilePurposeType>,
        stack_level: Option<u32>,
    ) -> usize {
        let mut inner = self.inner.write().unwrap();
        let before = inner.charging_profiles.len();
        inner.charging_profiles.retain(|p| {
            let id_match = id.map_or(true, |i| p.charging_profile_id == i);
            let purpose_match =
                purpose.map_or(true, |pu| &p.charging_profile_purpose == pu);
            let stack_match = stack_level.map_or(true, |s| p.stack_level == s);
            !(id_match && purpose_match && stack_match)
        });
        before - inner.charging_profiles.len()
    }

    pub fn charging_profiles(&self) -> Vec<ChargingProfile> {
        self.inner.read().unwrap().charging_profiles.clone()
    }

    // ── Auto-meter task handle ─────────────────────────────

    pub(crate) fn set_auto_meter(&self, handle: JoinHandle<()>) {
        let mut guard = self.auto_meter.lock().unwrap();
        if let Some(old) = guard.take() {
            old.task.abort();
        }
        *guard = Some(AutoMeterHandle { task: handle });
    }

    /// Cancel the auto-meter task if running. The last written meter
    /// value stays as-is.
    pub fn stop_auto_meter(&self) {
        if let Some(handle) = self.auto_meter.lock().unwrap().take() {
            handle.task.abort();
        }
    }

    pub fn auto_meter_running(&self) -> bool {
        self.auto_meter.lock().unwrap().is_some()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_meter.lock().unwrap().take() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::clock::SystemClock;

    fn connector() -> Connector {
        Connector::new(
            1,
            EventBus::new(),
            Arc::new(StateHistory::new()),
            Arc::new(SystemClock),
        )
    }

    fn sample_tx(connector_id: u32) -> Transaction {
        Transaction {
            id: 0,
            connector_id,
            tag_id: "TAG-1".into(),
            meter_start: 0,
            meter_stop: None,
            start_time: Utc::now(),
            stop_time: None,
            meter_sent: false,
            battery_capacity_kwh: None,
            initial_soc: None,
        }
    }

    #[test]
    fn accepted_transition_records_history_and_event() {
        let bus = EventBus::new();
        let history = Arc::new(StateHistory::new());
        let c = Connector::new(1, bus.clone(), history.clone(), Arc::new(SystemClock));
        let mut sub = bus.subscribe();

        let outcome = c.apply(ConnectorEvent::Plugin).unwrap();
        assert_eq!(outcome.old, ConnectorStatus::Available);
        assert_eq!(outcome.new, ConnectorStatus::Preparing);
        assert_eq!(history.len(), 1);

        match sub.try_recv() {
            Some(SimEvent::StatusChanged { connector_id, old, new }) => {
                assert_eq!(connector_id, 1);
                assert_eq!(old, ConnectorStatus::Available);
                assert_eq!(new, ConnectorStatus::Preparing);
            }
            other => panic!("expected StatusChanged, got {other:?}"),
        }
    }

    #[test]
    fn refused_transition_leaves_state_and_records_error() {
        let history = Arc::new(StateHistory::new());
        let c = Connector::new(1, EventBus::new(), history.clone(), Arc::new(SystemClock));

        let err = c.apply(ConnectorEvent::Resume).unwrap_err();
        assert_eq!(err.from, ConnectorStatus::Available);
        assert_eq!(c.status(), ConnectorStatus::Available);

        let entries = history.query(&Default::default());
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
    }

    #[test]
    fn transaction_object_survives_finishing_and_drops_on_available() {
        let c = connector();
        assert!(c.attach_transaction(sample_tx(1)));
        c.apply(ConnectorEvent::Plugin).unwrap();
        c.apply(ConnectorEvent::Authorize { tag_id: "TAG-1".into() }).unwrap();
        c.apply(ConnectorEvent::StartTransaction { transaction_id: 42 }).unwrap();
        assert_eq!(c.transaction().unwrap().id, 42);

        c.apply(ConnectorEvent::StopTransaction { reason: None }).unwrap();
        assert_eq!(c.status(), ConnectorStatus::Finishing);
        assert!(c.has_transaction());

        c.apply(ConnectorEvent::Plugout).unwrap();
        assert_eq!(c.status(), ConnectorStatus::Available);
        assert!(!c.has_transaction());
    }

    #[test]
    fn second_transaction_attach_is_refused() {
        let c = connector();
        assert!(c.attach_transaction(sample_tx(1)));
        assert!(!c.attach_transaction(sample_tx(1)));
    }

    #[test]
    fn meter_value_is_monotonic_within_transaction() {
        let c = connector();
        c.set_meter_value(500);
        // no transaction: decrease is allowed (manual reset)
        assert_eq!(c.set_meter_value(100), 100);

        c.attach_transaction(sample_tx(1));
        c.set_meter_value(400);
        assert_eq!(c.set_meter_value(250), 400);
        assert_eq!(c.meter_value(), 400);
    }

    #[test]
    fn soc_is_monotonic_while_charging() {
        let c = connector();
        c.attach_transaction(sample_tx(1));
        c.apply(ConnectorEvent::Plugin).unwrap();
        c.apply(ConnectorEvent::Authorize { tag_id: "T".into() }).unwrap();
        c.apply(ConnectorEvent::StartTransaction { transaction_id: 1 }).unwrap();

        c.set_soc(50.0);
        c.set_soc(40.0);
        assert_eq!(c.soc(), Some(50.0));
        c.set_soc(60.0);
        assert_eq!(c.soc(), Some(60.0));
    }

    #[test]
    fn reset_clears_transient_fields() {
        let c = connector();
        c.attach_transaction(sample_tx(1));
        c.apply(ConnectorEvent::Plugin).unwrap();
        c.apply(ConnectorEvent::Authorize { tag_id: "T".into() }).unwrap();
        c.apply(ConnectorEvent::Error { code: "HighTemperature".into() }).unwrap();
        assert_eq!(c.status(), ConnectorStatus::Faulted);

        c.apply(ConnectorEvent::Reset).unwrap();
        assert_eq!(c.status(), ConnectorStatus::Available);
        assert!(!c.has_transaction());
        assert!(!c.is_authorized());
        assert_eq!(c.tag_id(), None);
    }

    #[test]
    fn charging_profiles_replace_by_id_and_clear_by_filter() {
        use rust_ocpp::v1_6::types::{
            ChargingProfile, ChargingProfileKindType, ChargingProfilePurposeType,
            ChargingRateUnitType, ChargingSchedule,
        };

        let profile = |id: i32, stack: u32| ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level: stack,
            charging_profile_purpose: ChargingProfilePurposeType::TxDefaultProfile,
            charging_profile_kind: ChargingProfileKindType::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: None,
                charging_rate_unit: ChargingRateUnitType::W,
                charging_schedule_period: vec![],
                min_charging_rate: None,
            },
        };

        let c = connector();
        c.set_charging_profile(profile(1, 0));
        c.set_charging_profile(profile(2, 1));
        c.set_charging_profile(profile(1, 5)); // replaces id 1
        assert_eq!(c.charging_profiles().len(), 2);

        assert_eq!(c.clear_charging_profiles(None, None, Some(5)), 1);
        assert_eq!(c.clear_charging_profiles(Some(99), None, None), 0);
        assert_eq!(c.clear_charging_profiles(None, None, None), 1);
        assert!(c.charging_profiles().is_empty());
    }
}
