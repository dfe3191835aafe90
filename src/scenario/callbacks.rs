//! Scenario collaborator callbacks
//!
//! The executor never touches the charge point directly; every node
//! effect goes through this trait. [`ChargePointScenarioTarget`] binds
//! the callbacks to one connector of a charge point, and tests plug in
//! recording fakes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::debug;

use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::ConnectorStatus;
use crate::domain::meter::AutoMeterConfig;
use crate::domain::reservation::Reservation;
use crate::scenario::executor::ExecutorContext;
use crate::support::diag_log::{LogKind, LogLevel};
use crate::support::errors::SimResult;

/// Everything a scenario node can do to the outside world.
pub trait ScenarioCallbacks: Send + Sync {
    fn on_status_change(&self, status: ConnectorStatus) -> SimResult<()>;
    fn on_start_transaction(
        &self,
        tag_id: &str,
        battery_capacity_kwh: Option<f64>,
        initial_soc: Option<f64>,
    ) -> SimResult<()>;
    fn on_stop_transaction(&self) -> SimResult<()>;
    fn on_set_meter_value(&self, value: i64) -> SimResult<()>;
    fn on_send_meter_value(&self) -> SimResult<()>;
    fn on_send_notification(&self, message_type: &str, payload: &serde_json::Value)
        -> SimResult<()>;
    fn on_connector_plug(&self, plug_in: bool) -> SimResult<()>;
    fn on_reserve_now(
        &self,
        expiry_minutes: i64,
        id_tag: &str,
        parent_id_tag: Option<&str>,
        reservation_id: Option<i32>,
    ) -> SimResult<()>;
    fn on_cancel_reservation(&self, reservation_id: i32) -> SimResult<()>;
    fn on_auto_meter_start(&self, config: &AutoMeterConfig) -> SimResult<()>;
    fn on_auto_meter_stop(&self) -> SimResult<()>;

    /// Scenario-handler ownership for RemoteStartTrigger nodes.
    fn register_scenario_handler(&self);
    fn unregister_scenario_handler(&self);

    /// Current reservation on the target, for WaitForReservation polling.
    fn reservation_for_target(&self) -> Option<Reservation>;

    // Progress hooks; default to no-ops.
    fn on_node_execute(&self, _node_id: &str) {}
    fn on_node_progress(&self, _node_id: &str, _remaining: u64, _total: u64) {}
    fn on_state_change(&self, _context: &ExecutorContext) {}
    fn on_error(&self, _message: &str) {}
    fn log(&self, _level: crate::support::diag_log::LogLevel, _message: &str) {}
}

/// Callbacks bound to one connector of a charge point.
pub struct ChargePointScenarioTarget {
    cp: Arc<ChargePoint>,
    connector_id: u32,
    reservation_seq: AtomicI32,
}

impl ChargePointScenarioTarget {
    pub fn new(cp: Arc<ChargePoint>, connector_id: u32) -> Self {
        Self { cp, connector_id, reservation_seq: AtomicI32::new(1000) }
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }
}

impl ScenarioCallbacks for ChargePointScenarioTarget {
    fn on_status_change(&self, status: ConnectorStatus) -> SimResult<()> {
        self.cp.update_connector_status(self.connector_id, status)
    }

    fn on_start_transaction(
        &self,
        tag_id: &str,
        battery_capacity_kwh: Option<f64>,
        initial_soc: Option<f64>,
    ) -> SimResult<()> {
        self.cp
            .start_transaction(self.connector_id, tag_id, battery_capacity_kwh, initial_soc)
    }

    fn on_stop_transaction(&self) -> SimResult<()> {
        self.cp.stop_transaction(self.connector_id)
    }

    fn on_set_meter_value(&self, value: i64) -> SimResult<()> {
        self.cp.set_meter_value(self.connector_id, value).map(|_| ())
    }

    fn on_send_meter_value(&self) -> SimResult<()> {
        self.cp.send_meter_value(self.connector_id)
    }

    fn on_send_notification(
        &self,
        message_type: &str,
        payload: &serde_json::Value,
    ) -> SimResult<()> {
        self.cp.send_call(message_type, payload.clone(), Some(self.connector_id));
        Ok(())
    }

    fn on_connector_plug(&self, plug_in: bool) -> SimResult<()> {
        use crate::domain::fsm::ConnectorEvent;
        let event = if plug_in { ConnectorEvent::Plugin } else { ConnectorEvent::Plugout };
        self.cp.apply_connector_event(self.connector_id, event).map(|_| ())
    }

    fn on_reserve_now(
        &self,
        expiry_minutes: i64,
        id_tag: &str,
        parent_id_tag: Option<&str>,
        reservation_id: Option<i32>,
    ) -> SimResult<()> {
        use crate::domain::fsm::ConnectorEvent;
        let id = reservation_id
            .unwrap_or_else(|| self.reservation_seq.fetch_add(1, Ordering::SeqCst));
        let now = self.cp.clock().now();
        self.cp.reservations().insert(Reservation {
            id,
            connector_id: self.connector_id,
            id_tag: id_tag.to_string(),
            parent_id_tag: parent_id_tag.map(str::to_string),
            expiry_date: now + ChronoDuration::minutes(expiry_minutes),
            created_at: now,
        });
        self.cp
            .apply_connector_event(self.connector_id, ConnectorEvent::Reserve { reservation_id: id })
            .map(|_| ())
    }

    fn on_cancel_reservation(&self, reservation_id: i32) -> SimResult<()> {
        use crate::domain::fsm::{ConnectorEvent, ConnectorStatus};
        if self.cp.reservations().remove(reservation_id).is_some() {
            if let Ok(connector) = self.cp.connector(self.connector_id) {
                if connector.status() == ConnectorStatus::Reserved {
                    self.cp
                        .apply_connector_event(self.connector_id, ConnectorEvent::CancelReservation)?;
                }
            }
        }
        Ok(())
    }

    fn on_auto_meter_start(&self, config: &AutoMeterConfig) -> SimResult<()> {
        self.cp.start_auto_meter(self.connector_id, config.clone())
    }

    fn on_auto_meter_stop(&self) -> SimResult<()> {
        self.cp.stop_auto_meter(self.connector_id)
    }

    fn register_scenario_handler(&self) {
        self.cp.register_scenario_handler(self.connector_id);
    }

    fn unregister_scenario_handler(&self) {
        self.cp.unregister_scenario_handler(self.connector_id);
    }

    fn reservation_for_target(&self) -> Option<Reservation> {
        self.cp.reservations().reservation_for_connector(self.connector_id)
    }

    fn on_node_execute(&self, node_id: &str) {
        debug!(connector_id = self.connector_id, node_id, "scenario node");
    }

    fn on_state_change(&self, context: &ExecutorContext) {
        debug!(connector_id = self.connector_id, state = ?context.state, "scenario state");
    }

    fn on_error(&self, message: &str) {
        self.cp.diag().record(
            LogLevel::Error,
            LogKind::Scenario,
            format!("connector {}: {message}", self.connector_id),
        );
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.cp.diag().record(level, LogKind::Scenario, message);
    }
}
