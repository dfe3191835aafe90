//! Charge point aggregate root
//!
//! Owns the connectors, the heartbeat timer, the reservation book and the
//! wiring between transport, router and domain. Every mutation of
//! simulator state funnels through methods here, which keeps transitions
//! serialized per connector and gives the router, the REPL and the
//! scenario engine one identical surface.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rust_ocpp::v1_6::messages::authorize::AuthorizeRequest;
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatRequest;
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionRequest;
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionRequest;
use rust_ocpp::v1_6::types::{
    ChargePointErrorCode, Location, Measurand, MeterValue, Reason, ReadingContext, SampledValue,
    UnitOfMeasure, ValueFormat,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SimulatorConfig;
use crate::domain::connector::{Connector, Transaction, TransitionOutcome};
use crate::domain::fsm::{
    Availability, ChargePointStatus, ConnectorEvent, ConnectorStatus, InvalidTransition,
};
use crate::domain::meter::{battery_step, AutoMeterConfig, MeterStrategy};
use crate::domain::reservation::ReservationManager;
use crate::events::{EventBus, SimEvent};
use crate::history::{HistoryEntity, StateHistory, StateHistoryEntry};
use crate::ocpp::request_history::{InFlightRequest, RequestHistory};
use crate::ocpp::router;
use crate::ports::FileUploadSink;
use crate::support::clock::SharedClock;
use crate::support::diag_log::{DiagLog, LogKind, LogLevel};
use crate::support::errors::{SimResult, SimulatorError};
use crate::transport::{Transport, TransportEvent};

/// Close codes that do not flag an error on the charge point.
const CLEAN_CLOSE_CODES: [u16; 2] = [1000, 1005];

/// A configuration key as served by GetConfiguration.
#[derive(Debug, Clone)]
pub struct ConfigurationKey {
    pub value: String,
    pub readonly: bool,
}

/// Outcome of a ChangeConfiguration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChangeStatus {
    Accepted,
    Rejected,
    NotSupported,
}

/// The simulated charge point.
pub struct ChargePoint {
    id: String,
    /// Self-handle for the background tasks this aggregate spawns.
    self_weak: Weak<ChargePoint>,
    config: SimulatorConfig,
    status: RwLock<ChargePointStatus>,
    error: RwLock<Option<String>>,
    connectors: BTreeMap<u32, Arc<Connector>>,
    transport: Arc<dyn Transport>,
    requests: Arc<RequestHistory>,
    state_history: Arc<StateHistory>,
    reservations: Arc<ReservationManager>,
    bus: EventBus,
    diag: Arc<DiagLog>,
    clock: SharedClock,
    upload_sink: Arc<dyn FileUploadSink>,
    config_keys: RwLock<BTreeMap<String, ConfigurationKey>>,
    /// Connectors currently owned by a scenario handler.
    scenario_handlers: DashMap<u32, ()>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChargePoint {
    pub fn new(
        config: SimulatorConfig,
        transport: Arc<dyn Transport>,
        upload_sink: Arc<dyn FileUploadSink>,
        clock: SharedClock,
    ) -> SimResult<Arc<Self>> {
        config.validate()?;

        let bus = EventBus::new();
        let state_history = Arc::new(StateHistory::new());
        let diag = Arc::new(DiagLog::new(bus.clone(), clock.clone()));
        let reservations = Arc::new(ReservationManager::new(bus.clone(), clock.clone()));

        let connectors = (1..=config.connector_count)
            .map(|id| {
                (
                    id,
                    Arc::new(Connector::new(
                        id,
                        bus.clone(),
                        state_history.clone(),
                        clock.clone(),
                    )),
                )
            })
            .collect();

        let cp = Arc::new_cyclic(|self_weak| Self {
            id: config.cp_id.clone(),
            self_weak: self_weak.clone(),
            config_keys: RwLock::new(Self::seed_config_keys(&config)),
            config,
            status: RwLock::new(ChargePointStatus::Available),
            error: RwLock::new(None),
            connectors,
            transport,
            requests: Arc::new(RequestHistory::new()),
            state_history,
            reservations,
            bus,
            diag,
            clock,
            upload_sink,
            scenario_handlers: DashMap::new(),
            heartbeat: Mutex::new(None),
            rx_task: Mutex::new(None),
        });
        Ok(cp)
    }

    fn seed_config_keys(config: &SimulatorConfig) -> BTreeMap<String, ConfigurationKey> {
        let mut keys = BTreeMap::new();
        let mut put = |key: &str, value: String, readonly: bool| {
            keys.insert(key.to_string(), ConfigurationKey { value, readonly });
        };
        put("HeartbeatInterval", config.heartbeat_interval_secs.to_string(), false);
        put("MeterValueSampleInterval", "5".to_string(), false);
        put("NumberOfConnectors", config.connector_count.to_string(), true);
        put("ConnectionTimeOut", "60".to_string(), false);
        put("ResetRetries", "1".to_string(), false);
        put("AuthorizeRemoteTxRequests", "false".to_string(), true);
        put(
            "SupportedFeatureProfiles",
            "Core,FirmwareManagement,Reservation,SmartCharging".to_string(),
            true,
        );
        keys
    }

    // ── Accessors ──────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn requests(&self) -> &Arc<RequestHistory> {
        &self.requests
    }

    pub fn state_history(&self) -> &Arc<StateHistory> {
        &self.state_history
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    pub fn diag(&self) -> &Arc<DiagLog> {
        &self.diag
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn upload_sink(&self) -> &Arc<dyn FileUploadSink> {
        &self.upload_sink
    }

    pub fn status(&self) -> ChargePointStatus {
        *self.status.read().unwrap()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap().clone()
    }

    pub fn connector(&self, connector_id: u32) -> SimResult<&Arc<Connector>> {
        self.connectors
            .get(&connector_id)
            .ok_or(SimulatorError::ConnectorNotFound(connector_id))
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<Connector>> {
        self.connectors.values()
    }

    pub fn connector_count(&self) -> u32 {
        self.connectors.len() as u32
    }

    /// The connector owning transaction `transaction_id`, if any.
    pub fn connector_by_transaction(&self, transaction_id: i32) -> Option<&Arc<Connector>> {
        self.connectors
            .values()
            .find(|c| c.transaction().map_or(false, |tx| tx.id == transaction_id))
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Open the link to the CSMS and start routing inbound frames.
    pub async fn connect(&self) -> SimResult<()> {
        self.spawn_rx_loop();
        self.transport.connect().await?;
        Ok(())
    }

    /// Tear down: heartbeat, auto-meter tasks, reservation sweeper,
    /// pending requests and the socket (with its reconnect timer).
    pub async fn disconnect(&self) {
        self.stop_heartbeat();
        for connector in self.connectors.values() {
            connector.stop_auto_meter();
        }
        self.reservations.stop_sweeper();
        self.transport.disconnect().await;
        self.requests.clear();
        if let Some(task) = self.rx_task.lock().unwrap().take() {
            task.abort();
        }
        self.bus.publish(SimEvent::Disconnected { code: None, manual: true });
        self.diag
            .record(LogLevel::Info, LogKind::Transport, "disconnected (manual)");
    }

    /// Hard reset: drop the link, then bring it back up.
    pub async fn reset(&self) {
        self.diag.record(LogLevel::Info, LogKind::System, "resetting charge point");
        self.disconnect().await;
        let _ = self.connect().await;
    }

    fn spawn_rx_loop(&self) {
        let mut guard = self.rx_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let mut rx = self.transport.subscribe();
        let weak = self.self_weak.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(cp) = weak.upgrade() else { break };
                        cp.handle_transport_event(event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "transport event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.diag.record(LogLevel::Info, LogKind::Transport, "connected to CSMS");
                self.bus.publish(SimEvent::Connected);
                self.boot();
            }
            TransportEvent::Closed { manual: true, .. } => {
                // disconnect() already did the bookkeeping
            }
            TransportEvent::Closed { code, manual: false } => {
                self.requests.clear();
                if let Some(code) = code.filter(|c| !CLEAN_CLOSE_CODES.contains(c)) {
                    *self.error.write().unwrap() =
                        Some(format!("connection closed abnormally (code {code})"));
                }
                self.diag.record(
                    LogLevel::Warning,
                    LogKind::Transport,
                    format!("connection lost (code {code:?})"),
                );
                self.bus.publish(SimEvent::Disconnected { code, manual: false });
            }
            TransportEvent::Frame(text) => {
                if let Some(cp) = self.self_weak.upgrade() {
                    router::route_frame(&cp, &text);
                }
            }
        }
    }

    // ── Outbound calls ─────────────────────────────────────

    /// Send a CALL and remember it for response correlation. Returns the
    /// generated message id.
    pub fn send_call(
        &self,
        action: &str,
        payload: serde_json::Value,
        connector_id: Option<u32>,
    ) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.requests.record(InFlightRequest {
            message_id: message_id.clone(),
            action: action.to_string(),
            payload: payload.clone(),
            connector_id,
            sent_at: self.clock.now(),
        });
        debug!(action, message_id = message_id.as_str(), "sending call");
        self.transport.send_call(&message_id, action, payload);
        message_id
    }

    /// Send BootNotification and drive connectors to their reset
    /// baseline.
    pub fn boot(&self) {
        let info = &self.config.boot_notification;
        let request = BootNotificationRequest {
            charge_box_serial_number: None,
            charge_point_model: info.model.clone(),
            charge_point_serial_number: info.serial_number.clone(),
            charge_point_vendor: info.vendor.clone(),
            firmware_version: info.firmware_version.clone(),
            iccid: info.iccid.clone(),
            imsi: info.imsi.clone(),
            meter_serial_number: info.meter_serial_number.clone(),
            meter_type: info.meter_type.clone(),
        };
        self.send_call("BootNotification", json!(request), None);
        self.diag.record(LogLevel::Info, LogKind::Ocpp, "BootNotification sent");

        if self.config.auto_reset_to_available {
            for connector in self.connectors.values() {
                if connector.status() != ConnectorStatus::Available {
                    let _ = self.drive_connector_towards(connector, ConnectorStatus::Available);
                }
            }
        }
    }

    pub fn authorize(&self, tag_id: &str) {
        let request = AuthorizeRequest { id_tag: tag_id.to_string() };
        self.send_call("Authorize", json!(request), None);
    }

    pub fn send_heartbeat(&self) {
        self.send_call("Heartbeat", json!(HeartbeatRequest {}), None);
    }

    // ── Connector FSM ──────────────────────────────────────

    /// Drive a connector with `event`; on an accepted status change a
    /// StatusNotification goes out. This is the single entry point used
    /// by handlers, scenarios and the REPL alike.
    pub fn apply_connector_event(
        &self,
        connector_id: u32,
        event: ConnectorEvent,
    ) -> SimResult<TransitionOutcome> {
        let connector = self.connector(connector_id)?;
        let error_code = match &event {
            ConnectorEvent::Error { code } => Some(code.clone()),
            _ => None,
        };
        let outcome = connector.apply(event)?;
        if outcome.old != outcome.new {
            self.send_status_notification(connector_id, outcome.new, error_code.as_deref());
        }
        Ok(outcome)
    }

    /// StatusNotification for the connector's current status.
    pub fn send_status_notification(
        &self,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<&str>,
    ) {
        let request = StatusNotificationRequest {
            connector_id,
            error_code: map_error_code(error_code),
            info: None,
            status: status.to_ocpp(),
            timestamp: Some(self.clock.now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        self.send_call("StatusNotification", json!(request), Some(connector_id));
    }

    /// Map a desired status onto the FSM event that reaches it from the
    /// connector's current state.
    fn event_towards(
        current: ConnectorStatus,
        target: ConnectorStatus,
    ) -> Option<ConnectorEvent> {
        use ConnectorStatus as S;
        match (current, target) {
            (_, t) if t == current => None,
            (S::Available | S::Reserved, S::Preparing) => Some(ConnectorEvent::Plugin),
            (S::SuspendedEV | S::SuspendedEVSE, S::Charging) => Some(ConnectorEvent::Resume),
            (S::Charging | S::SuspendedEVSE, S::SuspendedEV) => Some(ConnectorEvent::SuspendEv),
            (S::Charging | S::SuspendedEV, S::SuspendedEVSE) => {
                Some(ConnectorEvent::SuspendEvse { reason: None })
            }
            (S::Charging | S::SuspendedEV | S::SuspendedEVSE, S::Finishing) => {
                Some(ConnectorEvent::StopTransaction { reason: None })
            }
            (S::Preparing | S::Finishing, S::Available) => Some(ConnectorEvent::Plugout),
            (S::Unavailable, S::Available) => Some(ConnectorEvent::SetAvailable),
            (S::Faulted, S::Available) => Some(ConnectorEvent::Reset),
            (S::Reserved, S::Available) => Some(ConnectorEvent::CancelReservation),
            (_, S::Faulted) => Some(ConnectorEvent::Error { code: "OtherError".into() }),
            (S::Available, S::Unavailable) => Some(ConnectorEvent::SetUnavailable),
            _ => None,
        }
    }

    fn drive_connector_towards(
        &self,
        connector: &Arc<Connector>,
        target: ConnectorStatus,
    ) -> SimResult<()> {
        match Self::event_towards(connector.status(), target) {
            Some(event) => {
                self.apply_connector_event(connector.id, event)?;
                Ok(())
            }
            None if connector.status() == target => Ok(()),
            None => Err(SimulatorError::InvalidTransition(InvalidTransition {
                from: connector.status(),
                event: "StatusChange",
                reason: Some(format!("no edge towards {target}")),
            })),
        }
    }

    /// Status update entry point; connector 0 addresses the charge point
    /// itself.
    pub fn update_connector_status(
        &self,
        connector_id: u32,
        status: ConnectorStatus,
    ) -> SimResult<()> {
        if connector_id == 0 {
            let cp_status = match status {
                ConnectorStatus::Unavailable => ChargePointStatus::Unavailable,
                ConnectorStatus::Faulted => ChargePointStatus::Faulted,
                _ => ChargePointStatus::Available,
            };
            self.set_cp_status(cp_status);
            return Ok(());
        }
        let connector = self.connector(connector_id)?;
        self.drive_connector_towards(connector, status)
    }

    /// Availability update; connector 0 applies to every connector and
    /// the charge point itself.
    pub fn update_connector_availability(
        &self,
        connector_id: u32,
        availability: Availability,
    ) -> SimResult<()> {
        if connector_id == 0 {
            for connector in self.connectors.values() {
                self.apply_availability(connector, availability)?;
            }
            self.set_cp_status(match availability {
                Availability::Operative => ChargePointStatus::Available,
                Availability::Inoperative => ChargePointStatus::Unavailable,
            });
            return Ok(());
        }
        let connector = self.connector(connector_id)?;
        self.apply_availability(connector, availability)
    }

    fn apply_availability(
        &self,
        connector: &Arc<Connector>,
        availability: Availability,
    ) -> SimResult<()> {
        if connector.availability() == availability {
            return Ok(());
        }
        let event = match availability {
            Availability::Operative => ConnectorEvent::SetAvailable,
            Availability::Inoperative => ConnectorEvent::SetUnavailable,
        };
        self.apply_connector_event(connector.id, event)?;
        Ok(())
    }

    /// Charge-point level status with exactly one history entry and one
    /// event per change.
    pub fn set_cp_status(&self, new: ChargePointStatus) {
        let old = {
            let mut status = self.status.write().unwrap();
            let old = *status;
            if old == new {
                return;
            }
            *status = new;
            old
        };

        self.state_history.record(StateHistoryEntry::accepted(
            self.clock.now(),
            HistoryEntity::ChargePoint,
            None,
            "StatusChange",
            old.as_str(),
            new.as_str(),
            serde_json::Value::Null,
        ));
        self.bus.publish(SimEvent::ChargePointStatusChanged { old, new });

        // An unavailable charge point takes every connector with it.
        if new == ChargePointStatus::Unavailable {
            for connector in self.connectors.values() {
                if connector.status() != ConnectorStatus::Unavailable {
                    let _ = self.apply_connector_event(connector.id, ConnectorEvent::SetUnavailable);
                }
            }
        }
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.error.write().unwrap() = Some(error.into());
    }

    pub fn clear_error(&self) {
        *self.error.write().unwrap() = None;
    }

    // ── Transactions ───────────────────────────────────────

    /// Create a transaction (id 0 until the CSMS confirms), send
    /// StartTransaction and drive the connector into Preparing.
    pub fn start_transaction(
        &self,
        connector_id: u32,
        tag_id: &str,
        battery_capacity_kwh: Option<f64>,
        initial_soc: Option<f64>,
    ) -> SimResult<()> {
        let connector = self.connector(connector_id)?;

        match connector.status() {
            ConnectorStatus::Available
            | ConnectorStatus::Preparing
            | ConnectorStatus::Reserved => {}
            other => {
                return Err(SimulatorError::InvalidTransition(InvalidTransition {
                    from: other,
                    event: "StartTransaction",
                    reason: Some("connector cannot start a transaction".into()),
                }))
            }
        }

        let reservation = self.reservations.consume_for_connector(connector_id, tag_id);

        let now = self.clock.now();
        let tx = Transaction {
            id: 0,
            connector_id,
            tag_id: tag_id.to_string(),
            meter_start: connector.meter_value(),
            meter_stop: None,
            start_time: now,
            stop_time: None,
            meter_sent: false,
            battery_capacity_kwh,
            initial_soc,
        };
        if !connector.attach_transaction(tx) {
            return Err(SimulatorError::TransactionAlreadyActive(connector_id));
        }

        let request = StartTransactionRequest {
            connector_id,
            id_tag: tag_id.to_string(),
            meter_start: connector.meter_value() as i32,
            reservation_id: reservation.map(|r| r.id),
            timestamp: now,
        };
        self.send_call("StartTransaction", json!(request), Some(connector_id));

        // Plug in and authorize locally; tolerate a connector that is
        // already plugged (Preparing).
        if matches!(
            connector.status(),
            ConnectorStatus::Available | ConnectorStatus::Reserved
        ) {
            self.apply_connector_event(connector_id, ConnectorEvent::Plugin)?;
        }
        self.apply_connector_event(
            connector_id,
            ConnectorEvent::Authorize { tag_id: tag_id.to_string() },
        )?;

        self.bus.publish(SimEvent::TransactionStarted {
            connector_id,
            transaction_id: 0,
            tag_id: tag_id.to_string(),
        });
        self.diag.record(
            LogLevel::Info,
            LogKind::Ocpp,
            format!("transaction requested on connector {connector_id} (tag {tag_id})"),
        );
        Ok(())
    }

    /// Stop the active transaction: Finishing, StopTransaction CALL and,
    /// with auto-reset, back to Available.
    pub fn stop_transaction(&self, connector_id: u32) -> SimResult<()> {
        self.stop_transaction_with_reason(connector_id, Reason::Local)
    }

    pub fn stop_transaction_with_reason(
        &self,
        connector_id: u32,
        reason: Reason,
    ) -> SimResult<()> {
        let connector = self.connector(connector_id)?;
        if !connector.has_transaction() {
            warn!(connector_id, "stop_transaction without an active transaction; ignoring");
            return Ok(());
        }

        connector.stop_auto_meter();

        let now = self.clock.now();
        let tx = match connector.stamp_transaction_stop(now) {
            Some(tx) => tx,
            None => return Ok(()),
        };

        let reason_str = format!("{reason:?}");
        let request = StopTransactionRequest {
            id_tag: Some(tx.tag_id.clone()),
            meter_stop: tx.meter_stop.unwrap_or(tx.meter_start) as i32,
            timestamp: now,
            transaction_id: tx.id,
            reason: Some(reason),
            transaction_data: None,
        };
        self.send_call("StopTransaction", json!(request), Some(connector_id));

        self.bus.publish(SimEvent::TransactionStopped {
            connector_id,
            transaction_id: tx.id,
        });

        // From Charging/Suspended* this lands in Finishing; from
        // Preparing (unconfirmed start) there is no edge, which is fine.
        let _ = self.apply_connector_event(
            connector_id,
            ConnectorEvent::StopTransaction { reason: Some(reason_str) },
        );
        self.diag.record(
            LogLevel::Info,
            LogKind::Ocpp,
            format!("transaction {} stopped on connector {connector_id}", tx.id),
        );

        if self.config.auto_reset_to_available
            && matches!(
                connector.status(),
                ConnectorStatus::Finishing | ConnectorStatus::Preparing
            )
        {
            self.apply_connector_event(connector_id, ConnectorEvent::Plugout)?;
        } else {
            // transaction is kept until the connector reaches Available
            connector.clear_start_in_flight();
        }
        Ok(())
    }

    // ── Meter values ───────────────────────────────────────

    pub fn set_meter_value(&self, connector_id: u32, value: i64) -> SimResult<i64> {
        let connector = self.connector(connector_id)?;
        Ok(connector.set_meter_value(value))
    }

    /// Send the current meter register (and SoC when known) as a
    /// MeterValues CALL. A closed transport makes this a logged no-op.
    pub fn send_meter_value(&self, connector_id: u32) -> SimResult<()> {
        let connector = self.connector(connector_id)?;
        if !self.transport.is_open() {
            warn!(connector_id, "meter value not sent: transport is closed");
            return Ok(());
        }

        let mut sampled = vec![SampledValue {
            context: Some(ReadingContext::SamplePeriodic),
            format: Some(ValueFormat::Raw),
            location: Some(Location::Outlet),
            measurand: Some(Measurand::EnergyActiveImportRegister),
            phase: None,
            unit: Some(UnitOfMeasure::Wh),
            value: connector.meter_value().to_string(),
        }];
        if let Some(soc) = connector.soc() {
            sampled.push(SampledValue {
                context: Some(ReadingContext::SamplePeriodic),
                format: Some(ValueFormat::Raw),
                location: None,
                measurand: Some(Measurand::SoC),
                phase: None,
                unit: Some(UnitOfMeasure::Percent),
                value: format!("{soc:.1}"),
            });
        }

        let transaction_id = connector.transaction().map(|tx| tx.id).filter(|id| *id != 0);
        let request = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: self.clock.now(),
                sampled_value: sampled,
            }],
        };
        self.send_call("MeterValues", json!(request), Some(connector_id));
        connector.mark_meter_sent();
        Ok(())
    }

    // ── Auto meter ─────────────────────────────────────────

    /// Start (or replace) the auto-meter task on a connector.
    pub fn start_auto_meter(&self, connector_id: u32, config: AutoMeterConfig) -> SimResult<()> {
        let connector = self.connector(connector_id)?.clone();

        if let MeterStrategy::BatteryCurve { initial_soc, .. } = &config.strategy {
            let start_soc = connector
                .transaction()
                .and_then(|tx| tx.initial_soc)
                .unwrap_or(*initial_soc);
            connector.set_soc(start_soc);
        }

        let weak = self.self_weak.clone();
        let interval_secs = config.strategy.interval_seconds();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate tick
            let mut elapsed_secs: u64 = 0;
            let mut carry_wh: f64 = 0.0;

            loop {
                ticker.tick().await;
                elapsed_secs += interval_secs;
                let Some(cp) = weak.upgrade() else { break };
                let Ok(connector) = cp.connector(connector_id) else { break };

                let finished = match &config.strategy {
                    MeterStrategy::Increment {
                        increment_value,
                        max_time_seconds,
                        max_value,
                        ..
                    } => {
                        let next = connector.meter_value() + increment_value;
                        connector.set_meter_value(next);
                        let time_up = max_time_seconds.map_or(false, |t| elapsed_secs >= t);
                        let value_up = max_value.map_or(false, |v| next >= v);
                        time_up || value_up
                    }
                    MeterStrategy::BatteryCurve {
                        capacity_kwh,
                        initial_soc,
                        max_power_w,
                        ..
                    } => {
                        let soc = connector.soc().unwrap_or(*initial_soc);
                        let (wh, new_soc) =
                            battery_step(*capacity_kwh, *max_power_w, soc, interval_secs as f64);
                        carry_wh += wh;
                        let whole = carry_wh as i64;
                        carry_wh -= whole as f64;
                        connector.set_meter_value(connector.meter_value() + whole);
                        connector.set_soc(new_soc);
                        new_soc >= 100.0
                    }
                };

                if config.send_meter_values {
                    let _ = cp.send_meter_value(connector_id);
                }

                if finished {
                    info!(connector_id, "auto-meter limit reached; stopping transaction");
                    let _ = cp.stop_transaction(connector_id);
                    break;
                }
            }
        });

        connector.set_auto_meter(task);
        Ok(())
    }

    pub fn stop_auto_meter(&self, connector_id: u32) -> SimResult<()> {
        self.connector(connector_id)?.stop_auto_meter();
        Ok(())
    }

    // ── Heartbeat ──────────────────────────────────────────

    /// Start (or re-arm) the heartbeat with the given period.
    pub fn start_heartbeat(&self, period_secs: i64) -> SimResult<()> {
        if period_secs <= 0 {
            return Err(SimulatorError::InvalidHeartbeatPeriod(period_secs));
        }
        self.stop_heartbeat();

        let weak = self.self_weak.clone();
        let period = Duration::from_secs(period_secs as u64);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first beat one period from now
            loop {
                ticker.tick().await;
                let Some(cp) = weak.upgrade() else { break };
                cp.send_heartbeat();
            }
        });
        *self.heartbeat.lock().unwrap() = Some(task);
        info!(period_secs, "heartbeat started");
        Ok(())
    }

    pub fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.lock().unwrap().is_some()
    }

    // ── Configuration keys ─────────────────────────────────

    /// Known keys plus the unknown subset of `requested`.
    pub fn configuration(
        &self,
        requested: Option<&[String]>,
    ) -> (Vec<(String, ConfigurationKey)>, Vec<String>) {
        let keys = self.config_keys.read().unwrap();
        match requested {
            None => (
                keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Vec::new(),
            ),
            Some(requested) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for key in requested {
                    match keys.get(key) {
                        Some(v) => known.push((key.clone(), v.clone())),
                        None => unknown.push(key.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }

    pub fn change_configuration(&self, key: &str, value: &str) -> ConfigChangeStatus {
        let status = {
            let mut keys = self.config_keys.write().unwrap();
            match keys.get_mut(key) {
                None => ConfigChangeStatus::NotSupported,
                Some(entry) if entry.readonly => ConfigChangeStatus::Rejected,
                Some(entry) => {
                    entry.value = value.to_string();
                    ConfigChangeStatus::Accepted
                }
            }
        };

        // A new HeartbeatInterval re-arms a running timer.
        if status == ConfigChangeStatus::Accepted && key == "HeartbeatInterval" {
            if let Ok(secs) = value.parse::<i64>() {
                if self.heartbeat_running() {
                    let _ = self.start_heartbeat(secs);
                }
            }
        }
        status
    }

    // ── Scenario coordination ──────────────────────────────

    pub fn register_scenario_handler(&self, connector_id: u32) {
        self.scenario_handlers.insert(connector_id, ());
        debug!(connector_id, "scenario handler registered");
    }

    pub fn unregister_scenario_handler(&self, connector_id: u32) {
        self.scenario_handlers.remove(&connector_id);
        debug!(connector_id, "scenario handler unregistered");
    }

    pub fn is_scenario_handled(&self, connector_id: u32) -> bool {
        self.scenario_handlers.contains_key(&connector_id)
    }

    pub fn notify_remote_start_received(&self, connector_id: u32, tag_id: &str) {
        self.bus.publish(SimEvent::RemoteStartReceived {
            connector_id,
            tag_id: tag_id.to_string(),
        });
    }
}

/// Map a free-form error code onto the OCPP enumeration.
fn map_error_code(code: Option<&str>) -> ChargePointErrorCode {
    match code {
        None | Some("NoError") => ChargePointErrorCode::NoError,
        Some("ConnectorLockFailure") => ChargePointErrorCode::ConnectorLockFailure,
        Some("EVCommunicationError") => ChargePointErrorCode::EVCommunicationError,
        Some("GroundFailure") => ChargePointErrorCode::GroundFailure,
        Some("HighTemperature") => ChargePointErrorCode::HighTemperature,
        Some("InternalError") => ChargePointErrorCode::InternalError,
        Some("LocalListConflict") => ChargePointErrorCode::LocalListConflict,
        Some("OverCurrentFailure") => ChargePointErrorCode::OverCurrentFailure,
        Some("PowerMeterFailure") => ChargePointErrorCode::PowerMeterFailure,
        Some("PowerSwitchFailure") => ChargePointErrorCode::PowerSwitchFailure,
        Some("ReaderFailure") => ChargePointErrorCode::ReaderFailure,
        Some("ResetFailure") => ChargePointErrorCode::ResetFailure,
        Some("UnderVoltage") => ChargePointErrorCode::UnderVoltage,
        Some("OverVoltage") => ChargePointErrorCode::OverVoltage,
        Some("WeakSignal") => ChargePointErrorCode::WeakSignal,
        Some(_) => ChargePointErrorCode::OtherError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NullUploadSink;
    use crate::support::clock::SystemClock;
    use crate::transport::ChannelTransport;

    fn charge_point_with_transport() -> (Arc<ChargePoint>, Arc<ChannelTransport>) {
        let mut config = SimulatorConfig::new("CP-TEST", "ws://localhost:9000/ocpp/");
        config.connector_count = 2;
        let transport = Arc::new(ChannelTransport::new());
        let cp = ChargePoint::new(
            config,
            transport.clone(),
            Arc::new(NullUploadSink),
            Arc::new(SystemClock),
        )
        .unwrap();
        (cp, transport)
    }

    #[tokio::test]
    async fn start_transaction_sends_call_and_prepares_connector() {
        let (cp, transport) = charge_point_with_transport();
        transport.connect().await.unwrap();

        cp.start_transaction(1, "DEADBEEF", None, None).unwrap();

        assert_eq!(
            transport.sent_actions(),
            vec!["StartTransaction", "StatusNotification"]
        );
        assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Preparing);
        assert!(cp.connector(1).unwrap().has_transaction());
    }

    #[tokio::test]
    async fn second_start_on_same_connector_is_refused() {
        let (cp, transport) = charge_point_with_transport();
        transport.connect().await.unwrap();

        cp.start_transaction(1, "A", None, None).unwrap();
        let err = cp.start_transaction(1, "B", None, None).unwrap_err();
        assert!(matches!(err, SimulatorError::TransactionAlreadyActive(1)));
    }

    #[tokio::test]
    async fn stop_without_transaction_is_noop() {
        let (cp, transport) = charge_point_with_transport();
        transport.connect().await.unwrap();

        cp.stop_transaction(1).unwrap();
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_rejects_non_positive_period() {
        let (cp, _) = charge_point_with_transport();
        assert!(matches!(
            cp.start_heartbeat(0),
            Err(SimulatorError::InvalidHeartbeatPeriod(0))
        ));
        assert!(matches!(
            cp.start_heartbeat(-5),
            Err(SimulatorError::InvalidHeartbeatPeriod(-5))
        ));
        assert!(!cp.heartbeat_running());
    }

    #[tokio::test]
    async fn connector_zero_updates_charge_point_status() {
        let (cp, _) = charge_point_with_transport();
        cp.update_connector_status(0, ConnectorStatus::Unavailable).unwrap();
        assert_eq!(cp.status(), ChargePointStatus::Unavailable);
        // the invariant pulls every connector down with it
        for connector in cp.connectors() {
            assert_eq!(connector.status(), ConnectorStatus::Unavailable);
        }
    }

    #[tokio::test]
    async fn availability_round_trip_restores_available() {
        let (cp, transport) = charge_point_with_transport();
        transport.connect().await.unwrap();

        cp.update_connector_availability(1, Availability::Inoperative).unwrap();
        assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Unavailable);
        cp.update_connector_availability(1, Availability::Operative).unwrap();
        let connector = cp.connector(1).unwrap();
        assert_eq!(connector.status(), ConnectorStatus::Available);
        assert_eq!(connector.availability(), Availability::Operative);
    }

    #[tokio::test]
    async fn change_configuration_respects_readonly_and_unknown() {
        let (cp, _) = charge_point_with_transport();
        assert_eq!(
            cp.change_configuration("NumberOfConnectors", "5"),
            ConfigChangeStatus::Rejected
        );
        assert_eq!(
            cp.change_configuration("NoSuchKey", "1"),
            ConfigChangeStatus::NotSupported
        );
        assert_eq!(
            cp.change_configuration("HeartbeatInterval", "60"),
            ConfigChangeStatus::Accepted
        );
        let (known, unknown) =
            cp.configuration(Some(&["HeartbeatInterval".to_string(), "Nope".to_string()]));
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].1.value, "60");
        assert_eq!(unknown, vec!["Nope".to_string()]);
    }

    #[tokio::test]
    async fn meter_value_send_is_noop_when_closed() {
        let (cp, transport) = charge_point_with_transport();
        cp.set_meter_value(1, 100).unwrap();
        cp.send_meter_value(1).unwrap();
        assert!(transport.sent_frames().is_empty());
    }
}
