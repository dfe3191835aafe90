//! Result handlers
//!
//! Run when the CSMS answers one of our CALLs. Dispatch happens on the
//! action stored in the request history, so transaction results know
//! which connector they belong to.

use std::sync::Arc;
use std::time::Duration;

use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationResponse;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionResponse;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionResponse;
use rust_ocpp::v1_6::types::{AuthorizationStatus, RegistrationStatus};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::{ChargePointStatus, ConnectorEvent, ConnectorStatus};
use crate::events::SimEvent;
use crate::ocpp::request_history::InFlightRequest;
use crate::support::diag_log::{LogKind, LogLevel};

/// BootNotification response: Accepted brings the charge point online,
/// announces every connector and arms the heartbeat with the returned
/// interval. Pending/Rejected schedules a retry after that interval.
pub fn boot_notification(cp: &Arc<ChargePoint>, payload: Value) {
    let resp: BootNotificationResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparseable BootNotification response");
            return;
        }
    };

    let interval_secs = i64::from(resp.interval).max(0) as u64;

    match resp.status {
        RegistrationStatus::Accepted => {
            info!(interval = interval_secs, "boot accepted");
            cp.diag().record(LogLevel::Info, LogKind::Ocpp, "BootNotification accepted");
            cp.clear_error();
            cp.set_cp_status(ChargePointStatus::Available);
            cp.bus().publish(SimEvent::BootAccepted { interval_secs });

            // Announce where every connector stands.
            for connector in cp.connectors() {
                cp.send_status_notification(connector.id, connector.status(), None);
            }

            let heartbeat_secs = if interval_secs > 0 {
                interval_secs as i64
            } else {
                cp.config().heartbeat_interval_secs as i64
            };
            let _ = cp.start_heartbeat(heartbeat_secs);
        }
        status @ (RegistrationStatus::Pending | RegistrationStatus::Rejected) => {
            warn!(?status, retry_in = interval_secs, "boot not accepted");
            cp.diag().record(
                LogLevel::Warning,
                LogKind::Ocpp,
                format!("BootNotification {status:?}; retrying in {interval_secs}s"),
            );
            let cp = cp.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(interval_secs.max(1))).await;
                cp.boot();
            });
        }
    }
}

/// StartTransaction response: Accepted stores the transaction id and
/// moves the connector to Charging; anything else faults the connector
/// and cleans the transaction up.
pub fn start_transaction(cp: &Arc<ChargePoint>, request: InFlightRequest, payload: Value) {
    let resp: StartTransactionResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparseable StartTransaction response");
            return;
        }
    };

    let Some(connector_id) = request.connector_id else {
        warn!("StartTransaction response without connector context");
        return;
    };
    let Ok(connector) = cp.connector(connector_id) else { return };
    connector.clear_start_in_flight();

    if resp.id_tag_info.status == AuthorizationStatus::Accepted {
        info!(connector_id, transaction_id = resp.transaction_id, "transaction confirmed");
        let _ = cp.apply_connector_event(
            connector_id,
            ConnectorEvent::StartTransaction { transaction_id: resp.transaction_id },
        );
        if let Some(tx) = connector.transaction() {
            cp.bus().publish(SimEvent::TransactionStarted {
                connector_id,
                transaction_id: tx.id,
                tag_id: tx.tag_id,
            });
        }
        if let Some(auto_meter) = cp.config().auto_meter_value.clone() {
            let _ = cp.start_auto_meter(connector_id, auto_meter);
        }
    } else {
        warn!(
            connector_id,
            status = ?resp.id_tag_info.status,
            "transaction rejected by CSMS"
        );
        cp.diag().record(
            LogLevel::Warning,
            LogKind::Ocpp,
            format!("StartTransaction rejected on connector {connector_id}"),
        );
        connector.clear_transaction();
        let _ = cp.apply_connector_event(
            connector_id,
            ConnectorEvent::Error { code: "InternalError".into() },
        );
    }
}

/// StopTransaction response carries only the (optional) final id tag
/// verdict; the local state has already moved on.
pub fn stop_transaction(cp: &Arc<ChargePoint>, request: InFlightRequest, payload: Value) {
    let resp: StopTransactionResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparseable StopTransaction response");
            return;
        }
    };
    debug!(
        connector_id = ?request.connector_id,
        id_tag_info = ?resp.id_tag_info,
        "stop transaction acknowledged"
    );
    cp.diag().record(LogLevel::Debug, LogKind::Ocpp, "StopTransaction acknowledged");
}

/// Authorize response: remember the verdict and, when accepted, let a
/// connector sitting in Preparing use the authorization.
pub fn authorize(cp: &Arc<ChargePoint>, request: InFlightRequest, payload: Value) {
    let resp: AuthorizeResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparseable Authorize response");
            return;
        }
    };
    let tag_id = serde_json::from_value::<AuthorizeRequest>(request.payload)
        .map(|r| r.id_tag)
        .unwrap_or_default();
    let accepted = resp.id_tag_info.status == AuthorizationStatus::Accepted;

    info!(tag_id = tag_id.as_str(), accepted, "authorization result");
    cp.bus().publish(SimEvent::AuthorizationResult { tag_id: tag_id.clone(), accepted });

    if accepted {
        if let Some(connector) = cp
            .connectors()
            .find(|c| c.status() == ConnectorStatus::Preparing && !c.is_authorized())
        {
            let _ = cp.apply_connector_event(
                connector.id,
                ConnectorEvent::Authorize { tag_id },
            );
        }
    }
}

pub fn heartbeat(cp: &Arc<ChargePoint>, payload: Value) {
    let resp: HeartbeatResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unparseable Heartbeat response");
            return;
        }
    };
    debug!(current_time = %resp.current_time, "heartbeat acknowledged");
    cp.bus().publish(SimEvent::HeartbeatAcknowledged { current_time: resp.current_time });
}

/// CALLERROR recovery. A failed StartTransaction cleans the pending
/// transaction and returns the connector to Available; everything else
/// is logged and forgotten.
pub fn call_error(
    cp: &Arc<ChargePoint>,
    request: InFlightRequest,
    error_code: &str,
    error_description: &str,
) {
    warn!(
        action = request.action.as_str(),
        error_code,
        error_description,
        "call answered with error"
    );
    cp.diag().record(
        LogLevel::Error,
        LogKind::Ocpp,
        format!("{} failed: {error_code} {error_description}", request.action),
    );

    if request.action == "StartTransaction" {
        if let Some(connector_id) = request.connector_id {
            if let Ok(connector) = cp.connector(connector_id) {
                connector.clear_transaction();
                if connector.status() == ConnectorStatus::Preparing {
                    let _ = cp.apply_connector_event(connector_id, ConnectorEvent::Plugout);
                }
            }
        }
    }
}
