//! TriggerMessage handler
//!
//! The CSMS asks the charge point to send a specific message on its own
//! initiative. The reply goes out first; the triggered message follows.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::diagnostics_status_notification::DiagnosticsStatusNotificationRequest;
use rust_ocpp::v1_6::messages::trigger_message::{TriggerMessageRequest, TriggerMessageResponse};
use rust_ocpp::v1_6::types::{DiagnosticsStatus, MessageTrigger, TriggerMessageStatus};
use serde_json::{json, Value};
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_trigger_message(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: TriggerMessageRequest = parse_payload(payload)?;
    info!(requested = ?req.requested_message, connector_id = ?req.connector_id, "trigger message");

    let status = match req.requested_message {
        MessageTrigger::BootNotification => {
            let cp = cp.clone();
            tokio::spawn(async move { cp.boot() });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::Heartbeat => {
            let cp = cp.clone();
            tokio::spawn(async move { cp.send_heartbeat() });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::MeterValues => {
            let connector_id = req.connector_id.unwrap_or(1);
            if cp.connector(connector_id).is_err() {
                TriggerMessageStatus::Rejected
            } else {
                let cp = cp.clone();
                tokio::spawn(async move {
                    let _ = cp.send_meter_value(connector_id);
                });
                TriggerMessageStatus::Accepted
            }
        }
        MessageTrigger::StatusNotification => {
            let targets: Vec<u32> = match req.connector_id {
                Some(id) if cp.connector(id).is_err() => {
                    return to_payload(&TriggerMessageResponse {
                        status: TriggerMessageStatus::Rejected,
                    })
                }
                Some(id) => vec![id],
                None => cp.connectors().map(|c| c.id).collect(),
            };
            let cp = cp.clone();
            tokio::spawn(async move {
                for id in targets {
                    if let Ok(connector) = cp.connector(id) {
                        cp.send_status_notification(id, connector.status(), None);
                    }
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::DiagnosticsStatusNotification => {
            let cp = cp.clone();
            tokio::spawn(async move {
                cp.send_call(
                    "DiagnosticsStatusNotification",
                    json!(DiagnosticsStatusNotificationRequest { status: DiagnosticsStatus::Idle }),
                    None,
                );
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::FirmwareStatusNotification => TriggerMessageStatus::NotImplemented,
    };

    to_payload(&TriggerMessageResponse { status })
}
