//! RemoteStopTransaction handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use rust_ocpp::v1_6::types::{Reason, RemoteStartStopStatus};
use serde_json::Value;
use tracing::{info, warn};

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::ConnectorEvent;
use crate::ocpp::router::CallFault;

pub fn handle_remote_stop(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: RemoteStopTransactionRequest = parse_payload(payload)?;

    let status = match cp.connector_by_transaction(req.transaction_id) {
        Some(connector) => {
            let connector_id = connector.id;
            info!(connector_id, transaction_id = req.transaction_id, "remote stop");
            let cp = cp.clone();
            tokio::spawn(async move {
                // suspend from the EVSE side first, then finish
                let _ = cp.apply_connector_event(
                    connector_id,
                    ConnectorEvent::SuspendEvse { reason: Some("RemoteStop".into()) },
                );
                if let Err(e) = cp.stop_transaction_with_reason(connector_id, Reason::Remote) {
                    warn!(connector_id, error = %e, "remote stop failed");
                }
            });
            RemoteStartStopStatus::Accepted
        }
        None => {
            warn!(transaction_id = req.transaction_id, "remote stop for unknown transaction");
            RemoteStartStopStatus::Rejected
        }
    };

    to_payload(&RemoteStopTransactionResponse { status })
}
