//! UnlockConnector handler
//!
//! Unlocking a connector with an active transaction stops it first
//! (reason UnlockCommand), then reports Unlocked.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::unlock_connector::{
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use rust_ocpp::v1_6::types::{Reason, UnlockStatus};
use serde_json::Value;
use tracing::{info, warn};

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::{ConnectorEvent, ConnectorStatus};
use crate::ocpp::router::CallFault;

pub fn handle_unlock_connector(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: UnlockConnectorRequest = parse_payload(payload)?;
    info!(connector_id = req.connector_id, "unlock connector");

    let status = match cp.connector(req.connector_id) {
        Err(_) => UnlockStatus::NotSupported,
        Ok(connector) => {
            let connector_id = connector.id;
            if connector.has_transaction() {
                let cp = cp.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        cp.stop_transaction_with_reason(connector_id, Reason::UnlockCommand)
                    {
                        warn!(connector_id, error = %e, "unlock-triggered stop failed");
                    }
                });
            } else if matches!(
                connector.status(),
                ConnectorStatus::Preparing | ConnectorStatus::Finishing
            ) {
                let _ = cp.apply_connector_event(connector_id, ConnectorEvent::Plugout);
            }
            UnlockStatus::Unlocked
        }
    };

    to_payload(&UnlockConnectorResponse { status })
}
