//! RemoteStartTransaction handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::remote_start_transaction::{
    RemoteStartTransactionRequest, RemoteStartTransactionResponse,
};
use rust_ocpp::v1_6::types::RemoteStartStopStatus;
use serde_json::Value;
use tracing::{info, warn};

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::{Availability, ConnectorStatus};
use crate::ocpp::router::CallFault;

pub fn handle_remote_start(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: RemoteStartTransactionRequest = parse_payload(payload)?;

    let connector_id = match req.connector_id {
        Some(id) => Some(id),
        // No connector requested: first one that could take a session.
        None => cp
            .connectors()
            .find(|c| {
                matches!(
                    c.status(),
                    ConnectorStatus::Available | ConnectorStatus::Preparing | ConnectorStatus::Reserved
                )
            })
            .map(|c| c.id),
    };
    let Some(connector_id) = connector_id else {
        warn!("remote start with no connector able to take a session");
        return to_payload(&RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        });
    };

    let status = match cp.connector(connector_id) {
        Err(_) => {
            warn!(connector_id, "remote start for unknown connector");
            RemoteStartStopStatus::Rejected
        }
        Ok(connector) => {
            let operative = connector.availability() == Availability::Operative
                && !matches!(
                    connector.status(),
                    ConnectorStatus::Faulted | ConnectorStatus::Unavailable
                );
            if !operative {
                RemoteStartStopStatus::Rejected
            } else if cp.is_scenario_handled(connector_id) {
                // A scenario owns this connector; hand it the event and
                // let it decide when (and whether) to start.
                info!(connector_id, tag_id = req.id_tag.as_str(), "remote start handed to scenario");
                cp.notify_remote_start_received(connector_id, &req.id_tag);
                RemoteStartStopStatus::Accepted
            } else {
                if let Some(profile) = req.charging_profile.clone() {
                    connector.set_charging_profile(profile);
                }
                let cp = cp.clone();
                let tag_id = req.id_tag.clone();
                // reply goes out first; the transaction starts right after
                tokio::spawn(async move {
                    if let Err(e) = cp.start_transaction(connector_id, &tag_id, None, None) {
                        warn!(connector_id, error = %e, "remote start failed");
                    }
                });
                RemoteStartStopStatus::Accepted
            }
        }
    };

    to_payload(&RemoteStartTransactionResponse { status })
}
