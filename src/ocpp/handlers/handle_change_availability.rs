//! ChangeAvailability handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::change_availability::{
    ChangeAvailabilityRequest, ChangeAvailabilityResponse,
};
use rust_ocpp::v1_6::types::{AvailabilityStatus, AvailabilityType};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::Availability;
use crate::ocpp::router::CallFault;

pub fn handle_change_availability(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: ChangeAvailabilityRequest = parse_payload(payload)?;
    let availability = match req.kind {
        AvailabilityType::Operative => Availability::Operative,
        AvailabilityType::Inoperative => Availability::Inoperative,
    };
    info!(connector_id = req.connector_id, ?availability, "change availability");

    // A transaction in progress defers the change per OCPP 1.6 §5.2.
    let busy = if req.connector_id == 0 {
        cp.connectors().any(|c| c.has_transaction())
    } else {
        cp.connector(req.connector_id)
            .map(|c| c.has_transaction())
            .unwrap_or(false)
    };
    if busy && availability == Availability::Inoperative {
        return to_payload(&ChangeAvailabilityResponse { status: AvailabilityStatus::Scheduled });
    }

    let status = match cp.update_connector_availability(req.connector_id, availability) {
        Ok(()) => AvailabilityStatus::Accepted,
        Err(_) => AvailabilityStatus::Rejected,
    };
    to_payload(&ChangeAvailabilityResponse { status })
}
