//! CancelReservation handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::cancel_reservation::{
    CancelReservationRequest, CancelReservationResponse,
};
use rust_ocpp::v1_6::types::CancelReservationStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::{ConnectorEvent, ConnectorStatus};
use crate::ocpp::router::CallFault;

pub fn handle_cancel_reservation(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: CancelReservationRequest = parse_payload(payload)?;
    info!(reservation_id = req.reservation_id, "cancel reservation");

    let status = match cp.reservations().remove(req.reservation_id) {
        Some(reservation) => {
            if reservation.connector_id != 0 {
                if let Ok(connector) = cp.connector(reservation.connector_id) {
                    if connector.status() == ConnectorStatus::Reserved {
                        let _ = cp.apply_connector_event(
                            reservation.connector_id,
                            ConnectorEvent::CancelReservation,
                        );
                    }
                }
            }
            CancelReservationStatus::Accepted
        }
        None => CancelReservationStatus::Rejected,
    };

    to_payload(&CancelReservationResponse { status })
}
