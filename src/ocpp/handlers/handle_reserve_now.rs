//! ReserveNow handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::reserve_now::{ReserveNowRequest, ReserveNowResponse};
use rust_ocpp::v1_6::types::ReservationStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::domain::fsm::{Availability, ConnectorEvent, ConnectorStatus};
use crate::domain::reservation::Reservation;
use crate::ocpp::router::CallFault;

pub fn handle_reserve_now(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: ReserveNowRequest = parse_payload(payload)?;
    info!(
        reservation_id = req.reservation_id,
        connector_id = req.connector_id,
        id_tag = req.id_tag.as_str(),
        "reserve now"
    );

    if req.expiry_date <= cp.clock().now() {
        return to_payload(&ReserveNowResponse { status: ReservationStatus::Rejected });
    }

    let status = if req.connector_id == 0 {
        // Whole-charge-point reservation: only one wildcard at a time.
        if cp.reservations().reservation_for_connector(0).is_some() {
            ReservationStatus::Occupied
        } else {
            cp.reservations().insert(Reservation {
                id: req.reservation_id,
                connector_id: 0,
                id_tag: req.id_tag.clone(),
                parent_id_tag: req.parent_id_tag.clone(),
                expiry_date: req.expiry_date,
                created_at: cp.clock().now(),
            });
            ReservationStatus::Accepted
        }
    } else {
        match cp.connector(req.connector_id) {
            Err(_) => ReservationStatus::Rejected,
            Ok(connector) => {
                let already_reserved = connector.status() == ConnectorStatus::Reserved
                    || cp
                        .reservations()
                        .reservation_for_connector(req.connector_id)
                        .map_or(false, |r| r.connector_id == req.connector_id);
                if connector.status() == ConnectorStatus::Faulted {
                    ReservationStatus::Faulted
                } else if connector.has_transaction() || already_reserved {
                    ReservationStatus::Occupied
                } else if connector.availability() == Availability::Inoperative
                    || connector.status() == ConnectorStatus::Unavailable
                {
                    ReservationStatus::Unavailable
                } else {
                    cp.reservations().insert(Reservation {
                        id: req.reservation_id,
                        connector_id: req.connector_id,
                        id_tag: req.id_tag.clone(),
                        parent_id_tag: req.parent_id_tag.clone(),
                        expiry_date: req.expiry_date,
                        created_at: cp.clock().now(),
                    });
                    let _ = cp.apply_connector_event(
                        req.connector_id,
                        ConnectorEvent::Reserve { reservation_id: req.reservation_id },
                    );
                    ReservationStatus::Accepted
                }
            }
        }
    };

    to_payload(&ReserveNowResponse { status })
}
