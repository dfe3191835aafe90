//! ClearChargingProfile handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::clear_charging_profile::{
    ClearChargingProfileRequest, ClearChargingProfileResponse,
};
use rust_ocpp::v1_6::types::ClearChargingProfileStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_clear_charging_profile(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: ClearChargingProfileRequest = parse_payload(payload)?;
    info!(id = ?req.id, connector_id = ?req.connector_id, "clear charging profile");

    let stack_level = req.stack_level.and_then(|s| u32::try_from(s).ok());
    let targets: Vec<u32> = match req.connector_id.and_then(|id| u32::try_from(id).ok()) {
        Some(0) | None => cp.connectors().map(|c| c.id).collect(),
        Some(id) => vec![id],
    };

    let mut removed = 0;
    for id in targets {
        if let Ok(connector) = cp.connector(id) {
            removed += connector.clear_charging_profiles(
                req.id,
                req.charging_profile_purpose.as_ref(),
                stack_level,
            );
        }
    }

    let status = if removed > 0 {
        ClearChargingProfileStatus::Accepted
    } else {
        ClearChargingProfileStatus::Unknown
    };
    to_payload(&ClearChargingProfileResponse { status })
}
