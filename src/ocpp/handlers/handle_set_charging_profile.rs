//! SetChargingProfile handler
//!
//! Profiles are stored, not enforced: the simulator keeps them per
//! connector so GetCompositeSchedule can answer from them.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::set_charging_profile::{
    SetChargingProfileRequest, SetChargingProfileResponse,
};
use rust_ocpp::v1_6::types::{ChargingProfilePurposeType, ChargingProfileStatus};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_set_charging_profile(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: SetChargingProfileRequest = parse_payload(payload)?;
    let profile = req.cs_charging_profiles;
    info!(
        connector_id = req.connector_id,
        profile_id = profile.charging_profile_id,
        stack_level = profile.stack_level,
        "set charging profile"
    );

    let status = if req.connector_id == 0 {
        // Charge-point-wide profile: mirrored to every connector.
        for connector in cp.connectors() {
            connector.set_charging_profile(profile.clone());
        }
        ChargingProfileStatus::Accepted
    } else {
        match u32::try_from(req.connector_id).ok().and_then(|id| cp.connector(id).ok()) {
            None => ChargingProfileStatus::Rejected,
            Some(connector) => {
                // TxProfile without a transaction has nothing to attach to.
                if profile.charging_profile_purpose == ChargingProfilePurposeType::TxProfile
                    && !connector.has_transaction()
                {
                    ChargingProfileStatus::Rejected
                } else {
                    connector.set_charging_profile(profile.clone());
                    ChargingProfileStatus::Accepted
                }
            }
        }
    };

    to_payload(&SetChargingProfileResponse { status })
}
