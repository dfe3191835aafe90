//! GetCompositeSchedule handler
//!
//! Answers from the stored profiles: the highest-stack-level profile on
//! the connector wins and its schedule is clipped to the requested
//! duration. No power math beyond that: profile storage and echo only.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::get_composite_schedule::{
    GetCompositeScheduleRequest, GetCompositeScheduleResponse,
};
use rust_ocpp::v1_6::types::GetCompositeScheduleStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_get_composite_schedule(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: GetCompositeScheduleRequest = parse_payload(payload)?;
    info!(connector_id = req.connector_id, duration = req.duration, "composite schedule");

    let connector = u32::try_from(req.connector_id)
        .ok()
        .and_then(|id| cp.connector(id).ok());

    let best = connector.and_then(|c| {
        c.charging_profiles()
            .into_iter()
            .max_by_key(|p| p.stack_level)
    });

    let response = match best {
        Some(profile) => {
            let mut schedule = profile.charging_schedule;
            schedule.duration = Some(match schedule.duration {
                Some(d) => d.min(req.duration),
                None => req.duration,
            });
            GetCompositeScheduleResponse {
                status: GetCompositeScheduleStatus::Accepted,
                connector_id: Some(req.connector_id),
                schedule_start: Some(cp.clock().now()),
                charging_schedule: Some(schedule),
            }
        }
        None => GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        },
    };
    to_payload(&response)
}
