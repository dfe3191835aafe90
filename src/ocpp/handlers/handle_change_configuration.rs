//! ChangeConfiguration handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::change_configuration::{
    ChangeConfigurationRequest, ChangeConfigurationResponse,
};
use rust_ocpp::v1_6::types::ConfigurationStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::{ChargePoint, ConfigChangeStatus};
use crate::ocpp::router::CallFault;

pub fn handle_change_configuration(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: ChangeConfigurationRequest = parse_payload(payload)?;
    info!(key = req.key.as_str(), value = req.value.as_str(), "change configuration");

    let status = match cp.change_configuration(&req.key, &req.value) {
        ConfigChangeStatus::Accepted => ConfigurationStatus::Accepted,
        ConfigChangeStatus::Rejected => ConfigurationStatus::Rejected,
        ConfigChangeStatus::NotSupported => ConfigurationStatus::NotSupported,
    };

    to_payload(&ChangeConfigurationResponse { status })
}
