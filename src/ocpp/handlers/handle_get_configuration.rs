//! GetConfiguration handler

use std::sync::Arc;

use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::types::KeyValue;
use serde_json::Value;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_get_configuration(
    cp: &Arc<ChargePoint>,
    payload: &Value,
) -> Result<Value, CallFault> {
    let req: GetConfigurationRequest = parse_payload(payload)?;

    let (known, unknown) = cp.configuration(req.key.as_deref());

    let configuration_key: Vec<KeyValue> = known
        .into_iter()
        .map(|(key, entry)| KeyValue {
            key,
            readonly: entry.readonly,
            value: Some(entry.value),
        })
        .collect();

    to_payload(&GetConfigurationResponse {
        configuration_key: Some(configuration_key),
        unknown_key: (!unknown.is_empty()).then_some(unknown),
    })
}
