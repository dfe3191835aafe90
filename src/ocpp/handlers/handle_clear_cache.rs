//! ClearCache handler
//!
//! The simulator keeps no local authorization cache; the acknowledgement
//! is all the protocol asks for.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::clear_cache::{ClearCacheRequest, ClearCacheResponse};
use rust_ocpp::v1_6::types::ClearCacheStatus;
use serde_json::Value;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_clear_cache(_cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let _req: ClearCacheRequest = parse_payload(payload)?;
    to_payload(&ClearCacheResponse { status: ClearCacheStatus::Accepted })
}
