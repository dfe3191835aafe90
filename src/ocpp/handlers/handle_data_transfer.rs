//! DataTransfer handler
//!
//! Vendor-specific escape hatch. Only our own vendor id is recognized;
//! recognized requests echo the data back.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::data_transfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v1_6::types::DataTransferStatus;
use serde_json::Value;
use tracing::debug;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

pub fn handle_data_transfer(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: DataTransferRequest = parse_payload(payload)?;
    debug!(vendor_id = req.vendor_string.as_str(), message_id = ?req.message_id, "data transfer");

    let response = if req.vendor_string == cp.config().boot_notification.vendor {
        DataTransferResponse {
            data: req.data,
            status: DataTransferStatus::Accepted,
        }
    } else {
        DataTransferResponse {
            data: None,
            status: DataTransferStatus::UnknownVendorId,
        }
    };
    to_payload(&response)
}
