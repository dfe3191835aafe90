//! Reset handler
//!
//! Accepted immediately; the actual reset happens 5 seconds later so the
//! CALLRESULT still makes it out over the old connection. Hard tears the
//! link down and reconnects; Soft re-boots in place.

use std::sync::Arc;
use std::time::Duration;

use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::types::{ResetRequestStatus, ResetResponseStatus};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

const RESET_DELAY: Duration = Duration::from_secs(5);

pub fn handle_reset(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: ResetRequest = parse_payload(payload)?;
    info!(kind = ?req.kind, "reset scheduled in {RESET_DELAY:?}");

    let cp = cp.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RESET_DELAY).await;
        match req.kind {
            ResetRequestStatus::Hard => cp.reset().await,
            ResetRequestStatus::Soft => cp.boot(),
        }
    });

    to_payload(&ResetResponse { status: ResetResponseStatus::Accepted })
}
