//! GetDiagnostics handler
//!
//! Snapshots the diagnostics log ring and uploads it to the requested
//! location in the background, bracketed by DiagnosticsStatusNotification
//! messages. The response names the file immediately.

use std::sync::Arc;

use rust_ocpp::v1_6::messages::diagnostics_status_notification::DiagnosticsStatusNotificationRequest;
use rust_ocpp::v1_6::messages::get_diagnostics::{GetDiagnosticsRequest, GetDiagnosticsResponse};
use rust_ocpp::v1_6::types::DiagnosticsStatus;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{parse_payload, to_payload};
use crate::domain::charge_point::ChargePoint;
use crate::ocpp::router::CallFault;

const DIAGNOSTICS_FILE: &str = "diagnostics.txt";

pub fn handle_get_diagnostics(cp: &Arc<ChargePoint>, payload: &Value) -> Result<Value, CallFault> {
    let req: GetDiagnosticsRequest = parse_payload(payload)?;
    info!(location = req.location.as_str(), "diagnostics requested");

    let snapshot = cp.diag().snapshot();
    let cp = cp.clone();
    let location = req.location;
    tokio::spawn(async move {
        let status_of = |status: DiagnosticsStatus| {
            json!(DiagnosticsStatusNotificationRequest { status })
        };
        cp.send_call("DiagnosticsStatusNotification", status_of(DiagnosticsStatus::Uploading), None);
        let result = cp
            .upload_sink()
            .upload(&location, DIAGNOSTICS_FILE, snapshot.as_bytes())
            .await;
        let status = match result {
            Ok(()) => DiagnosticsStatus::Uploaded,
            Err(e) => {
                warn!(error = %e, "diagnostics upload failed");
                DiagnosticsStatus::UploadFailed
            }
        };
        cp.send_call("DiagnosticsStatusNotification", status_of(status), None);
    });

    to_payload(&GetDiagnosticsResponse { file_name: Some(DIAGNOSTICS_FILE.to_string()) })
}
