//! Shared rig for integration tests: a charge point wired to the
//! in-process loopback transport, with the test playing CSMS.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use cp_sim::config::SimulatorConfig;
use cp_sim::domain::charge_point::ChargePoint;
use cp_sim::ports::NullUploadSink;
use cp_sim::support::clock::SystemClock;
use cp_sim::support::ocpp_frame::OcppFrame;
use cp_sim::transport::ChannelTransport;

pub fn rig(connectors: u32) -> (Arc<ChargePoint>, Arc<ChannelTransport>) {
    let mut config = SimulatorConfig::new("CP-TEST", "ws://localhost:9000/ocpp/");
    config.connector_count = connectors;
    config.tag_ids = vec!["DEADBEEF".into()];
    let transport = Arc::new(ChannelTransport::new());
    let cp = ChargePoint::new(
        config,
        transport.clone(),
        Arc::new(NullUploadSink),
        Arc::new(SystemClock),
    )
    .expect("config is valid");
    (cp, transport)
}

/// Poll until `pred` holds; panics after ~2 seconds.
pub async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s: {what}");
}

/// Message id of the latest outbound Call for `action`.
pub fn call_id(transport: &ChannelTransport, action: &str) -> String {
    match transport.last_call(action) {
        Some(OcppFrame::Call { message_id, .. }) => message_id,
        other => panic!("no outbound {action} call, got {other:?}"),
    }
}

/// Answer an outbound Call with a CALLRESULT.
pub fn reply(transport: &ChannelTransport, message_id: &str, payload: Value) {
    transport.inject(
        OcppFrame::CallResult { message_id: message_id.to_string(), payload }.serialize(),
    );
}

/// Answer an outbound Call with a CALLERROR.
pub fn reply_error(transport: &ChannelTransport, message_id: &str, code: &str, description: &str) {
    transport.inject(
        OcppFrame::CallError {
            message_id: message_id.to_string(),
            error_code: code.to_string(),
            error_description: description.to_string(),
            error_details: json!({}),
        }
        .serialize(),
    );
}

/// Send an inbound CALL as the CSMS.
pub fn csms_call(transport: &ChannelTransport, message_id: &str, action: &str, payload: Value) {
    transport.inject(
        OcppFrame::Call {
            message_id: message_id.to_string(),
            action: action.to_string(),
            payload,
        }
        .serialize(),
    );
}

/// The CALLRESULT sent in answer to `message_id`, if any yet.
pub fn result_for(transport: &ChannelTransport, message_id: &str) -> Option<Value> {
    transport.sent_ocpp().into_iter().find_map(|f| match f {
        OcppFrame::CallResult { message_id: id, payload } if id == message_id => Some(payload),
        _ => None,
    })
}

pub fn boot_accepted() -> Value {
    json!({
        "status": "Accepted",
        "currentTime": Utc::now().to_rfc3339(),
        "interval": 300,
    })
}

/// Connect and complete the boot handshake; leaves the captured frames
/// drained so tests start from a quiet wire.
pub async fn connect_and_boot(cp: &Arc<ChargePoint>, transport: &Arc<ChannelTransport>) {
    cp.connect().await.expect("connect");
    wait_until("BootNotification sent", || {
        transport.last_call("BootNotification").is_some()
    })
    .await;
    let id = call_id(transport, "BootNotification");
    reply(transport, &id, boot_accepted());
    wait_until("StatusNotification after boot", || {
        transport.last_call("StatusNotification").is_some()
    })
    .await;
    transport.take_sent();
}

/// StartTransaction response with the given verdict.
pub fn start_tx_response(transaction_id: i32, status: &str) -> Value {
    json!({
        "transactionId": transaction_id,
        "idTagInfo": { "status": status },
    })
}
