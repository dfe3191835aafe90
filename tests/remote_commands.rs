//! CSMS-initiated commands: remote start/stop, configuration access and
//! the scenario-handler handshake.

mod common;

use common::*;
use cp_sim::domain::fsm::ConnectorStatus;
use cp_sim::events::SimEvent;
use cp_sim::transport::Transport;

#[tokio::test]
async fn remote_start_with_scenario_handler_emits_event_only() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.register_scenario_handler(1);
    let mut events = cp.bus().subscribe();

    csms_call(
        &transport,
        "rs-1",
        "RemoteStartTransaction",
        serde_json::json!({ "connectorId": 1, "idTag": "T" }),
    );

    wait_until("remote start answered", || result_for(&transport, "rs-1").is_some()).await;
    assert_eq!(result_for(&transport, "rs-1").unwrap()["status"], "Accepted");

    // no automatic StartTransaction while the scenario owns the connector
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transport.last_call("StartTransaction").is_none());
    assert!(cp.is_scenario_handled(1));

    let mut saw_event = false;
    while let Some(event) = events.try_recv() {
        if let SimEvent::RemoteStartReceived { connector_id: 1, tag_id } = event {
            assert_eq!(tag_id, "T");
            saw_event = true;
        }
    }
    assert!(saw_event, "remoteStartReceived must reach the bus");
}

#[tokio::test]
async fn remote_start_without_handler_starts_a_transaction() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    csms_call(
        &transport,
        "rs-2",
        "RemoteStartTransaction",
        serde_json::json!({ "connectorId": 1, "idTag": "REMOTE" }),
    );

    wait_until("transaction started", || {
        transport.last_call("StartTransaction").is_some()
    })
    .await;
    assert_eq!(result_for(&transport, "rs-2").unwrap()["status"], "Accepted");
    assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Preparing);
    assert_eq!(
        cp.connector(1).unwrap().transaction().unwrap().tag_id,
        "REMOTE"
    );
}

#[tokio::test]
async fn remote_stop_suspends_then_finishes() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(42, "Accepted"));
    wait_until("charging", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Charging
    })
    .await;
    transport.take_sent();

    csms_call(
        &transport,
        "stop-1",
        "RemoteStopTransaction",
        serde_json::json!({ "transactionId": 42 }),
    );

    wait_until("stopped", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Available
    })
    .await;
    assert_eq!(result_for(&transport, "stop-1").unwrap()["status"], "Accepted");
    assert!(transport.last_call("StopTransaction").is_some());

    // unknown transaction id is rejected
    csms_call(
        &transport,
        "stop-2",
        "RemoteStopTransaction",
        serde_json::json!({ "transactionId": 999 }),
    );
    wait_until("rejected", || result_for(&transport, "stop-2").is_some()).await;
    assert_eq!(result_for(&transport, "stop-2").unwrap()["status"], "Rejected");
}

#[tokio::test]
async fn get_configuration_reports_unknown_keys() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    csms_call(
        &transport,
        "cfg-1",
        "GetConfiguration",
        serde_json::json!({ "key": ["HeartbeatInterval", "Bogus"] }),
    );

    wait_until("answered", || result_for(&transport, "cfg-1").is_some()).await;
    let payload = result_for(&transport, "cfg-1").unwrap();
    assert_eq!(payload["configurationKey"][0]["key"], "HeartbeatInterval");
    assert_eq!(payload["unknownKey"][0], "Bogus");
}

#[tokio::test]
async fn unknown_action_gets_not_implemented() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    csms_call(&transport, "x-1", "SignCertificate", serde_json::json!({}));

    wait_until("call error", || {
        transport.sent_ocpp().iter().any(|f| {
            matches!(f, cp_sim::support::ocpp_frame::OcppFrame::CallError { message_id, .. } if message_id == "x-1")
        })
    })
    .await;

    let error = transport
        .sent_ocpp()
        .into_iter()
        .find_map(|f| match f {
            cp_sim::support::ocpp_frame::OcppFrame::CallError { message_id, error_code, .. }
                if message_id == "x-1" =>
            {
                Some(error_code)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(error, "NotImplemented");
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_reset() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    transport.inject("{\"not\":\"an array\"}");
    transport.inject("[9,\"x\",{}]");
    transport.inject("[2,\"short\"]");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transport.is_open());
    assert!(transport.sent_frames().is_empty());
    assert!(cp.error().is_none());
}
