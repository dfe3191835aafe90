//! Full charging session against a scripted CSMS: boot handshake,
//! transaction start/confirm, metering and stop.

mod common;

use common::*;
use cp_sim::domain::fsm::{ChargePointStatus, ConnectorStatus};
use cp_sim::support::ocpp_frame::OcppFrame;

#[tokio::test]
async fn simple_charging_session() {
    let (cp, transport) = rig(1);

    // connect → BootNotification, then the connector announcement
    cp.connect().await.unwrap();
    wait_until("boot sent", || transport.last_call("BootNotification").is_some()).await;
    let boot_id = call_id(&transport, "BootNotification");
    reply(&transport, &boot_id, boot_accepted());
    wait_until("available announced", || {
        transport.last_call("StatusNotification").is_some()
    })
    .await;

    assert_eq!(
        transport.sent_actions(),
        vec!["BootNotification", "StatusNotification"]
    );
    assert_eq!(cp.status(), ChargePointStatus::Available);
    transport.take_sent();

    // start 1 DEADBEEF → StartTransaction, StatusNotification(Preparing)
    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    assert_eq!(
        transport.sent_actions(),
        vec!["StartTransaction", "StatusNotification"]
    );
    let connector = cp.connector(1).unwrap();
    assert_eq!(connector.status(), ConnectorStatus::Preparing);
    assert_eq!(connector.transaction().unwrap().id, 0);

    // CSMS confirms with transactionId 42 → Charging
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(42, "Accepted"));
    wait_until("charging", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Charging
    })
    .await;
    assert_eq!(cp.connector(1).unwrap().transaction().unwrap().id, 42);
    transport.take_sent();

    // metering during the session
    cp.set_meter_value(1, 1500).unwrap();
    cp.send_meter_value(1).unwrap();
    let meter = transport.last_call("MeterValues").expect("meter values sent");
    if let OcppFrame::Call { payload, .. } = meter {
        assert_eq!(payload["connectorId"], 1);
        assert_eq!(payload["transactionId"], 42);
    }
    transport.take_sent();

    // stop 1 → StopTransaction, Finishing, Available
    cp.stop_transaction(1).unwrap();
    assert_eq!(
        transport.sent_actions(),
        vec!["StopTransaction", "StatusNotification", "StatusNotification"]
    );
    let stop = transport.last_call("StopTransaction").unwrap();
    if let OcppFrame::Call { payload, .. } = stop {
        assert_eq!(payload["transactionId"], 42);
        assert_eq!(payload["meterStop"], 1500);
    }
    let connector = cp.connector(1).unwrap();
    assert_eq!(connector.status(), ConnectorStatus::Available);
    assert!(connector.transaction().is_none());
}

#[tokio::test]
async fn rejected_start_faults_the_connector() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "BADTAG", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(0, "Invalid"));

    wait_until("faulted", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Faulted
    })
    .await;
    assert!(cp.connector(1).unwrap().transaction().is_none());
}

#[tokio::test]
async fn call_error_on_start_returns_connector_to_available() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Preparing);

    let start_id = call_id(&transport, "StartTransaction");
    reply_error(&transport, &start_id, "InternalError", "database down");

    wait_until("back to available", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Available
    })
    .await;
    assert!(cp.connector(1).unwrap().transaction().is_none());
    // the failed request is no longer pending
    assert!(cp.requests().get_action(&start_id).is_none());
}

#[tokio::test]
async fn meter_values_are_monotonic_within_a_session() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(7, "Accepted"));
    wait_until("charging", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Charging
    })
    .await;

    cp.set_meter_value(1, 1000).unwrap();
    // decrease is refused inside a transaction
    assert_eq!(cp.set_meter_value(1, 400).unwrap(), 1000);
    assert_eq!(cp.connector(1).unwrap().meter_value(), 1000);
}
