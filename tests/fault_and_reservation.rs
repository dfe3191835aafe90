//! Fault recovery and the reservation lifecycle.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use cp_sim::domain::fsm::{ConnectorEvent, ConnectorStatus};

#[tokio::test]
async fn faulted_connector_recovers_on_reset() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(5, "Accepted"));
    wait_until("charging", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Charging
    })
    .await;
    transport.take_sent();

    cp.apply_connector_event(1, ConnectorEvent::Error { code: "HighTemperature".into() })
        .unwrap();
    assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Faulted);
    let notification = transport.last_call("StatusNotification").expect("fault announced");
    if let cp_sim::support::ocpp_frame::OcppFrame::Call { payload, .. } = notification {
        assert_eq!(payload["status"], "Faulted");
        assert_eq!(payload["errorCode"], "HighTemperature");
    }

    cp.apply_connector_event(1, ConnectorEvent::Reset).unwrap();
    let connector = cp.connector(1).unwrap();
    assert_eq!(connector.status(), ConnectorStatus::Available);
    assert!(connector.transaction().is_none());
    assert!(!connector.is_authorized());
    assert_eq!(connector.tag_id(), None);
}

#[tokio::test]
async fn reservation_happy_path() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    let expiry = (Utc::now() + ChronoDuration::minutes(10)).to_rfc3339();
    csms_call(
        &transport,
        "rsv-1",
        "ReserveNow",
        serde_json::json!({
            "connectorId": 1,
            "expiryDate": expiry,
            "idTag": "X",
            "reservationId": 7,
        }),
    );

    wait_until("reserved", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Reserved
    })
    .await;
    assert_eq!(result_for(&transport, "rsv-1").unwrap()["status"], "Accepted");
    assert_eq!(cp.reservations().reservation_for_connector(1).unwrap().id, 7);

    csms_call(
        &transport,
        "rsv-2",
        "CancelReservation",
        serde_json::json!({ "reservationId": 7 }),
    );
    wait_until("available again", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Available
    })
    .await;
    assert_eq!(result_for(&transport, "rsv-2").unwrap()["status"], "Accepted");
    assert!(cp.reservations().is_empty());
}

#[tokio::test]
async fn reserved_connector_rejects_second_reservation() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    let expiry = (Utc::now() + ChronoDuration::minutes(10)).to_rfc3339();
    let request = |id: i32| {
        serde_json::json!({
            "connectorId": 1,
            "expiryDate": expiry,
            "idTag": "X",
            "reservationId": id,
        })
    };
    csms_call(&transport, "rsv-1", "ReserveNow", request(1));
    wait_until("reserved", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Reserved
    })
    .await;

    csms_call(&transport, "rsv-2", "ReserveNow", request(2));
    wait_until("second answered", || result_for(&transport, "rsv-2").is_some()).await;
    assert_eq!(result_for(&transport, "rsv-2").unwrap()["status"], "Occupied");
}

#[tokio::test]
async fn expired_reservation_request_is_rejected() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;
    let _ = &cp;

    let expiry = (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339();
    csms_call(
        &transport,
        "rsv-old",
        "ReserveNow",
        serde_json::json!({
            "connectorId": 1,
            "expiryDate": expiry,
            "idTag": "X",
            "reservationId": 3,
        }),
    );
    wait_until("answered", || result_for(&transport, "rsv-old").is_some()).await;
    assert_eq!(result_for(&transport, "rsv-old").unwrap()["status"], "Rejected");
}

#[tokio::test]
async fn transaction_start_consumes_matching_reservation() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    let expiry = (Utc::now() + ChronoDuration::minutes(10)).to_rfc3339();
    csms_call(
        &transport,
        "rsv-1",
        "ReserveNow",
        serde_json::json!({
            "connectorId": 1,
            "expiryDate": expiry,
            "idTag": "DEADBEEF",
            "reservationId": 11,
        }),
    );
    wait_until("reserved", || {
        cp.connector(1).unwrap().status() == ConnectorStatus::Reserved
    })
    .await;
    transport.take_sent();

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start = transport.last_call("StartTransaction").unwrap();
    if let cp_sim::support::ocpp_frame::OcppFrame::Call { payload, .. } = start {
        assert_eq!(payload["reservationId"], 11);
    }
    assert!(cp.reservations().is_empty(), "reservation is consumed by use");
    assert_eq!(cp.connector(1).unwrap().status(), ConnectorStatus::Preparing);
}
