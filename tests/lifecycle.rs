//! Connection lifecycle, cleanup guarantees and close-code handling.

mod common;

use std::time::Duration;

use common::*;
use cp_sim::domain::meter::{AutoMeterConfig, MeterStrategy};
use cp_sim::history::HistoryQuery;
use cp_sim::transport::Transport;

#[tokio::test]
async fn disconnect_releases_every_resource() {
    let (cp, transport) = rig(2);
    connect_and_boot(&cp, &transport).await;

    cp.reservations().start_sweeper();
    cp.start_auto_meter(
        1,
        AutoMeterConfig {
            strategy: MeterStrategy::Increment {
                interval_seconds: 1,
                increment_value: 10,
                max_time_seconds: None,
                max_value: None,
            },
            send_meter_values: false,
        },
    )
    .unwrap();
    cp.send_heartbeat();
    assert!(cp.heartbeat_running(), "boot response armed the heartbeat");
    assert!(!cp.requests().is_empty());

    cp.disconnect().await;

    assert!(!cp.heartbeat_running());
    assert!(!cp.connector(1).unwrap().auto_meter_running());
    assert!(!cp.reservations().sweeper_running());
    assert!(cp.requests().is_empty());
    assert!(!cp.transport().is_open());
}

#[tokio::test]
async fn abnormal_close_sets_error_and_clears_requests() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.send_heartbeat();
    assert_eq!(cp.requests().len(), 1);

    transport.close_with_code(1006);
    wait_until("error recorded", || cp.error().is_some()).await;
    assert!(cp.error().unwrap().contains("1006"));
    assert!(cp.requests().is_empty());
}

#[tokio::test]
async fn close_code_1005_does_not_set_error() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    transport.close_with_code(1005);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cp.error().is_none());
}

#[tokio::test]
async fn connect_twice_logs_and_stays_connected() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.connect().await.unwrap();
    assert!(transport.is_open());
    // still exactly one live rx pipeline: a heartbeat yields one frame
    transport.take_sent();
    cp.send_heartbeat();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent_frames().len(), 1);
}

#[tokio::test]
async fn state_history_records_the_session_walk() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(3, "Accepted"));
    wait_until("charging recorded", || {
        cp.state_history()
            .query(&HistoryQuery {
                transition_type: Some("StartTransaction".into()),
                ..Default::default()
            })
            .len()
            == 1
    })
    .await;
    cp.stop_transaction(1).unwrap();

    let walk: Vec<(String, String)> = cp
        .state_history()
        .query(&HistoryQuery { entity_id: Some(1), ..Default::default() })
        .into_iter()
        .map(|e| (e.from_state, e.to_state))
        .collect();

    assert_eq!(
        walk,
        vec![
            ("Available".to_string(), "Preparing".to_string()),
            ("Preparing".to_string(), "Preparing".to_string()), // authorize
            ("Preparing".to_string(), "Charging".to_string()),
            ("Charging".to_string(), "Finishing".to_string()),
            ("Finishing".to_string(), "Available".to_string()),
        ]
    );

    let stats = cp.state_history().stats();
    assert_eq!(stats.errors, 0);
    let json: Vec<serde_json::Value> =
        serde_json::from_str(&cp.state_history().export_json()).unwrap();
    let csv_rows = cp.state_history().export_csv().lines().count() - 1;
    assert_eq!(json.len(), csv_rows);
}

#[tokio::test(start_paused = true)]
async fn auto_meter_increment_stops_at_limit() {
    let (cp, transport) = rig(1);
    connect_and_boot(&cp, &transport).await;

    cp.start_transaction(1, "DEADBEEF", None, None).unwrap();
    let start_id = call_id(&transport, "StartTransaction");
    reply(&transport, &start_id, start_tx_response(21, "Accepted"));
    wait_until("charging", || {
        cp.connector(1).unwrap().status() == cp_sim::ConnectorStatus::Charging
    })
    .await;

    cp.start_auto_meter(
        1,
        AutoMeterConfig {
            strategy: MeterStrategy::Increment {
                interval_seconds: 1,
                increment_value: 100,
                max_time_seconds: None,
                max_value: Some(250),
            },
            send_meter_values: false,
        },
    )
    .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    // 100, 200, 300 >= 250 → stop; transaction closed, connector reset
    let connector = cp.connector(1).unwrap();
    assert_eq!(connector.meter_value(), 300);
    assert!(!connector.auto_meter_running() || connector.transaction().is_none());
    wait_until("transaction stopped", || {
        transport.last_call("StopTransaction").is_some()
    })
    .await;
    assert_eq!(connector.status(), cp_sim::ConnectorStatus::Available);
}
