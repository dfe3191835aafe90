//! Event bus
//!
//! Typed pub/sub over a tokio broadcast channel. The bus is the only
//! component that crosses component boundaries: connector transitions,
//! transaction lifecycle, transport state and diagnostics all land here,
//! and the scenario engine's wait primitives are built on top of
//! [`EventBus::wait_for`]. A subscriber sees every event and filters,
//! which is the broadcast rendition of wildcard subscription.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::fsm::{ChargePointStatus, ConnectorStatus};
use crate::support::diag_log::{LogKind, LogLevel};
use crate::support::errors::SimulatorError;

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Everything the simulator announces on the bus.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Transport opened a socket to the CSMS.
    Connected,
    /// Transport lost or closed the socket.
    Disconnected { code: Option<u16>, manual: bool },
    /// BootNotification was answered with Accepted.
    BootAccepted { interval_secs: u64 },
    /// Charge-point level ("connector 0") status change.
    ChargePointStatusChanged {
        old: ChargePointStatus,
        new: ChargePointStatus,
    },
    /// A connector completed an FSM transition.
    StatusChanged {
        connector_id: u32,
        old: ConnectorStatus,
        new: ConnectorStatus,
    },
    /// A connector meter register moved.
    MeterValueChanged { connector_id: u32, value: i64 },
    /// State of charge moved (battery-curve metering).
    SocChanged { connector_id: u32, soc: f64 },
    /// Transaction created locally; `transaction_id` is 0 until the CSMS
    /// assigns one, after which the event fires again with the real id.
    TransactionStarted {
        connector_id: u32,
        transaction_id: i32,
        tag_id: String,
    },
    TransactionStopped {
        connector_id: u32,
        transaction_id: i32,
    },
    /// RemoteStartTransaction arrived while a scenario handler owns the
    /// connector; the scenario decides what happens next.
    RemoteStartReceived { connector_id: u32, tag_id: String },
    AuthorizationResult { tag_id: String, accepted: bool },
    ReservationCreated {
        reservation_id: i32,
        connector_id: u32,
    },
    ReservationCancelled {
        reservation_id: i32,
        connector_id: u32,
    },
    HeartbeatAcknowledged { current_time: DateTime<Utc> },
    /// Mirrored from the diagnostics log ring.
    LogRecorded {
        level: LogLevel,
        kind: LogKind,
        message: String,
    },
}

impl SimEvent {
    /// Stable event-type name, `log.{kind}.{level}` style for log events.
    pub fn event_type(&self) -> String {
        match self {
            Self::Connected => "connected".into(),
            Self::Disconnected { .. } => "disconnected".into(),
            Self::BootAccepted { .. } => "boot_accepted".into(),
            Self::ChargePointStatusChanged { .. } => "charge_point_status_changed".into(),
            Self::StatusChanged { .. } => "status_changed".into(),
            Self::MeterValueChanged { .. } => "meter_value_changed".into(),
            Self::SocChanged { .. } => "soc_changed".into(),
            Self::TransactionStarted { .. } => "transaction_started".into(),
            Self::TransactionStopped { .. } => "transaction_stopped".into(),
            Self::RemoteStartReceived { .. } => "remote_start_received".into(),
            Self::AuthorizationResult { .. } => "authorization_result".into(),
            Self::ReservationCreated { .. } => "reservation_created".into(),
            Self::ReservationCancelled { .. } => "reservation_cancelled".into(),
            Self::HeartbeatAcknowledged { .. } => "heartbeat_acknowledged".into(),
            Self::LogRecorded { level, kind, .. } => {
                format!("log.{}.{}", kind.as_str(), level.as_str().to_lowercase())
            }
        }
    }
}

/// Broadcast event bus. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SimEvent>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an event to all subscribers. Publishing never fails; with
    /// no subscribers the event is simply dropped.
    pub fn publish(&self, event: SimEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event = %event_type, subscribers = count, "event published"),
            Err(_) => debug!(event = %event_type, "event published (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        let receiver = self.sender.subscribe();
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        EventSubscriber {
            receiver,
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }

    /// Await the first event for which `pred` returns `Some`.
    ///
    /// `timeout` of `None` waits forever. The subscription is created as
    /// soon as the returned future is polled and is dropped on every exit
    /// path (resolve, timeout, cancellation), so no listener leaks.
    pub async fn wait_for<T, F>(
        &self,
        timeout: Option<Duration>,
        mut pred: F,
    ) -> Result<T, SimulatorError>
    where
        F: FnMut(&SimEvent) -> Option<T>,
    {
        let mut sub = self.subscribe();
        let wait = async {
            loop {
                match sub.recv().await {
                    Some(event) => {
                        if let Some(out) = pred(&event) {
                            return Ok(out);
                        }
                    }
                    None => {
                        return Err(SimulatorError::Protocol("event bus closed".into()));
                    }
                }
            }
        };

        match timeout {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| SimulatorError::Timeout(t))?,
            None => wait.await,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the bus.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<SimEvent>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventSubscriber {
    /// Next event, skipping over lag gaps. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive. `None` when no event is queued.
    pub fn try_recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(SimEvent::Connected);

        match tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
        {
            Some(SimEvent::Connected) => {}
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(a);
        assert_eq!(bus.subscriber_count(), 1);
        drop(b);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_filters_events() {
        let bus = EventBus::new();
        let bus2 = bus.clone();

        let wait = tokio::spawn(async move {
            bus2.wait_for(Some(Duration::from_secs(1)), |e| match e {
                SimEvent::MeterValueChanged { connector_id: 1, value } if *value >= 500 => {
                    Some(*value)
                }
                _ => None,
            })
            .await
        });

        // Give the waiter a chance to subscribe.
        tokio::task::yield_now().await;
        bus.publish(SimEvent::MeterValueChanged { connector_id: 1, value: 100 });
        bus.publish(SimEvent::MeterValueChanged { connector_id: 2, value: 900 });
        bus.publish(SimEvent::MeterValueChanged { connector_id: 1, value: 700 });

        assert_eq!(wait.await.unwrap().unwrap(), 700);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out() {
        let bus = EventBus::new();
        let result = bus
            .wait_for(Some(Duration::from_secs(5)), |_| None::<()>)
            .await;
        assert!(matches!(result, Err(SimulatorError::Timeout(_))));
    }

    #[test]
    fn log_event_type_is_dotted() {
        let e = SimEvent::LogRecorded {
            level: LogLevel::Error,
            kind: LogKind::Transport,
            message: "x".into(),
        };
        assert_eq!(e.event_type(), "log.transport.error");
    }
}
