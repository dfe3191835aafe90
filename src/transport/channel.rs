//! In-process loopback transport
//!
//! Stands in for the WebSocket link in tests: outbound frames are
//! captured for inspection, inbound frames and close events are injected
//! by the test acting as the CSMS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::{Transport, TransportError, TransportEvent};
use crate::support::ocpp_frame::OcppFrame;

const EVENT_CAPACITY: usize = 256;

/// Loopback transport; the "peer" is the test itself.
pub struct ChannelTransport {
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    // ── Peer-side controls ─────────────────────────────────

    /// Deliver one inbound frame, as if the CSMS had sent it.
    pub fn inject(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Frame(text.into()));
    }

    /// Simulate a remote close with the given code (1006 = abnormal).
    pub fn close_with_code(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed { code: Some(code), manual: false });
    }

    /// Every frame sent so far, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Drain the captured frames.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// Parsed view of the captured frames.
    pub fn sent_ocpp(&self) -> Vec<OcppFrame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| OcppFrame::parse(t).ok())
            .collect()
    }

    /// Outbound Call actions, in send order.
    pub fn sent_actions(&self) -> Vec<String> {
        self.sent_ocpp()
            .into_iter()
            .filter_map(|f| match f {
                OcppFrame::Call { action, .. } => Some(action),
                _ => None,
            })
            .collect()
    }

    /// The last outbound Call for `action`, if any.
    pub fn last_call(&self, action: &str) -> Option<OcppFrame> {
        self.sent_ocpp()
            .into_iter()
            .filter(|f| matches!(f, OcppFrame::Call { action: a, .. } if a == action))
            .last()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.open.swap(true, Ordering::SeqCst) {
            warn!("connect() on an already-open channel transport");
            return Ok(());
        }
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed { code: None, manual: true });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) {
        if !self.is_open() {
            warn!("send while socket is not open; frame dropped");
            return;
        }
        self.sent.lock().unwrap().push(text);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn captures_sent_frames_only_while_open() {
        let t = ChannelTransport::new();
        t.send("dropped".into());
        t.connect().await.unwrap();
        t.send_call("m1", "Heartbeat", json!({}));
        assert_eq!(t.sent_actions(), vec!["Heartbeat"]);
    }

    #[tokio::test]
    async fn emits_lifecycle_events() {
        let t = ChannelTransport::new();
        let mut rx = t.subscribe();

        t.connect().await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Opened));

        t.close_with_code(1006);
        match rx.try_recv().unwrap() {
            TransportEvent::Closed { code: Some(1006), manual: false } => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn connect_twice_is_idempotent() {
        let t = ChannelTransport::new();
        t.connect().await.unwrap();
        t.connect().await.unwrap();
        let mut rx = t.subscribe();
        assert!(rx.try_recv().is_err()); // no duplicate Opened for the second call
    }
}
