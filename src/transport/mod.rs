//! Transport abstraction
//!
//! The charge point talks to the CSMS through the [`Transport`] trait:
//! one active socket at most, frame-oriented text messages, open/close
//! lifecycle surfaced as broadcast events. [`ws::WsTransport`] is the
//! real WebSocket client; [`channel::ChannelTransport`] is an in-process
//! loopback so the core runs in tests (or embedded in a CSMS test rig)
//! without a socket.

pub mod channel;
pub mod ws;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::support::ocpp_frame::OcppFrame;

pub use channel::ChannelTransport;
pub use ws::WsTransport;

/// Lifecycle and traffic notifications from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Socket is open and frames can flow.
    Opened,
    /// Socket closed. `manual` is set when `disconnect()` caused it;
    /// `code` carries the WebSocket close code when one was received.
    Closed { code: Option<u16>, manual: bool },
    /// One inbound text frame.
    Frame(String),
}

/// Socket-level failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("socket is not open")]
    NotOpen,
}

/// A frame-oriented link to the CSMS.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link. Idempotent: connecting an open transport logs a
    /// warning and returns Ok.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the link and suppress any reconnect. Idempotent.
    async fn disconnect(&self);

    fn is_open(&self) -> bool;

    /// Queue one text frame for sending. When the socket is not open the
    /// frame is dropped with a WARN log; sending never errors upward.
    fn send(&self, text: String);

    /// Subscribe to open/close/frame notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    // ── OCPP-J helpers ─────────────────────────────────────

    fn send_call(&self, message_id: &str, action: &str, payload: Value) {
        self.send(
            OcppFrame::Call {
                message_id: message_id.to_string(),
                action: action.to_string(),
                payload,
            }
            .serialize(),
        );
    }

    fn send_call_result(&self, message_id: &str, payload: Value) {
        self.send(
            OcppFrame::CallResult {
                message_id: message_id.to_string(),
                payload,
            }
            .serialize(),
        );
    }

    fn send_call_error(
        &self,
        message_id: &str,
        error_code: &str,
        error_description: &str,
        error_details: Option<Value>,
    ) {
        self.send(
            OcppFrame::CallError {
                message_id: message_id.to_string(),
                error_code: error_code.to_string(),
                error_description: error_description.to_string(),
                error_details: error_details.unwrap_or_else(|| Value::Object(Default::default())),
            }
            .serialize(),
        );
    }
}
