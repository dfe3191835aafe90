//! Simulator error taxonomy
//!
//! I/O and protocol errors are recovered locally and reported via events;
//! application errors are returned to their immediate caller;
//! configuration errors are fatal at startup.

use std::time::Duration;

use thiserror::Error;

use crate::domain::fsm::InvalidTransition;
use crate::transport::TransportError;

/// Errors surfaced by the simulator core.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Socket-level failure (handshake, closed unexpectedly).
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Malformed frame or unknown action on the wire.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The connector state machine refused an event.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Failure inside an inbound-call handler.
    #[error("handler failure: {0}")]
    Handler(String),

    /// Unhandled error inside a scenario node.
    #[error("scenario failure: {0}")]
    Scenario(String),

    /// A wait primitive expired.
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    /// Missing or invalid required configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connector not found: {0}")]
    ConnectorNotFound(u32),

    #[error("no active transaction on connector {0}")]
    NoActiveTransaction(u32),

    #[error("transaction already active on connector {0}")]
    TransactionAlreadyActive(u32),

    #[error("heartbeat period must be positive, got {0}")]
    InvalidHeartbeatPeriod(i64),
}

/// Result alias used across the crate.
pub type SimResult<T> = Result<T, SimulatorError>;
