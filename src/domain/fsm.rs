//! Connector state machine
//!
//! The nine OCPP 1.6 connector statuses and the guarded transition table
//! between them. Every caller-initiated change (REPL command, scenario
//! node, remote command, CALLRESULT handler) funnels through
//! [`next_status`], so each is validated identically, recorded once and
//! published once. The pure function here decides the target state;
//! [`crate::domain::connector::Connector::apply`] owns the side effects.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Statuses ───────────────────────────────────────────────────

/// OCPP 1.6 connector status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEV => "SuspendedEV",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Available" => Self::Available,
            "Preparing" => Self::Preparing,
            "Charging" => Self::Charging,
            "SuspendedEV" => Self::SuspendedEV,
            "SuspendedEVSE" => Self::SuspendedEVSE,
            "Finishing" => Self::Finishing,
            "Reserved" => Self::Reserved,
            "Unavailable" => Self::Unavailable,
            "Faulted" => Self::Faulted,
            _ => return None,
        })
    }

    /// The wire representation used in StatusNotification.
    pub fn to_ocpp(&self) -> rust_ocpp::v1_6::types::ChargePointStatus {
        use rust_ocpp::v1_6::types::ChargePointStatus as Ocpp;
        match self {
            Self::Available => Ocpp::Available,
            Self::Preparing => Ocpp::Preparing,
            Self::Charging => Ocpp::Charging,
            Self::SuspendedEV => Ocpp::SuspendedEV,
            Self::SuspendedEVSE => Ocpp::SuspendedEVSE,
            Self::Finishing => Ocpp::Finishing,
            Self::Reserved => Ocpp::Reserved,
            Self::Unavailable => Ocpp::Unavailable,
            Self::Faulted => Ocpp::Faulted,
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Charge-point ("connector 0") status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Available,
    Unavailable,
    Faulted,
}

impl ChargePointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative availability flag, distinct from the OCPP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Operative,
    Inoperative,
}

// ── Events ─────────────────────────────────────────────────────

/// Events a connector can be driven with.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Plugin,
    Authorize { tag_id: String },
    StartTransaction { transaction_id: i32 },
    StopTransaction { reason: Option<String> },
    Plugout,
    Error { code: String },
    Reserve { reservation_id: i32 },
    CancelReservation,
    Reset,
    SuspendEv,
    SuspendEvse { reason: Option<String> },
    Resume,
    SetUnavailable,
    SetAvailable,
}

impl ConnectorEvent {
    /// Stable event name used in state-history records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plugin => "Plugin",
            Self::Authorize { .. } => "Authorize",
            Self::StartTransaction { .. } => "StartTransaction",
            Self::StopTransaction { .. } => "StopTransaction",
            Self::Plugout => "Plugout",
            Self::Error { .. } => "Error",
            Self::Reserve { .. } => "Reserve",
            Self::CancelReservation => "CancelReservation",
            Self::Reset => "Reset",
            Self::SuspendEv => "SuspendEV",
            Self::SuspendEvse { .. } => "SuspendEVSE",
            Self::Resume => "Resume",
            Self::SetUnavailable => "SetUnavailable",
            Self::SetAvailable => "SetAvailable",
        }
    }
}

/// Guard inputs for the transition function.
#[derive(Debug, Clone, Copy)]
pub struct FsmContext {
    pub availability: Availability,
    pub authorized: bool,
}

/// A refused event. The state is left untouched.
#[derive(Debug, Clone, Error)]
#[error("invalid transition: {event} not allowed in {from}{}", .reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
pub struct InvalidTransition {
    pub from: ConnectorStatus,
    pub event: &'static str,
    pub reason: Option<String>,
}

impl InvalidTransition {
    fn new(from: ConnectorStatus, event: &ConnectorEvent) -> Self {
        Self { from, event: event.name(), reason: None }
    }

    fn guard(from: ConnectorStatus, event: &ConnectorEvent, reason: impl Into<String>) -> Self {
        Self { from, event: event.name(), reason: Some(reason.into()) }
    }
}

// ── Transition table ───────────────────────────────────────────

/// Compute the target status for `event` in `from`, or refuse.
///
/// Pure: no side effects, no mutation. `Error` is accepted from any
/// state and always targets `Faulted`.
pub fn next_status(
    from: ConnectorStatus,
    ctx: &FsmContext,
    event: &ConnectorEvent,
) -> Result<ConnectorStatus, InvalidTransition> {
    use ConnectorEvent as E;
    use ConnectorStatus as S;

    // Error is accepted everywhere.
    if let E::Error { .. } = event {
        return Ok(S::Faulted);
    }

    match (from, event) {
        (S::Available, E::Plugin) => {
            if ctx.availability == Availability::Operative {
                Ok(S::Preparing)
            } else {
                Err(InvalidTransition::guard(from, event, "connector is Inoperative"))
            }
        }
        (S::Available, E::Reserve { .. }) => Ok(S::Reserved),
        (S::Available, E::SetUnavailable) => Ok(S::Unavailable),

        (S::Preparing, E::Authorize { .. }) => Ok(S::Preparing),
        (S::Preparing, E::StartTransaction { .. }) => {
            if ctx.authorized {
                Ok(S::Charging)
            } else {
                Err(InvalidTransition::guard(from, event, "not authorized"))
            }
        }
        (S::Preparing, E::Plugout) => Ok(S::Available),

        (S::Charging, E::SuspendEv) => Ok(S::SuspendedEV),
        (S::Charging, E::SuspendEvse { .. }) => Ok(S::SuspendedEVSE),
        (S::Charging, E::StopTransaction { .. }) => Ok(S::Finishing),

        (S::SuspendedEV, E::Resume) => Ok(S::Charging),
        (S::SuspendedEV, E::SuspendEvse { .. }) => Ok(S::SuspendedEVSE),
        (S::SuspendedEV, E::StopTransaction { .. }) => Ok(S::Finishing),

        (S::SuspendedEVSE, E::Resume) => Ok(S::Charging),
        (S::SuspendedEVSE, E::SuspendEv) => Ok(S::SuspendedEV),
        (S::SuspendedEVSE, E::StopTransaction { .. }) => Ok(S::Finishing),

        (S::Finishing, E::Plugout) => Ok(S::Available),

        (S::Reserved, E::Plugin) => {
            if ctx.availability == Availability::Operative {
                Ok(S::Preparing)
            } else {
                Err(InvalidTransition::guard(from, event, "connector is Inoperative"))
            }
        }
        (S::Reserved, E::CancelReservation) => Ok(S::Available),

        (S::Unavailable, E::SetAvailable) => Ok(S::Available),

        (S::Faulted, E::Reset) => Ok(S::Available),

        _ => Err(InvalidTransition::new(from, event)),
    }
}
