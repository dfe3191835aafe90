//! Per-action handlers
//!
//! Inbound CALLs are dispatched by action name; each handler
//! deserializes the payload into its `rust_ocpp::v1_6` request type and
//! returns the response payload. Results and errors for our own CALLs
//! are dispatched by the action recovered from the request history, so
//! transaction-related result handlers keep the originating connector.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::request_history::InFlightRequest;
use super::router::CallFault;
use crate::domain::charge_point::ChargePoint;

mod handle_cancel_reservation;
mod handle_change_availability;
mod handle_change_configuration;
mod handle_clear_cache;
mod handle_clear_charging_profile;
mod handle_data_transfer;
mod handle_get_composite_schedule;
mod handle_get_configuration;
mod handle_get_diagnostics;
mod handle_remote_start;
mod handle_remote_stop;
mod handle_reserve_now;
mod handle_reset;
mod handle_set_charging_profile;
mod handle_trigger_message;
mod handle_unlock_connector;
mod results;

pub use handle_cancel_reservation::handle_cancel_reservation;
pub use handle_change_availability::handle_change_availability;
pub use handle_change_configuration::handle_change_configuration;
pub use handle_clear_cache::handle_clear_cache;
pub use handle_clear_charging_profile::handle_clear_charging_profile;
pub use handle_data_transfer::handle_data_transfer;
pub use handle_get_composite_schedule::handle_get_composite_schedule;
pub use handle_get_configuration::handle_get_configuration;
pub use handle_get_diagnostics::handle_get_diagnostics;
pub use handle_remote_start::handle_remote_start;
pub use handle_remote_stop::handle_remote_stop;
pub use handle_reserve_now::handle_reserve_now;
pub use handle_reset::handle_reset;
pub use handle_set_charging_profile::handle_set_charging_profile;
pub use handle_trigger_message::handle_trigger_message;
pub use handle_unlock_connector::handle_unlock_connector;

/// Route an inbound CALL to its handler.
///
/// Unknown actions (including CP-to-CS actions echoed back at us) get a
/// `NotImplemented` CALLERROR.
pub fn dispatch_call(
    cp: &Arc<ChargePoint>,
    action: &str,
    payload: &Value,
) -> Result<Value, CallFault> {
    match action {
        "RemoteStartTransaction" => handle_remote_start(cp, payload),
        "RemoteStopTransaction" => handle_remote_stop(cp, payload),
        "Reset" => handle_reset(cp, payload),
        "GetConfiguration" => handle_get_configuration(cp, payload),
        "ChangeConfiguration" => handle_change_configuration(cp, payload),
        "ChangeAvailability" => handle_change_availability(cp, payload),
        "ClearCache" => handle_clear_cache(cp, payload),
        "DataTransfer" => handle_data_transfer(cp, payload),
        "GetDiagnostics" => handle_get_diagnostics(cp, payload),
        "TriggerMessage" => handle_trigger_message(cp, payload),
        "ReserveNow" => handle_reserve_now(cp, payload),
        "CancelReservation" => handle_cancel_reservation(cp, payload),
        "UnlockConnector" => handle_unlock_connector(cp, payload),
        "SetChargingProfile" => handle_set_charging_profile(cp, payload),
        "ClearChargingProfile" => handle_clear_charging_profile(cp, payload),
        "GetCompositeSchedule" => handle_get_composite_schedule(cp, payload),
        unknown => Err(CallFault::not_implemented(unknown)),
    }
}

/// Route a CALLRESULT to the handler for the originating action.
pub fn dispatch_result(cp: &Arc<ChargePoint>, request: InFlightRequest, payload: Value) {
    match request.action.as_str() {
        "BootNotification" => results::boot_notification(cp, payload),
        "StartTransaction" => results::start_transaction(cp, request, payload),
        "StopTransaction" => results::stop_transaction(cp, request, payload),
        "Authorize" => results::authorize(cp, request, payload),
        "Heartbeat" => results::heartbeat(cp, payload),
        other => debug!(action = other, "result acknowledged"),
    }
}

/// Action-specific recovery for a CALLERROR on one of our requests.
pub fn dispatch_call_error(
    cp: &Arc<ChargePoint>,
    request: InFlightRequest,
    error_code: &str,
    error_description: &str,
) {
    results::call_error(cp, request, error_code, error_description);
}

// ── Payload helpers ────────────────────────────────────────────

pub(crate) fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, CallFault> {
    serde_json::from_value(payload.clone()).map_err(|e| CallFault::formation(e.to_string()))
}

pub(crate) fn to_payload<T: Serialize>(response: &T) -> Result<Value, CallFault> {
    serde_json::to_value(response).map_err(|e| CallFault::internal(e.to_string()))
}
