//! Message router
//!
//! Takes raw frames off the transport and fans them out: inbound CALLs
//! to the action handlers (answered with CALLRESULT or CALLERROR),
//! CALLRESULTs and CALLERRORs to the result handlers via the request
//! history. Malformed frames are logged and dropped; the connection is
//! never reset over them.

use std::sync::Arc;

use tracing::{debug, warn};

use super::handlers;
use crate::domain::charge_point::ChargePoint;
use crate::support::diag_log::{LogKind, LogLevel};
use crate::support::ocpp_frame::{error_code, OcppFrame};
use crate::transport::Transport;

/// A CALLERROR to be sent instead of a CALLRESULT.
#[derive(Debug, Clone)]
pub struct CallFault {
    pub code: &'static str,
    pub description: String,
}

impl CallFault {
    pub fn not_implemented(action: &str) -> Self {
        Self {
            code: error_code::NOT_IMPLEMENTED,
            description: format!("action not supported: {action}"),
        }
    }

    pub fn formation(description: impl Into<String>) -> Self {
        Self { code: error_code::FORMATION_VIOLATION, description: description.into() }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self { code: error_code::INTERNAL_ERROR, description: description.into() }
    }
}

/// Route one inbound frame.
pub fn route_frame(cp: &Arc<ChargePoint>, text: &str) {
    let frame = match OcppFrame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            cp.diag().record(
                LogLevel::Error,
                LogKind::Ocpp,
                format!("dropping malformed frame: {err}"),
            );
            return;
        }
    };

    match frame {
        OcppFrame::Call { message_id, action, payload } => {
            debug!(action = action.as_str(), message_id = message_id.as_str(), "inbound call");
            match handlers::dispatch_call(cp, &action, &payload) {
                Ok(response) => cp.transport().send_call_result(&message_id, response),
                Err(fault) => {
                    cp.diag().record(
                        LogLevel::Warning,
                        LogKind::Ocpp,
                        format!("{action} answered with {}: {}", fault.code, fault.description),
                    );
                    cp.transport().send_call_error(
                        &message_id,
                        fault.code,
                        &fault.description,
                        None,
                    );
                }
            }
        }
        OcppFrame::CallResult { message_id, payload } => {
            match cp.requests().take(&message_id) {
                Some(request) => handlers::dispatch_result(cp, request, payload),
                None => warn!(message_id = message_id.as_str(), "result for unknown request"),
            }
        }
        OcppFrame::CallError { message_id, error_code, error_description, .. } => {
            match cp.requests().take(&message_id) {
                Some(request) => handlers::dispatch_call_error(
                    cp,
                    request,
                    &error_code,
                    &error_description,
                ),
                None => warn!(message_id = message_id.as_str(), "error for unknown request"),
            }
        }
    }
}
