//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) envelope, identical across OCPP 1.6
//! and later versions:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! A frame that is not a JSON array in one of these shapes is rejected by
//! the parser; the transport logs it and drops it without resetting the
//! connection.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// CALLERROR codes the simulator emits.
pub mod error_code {
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const FORMATION_VIOLATION: &str = "FormationViolation";
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
}

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame.
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, messageId, action, payload]`
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, messageId, payload]`
    CallResult {
        message_id: String,
        payload: Value,
    },
    /// `[4, messageId, errorCode, errorDescription, errorDetails]`
    CallError {
        message_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    /// Build an outbound Call with a fresh UUID message id.
    pub fn new_call(action: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }

    // ── Parsing ────────────────────────────────────────────

    /// Parse raw frame text. Anything but an array in one of the three
    /// OCPP-J shapes is an error.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| OcppFrameError::NotAnArray(e.to_string()))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(OcppFrameError::MissingMessageType)?;

        let message_id = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or(OcppFrameError::FieldType("messageId must be a string"))?
            .to_string();

        match msg_type {
            MSG_TYPE_CALL => {
                if arr.len() != 4 {
                    return Err(OcppFrameError::BadArity { msg_type, len: arr.len() });
                }
                let action = arr[2]
                    .as_str()
                    .ok_or(OcppFrameError::FieldType("action must be a string"))?
                    .to_string();
                Ok(Self::Call {
                    message_id,
                    action,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                if arr.len() != 3 {
                    return Err(OcppFrameError::BadArity { msg_type, len: arr.len() });
                }
                Ok(Self::CallResult {
                    message_id,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                // errorDetails is optional on the wire; everything else is not.
                if arr.len() != 4 && arr.len() != 5 {
                    return Err(OcppFrameError::BadArity { msg_type, len: arr.len() });
                }
                let error_code = arr[2]
                    .as_str()
                    .ok_or(OcppFrameError::FieldType("errorCode must be a string"))?
                    .to_string();
                let error_description = arr[3].as_str().unwrap_or("").to_string();
                let error_details = arr
                    .get(4)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                Ok(Self::CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                })
            }
            other => Err(OcppFrameError::UnknownMessageType(other)),
        }
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to wire text.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(message_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { message_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(message_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(message_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        // serializing a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    // ── Helpers ────────────────────────────────────────────

    /// The message id, whatever the frame kind.
    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Frame parse failures. Never propagated past the router: the frame is
/// logged and dropped.
#[derive(Debug, Error)]
pub enum OcppFrameError {
    #[error("frame is not a JSON array: {0}")]
    NotAnArray(String),
    #[error("frame has no numeric message type")]
    MissingMessageType,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("wrong element count for message type {msg_type}: {len}")]
    BadArity { msg_type: u64, len: usize },
    #[error("field type mismatch: {0}")]
    FieldType(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call() {
        let text = r#"[2,"19223201","BootNotification",{"chargePointVendor":"Acme","chargePointModel":"One"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                message_id,
                action,
                payload,
            } => {
                assert_eq!(message_id, "19223201");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Acme");
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn parses_call_result() {
        let text = r#"[3,"19223201",{"status":"Accepted","interval":300,"currentTime":"2024-01-01T00:00:00Z"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallResult { message_id, payload } => {
                assert_eq!(message_id, "19223201");
                assert_eq!(payload["status"], "Accepted");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    #[test]
    fn parses_call_error_without_details() {
        let text = r#"[4,"x","NotImplemented","no such action"]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallError {
                error_code,
                error_description,
                error_details,
                ..
            } => {
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_description, "no such action");
                assert_eq!(error_details, json!({}));
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_array() {
        assert!(matches!(
            OcppFrame::parse(r#"{"hello":"world"}"#),
            Err(OcppFrameError::NotAnArray(_))
        ));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(
            OcppFrame::parse(r#"[2,"id","Heartbeat"]"#),
            Err(OcppFrameError::BadArity { msg_type: 2, len: 3 })
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[3,"id"]"#),
            Err(OcppFrameError::BadArity { msg_type: 3, len: 2 })
        ));
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(matches!(
            OcppFrame::parse(r#"[7,"id",{}]"#),
            Err(OcppFrameError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn call_roundtrip_keeps_message_id() {
        let frame = OcppFrame::new_call("Heartbeat", json!({}));
        let id = frame.message_id().to_string();
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.message_id(), id);
    }

    #[test]
    fn serializes_call_error_with_five_elements() {
        let frame = OcppFrame::CallError {
            message_id: "m1".into(),
            error_code: error_code::INTERNAL_ERROR.into(),
            error_description: "boom".into(),
            error_details: json!({}),
        };
        let text = frame.serialize();
        let arr: Vec<Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(arr.len(), 5);
        assert_eq!(arr[0], 4);
    }
}
