//! OCPP protocol runtime: in-flight request correlation, the message
//! router and the per-action handlers.

pub mod handlers;
pub mod request_history;
pub mod router;

pub use request_history::{InFlightRequest, RequestHistory};
pub use router::route_frame;
