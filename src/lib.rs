//! # OCPP charge-point simulator
//!
//! Impersonates one or many EV charging stations toward a Central System
//! (CSMS) over an OCPP 1.6J WebSocket link. The crate is the simulator
//! core: wire protocol runtime, charge-point domain model, connector
//! state machine, scenario execution engine and the concurrency glue
//! between them.
//!
//! ## Layout
//!
//! - **support**: cross-cutting utilities (errors, clock, OCPP-J framing,
//!   diagnostics log ring)
//! - **events**: broadcast event bus shared by every component
//! - **transport**: WebSocket client with reconnect, plus an in-process
//!   loopback transport for tests
//! - **ocpp**: request history, message router, per-action handlers
//! - **domain**: charge point, connectors, state machine, meter curves,
//!   reservations
//! - **history**: bounded ring of recorded state transitions
//! - **scenario**: directed-graph scenario interpreter
//! - **ports**: boundary traits (scenario repository, file-upload sink)
//! - **config**: simulator configuration record and stores

pub mod config;
pub mod domain;
pub mod events;
pub mod history;
pub mod ocpp;
pub mod ports;
pub mod scenario;
pub mod support;
pub mod transport;

// Re-export commonly used types at crate root
pub use config::{BasicAuth, BootInfo, ConfigStore, SimulatorConfig};
pub use domain::charge_point::ChargePoint;
pub use domain::fsm::{Availability, ConnectorEvent, ConnectorStatus};
pub use domain::meter::{AutoMeterConfig, MeterStrategy};
pub use events::{EventBus, SimEvent};
pub use support::errors::SimulatorError;
pub use transport::{Transport, TransportEvent};
