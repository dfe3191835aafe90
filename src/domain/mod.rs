//! Charge-point domain model: state machine, connectors, aggregate root,
//! meter curves and reservations.

pub mod charge_point;
pub mod connector;
pub mod fsm;
pub mod meter;
pub mod reservation;

pub use charge_point::ChargePoint;
pub use connector::{Connector, Transaction};
pub use fsm::{Availability, ChargePointStatus, ConnectorEvent, ConnectorStatus, InvalidTransition};
pub use meter::{AutoMeterConfig, MeterStrategy};
pub use reservation::{Reservation, ReservationManager};
