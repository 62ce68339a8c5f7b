//! AMQP 0.9.1 transport backed by `lapin`
//!
//! - [`connection`] - connector and process-lifetime connection
//! - [`channel`] - publisher-confirm channels and declaration calls
//! - [`errors`] - mapping of `lapin` errors onto [`BrokerError`](super::BrokerError)

pub mod channel;
pub mod connection;
pub mod errors;

pub use channel::AmqpChannel;
pub use connection::{AmqpConnection, AmqpConnector};
pub use errors::classify_lapin_error;
