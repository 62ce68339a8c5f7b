//! Testing utilities and mock implementations
//!
//! An in-memory broker and scripted connectors so the gateway can be tested
//! without a running RabbitMQ.

pub mod mocks;

pub use mocks::*;
