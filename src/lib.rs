//! Dispatcher - task submission gateway
//!
//! Accepts task submissions over HTTP and hands them to a RabbitMQ topology
//! that it provisions and supervises.
//!
//! # Overview
//!
//! - Task normalization: stable ids, routing defaults, priority derivation
//!   and serial numbers
//! - Connection supervision with bounded startup retry
//! - Idempotent exchange, queue and binding provisioning
//! - Persistent, mandatory, confirmed publishing with failure classification
//!
//! # Quick Start
//!
//! ```rust
//! use dispatcher::task::{SubmitTaskRequest, TaskDefaults, TaskNormalizer};
//! use dispatcher::transport::ExchangeType;
//! use serde_json::json;
//!
//! let normalizer = TaskNormalizer::new(TaskDefaults {
//!     exchange_type: ExchangeType::Topic,
//!     exchange_name: "dispatcher_exchange".to_string(),
//!     queue_name: "dispatcher_queue".to_string(),
//!     routing_key: "test.key".to_string(),
//! });
//!
//! let request: SubmitTaskRequest =
//!     serde_json::from_value(json!({"payload": {"is_urgent": true}})).unwrap();
//! let task = normalizer.normalize(request).unwrap();
//!
//! assert_eq!(task.priority, 9);
//! assert_eq!(task.routing.queue_name, "dispatcher_queue");
//! assert!(task.serial_number().is_some());
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod task;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, GatewayConfig};
pub use error::{DispatchError, DispatchResult};
pub use messaging::{ConnectionSupervisor, Publisher, TopologyProvisioner};
pub use task::{SubmitTaskRequest, Task, TaskNormalizer};
pub use transport::amqp::AmqpConnector;
