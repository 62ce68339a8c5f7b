//! Broker-facing reliability layer
//!
//! - [`supervisor`]: process-lifetime connection with bounded startup retry
//! - [`channel`]: per-request channel scope
//! - [`topology`]: idempotent exchange, queue and binding provisioning
//! - [`publisher`]: confirmed, mandatory, persistent publishing

pub mod channel;
pub mod publisher;
pub mod supervisor;
pub mod topology;

pub use channel::ChannelLease;
pub use publisher::{build_message, task_message, Publisher, JSON_CONTENT_TYPE};
pub use supervisor::{ConnectionSupervisor, RetryPolicy, Sleeper, TokioSleeper};
pub use topology::{ExchangeHandle, TopologyProvisioner, DEFAULT_EXCHANGE};
