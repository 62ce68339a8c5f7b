//! Task submission model and normalization
//!
//! - [`schema`] - wire shapes for submissions and the normalized [`Task`]
//! - [`normalizer`] - defaulting, priority resolution and serial numbers

pub mod normalizer;
pub mod schema;

pub use normalizer::{serial_number_at, TaskDefaults, TaskNormalizer, SERIAL_NUMBER_PREFIX};
pub use schema::{Routing, SubmitTaskRequest, Task, TaskBody, MAX_PRIORITY, URGENT_PRIORITY};
