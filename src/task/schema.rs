//! Submission wire format and the normalized task

use crate::transport::ExchangeType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Highest accepted task priority
pub const MAX_PRIORITY: u8 = 9;

/// Priority derived for payloads flagged `is_urgent`
pub const URGENT_PRIORITY: u8 = 9;

/// Raw submission as received from a client
///
/// Every field is optional; `priority` stays an untyped JSON value so that a
/// wrong type is reported as a validation error instead of a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Where a task is published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub exchange_type: ExchangeType,
    pub exchange_name: String,
    pub queue_name: String,
    pub routing_key: String,
}

/// A validated, self-contained task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Idempotency anchor for downstream consumers
    pub id: String,
    pub routing: Routing,
    /// 0..=9
    pub priority: u8,
    /// Always carries `sn`
    pub payload: Map<String, Value>,
}

/// Message body published for a task; routing metadata stays out of it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBody {
    pub uuid: String,
    pub priority: u8,
    pub payload: Map<String, Value>,
}

impl Task {
    /// Serial number carried in the payload
    pub fn serial_number(&self) -> Option<&str> {
        self.payload.get("sn").and_then(Value::as_str)
    }

    pub fn body(&self) -> TaskBody {
        TaskBody {
            uuid: self.id.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
        }
    }

    /// JSON bytes of [`Task::body`]
    pub fn to_message_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body())
    }

    /// Fully specified request that normalizes back to this task
    pub fn to_request(&self) -> SubmitTaskRequest {
        SubmitTaskRequest {
            uuid: Some(self.id.clone()),
            exchange_type: Some(self.routing.exchange_type.to_string()),
            exchange_name: Some(self.routing.exchange_name.clone()),
            queue_name: Some(self.routing.queue_name.clone()),
            routing_key: Some(self.routing.routing_key.clone()),
            priority: Some(Value::from(self.priority)),
            payload: Some(Value::Object(self.payload.clone())),
        }
    }
}
