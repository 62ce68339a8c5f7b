//! Task normalization
//!
//! Turns a [`SubmitTaskRequest`] into a self-contained [`Task`]:
//!
//! - missing `uuid` gets a fresh v4 UUID
//! - missing routing fields take the configured defaults
//! - an explicit `priority` wins after range validation; otherwise
//!   `payload.is_urgent == true` means priority 9 and anything else 0
//! - missing `payload.sn` gets a sortable, time-derived serial number
//!
//! Normalizing the [`Task::to_request`] of a normalized task yields the same
//! task.

use super::schema::{Routing, SubmitTaskRequest, Task, MAX_PRIORITY, URGENT_PRIORITY};
use crate::config::TopologySection;
use crate::error::{DispatchError, DispatchResult};
use crate::transport::ExchangeType;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Literal prefix of generated serial numbers
pub const SERIAL_NUMBER_PREFIX: &str = "SN";

/// Routing defaults applied to omitted fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefaults {
    pub exchange_type: ExchangeType,
    pub exchange_name: String,
    pub queue_name: String,
    pub routing_key: String,
}

impl From<&TopologySection> for TaskDefaults {
    fn from(topology: &TopologySection) -> Self {
        Self {
            exchange_type: topology.default_exchange_type,
            exchange_name: topology.default_exchange_name.clone(),
            queue_name: topology.default_queue_name.clone(),
            routing_key: topology.default_routing_key.clone(),
        }
    }
}

/// Validates and canonicalizes submissions
#[derive(Debug, Clone)]
pub struct TaskNormalizer {
    defaults: TaskDefaults,
}

impl TaskNormalizer {
    pub fn new(defaults: TaskDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }

    /// Normalize using the current time for serial numbers
    pub fn normalize(&self, raw: SubmitTaskRequest) -> DispatchResult<Task> {
        self.normalize_at(raw, Utc::now())
    }

    /// Normalize with an explicit clock reading
    pub fn normalize_at(&self, raw: SubmitTaskRequest, now: DateTime<Utc>) -> DispatchResult<Task> {
        let mut payload = match raw.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(DispatchError::validation(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let priority = resolve_priority(raw.priority.as_ref(), &payload)?;
        let routing = self.resolve_routing(
            raw.exchange_type,
            raw.exchange_name,
            raw.queue_name,
            raw.routing_key,
        )?;

        let id = match raw.uuid {
            Some(id) if !id.trim().is_empty() => id,
            Some(_) => return Err(DispatchError::validation("uuid must not be empty")),
            None => Uuid::new_v4().to_string(),
        };

        if matches!(payload.get("sn"), None | Some(Value::Null)) {
            let suffix = rand::thread_rng().gen_range(0..1000);
            payload.insert("sn".to_string(), Value::String(serial_number_at(now, suffix)));
        }

        Ok(Task {
            id,
            routing,
            priority,
            payload,
        })
    }

    fn resolve_routing(
        &self,
        exchange_type: Option<String>,
        exchange_name: Option<String>,
        queue_name: Option<String>,
        routing_key: Option<String>,
    ) -> DispatchResult<Routing> {
        let exchange_type = match exchange_type {
            Some(raw) => raw.parse::<ExchangeType>().map_err(DispatchError::validation)?,
            None => self.defaults.exchange_type,
        };

        let queue_name = queue_name.unwrap_or_else(|| self.defaults.queue_name.clone());
        if queue_name.trim().is_empty() {
            return Err(DispatchError::validation("queue_name must not be empty"));
        }

        Ok(Routing {
            exchange_type,
            exchange_name: exchange_name.unwrap_or_else(|| self.defaults.exchange_name.clone()),
            queue_name,
            routing_key: routing_key.unwrap_or_else(|| self.defaults.routing_key.clone()),
        })
    }
}

/// Explicit priority wins; otherwise derive from `payload.is_urgent`
fn resolve_priority(explicit: Option<&Value>, payload: &Map<String, Value>) -> DispatchResult<u8> {
    match explicit {
        None | Some(Value::Null) => Ok(match payload.get("is_urgent") {
            Some(Value::Bool(true)) => URGENT_PRIORITY,
            _ => 0,
        }),
        Some(Value::Number(number)) => {
            let value = number.as_i64().ok_or_else(|| {
                DispatchError::validation(format!("priority must be an integer, got {number}"))
            })?;
            if !(0..=i64::from(MAX_PRIORITY)).contains(&value) {
                return Err(DispatchError::validation(format!(
                    "priority must be between 0 and {MAX_PRIORITY}, got {value}"
                )));
            }
            Ok(value as u8)
        }
        Some(other) => Err(DispatchError::validation(format!(
            "priority must be an integer, got {}",
            json_type_name(other)
        ))),
    }
}

/// `SN` + yyMMddHHmmss + 3-digit millisecond + 3-digit suffix
pub fn serial_number_at(now: DateTime<Utc>, suffix: u16) -> String {
    format!(
        "{SERIAL_NUMBER_PREFIX}{}{:03}{:03}",
        now.format("%y%m%d%H%M%S"),
        now.timestamp_subsec_millis().min(999),
        suffix % 1000
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
