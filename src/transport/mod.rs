//! Broker transport abstraction
//!
//! The gateway talks to the broker only through [`Connector`],
//! [`BrokerConnection`] and [`BrokerChannel`]. The AMQP implementation lives in
//! [`amqp`]; tests inject the in-memory broker from `crate::testing`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub mod amqp;

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Fanout,
    Direct,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Fanout => "fanout",
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fanout" => Ok(ExchangeType::Fanout),
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(format!(
                "unknown exchange type '{other}', expected fanout, direct, topic or headers"
            )),
        }
    }
}

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non-auto-delete exchange
    pub fn durable(name: &str, kind: ExchangeType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Declared as `x-max-priority` when set
    pub max_priority: Option<u8>,
}

impl QueueSpec {
    /// Durable, non-auto-delete queue with optional priority capability
    pub fn durable(name: &str, max_priority: Option<u8>) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            max_priority,
        }
    }
}

/// Exchange to queue binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// A message ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub priority: Option<u8>,
    pub content_type: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub delivery_mode: u8,
}

impl OutboundMessage {
    /// Persistent message carrying `message_id` for downstream deduplication
    pub fn persistent(body: Vec<u8>, message_id: impl Into<String>) -> Self {
        Self {
            body,
            message_id: message_id.into(),
            priority: None,
            content_type: None,
            timestamp: None,
            delivery_mode: PERSISTENT_DELIVERY_MODE,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == PERSISTENT_DELIVERY_MODE
    }
}

/// Broker response to a confirmed publish
#[derive(Debug, Clone, PartialEq)]
pub enum PublishConfirm {
    /// Broker accepted and routed the message
    Acked,
    /// Broker returned a mandatory message because no queue was bound
    Returned { reply_code: u16, reply_text: String },
    /// Broker refused the message
    Nacked,
}

/// Broker-layer errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Access refused: {0}")]
    AccessRefused(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
}

impl BrokerError {
    /// Whether repeating the operation could succeed without a topology change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed(_)
                | BrokerError::ConnectionClosed(_)
                | BrokerError::Io(_)
                | BrokerError::Timeout(_)
                | BrokerError::Protocol(_)
        )
    }
}

/// Opens broker connections
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A process-lifetime broker connection
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a fresh channel in publisher-confirm mode
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// Close the connection; closing a closed connection is a no-op
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// A short-lived channel scoped to one request
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent exchange declaration
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Check that an exchange exists without creating it
    async fn lookup_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Idempotent queue declaration
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Idempotent binding declaration
    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;

    /// Publish with the mandatory flag and wait for the broker confirm
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<PublishConfirm, BrokerError>;

    /// Close the channel; closing a closed channel is a no-op
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}
