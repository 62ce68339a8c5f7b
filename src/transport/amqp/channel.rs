//! Publisher-confirm channel

use super::errors::classify_lapin_error;
use crate::transport::{
    BindingSpec, BrokerChannel, BrokerError, ExchangeSpec, ExchangeType, OutboundMessage,
    PublishConfirm, QueueSpec,
};
use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tracing::debug;

/// `lapin` channel in confirm mode
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

/// `lapin` exchange kind for an exchange type
pub fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

/// Queue arguments for a declaration
pub fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(max_priority) = spec.max_priority {
        arguments.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(i32::from(max_priority)),
        );
    }
    arguments
}

/// AMQP basic properties for a message
pub fn message_properties(message: &OutboundMessage) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(message.delivery_mode)
        .with_message_id(message.message_id.clone().into());

    if let Some(priority) = message.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    properties
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_lapin_error(&e))
    }

    async fn lookup_exchange(&self, name: &str) -> Result<(), BrokerError> {
        // Passive declare: the broker answers NOT_FOUND instead of creating
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_lapin_error(&e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| classify_lapin_error(&e))
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_lapin_error(&e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<PublishConfirm, BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &message.body,
                message_properties(message),
            )
            .await
            .map_err(|e| classify_lapin_error(&e))?;

        let confirmation = confirm.await.map_err(|e| classify_lapin_error(&e))?;
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            message_id = %message.message_id,
            "Publish confirmation received"
        );

        // An unroutable mandatory message is returned first, then acked
        Ok(match confirmation {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishConfirm::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                }
            }
            Confirmation::Ack(None) => PublishConfirm::Acked,
            Confirmation::Nack(None) => PublishConfirm::Nacked,
            Confirmation::NotRequested => PublishConfirm::Nacked,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        match self.channel.close(200, "OK").await {
            Ok(()) => Ok(()),
            Err(e) => match classify_lapin_error(&e) {
                // Raced with a broker-side close
                BrokerError::ChannelClosed(_) | BrokerError::ConnectionClosed(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
