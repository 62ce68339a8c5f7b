//! Confirmed, mandatory publishing
//!
//! A publish first ensures topology, then sends a persistent message with the
//! mandatory flag and waits for the broker confirm. Outcomes:
//!
//! | broker answer                 | result                      | retried |
//! |-------------------------------|-----------------------------|---------|
//! | ack                           | `Ok(())`                    | -       |
//! | return (no queue bound)       | `UnroutableMessage`         | no      |
//! | nack, channel or I/O failure  | `TransientPublish`          | yes     |
//! | topology failure              | topology error              | no      |
//!
//! A channel-level fault closes the channel, and every later publish on it
//! fails without reaching the broker. [`Publisher::try_publish`] stops at that
//! point; [`Publisher::publish_scoped`] replaces the channel with a fresh one
//! from the supervisor and spends the rest of the attempt budget there.

use super::channel::ChannelLease;
use super::supervisor::ConnectionSupervisor;
use super::topology::{ExchangeHandle, TopologyProvisioner};
use crate::broker_span;
use crate::config::GatewayConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::task::{Routing, Task};
use crate::transport::{BrokerChannel, OutboundMessage, PublishConfirm};
use chrono::Utc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Content type of serialized task bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages on a caller-provided channel
#[derive(Debug, Clone)]
pub struct Publisher {
    provisioner: TopologyProvisioner,
    max_retries: u32,
}

/// Outcome of a run of attempts on one channel
enum AttemptRun {
    Finished(DispatchResult<()>),
    /// The channel closed under a failed attempt while budget remained
    ChannelLost {
        attempts_used: u32,
        last_failure: String,
    },
}

impl Publisher {
    pub fn new(provisioner: TopologyProvisioner, max_retries: u32) -> Self {
        Self {
            provisioner,
            max_retries,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            TopologyProvisioner::from_config(&config.topology),
            config.broker.publish_max_retries,
        )
    }

    /// Publish attempts per call, at least one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn provisioner(&self) -> &TopologyProvisioner {
        &self.provisioner
    }

    /// Publish and report only whether the broker acknowledged the message
    pub async fn publish(
        &self,
        channel: &dyn BrokerChannel,
        routing: &Routing,
        message: &OutboundMessage,
    ) -> bool {
        self.try_publish(channel, routing, message).await.is_ok()
    }

    /// Publish on one channel and classify the failure
    ///
    /// Retries stop early when the channel closes under a failed attempt.
    pub async fn try_publish(
        &self,
        channel: &dyn BrokerChannel,
        routing: &Routing,
        message: &OutboundMessage,
    ) -> DispatchResult<()> {
        let exchange = self.ensure_topology(channel, routing).await?;

        match self.run_attempts(channel, &exchange, routing, message, 1).await {
            AttemptRun::Finished(result) => result,
            AttemptRun::ChannelLost {
                attempts_used,
                last_failure,
            } => Err(DispatchError::TransientPublish {
                attempts: attempts_used,
                message: last_failure,
            }),
        }
    }

    /// Publish through a request-scoped lease, replacing the channel when a
    /// fault closes it
    ///
    /// Every lease taken here, including the one passed in, is released
    /// before returning. The attempt budget is shared across channels.
    pub async fn publish_scoped(
        &self,
        supervisor: &ConnectionSupervisor,
        lease: ChannelLease,
        routing: &Routing,
        message: &OutboundMessage,
    ) -> DispatchResult<()> {
        let exchange = match self.ensure_topology(lease.channel(), routing).await {
            Ok(exchange) => exchange,
            Err(e) => {
                let _ = lease.release().await;
                return Err(e);
            }
        };

        let mut lease = lease;
        let mut next_attempt = 1;
        loop {
            let run = self
                .run_attempts(lease.channel(), &exchange, routing, message, next_attempt)
                .await;
            // A close failure does not change the publish outcome
            let _ = lease.release().await;

            let (attempts_used, last_failure) = match run {
                AttemptRun::Finished(result) => return result,
                AttemptRun::ChannelLost {
                    attempts_used,
                    last_failure,
                } => (attempts_used, last_failure),
            };

            lease = match supervisor.open_channel().await {
                Ok(fresh) => fresh,
                Err(e) => {
                    error!(
                        exchange = %exchange.name,
                        message_id = %message.message_id,
                        attempts = attempts_used,
                        error = %e,
                        "No replacement channel, giving up on publish"
                    );
                    return Err(DispatchError::TransientPublish {
                        attempts: attempts_used,
                        message: format!("{last_failure}; no replacement channel: {e}"),
                    });
                }
            };
            debug!(
                message_id = %message.message_id,
                next_attempt = attempts_used + 1,
                "Retrying publish on a fresh channel"
            );
            next_attempt = attempts_used + 1;
        }
    }

    async fn ensure_topology(
        &self,
        channel: &dyn BrokerChannel,
        routing: &Routing,
    ) -> DispatchResult<ExchangeHandle> {
        self.provisioner
            .ensure_topology(channel, routing)
            .instrument(broker_span!(
                operation = "ensure_topology",
                exchange = %routing.exchange_name,
                queue = %routing.queue_name
            ))
            .await
            .map_err(|e| {
                error!(
                    exchange = %routing.exchange_name,
                    queue = %routing.queue_name,
                    routing_key = %routing.routing_key,
                    error_kind = e.kind(),
                    error = %e,
                    "Topology unavailable, message not published"
                );
                e
            })
    }

    async fn run_attempts(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &ExchangeHandle,
        routing: &Routing,
        message: &OutboundMessage,
        first_attempt: u32,
    ) -> AttemptRun {
        let max_attempts = self.max_attempts();
        let span = broker_span!(
            operation = "publish",
            exchange = %exchange.name,
            routing_key = %routing.routing_key,
            message_id = %message.message_id
        );

        async move {
            let mut last_failure = String::new();

            for attempt in first_attempt..=max_attempts {
                debug!(body_len = message.body.len(), attempt, "Publishing message");

                match channel
                    .publish(&exchange.name, &routing.routing_key, message)
                    .await
                {
                    Ok(PublishConfirm::Acked) => {
                        info!(attempt, "Message published");
                        return AttemptRun::Finished(Ok(()));
                    }
                    Ok(PublishConfirm::Returned {
                        reply_code,
                        reply_text,
                    }) => {
                        error!(
                            reply_code,
                            reply_text = %reply_text,
                            "Message unroutable, not retrying"
                        );
                        return AttemptRun::Finished(Err(DispatchError::UnroutableMessage {
                            exchange: exchange.name.clone(),
                            routing_key: routing.routing_key.clone(),
                            reason: format!("{reply_code} {reply_text}"),
                        }));
                    }
                    Ok(PublishConfirm::Nacked) => {
                        warn!(attempt, max_attempts, "Broker rejected message");
                        last_failure = "broker negatively acknowledged the message".to_string();
                    }
                    Err(e) => {
                        warn!(
                            attempt,
                            max_attempts,
                            transient = e.is_transient(),
                            error = %e,
                            "Publish attempt failed"
                        );
                        last_failure = e.to_string();
                    }
                }

                if attempt < max_attempts && !channel.is_open() {
                    warn!(attempt, max_attempts, "Channel closed after failed publish");
                    return AttemptRun::ChannelLost {
                        attempts_used: attempt,
                        last_failure,
                    };
                }
            }

            error!(attempts = max_attempts, "Publish failed, retry budget exhausted");
            AttemptRun::Finished(Err(DispatchError::TransientPublish {
                attempts: max_attempts,
                message: last_failure,
            }))
        }
        .instrument(span)
        .await
    }
}

/// Persistent message; a fresh UUID is generated per call when no id is given
pub fn build_message(body: Vec<u8>, message_id: Option<&str>) -> OutboundMessage {
    let message_id = match message_id {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    OutboundMessage::persistent(body, message_id)
}

/// JSON message for a normalized task, keyed by the task id
pub fn task_message(task: &Task) -> DispatchResult<OutboundMessage> {
    let body = task
        .to_message_body()
        .map_err(|e| DispatchError::internal(format!("failed to serialize task: {e}")))?;

    Ok(build_message(body, Some(&task.id))
        .with_priority(task.priority)
        .with_content_type(JSON_CONTENT_TYPE)
        .with_timestamp(Utc::now().timestamp().max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{InMemoryBroker, PublishFault};
    use crate::transport::{BrokerConnection, BrokerError, ExchangeSpec, ExchangeType};
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn routing(exchange: &str, queue: &str, key: &str) -> Routing {
        Routing {
            exchange_type: ExchangeType::Direct,
            exchange_name: exchange.to_string(),
            queue_name: queue.to_string(),
            routing_key: key.to_string(),
        }
    }

    fn publisher(auto_declare: bool, max_retries: u32) -> Publisher {
        Publisher::new(TopologyProvisioner::new(auto_declare, Some(10)), max_retries)
    }

    #[tokio::test]
    async fn test_publish_acked() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), Some("m-1"));

        let ok = publisher(true, 3)
            .publish(channel.as_ref(), &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(ok);
        let delivered = broker.messages("jobs_q");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_id, "m-1");
        assert!(delivered[0].is_persistent());
    }

    #[tokio::test]
    async fn test_unroutable_is_not_retried() {
        let broker = InMemoryBroker::new();
        broker.seed_exchange(ExchangeSpec::durable("orders", ExchangeType::Direct));
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let result = publisher(false, 3)
            .try_publish(channel.as_ref(), &routing("orders", "none", "nowhere"), &message)
            .await;

        assert!(matches!(result, Err(DispatchError::UnroutableMessage { .. })));
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let broker = InMemoryBroker::new();
        broker.inject_publish_faults(vec![
            PublishFault::Error(BrokerError::Timeout(Duration::from_secs(1))),
            PublishFault::Nack,
        ]);
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let ok = publisher(true, 3)
            .publish(channel.as_ref(), &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(ok);
        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.messages("jobs_q").len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let broker = InMemoryBroker::new();
        broker.inject_publish_faults(vec![PublishFault::Nack; 5]);
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let result = publisher(true, 3)
            .try_publish(channel.as_ref(), &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::TransientPublish { attempts: 3, .. })
        ));
        assert_eq!(broker.publish_attempts(), 3);
        assert!(broker.messages("jobs_q").is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_retries() {
        let broker = InMemoryBroker::new();
        broker.inject_publish_faults(vec![PublishFault::Error(BrokerError::Io(
            "connection reset".to_string(),
        ))]);
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let result = publisher(true, 3)
            .try_publish(channel.as_ref(), &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        match result {
            Err(DispatchError::TransientPublish { attempts, message }) => {
                assert_eq!(attempts, 1);
                assert!(message.contains("connection reset"));
            }
            other => panic!("expected transient publish failure, got {other:?}"),
        }
        assert!(!channel.is_open());
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_scoped_publish_replaces_closed_channel() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::from_connection(broker.connection());
        broker.inject_publish_faults(vec![
            PublishFault::Error(BrokerError::Io("connection reset".to_string())),
            PublishFault::Error(BrokerError::ChannelClosed("channel error".to_string())),
        ]);
        let message = build_message(b"{}".to_vec(), None);
        let lease = supervisor.open_channel().await.unwrap();

        let result = publisher(true, 3)
            .publish_scoped(&supervisor, lease, &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(result.is_ok());
        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.channels_opened(), 3);
        assert_eq!(broker.open_channel_count(), 0);
        assert_eq!(broker.messages("jobs_q").len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_publish_budget_spans_channels() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::from_connection(broker.connection());
        broker.inject_publish_faults(vec![
            PublishFault::Error(BrokerError::Io("connection reset".to_string()));
            4
        ]);
        let message = build_message(b"{}".to_vec(), None);
        let lease = supervisor.open_channel().await.unwrap();

        let result = publisher(true, 3)
            .publish_scoped(&supervisor, lease, &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::TransientPublish { attempts: 3, .. })
        ));
        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.channels_opened(), 3);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_scoped_publish_without_replacement_channel() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::from_connection(broker.connection());
        broker.inject_publish_faults(vec![PublishFault::Error(BrokerError::Io(
            "connection reset".to_string(),
        ))]);
        let message = build_message(b"{}".to_vec(), None);
        let lease = supervisor.open_channel().await.unwrap();
        broker.fail_channel_open(true);

        let result = publisher(true, 3)
            .publish_scoped(&supervisor, lease, &routing("jobs", "jobs_q", "jobs"), &message)
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::TransientPublish { attempts: 1, .. })
        ));
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_scoped_publish_releases_lease_on_topology_failure() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::from_connection(broker.connection());
        let message = build_message(b"{}".to_vec(), None);
        let lease = supervisor.open_channel().await.unwrap();

        let result = publisher(false, 3)
            .publish_scoped(&supervisor, lease, &routing("orders", "q", "k"), &message)
            .await;

        assert!(matches!(result, Err(DispatchError::TopologyNotFound { .. })));
        assert_eq!(broker.publish_attempts(), 0);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_retries_still_attempts_once() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let publisher = publisher(true, 0);
        assert_eq!(publisher.max_attempts(), 1);
        assert!(
            publisher
                .publish(channel.as_ref(), &routing("jobs", "jobs_q", "jobs"), &message)
                .await
        );
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_topology_failure_skips_publish() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let message = build_message(b"{}".to_vec(), None);

        let result = publisher(false, 3)
            .try_publish(channel.as_ref(), &routing("orders", "q", "k"), &message)
            .await;

        assert!(matches!(result, Err(DispatchError::TopologyNotFound { .. })));
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[test]
    fn test_fresh_message_id_per_call() {
        let first = build_message(Vec::new(), None);
        let second = build_message(Vec::new(), None);
        assert_ne!(first.message_id, second.message_id);
        assert!(Uuid::parse_str(&first.message_id).is_ok());
    }

    #[test]
    fn test_task_message_properties() {
        let mut payload = Map::new();
        payload.insert("sn".to_string(), json!("SN1"));
        let task = Task {
            id: "task-7".to_string(),
            routing: routing("jobs", "jobs_q", "jobs"),
            priority: 9,
            payload,
        };

        let message = task_message(&task).unwrap();
        assert_eq!(message.message_id, "task-7");
        assert_eq!(message.priority, Some(9));
        assert_eq!(message.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert!(message.timestamp.is_some());
        assert!(message.is_persistent());

        let body: Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body["uuid"], "task-7");
        assert_eq!(body["payload"]["sn"], "SN1");
    }
}
