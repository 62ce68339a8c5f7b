//! Topology provisioning
//!
//! With auto-declaration on, every publish declares its exchange, queue and
//! binding. The broker treats identical re-declarations as no-ops, so this is
//! safe to run for every request from every worker. Conflicting parameters
//! come back as `PRECONDITION_FAILED` and surface as
//! [`DispatchError::TopologyConflict`].
//!
//! With auto-declaration off the exchange is only looked up, and nothing is
//! ever created.

use crate::config::TopologySection;
use crate::error::{DispatchError, DispatchResult};
use crate::task::Routing;
use crate::transport::{
    BindingSpec, BrokerChannel, BrokerError, ExchangeSpec, ExchangeType, QueueSpec,
};
use tracing::{debug, info, warn};

/// Name of the broker's built-in default exchange
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchange resolved for a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    pub name: String,
    /// Known only when this call declared the exchange
    pub kind: Option<ExchangeType>,
    pub declared: bool,
}

impl ExchangeHandle {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }
}

/// Ensures exchange, queue and binding exist before a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyProvisioner {
    auto_declare: bool,
    max_priority: Option<u8>,
}

impl TopologyProvisioner {
    pub fn new(auto_declare: bool, max_priority: Option<u8>) -> Self {
        Self {
            auto_declare,
            max_priority,
        }
    }

    pub fn from_config(topology: &TopologySection) -> Self {
        Self::new(topology.auto_declare, topology.queue_max_priority)
    }

    pub fn auto_declare(&self) -> bool {
        self.auto_declare
    }

    pub fn max_priority(&self) -> Option<u8> {
        self.max_priority
    }

    pub async fn ensure_topology(
        &self,
        channel: &dyn BrokerChannel,
        routing: &Routing,
    ) -> DispatchResult<ExchangeHandle> {
        if self.auto_declare {
            self.declare_all(channel, routing).await
        } else {
            self.resolve_existing(channel, &routing.exchange_name).await
        }
    }

    async fn resolve_existing(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &str,
    ) -> DispatchResult<ExchangeHandle> {
        if exchange != DEFAULT_EXCHANGE {
            match channel.lookup_exchange(exchange).await {
                Ok(()) => {}
                Err(BrokerError::NotFound(_)) => {
                    warn!(
                        exchange = %exchange,
                        "Exchange not found and auto-declaration is disabled"
                    );
                    return Err(DispatchError::topology_not_found(exchange));
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(exchange = %exchange, "Using existing exchange");
        Ok(ExchangeHandle {
            name: exchange.to_string(),
            kind: None,
            declared: false,
        })
    }

    async fn declare_all(
        &self,
        channel: &dyn BrokerChannel,
        routing: &Routing,
    ) -> DispatchResult<ExchangeHandle> {
        let exchange = &routing.exchange_name;
        let is_default = exchange == DEFAULT_EXCHANGE;

        if !is_default {
            let spec = ExchangeSpec::durable(exchange, routing.exchange_type);
            channel
                .declare_exchange(&spec)
                .await
                .map_err(|e| declaration_error(format!("exchange '{exchange}'"), e))?;
        }

        let queue = QueueSpec::durable(&routing.queue_name, self.max_priority);
        channel
            .declare_queue(&queue)
            .await
            .map_err(|e| declaration_error(format!("queue '{}'", routing.queue_name), e))?;

        // The default exchange routes by queue name and refuses explicit bindings
        if !is_default {
            let binding = BindingSpec {
                exchange: exchange.clone(),
                queue: routing.queue_name.clone(),
                routing_key: routing.routing_key.clone(),
            };
            channel.bind_queue(&binding).await.map_err(|e| {
                declaration_error(
                    format!(
                        "binding '{}' -> '{}' ({})",
                        exchange, routing.queue_name, routing.routing_key
                    ),
                    e,
                )
            })?;
        }

        info!(
            exchange = %exchange,
            exchange_type = %routing.exchange_type,
            queue = %routing.queue_name,
            routing_key = %routing.routing_key,
            max_priority = ?self.max_priority,
            "Topology ensured"
        );

        Ok(ExchangeHandle {
            name: exchange.clone(),
            kind: (!is_default).then_some(routing.exchange_type),
            declared: !is_default,
        })
    }
}

fn declaration_error(entity: String, error: BrokerError) -> DispatchError {
    match error {
        BrokerError::PreconditionFailed(message) | BrokerError::NotFound(message) => {
            warn!(entity = %entity, reason = %message, "Topology declaration rejected");
            DispatchError::topology_conflict(entity, message)
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::InMemoryBroker;
    use crate::transport::BrokerConnection;

    fn routing(exchange: &str, queue: &str, key: &str) -> Routing {
        Routing {
            exchange_type: ExchangeType::Topic,
            exchange_name: exchange.to_string(),
            queue_name: queue.to_string(),
            routing_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_declares_exchange_queue_and_binding() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let provisioner = TopologyProvisioner::new(true, Some(10));

        let handle = provisioner
            .ensure_topology(channel.as_ref(), &routing("jobs", "jobs_queue", "jobs.#"))
            .await
            .unwrap();

        assert_eq!(handle.name, "jobs");
        assert_eq!(handle.kind, Some(ExchangeType::Topic));
        assert!(handle.declared);

        let exchange = broker.exchange("jobs").unwrap();
        assert!(exchange.durable);
        assert_eq!(exchange.kind, ExchangeType::Topic);
        assert_eq!(broker.queue("jobs_queue").unwrap().max_priority, Some(10));
        assert_eq!(broker.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_redeclaration_is_idempotent() {
        let broker = InMemoryBroker::new();
        let provisioner = TopologyProvisioner::new(true, Some(10));
        let route = routing("jobs", "jobs_queue", "jobs.created");

        for _ in 0..2 {
            let channel = broker.connection().open_channel().await.unwrap();
            provisioner
                .ensure_topology(channel.as_ref(), &route)
                .await
                .unwrap();
        }

        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.queue_count(), 1);
        assert_eq!(broker.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_exchange_type_is_surfaced() {
        let broker = InMemoryBroker::new();
        broker.seed_exchange(ExchangeSpec::durable("jobs", ExchangeType::Direct));
        let channel = broker.connection().open_channel().await.unwrap();

        let result = TopologyProvisioner::new(true, None)
            .ensure_topology(channel.as_ref(), &routing("jobs", "jobs_queue", "k"))
            .await;

        assert!(matches!(result, Err(DispatchError::TopologyConflict { .. })));
        assert_eq!(broker.exchange("jobs").unwrap().kind, ExchangeType::Direct);
        assert!(broker.queue("jobs_queue").is_none());
    }

    #[tokio::test]
    async fn test_conflicting_queue_priority_is_surfaced() {
        let broker = InMemoryBroker::new();
        broker.seed_queue(QueueSpec::durable("jobs_queue", None));
        let channel = broker.connection().open_channel().await.unwrap();

        let result = TopologyProvisioner::new(true, Some(10))
            .ensure_topology(channel.as_ref(), &routing("jobs", "jobs_queue", "k"))
            .await;

        match result {
            Err(DispatchError::TopologyConflict { entity, .. }) => {
                assert_eq!(entity, "queue 'jobs_queue'")
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_locked_mode_missing_exchange_creates_nothing() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();

        let result = TopologyProvisioner::new(false, Some(10))
            .ensure_topology(channel.as_ref(), &routing("orders", "orders_queue", "k"))
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::TopologyNotFound { ref exchange }) if exchange == "orders"
        ));
        assert_eq!(broker.exchange_count(), 0);
        assert_eq!(broker.queue_count(), 0);
        assert!(broker.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_locked_mode_uses_existing_exchange() {
        let broker = InMemoryBroker::new();
        broker.seed_exchange(ExchangeSpec::durable("orders", ExchangeType::Direct));
        let channel = broker.connection().open_channel().await.unwrap();

        let handle = TopologyProvisioner::new(false, Some(10))
            .ensure_topology(channel.as_ref(), &routing("orders", "orders_queue", "k"))
            .await
            .unwrap();

        assert_eq!(handle.name, "orders");
        assert!(!handle.declared);
        assert!(broker.queue("orders_queue").is_none());
    }

    #[tokio::test]
    async fn test_default_exchange_declares_queue_only() {
        let broker = InMemoryBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();

        let handle = TopologyProvisioner::new(true, Some(10))
            .ensure_topology(channel.as_ref(), &routing("", "direct_queue", "direct_queue"))
            .await
            .unwrap();

        assert!(handle.is_default());
        assert_eq!(broker.exchange_count(), 0);
        assert!(broker.queue("direct_queue").is_some());
        assert!(broker.bindings().is_empty());

        let locked = TopologyProvisioner::new(false, None)
            .ensure_topology(channel.as_ref(), &routing("", "q", "q"))
            .await;
        assert!(locked.is_ok());
    }
}
