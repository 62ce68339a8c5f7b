//! Process-lifetime AMQP connection

use super::channel::AmqpChannel;
use super::errors::classify_lapin_error;
use crate::transport::{BrokerChannel, BrokerConnection, BrokerError, Connector};
use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens `lapin` connections
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: &str) -> Self {
        Self {
            connection_name: connection_name.to_string(),
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new("dispatcher")
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        url::Url::parse(url).map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;

        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(url, properties)
            .await
            .map_err(|e| classify_lapin_error(&e))?;

        info!(connection_name = %self.connection_name, "AMQP connection established");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

/// Shared AMQP connection; hands out channels only
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| classify_lapin_error(&e))?;

        // Every publish on this channel resolves to an ack, nack or return
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify_lapin_error(&e))?;

        debug!(channel_id = channel.id(), "Opened publisher-confirm channel");
        Ok(Box::new(AmqpChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(200, "dispatcher shutdown")
            .await
            .map_err(|e| classify_lapin_error(&e))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}
