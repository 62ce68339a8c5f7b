//! Per-request channel scope

use crate::transport::{BrokerChannel, BrokerError};
use std::sync::Arc;
use tracing::{debug, warn};

/// A broker channel owned by exactly one request
///
/// Call [`ChannelLease::release`] when done. A lease dropped without release
/// (cancelled request, early return) closes its channel on the current tokio
/// runtime in the background.
pub struct ChannelLease {
    channel: Arc<dyn BrokerChannel>,
    released: bool,
}

impl ChannelLease {
    pub fn new(channel: Box<dyn BrokerChannel>) -> Self {
        Self {
            channel: Arc::from(channel),
            released: false,
        }
    }

    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }

    /// Close the channel; a channel the broker already closed is fine
    pub async fn release(mut self) -> Result<(), BrokerError> {
        self.released = true;
        let result = self.channel.close().await;
        if let Err(e) = &result {
            warn!(error = %e, "Failed to close channel");
        }
        result
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Channel lease dropped without release, closing in background");
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        warn!(error = %e, "Background channel close failed");
                    }
                });
            }
            Err(_) => warn!("Channel lease dropped outside a tokio runtime, channel left open"),
        }
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("open", &self.channel.is_open())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::InMemoryBroker;
    use crate::transport::BrokerConnection;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_closes_channel() {
        let broker = InMemoryBroker::new();
        let connection = broker.connection();
        let lease = ChannelLease::new(connection.open_channel().await.unwrap());

        assert_eq!(broker.open_channel_count(), 1);
        lease.release().await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_channel_in_background() {
        let broker = InMemoryBroker::new();
        let connection = broker.connection();
        let lease = ChannelLease::new(connection.open_channel().await.unwrap());
        drop(lease);

        for _ in 0..50 {
            if broker.open_channel_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[test]
    fn test_drop_outside_runtime_does_not_panic() {
        let broker = InMemoryBroker::new();
        let connection = broker.connection();
        let lease = ChannelLease::new(tokio_test::block_on(connection.open_channel()).unwrap());

        drop(lease);
        assert_eq!(broker.open_channel_count(), 1);
    }

    #[tokio::test]
    async fn test_release_after_broker_close_is_noop() {
        let broker = InMemoryBroker::new();
        let connection = broker.connection();
        let lease = ChannelLease::new(connection.open_channel().await.unwrap());

        // Passive lookup of a missing exchange closes the channel broker-side
        assert!(lease.channel().lookup_exchange("missing").await.is_err());
        assert!(!lease.channel().is_open());
        assert!(lease.release().await.is_ok());
    }
}
