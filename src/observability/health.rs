//! Health reporting for the HTTP edge and container orchestration
//!
//! The API is healthy whenever it can answer. The broker is healthy when the
//! shared connection is open and a probe channel can be opened and released.

use crate::messaging::ConnectionSupervisor;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const STATUS_OK: &str = "ok";
pub const STATUS_DEGRADED: &str = "degraded";

/// State of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: bool,
    pub detail: String,
}

impl ServiceHealth {
    pub fn up(detail: &str) -> Self {
        Self {
            status: true,
            detail: detail.to_string(),
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            status: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services {
    pub api: ServiceHealth,
    pub broker: ServiceHealth,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: String,
    pub services: Services,
}

impl HealthReport {
    pub fn from_services(services: Services) -> Self {
        let healthy = services.api.status && services.broker.status;
        Self {
            overall_status: if healthy { STATUS_OK } else { STATUS_DEGRADED }.to_string(),
            services,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.overall_status == STATUS_OK
    }

    /// 200 when everything is up, 503 otherwise
    pub fn status_code(&self) -> u16 {
        if self.is_ok() {
            200
        } else {
            503
        }
    }
}

/// Probe the broker through the supervisor
pub async fn check_broker(supervisor: &ConnectionSupervisor) -> ServiceHealth {
    if !supervisor.is_connected() {
        return ServiceHealth::down("connection closed");
    }

    match supervisor.open_channel().await {
        Ok(lease) => {
            let open = lease.channel().is_open();
            if let Err(e) = lease.release().await {
                debug!(error = %e, "Health probe channel close failed");
            }
            if open {
                ServiceHealth::up("connection open")
            } else {
                ServiceHealth::down("channel closed")
            }
        }
        Err(e) => ServiceHealth::down(format!("channel unavailable: {}", e.client_message())),
    }
}

pub async fn check_health(supervisor: &ConnectionSupervisor) -> HealthReport {
    HealthReport::from_services(Services {
        api: ServiceHealth::up("API available"),
        broker: check_broker(supervisor).await,
    })
}
