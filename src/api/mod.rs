//! HTTP edge
//!
//! - `POST /api/v1/submit_task`: normalize, publish, report
//! - `GET /health`, `GET /`: service health

pub mod handlers;

use crate::config::GatewayConfig;
use crate::messaging::{ConnectionSupervisor, Publisher};
use crate::task::{TaskDefaults, TaskNormalizer};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::Filter;

/// Largest accepted submission body
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Request-handling context, cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub normalizer: Arc<TaskNormalizer>,
    pub publisher: Arc<Publisher>,
}

impl AppState {
    pub fn new(config: &GatewayConfig, supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            normalizer: Arc::new(TaskNormalizer::new(TaskDefaults::from(&config.topology))),
            publisher: Arc::new(Publisher::from_config(config)),
        }
    }
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All gateway routes
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let submit = warp::path!("api" / "v1" / "submit_task")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handlers::submit_task);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::health);

    let root = warp::path::end()
        .and(warp::get())
        .and(with_state(state))
        .and_then(handlers::health);

    submit.or(health).or(root)
}

/// Bind the listener and return the server future
///
/// Bind errors (address in use, unavailable host) surface here, before
/// anything is spawned. The returned future serves until `shutdown`
/// resolves, then stops accepting requests.
pub fn bind<F>(
    state: AppState,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), warp::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(address = %bound, "HTTP server listening");
    Ok((bound, server))
}
