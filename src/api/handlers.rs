use super::AppState;
use crate::error::DispatchError;
use crate::messaging::task_message;
use crate::observability::check_health;
use crate::submission_span;
use crate::task::SubmitTaskRequest;
use serde::Serialize;
use std::convert::Infallible;
use tracing::{error, info, warn, Instrument};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{json, with_status, Json, WithStatus};

pub const STATUS_SUBMITTED: &str = "submitted";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_reply(status: StatusCode, error: &DispatchError) -> WithStatus<Json> {
    with_status(
        json(&ErrorResponse {
            error: error.client_message(),
        }),
        status,
    )
}

fn failed_reply(status: StatusCode, task_id: &str, error: &DispatchError) -> WithStatus<Json> {
    with_status(
        json(&SubmitResponse {
            task_id: task_id.to_string(),
            status: STATUS_FAILED,
            error: Some(error.client_message()),
        }),
        status,
    )
}

/// `POST /api/v1/submit_task`
pub async fn submit_task(body: Bytes, state: AppState) -> Result<WithStatus<Json>, Infallible> {
    let raw: SubmitTaskRequest = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            let error = DispatchError::validation(format!("malformed JSON body: {e}"));
            warn!(error = %error, "Rejected submission");
            return Ok(error_reply(StatusCode::BAD_REQUEST, &error));
        }
    };

    let task = match state.normalizer.normalize(raw) {
        Ok(task) => task,
        Err(error) => {
            warn!(error = %error, "Rejected submission");
            return Ok(error_reply(StatusCode::BAD_REQUEST, &error));
        }
    };

    let span = submission_span!(
        task_id = %task.id,
        exchange = %task.routing.exchange_name,
        queue = %task.routing.queue_name,
        routing_key = %task.routing.routing_key,
        priority = task.priority
    );

    async move {
        let message = match task_message(&task) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Failed to build message");
                return Ok(failed_reply(StatusCode::INTERNAL_SERVER_ERROR, &task.id, &e));
            }
        };

        let lease = match state.supervisor.open_channel().await {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, error_kind = e.kind(), "No broker channel available");
                return Ok(failed_reply(StatusCode::SERVICE_UNAVAILABLE, &task.id, &e));
            }
        };

        let outcome = state
            .publisher
            .publish_scoped(&state.supervisor, lease, &task.routing, &message)
            .await;

        match outcome {
            Ok(()) => {
                info!("Task submitted");
                Ok(with_status(
                    json(&SubmitResponse {
                        task_id: task.id.clone(),
                        status: STATUS_SUBMITTED,
                        error: None,
                    }),
                    StatusCode::OK,
                ))
            }
            Err(e) => {
                error!(error = %e, error_kind = e.kind(), "Task submission failed");
                Ok(failed_reply(StatusCode::BAD_GATEWAY, &task.id, &e))
            }
        }
    }
    .instrument(span)
    .await
}

/// `GET /health` and `GET /`
pub async fn health(state: AppState) -> Result<WithStatus<Json>, Infallible> {
    let report = check_health(&state.supervisor).await;
    let status =
        StatusCode::from_u16(report.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    Ok(with_status(json(&report), status))
}
