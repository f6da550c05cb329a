use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use folio_common::{Job, JobStatus};
use folio_jobs::JobEvent;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::{handlers::ApiError, state::AppState};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Serialize)]
pub struct BeautifyResponse {
    pub job_id: String,
    pub document_id: String,
    pub status: JobStatus,
}

/// Creates a queued job for the document and hands it to the dispatcher.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<(StatusCode, Json<BeautifyResponse>), ApiError> {
    let job = state.store.create(&document_id).await?;

    if let Err(err) = state.dispatcher.enqueue(&job.id).await {
        warn!(job_id = %job.id, error = %err, "failed to dispatch job");
        let message = err.to_string();
        state
            .store
            .finish(&job.id, JobStatus::Error, &message)
            .await?;
        state.events.publish(&job.id, JobEvent::Error { message });
        return Err(err.into());
    }

    info!(job_id = %job.id, document_id = %job.document_id, "job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(BeautifyResponse {
            job_id: job.id,
            document_id: job.document_id,
            status: job.status,
        }),
    ))
}

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.require(&job_id).await?))
}

/// Server-sent events for a job. Disconnecting does not affect the run.
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    state.store.require(&job_id).await?;

    let frames = state
        .events
        .stream(&job_id, state.stream_timeout)
        .map(Ok::<_, Infallible>);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}
