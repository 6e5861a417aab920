//! Control API (C8): a thin axum adapter translating HTTP requests into
//! `ConsumerEngine` calls. Owns no state beyond the engine handle and
//! performs no business logic of its own.

pub mod model;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::engine::{ConsumerEngine, StartConsumingRequest};
use crate::error::EngineError;
use crate::health;
use crate::webhook::WebhookSender;
use model::{
    BackupConfigsBody, BackupConfigsResponse, CleanupOrphansResponse, ConsumeBody, ErrorBody, OkBody,
    PersistedQueuesResponse, QueueNameBody, QueuesInfoBody, QueuesInfoResponse, RestoreBackupBody,
    RestoreBackupResponse, RestoreQueuesResponse, TestWebhookBody, TestWebhookResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConsumerEngine>,
    pub webhook: Arc<WebhookSender>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_combined))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/consume", post(consume))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/active-queues", get(active_queues))
        .route("/queue-info/:queue", get(queue_info))
        .route("/queues-info", post(queues_info))
        .route("/stats", get(stats))
        .route("/stats/reset", post(stats_reset))
        .route("/webhook/test", post(webhook_test))
        .route("/persisted-queues", get(persisted_queues))
        .route("/restore-queues", post(restore_queues))
        .route("/backup-configs", post(backup_configs))
        .route("/restore-backup", post(restore_backup))
        .route("/clear-configs", delete(clear_configs))
        .route("/cleanup-orphans", post(cleanup_orphans))
        .route("/persisted-queue/:queue", delete(delete_persisted_queue))
        .with_state(state)
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

async fn consume(State(state): State<AppState>, Json(body): Json<ConsumeBody>) -> Result<Response, EngineError> {
    let request = StartConsumingRequest {
        queue: body.queue,
        webhook_url: body.webhook,
        min_interval_ms: body.min_interval.unwrap_or(1000),
        max_interval_ms: body.max_interval.unwrap_or(2000),
        business_hours: body.business_hours.unwrap_or_default(),
    };
    state.engine.start_consuming(request).await?;
    Ok((StatusCode::CREATED, Json(OkBody::default())).into_response())
}

async fn pause(State(state): State<AppState>, Json(body): Json<QueueNameBody>) -> Result<Json<OkBody>, EngineError> {
    state.engine.pause_consuming(&body.queue).await?;
    Ok(Json(OkBody::default()))
}

async fn resume(State(state): State<AppState>, Json(body): Json<QueueNameBody>) -> Result<Json<OkBody>, EngineError> {
    state.engine.resume_consuming(&body.queue).await?;
    Ok(Json(OkBody::default()))
}

async fn stop(State(state): State<AppState>, Json(body): Json<QueueNameBody>) -> Result<Json<OkBody>, EngineError> {
    state.engine.stop_consuming(&body.queue).await?;
    Ok(Json(OkBody::default()))
}

async fn active_queues(State(state): State<AppState>) -> Json<Vec<crate::engine::QueueInfo>> {
    Json(state.engine.active_queues().await)
}

async fn queue_info(State(state): State<AppState>, Path(queue): Path<String>) -> Result<Json<crate::engine::QueueInfo>, EngineError> {
    Ok(Json(state.engine.queue_info(&queue).await?))
}

async fn queues_info(State(state): State<AppState>, Json(body): Json<QueuesInfoBody>) -> Json<QueuesInfoResponse> {
    let mut infos = Vec::with_capacity(body.queues.len());
    for queue in body.queues {
        if let Ok(info) = state.engine.queue_info(&queue).await {
            infos.push(info);
        }
    }
    Json(QueuesInfoResponse { queues: infos })
}

async fn stats(State(state): State<AppState>) -> Json<crate::engine::EngineStats> {
    Json(state.engine.stats())
}

async fn stats_reset(State(state): State<AppState>) -> Json<OkBody> {
    state.engine.reset_stats();
    Json(OkBody::default())
}

async fn webhook_test(State(state): State<AppState>, Json(body): Json<TestWebhookBody>) -> Response {
    let timeout = body.timeout.map(Duration::from_millis);
    let result = state.webhook.test_webhook(&body.url, timeout).await;
    let status = if result.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (
        status,
        Json(TestWebhookResponse {
            success: result.success,
            status: result.status,
            elapsed_ms: result.elapsed.as_millis(),
        }),
    )
        .into_response()
}

async fn persisted_queues(State(state): State<AppState>) -> Result<Json<PersistedQueuesResponse>, EngineError> {
    Ok(Json(state.engine.persisted_queues().await?.into()))
}

async fn restore_queues(State(state): State<AppState>) -> Result<Json<RestoreQueuesResponse>, EngineError> {
    let report = state.engine.restore_persisted().await?;
    Ok(Json(report.into()))
}

async fn backup_configs(State(state): State<AppState>, Json(body): Json<BackupConfigsBody>) -> Result<Json<BackupConfigsResponse>, EngineError> {
    let path = state.engine.backup_configs(body.path).await?;
    Ok(Json(BackupConfigsResponse {
        path: path.display().to_string(),
    }))
}

async fn restore_backup(State(state): State<AppState>, Json(body): Json<RestoreBackupBody>) -> Result<Json<RestoreBackupResponse>, EngineError> {
    let queues = state.engine.restore_backup(body.backup_path).await?;
    Ok(Json(RestoreBackupResponse { queues }))
}

async fn clear_configs(State(state): State<AppState>) -> Result<Json<OkBody>, EngineError> {
    state.engine.clear_configs().await?;
    Ok(Json(OkBody::default()))
}

async fn cleanup_orphans(State(state): State<AppState>) -> Result<Json<CleanupOrphansResponse>, EngineError> {
    let removed = state.engine.cleanup_orphans().await?;
    Ok(Json(CleanupOrphansResponse { removed }))
}

async fn delete_persisted_queue(State(state): State<AppState>, Path(queue): Path<String>) -> Result<Json<OkBody>, EngineError> {
    state.engine.remove_persisted(&queue).await?;
    Ok(Json(OkBody::default()))
}

async fn health_combined(State(state): State<AppState>) -> Response {
    let status = health::readiness(&state.engine).await;
    let code = if status.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(status)).into_response()
}

async fn health_live() -> Json<health::HealthStatus> {
    Json(health::liveness())
}

async fn health_ready(State(state): State<AppState>) -> Response {
    let status = health::readiness(&state.engine).await;
    let code = if status.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(status)).into_response()
}
