//! HTTP ingestion collector
//!
//! Accepts feed payloads over HTTP, wraps each one as a Report and sends it
//! to the configured destination queues for the parser bots.
//!
//! - `POST /ingest/report?feed_name=...` - body becomes the Report's `raw`
//! - `POST /ingest/batch?feed_name=...` - one Report per non-empty line
//! - `GET /health`, `GET /ready`

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::harmonization::HarmonizationRegistry;
use crate::message::{Message, MessageError};
use crate::pipeline::{Pipeline, PipelineError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    pub destination_queues: Vec<String>,
    /// Used when a request names no feed.
    #[serde(default)]
    pub feed_name: Option<String>,
    #[serde(default)]
    pub feed_provider: Option<String>,
}

pub struct IngestState {
    pipeline: Mutex<Box<dyn Pipeline>>,
    registry: Arc<HarmonizationRegistry>,
    config: IngestConfig,
}

impl IngestState {
    pub fn new(
        pipeline: Box<dyn Pipeline>,
        registry: Arc<HarmonizationRegistry>,
        config: IngestConfig,
    ) -> Self {
        Self {
            pipeline: Mutex::new(pipeline),
            registry,
            config,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    pub feed_name: Option<String>,
}

/// Response returned to client after ingestion
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestionResponse {
    pub report_id: String,
    pub status: IngestionStatus,
    pub timestamp: DateTime<Utc>,
    pub destinations: Vec<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Accepted, // Queued for the parsers
    Failed,   // Validation or transport error
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub status: String,
    pub processed: usize,
    pub accepted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub fn router(state: Arc<IngestState>) -> Router {
    Router::new()
        .route("/ingest/report", post(ingest_report))
        .route("/ingest/batch", post(ingest_batch))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build a Report around `body`.
pub fn build_report(
    registry: Arc<HarmonizationRegistry>,
    config: &IngestConfig,
    feed_name: Option<&str>,
    body: &str,
) -> Result<Message, MessageError> {
    let mut report = Message::new_report(registry);
    report.add("time.observation", Utc::now().to_rfc3339(), true)?;
    if let Some(feed) = feed_name.or(config.feed_name.as_deref()) {
        report.add("feed.name", feed, true)?;
    }
    if let Some(provider) = &config.feed_provider {
        report.add("feed.provider", provider.as_str(), true)?;
    }
    report.add("raw", body, true)?;
    Ok(report)
}

async fn publish(
    state: &IngestState,
    feed_name: Option<&str>,
    body: &str,
) -> Result<Uuid, AppError> {
    let report = build_report(state.registry.clone(), &state.config, feed_name, body)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    let payload = report
        .serialize()
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    let mut pipeline = state.pipeline.lock().await;
    pipeline
        .send(&state.config.destination_queues, &payload)
        .await
        .map_err(AppError::from)?;

    let report_id = Uuid::new_v4();
    tracing::info!(%report_id, feed = ?feed_name, bytes = body.len(), "Report queued for parsing");
    Ok(report_id)
}

/// Ingest a single report
pub async fn ingest_report(
    State(state): State<Arc<IngestState>>,
    Query(params): Query<IngestParams>,
    body: String,
) -> Result<(StatusCode, Json<IngestionResponse>), AppError> {
    if body.trim().is_empty() {
        return Err(AppError::ValidationError("Empty report body".to_string()));
    }
    let report_id = publish(&state, params.feed_name.as_deref(), &body).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestionResponse {
            report_id: report_id.to_string(),
            status: IngestionStatus::Accepted,
            timestamp: Utc::now(),
            destinations: state.config.destination_queues.clone(),
        }),
    ))
}

/// Ingest one report per line
pub async fn ingest_batch(
    State(state): State<Arc<IngestState>>,
    Query(params): Query<IngestParams>,
    body: String,
) -> Result<(StatusCode, Json<BatchResponse>), AppError> {
    let start = std::time::Instant::now();

    let mut processed = 0;
    let mut accepted = 0;
    let mut errors = Vec::new();

    for (line_num, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        processed += 1;
        match publish(&state, params.feed_name.as_deref(), line).await {
            Ok(_) => accepted += 1,
            Err(e) => errors.push(format!("Line {}: {}", line_num + 1, e)),
        }
    }

    let failed = errors.len();
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchResponse {
            status: if failed == 0 { "success" } else { "partial" }.to_string(),
            processed,
            accepted,
            failed,
            errors,
            duration_ms: start.elapsed().as_millis() as u64,
        }),
    ))
}

/// Health check endpoint (liveness)
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "intelflow-ingest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check endpoint - verifies the pipeline answers
pub async fn readiness_check(
    State(state): State<Arc<IngestState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(queue) = state.config.destination_queues.first() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let mut pipeline = state.pipeline.lock().await;
    match pipeline.queue_len(queue).await {
        Ok(depth) => Ok(Json(serde_json::json!({
            "status": "ready",
            "service": "intelflow-ingest",
            "queue": queue,
            "depth": depth,
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "Pipeline not ready");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

// Error handling

#[derive(Debug)]
pub enum AppError {
    ValidationError(String),
    Unavailable(String),
    InternalError(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::ValidationError(msg) => write!(f, "Invalid report: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Pipeline unavailable: {}", msg),
            AppError::InternalError(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        if err.is_transient() {
            AppError::Unavailable(err.to_string())
        } else {
            AppError::InternalError(err.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(serde_json::json!({
            "error": self.to_string()
        }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FullQueuePolicy, MemoryBroker, PipelineConfig};

    fn state(broker: &MemoryBroker, pipeline: PipelineConfig) -> Arc<IngestState> {
        Arc::new(IngestState::new(
            Box::new(broker.connect("intelflow-ingest", pipeline)),
            Arc::new(HarmonizationRegistry::bundled().unwrap()),
            IngestConfig {
                destination_queues: vec!["turris-parser-queue".to_string()],
                feed_name: Some("Default Feed".to_string()),
                feed_provider: None,
            },
        ))
    }

    fn registry() -> Arc<HarmonizationRegistry> {
        Arc::new(HarmonizationRegistry::bundled().unwrap())
    }

    #[tokio::test]
    async fn test_report_is_queued_with_raw_and_feed() {
        let broker = MemoryBroker::new();
        let state = state(&broker, PipelineConfig::default());

        let (status, Json(response)) = ingest_report(
            State(state),
            Query(IngestParams {
                feed_name: Some("Turris Greylist".to_string()),
            }),
            "93.184.216.34,,scanning,,".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response.status, IngestionStatus::Accepted);

        let queued = broker.peek_all("turris-parser-queue").await;
        let report = Message::deserialize(&queued[0], registry()).unwrap();
        assert_eq!(report.value("feed.name").unwrap().as_str(), Some("Turris Greylist"));
        assert!(report.contains("time.observation"));
        assert_eq!(report.raw_text().unwrap().as_deref(), Some("93.184.216.34,,scanning,,"));
    }

    #[tokio::test]
    async fn test_default_feed_name_and_empty_body() {
        let broker = MemoryBroker::new();
        let state = state(&broker, PipelineConfig::default());

        let err = ingest_report(
            State(state.clone()),
            Query(IngestParams::default()),
            "  ".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        ingest_report(State(state), Query(IngestParams::default()), "row".to_string())
            .await
            .unwrap();
        let queued = broker.peek_all("turris-parser-queue").await;
        let report = Message::deserialize(&queued[0], registry()).unwrap();
        assert_eq!(report.value("feed.name").unwrap().as_str(), Some("Default Feed"));
    }

    #[tokio::test]
    async fn test_batch_reports_full_queue_per_line() {
        let broker = MemoryBroker::new();
        let state = state(
            &broker,
            PipelineConfig {
                max_queue_length: 1,
                on_full: FullQueuePolicy::Fail,
                ..Default::default()
            },
        );

        let (_, Json(response)) = ingest_batch(
            State(state),
            Query(IngestParams::default()),
            "first\n\nsecond\n".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(response.processed, 2);
        assert_eq!(response.accepted, 1);
        assert_eq!(response.failed, 1);
        assert!(response.errors[0].starts_with("Line 3"));
    }

    #[tokio::test]
    async fn test_ready_reports_queue_depth() {
        let broker = MemoryBroker::new();
        let state = state(&broker, PipelineConfig::default());
        let Json(body) = readiness_check(State(state)).await.unwrap();
        assert_eq!(body["status"], "ready");
        assert_eq!(body["depth"], 0);
    }
}
