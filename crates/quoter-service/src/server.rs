//! HTTP control surface for the quotation pipeline.
//!
//! A thin surface exposing only the externally-initiated state changes
//! the core depends on: enqueue, cancel, resume, and status reads.

use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use quoter_config::ApiConfig;
use quoter_core::{NewQuoteRequest, PipelineError, QuotePipeline};
use quoter_types::{BatchJob, QuoteRequest, QuoteSource, QuoteSourceFailure};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Reference to the pipeline for processing requests.
	pub pipeline: Arc<QuotePipeline>,
}

/// Starts the HTTP server for the control surface.
pub async fn start_server(
	api_config: ApiConfig,
	pipeline: Arc<QuotePipeline>,
) -> anyhow::Result<()> {
	let app_state = AppState { pipeline };

	let app = Router::new()
		.nest(
			"/api",
			Router::new()
				.route("/quotes", post(handle_enqueue))
				.route("/quotes/{id}", get(handle_get_quote))
				.route("/quotes/{id}/cancel", post(handle_cancel))
				.route("/quotes/{id}/resume", post(handle_resume))
				.route("/batches", post(handle_enqueue_batch))
				.route("/batches/{id}", get(handle_get_batch)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
		.with_state(app_state);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Control API listening on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

/// API error wrapper with status mapping.
struct ApiError(PipelineError);

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			PipelineError::Storage(message) if message.contains("Not found") => {
				StatusCode::NOT_FOUND
			},
			PipelineError::Config(_) | PipelineError::Service(_) => StatusCode::BAD_REQUEST,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = Json(serde_json::json!({ "error": self.0.to_string() }));
		(status, body).into_response()
	}
}

impl From<PipelineError> for ApiError {
	fn from(e: PipelineError) -> Self {
		Self(e)
	}
}

/// Body for POST /api/quotes.
#[derive(Debug, Deserialize)]
struct EnqueueBody {
	input_text: Option<String>,
	input_image: Option<String>,
	item_code: Option<String>,
	project_id: Option<String>,
}

impl From<EnqueueBody> for NewQuoteRequest {
	fn from(body: EnqueueBody) -> Self {
		NewQuoteRequest {
			input_text: body.input_text,
			input_image: body.input_image,
			item_code: body.item_code,
			project_id: body.project_id,
			params: None,
		}
	}
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
	quote_request_id: String,
}

/// Handles POST /api/quotes.
async fn handle_enqueue(
	State(state): State<AppState>,
	Json(body): Json<EnqueueBody>,
) -> Result<Json<EnqueueResponse>, ApiError> {
	let id = state.pipeline.enqueue(body.into()).await?;
	Ok(Json(EnqueueResponse {
		quote_request_id: id,
	}))
}

/// Full view of one request, with its observations and diagnostics.
#[derive(Debug, Serialize)]
struct QuoteView {
	#[serde(flatten)]
	request: QuoteRequest,
	sources: Vec<QuoteSource>,
	failures: Vec<QuoteSourceFailure>,
}

/// Handles GET /api/quotes/{id}.
async fn handle_get_quote(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<QuoteView>, ApiError> {
	let request = state.pipeline.get_request(&id).await?;
	let sources = state.pipeline.get_sources(&id).await;
	let failures = state.pipeline.get_failures(&id).await;
	Ok(Json(QuoteView {
		request,
		sources,
		failures,
	}))
}

/// Handles POST /api/quotes/{id}/cancel.
async fn handle_cancel(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let cancelled = state.pipeline.cancel(&id).await?;
	Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// Handles POST /api/quotes/{id}/resume.
async fn handle_resume(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let resumed = state.pipeline.resume(&id).await?;
	Ok(Json(serde_json::json!({ "resumed": resumed })))
}

/// Body for POST /api/batches.
#[derive(Debug, Deserialize)]
struct EnqueueBatchBody {
	items: Vec<EnqueueBody>,
}

/// Handles POST /api/batches.
async fn handle_enqueue_batch(
	State(state): State<AppState>,
	Json(body): Json<EnqueueBatchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let items = body.items.into_iter().map(NewQuoteRequest::from).collect();
	let batch_id = state.pipeline.enqueue_batch(items).await?;
	Ok(Json(serde_json::json!({ "batch_id": batch_id })))
}

/// Handles GET /api/batches/{id}.
async fn handle_get_batch(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<BatchJob>, ApiError> {
	let batch = state.pipeline.get_batch(&id).await?;
	Ok(Json(batch))
}
