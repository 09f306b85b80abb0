//! Checkpoint and heartbeat management for quote requests.
//!
//! Each request carries a named progress marker, the id of the worker
//! driving it, and a heartbeat proving that worker is alive. Together
//! these give the pipeline crash recovery: a stale heartbeat marks the
//! request stuck, a reset makes it claimable again, and the stored
//! payloads let the next worker resume past completed stages instead of
//! starting over.

use crate::PipelineError;
use chrono::{Duration, Utc};
use quoter_storage::{QueryFilter, StorageIndexes, StorageService};
use quoter_types::{
	ItemNature, ProcessingCheckpoint, QuoteRequest, QuoteStatus, StorageNamespace,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Minutes without a heartbeat before a request counts as stuck.
pub const HEARTBEAT_TIMEOUT_MINUTES: i64 = 10;

/// Hard ceiling on total processing time.
pub const MAX_PROCESSING_HOURS: i64 = 24;

/// Error messages are truncated to this many characters on failure.
const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Generates the identity of the current worker process.
pub fn current_worker_id() -> String {
	let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
	format!("{}-{}", hostname, std::process::id())
}

/// Checkpoint manager bound to one worker identity.
pub struct CheckpointManager {
	storage: Arc<StorageService>,
	worker_id: String,
	heartbeat_timeout: Duration,
	max_processing: Duration,
}

impl CheckpointManager {
	/// Creates a manager with the default timeouts.
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self::with_timeouts(
			storage,
			Duration::minutes(HEARTBEAT_TIMEOUT_MINUTES),
			Duration::hours(MAX_PROCESSING_HOURS),
		)
	}

	/// Creates a manager with explicit timeouts.
	pub fn with_timeouts(
		storage: Arc<StorageService>,
		heartbeat_timeout: Duration,
		max_processing: Duration,
	) -> Self {
		Self {
			storage,
			worker_id: current_worker_id(),
			heartbeat_timeout,
			max_processing,
		}
	}

	/// The identity this manager claims requests under.
	pub fn worker_id(&self) -> &str {
		&self.worker_id
	}

	fn indexes(request: &QuoteRequest) -> StorageIndexes {
		StorageIndexes::new()
			.with_field("status", request.status)
			.with_field("checkpoint", request.checkpoint)
			.with_field("worker_id", request.worker_id.clone())
			.with_field(
				"last_heartbeat_ts",
				request.last_heartbeat.map(|t| t.timestamp()),
			)
			.with_field("started_at_ts", request.started_at.map(|t| t.timestamp()))
			.with_field("batch_id", request.batch_id.clone())
	}

	/// Persists a request with its execution-state indexes.
	///
	/// An operator-written CANCELLED status always survives: a worker
	/// writing non-terminal state on top of it adopts the cancellation
	/// instead of clobbering it.
	pub async fn persist(&self, request: &mut QuoteRequest) -> Result<(), PipelineError> {
		if !request.is_terminal() {
			if let Ok(stored) = self
				.storage
				.retrieve::<QuoteRequest>(StorageNamespace::Quotes.as_str(), &request.id)
				.await
			{
				if stored.status == QuoteStatus::Cancelled {
					request.status = QuoteStatus::Cancelled;
				}
			}
		}
		self.storage
			.store(
				StorageNamespace::Quotes.as_str(),
				&request.id,
				request,
				Some(Self::indexes(request)),
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}

	/// Marks the start of processing. Called once per attempt.
	pub async fn start(&self, request: &mut QuoteRequest) -> Result<(), PipelineError> {
		let now = Utc::now();
		request.checkpoint = Some(ProcessingCheckpoint::Init);
		request.last_heartbeat = Some(now);
		request.worker_id = Some(self.worker_id.clone());
		request.started_at = Some(now);
		self.persist(request).await?;
		tracing::debug!(
			request_id = %request.id,
			worker = %self.worker_id,
			"Started processing"
		);
		Ok(())
	}

	/// Saves a checkpoint, merging resume data into the existing map.
	pub async fn save(
		&self,
		request: &mut QuoteRequest,
		checkpoint: ProcessingCheckpoint,
		resume_data: Option<HashMap<String, serde_json::Value>>,
		progress_pct: Option<u8>,
	) -> Result<(), PipelineError> {
		request.checkpoint = Some(checkpoint);
		request.last_heartbeat = Some(Utc::now());
		if let Some(data) = resume_data {
			// Merge so earlier stages' data is never lost
			request.resume_data.extend(data);
		}
		if let Some(pct) = progress_pct {
			request.progress_pct = pct.min(100);
		}
		self.persist(request).await?;
		tracing::debug!(
			request_id = %request.id,
			checkpoint = ?checkpoint,
			progress = request.progress_pct,
			"Checkpoint saved"
		);
		Ok(())
	}

	/// Updates the heartbeat. Called around every long external call.
	pub async fn heartbeat(&self, request: &mut QuoteRequest) -> Result<(), PipelineError> {
		request.last_heartbeat = Some(Utc::now());
		self.persist(request).await
	}

	/// Marks processing complete with a terminal status.
	pub async fn complete(
		&self,
		request: &mut QuoteRequest,
		status: QuoteStatus,
	) -> Result<(), PipelineError> {
		let now = Utc::now();
		request.checkpoint = Some(ProcessingCheckpoint::Completed);
		request.last_heartbeat = Some(now);
		request.completed_at = Some(now);
		request.status = status;
		request.worker_id = None;
		self.persist(request).await?;
		tracing::info!(
			request_id = %request.id,
			status = ?status,
			"Processing complete"
		);
		Ok(())
	}

	/// Marks processing failed with a truncated error message.
	pub async fn fail(
		&self,
		request: &mut QuoteRequest,
		message: &str,
	) -> Result<(), PipelineError> {
		let now = Utc::now();
		request.checkpoint = Some(ProcessingCheckpoint::Completed);
		request.last_heartbeat = Some(now);
		request.completed_at = Some(now);
		request.status = QuoteStatus::Error;
		request.error_message = Some(message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect());
		request.worker_id = None;
		self.persist(request).await?;
		tracing::error!(request_id = %request.id, error = %message, "Processing failed");
		Ok(())
	}

	/// Optimistically claims a request for this worker.
	///
	/// Refuses when another worker's heartbeat is younger than the
	/// timeout. After writing, re-reads to confirm the claim survived a
	/// concurrent writer.
	pub async fn claim(&self, request: &mut QuoteRequest) -> Result<bool, PipelineError> {
		if let (Some(worker), Some(heartbeat)) = (&request.worker_id, request.last_heartbeat) {
			let fresh = Utc::now() - heartbeat < self.heartbeat_timeout;
			if fresh && worker != &self.worker_id {
				tracing::warn!(
					request_id = %request.id,
					owner = %worker,
					"Already being processed by another worker"
				);
				return Ok(false);
			}
		}

		request.worker_id = Some(self.worker_id.clone());
		request.last_heartbeat = Some(Utc::now());
		self.persist(request).await?;

		// Confirm no concurrent claimant won the write race
		let stored: QuoteRequest = self
			.storage
			.retrieve(StorageNamespace::Quotes.as_str(), &request.id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		if stored.worker_id.as_deref() != Some(self.worker_id.as_str()) {
			tracing::warn!(
				request_id = %request.id,
				winner = ?stored.worker_id,
				"Lost claim race"
			);
			return Ok(false);
		}

		tracing::info!(request_id = %request.id, worker = %self.worker_id, "Claimed");
		Ok(true)
	}

	/// Chooses the checkpoint to resume from given the stored payloads.
	///
	/// Persisted analysis skips the analyzer (vehicles route to the FIPE
	/// path); a persisted search response skips the search; recorded
	/// tested products continue mid-extraction.
	pub fn resume_point(&self, request: &QuoteRequest) -> Option<ProcessingCheckpoint> {
		let checkpoint = request.checkpoint?;

		if let Some(analysis) = &request.analysis_json {
			if matches!(
				checkpoint,
				ProcessingCheckpoint::AiAnalysisStart | ProcessingCheckpoint::AiAnalysisDone
			) {
				let natureza = analysis
					.get("natureza")
					.and_then(|v| serde_json::from_value::<ItemNature>(v.clone()).ok());
				return Some(match natureza {
					Some(n) if n.is_vehicle() => ProcessingCheckpoint::FipeSearch,
					_ => ProcessingCheckpoint::ShoppingSearchStart,
				});
			}
		}

		if request.search_response_json.is_some()
			&& matches!(
				checkpoint,
				ProcessingCheckpoint::ShoppingSearchStart
					| ProcessingCheckpoint::ShoppingSearchDone
			) {
			return Some(ProcessingCheckpoint::PriceExtractionStart);
		}

		if request.resume_data.contains_key("tested_products")
			&& checkpoint == ProcessingCheckpoint::PriceExtractionProgress
		{
			return Some(ProcessingCheckpoint::PriceExtractionProgress);
		}

		Some(checkpoint)
	}

	/// Lists requests stuck in PROCESSING with a stale heartbeat.
	pub async fn find_stuck(&self) -> Result<Vec<QuoteRequest>, PipelineError> {
		let cutoff = (Utc::now() - self.heartbeat_timeout).timestamp();
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), serde_json::json!("PROCESSING")),
			QueryFilter::LessThan("last_heartbeat_ts".into(), serde_json::json!(cutoff)),
		]);
		let stuck = self
			.storage
			.query::<QuoteRequest>(StorageNamespace::Quotes.as_str(), filter)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		Ok(stuck.into_iter().map(|(_, request)| request).collect())
	}

	/// Lists requests that can be resumed: PROCESSING with a checkpoint
	/// and either a dead worker or none at all.
	pub async fn find_resumable(&self) -> Result<Vec<QuoteRequest>, PipelineError> {
		let cutoff = (Utc::now() - self.heartbeat_timeout).timestamp();
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), serde_json::json!("PROCESSING")),
			QueryFilter::NotEquals("checkpoint".into(), serde_json::Value::Null),
			QueryFilter::Or(vec![
				QueryFilter::LessThan("last_heartbeat_ts".into(), serde_json::json!(cutoff)),
				QueryFilter::IsNull("worker_id".into()),
			]),
		]);
		let resumable = self
			.storage
			.query::<QuoteRequest>(StorageNamespace::Quotes.as_str(), filter)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		let mut requests: Vec<QuoteRequest> =
			resumable.into_iter().map(|(_, request)| request).collect();
		requests.sort_by_key(|r| r.created_at);
		Ok(requests)
	}

	/// Resets a stuck request so another worker can claim it.
	pub async fn reset_stuck(&self, request: &mut QuoteRequest) -> Result<(), PipelineError> {
		tracing::info!(
			request_id = %request.id,
			checkpoint = ?request.checkpoint,
			attempt = request.attempt_number,
			"Resetting stuck request"
		);
		request.worker_id = None;
		request.last_heartbeat = None;
		request.attempt_number += 1;
		self.persist(request).await
	}

	/// Moves requests past the processing ceiling to ERROR.
	pub async fn enforce_ceiling(&self) -> Result<usize, PipelineError> {
		let cutoff = (Utc::now() - self.max_processing).timestamp();
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), serde_json::json!("PROCESSING")),
			QueryFilter::LessThan("started_at_ts".into(), serde_json::json!(cutoff)),
		]);
		let expired = self
			.storage
			.query::<QuoteRequest>(StorageNamespace::Quotes.as_str(), filter)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		let mut moved = 0;
		for (_, mut request) in expired {
			self.fail(&mut request, "timeout: processing exceeded 24 hours")
				.await?;
			moved += 1;
		}
		Ok(moved)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use quoter_storage::implementations::memory::MemoryStorage;
	use quoter_types::{InputType, PipelineParams};

	fn storage() -> Arc<StorageService> {
		Arc::new(StorageService::new(Box::new(MemoryStorage::new())))
	}

	fn request(id: &str) -> QuoteRequest {
		QuoteRequest::new(id.to_string(), InputType::Text, PipelineParams::default())
	}

	#[tokio::test]
	async fn start_save_complete_roundtrip() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());
		let mut req = request("r1");

		manager.start(&mut req).await.unwrap();
		assert_eq!(req.checkpoint, Some(ProcessingCheckpoint::Init));
		assert!(req.worker_id.is_some());

		let mut data = HashMap::new();
		data.insert("query".to_string(), serde_json::json!("notebook dell"));
		manager
			.save(
				&mut req,
				ProcessingCheckpoint::AiAnalysisDone,
				Some(data),
				Some(20),
			)
			.await
			.unwrap();

		let mut more = HashMap::new();
		more.insert("tested_products".to_string(), serde_json::json!([0, 1]));
		manager
			.save(
				&mut req,
				ProcessingCheckpoint::PriceExtractionProgress,
				Some(more),
				Some(45),
			)
			.await
			.unwrap();
		// Merge keeps earlier stage data
		assert!(req.resume_data.contains_key("query"));
		assert!(req.resume_data.contains_key("tested_products"));

		manager
			.complete(&mut req, QuoteStatus::Done)
			.await
			.unwrap();
		let stored: QuoteRequest = storage
			.retrieve(StorageNamespace::Quotes.as_str(), "r1")
			.await
			.unwrap();
		assert_eq!(stored.status, QuoteStatus::Done);
		assert_eq!(stored.checkpoint, Some(ProcessingCheckpoint::Completed));
		assert!(stored.completed_at.is_some());
		assert!(stored.worker_id.is_none());
	}

	#[tokio::test]
	async fn fail_truncates_message() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());
		let mut req = request("r1");
		manager.start(&mut req).await.unwrap();

		let long = "x".repeat(5000);
		manager.fail(&mut req, &long).await.unwrap();
		assert_eq!(req.error_message.as_ref().unwrap().len(), 1000);
		assert_eq!(req.status, QuoteStatus::Error);
	}

	#[tokio::test]
	async fn claim_refuses_fresh_foreign_worker() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());
		let mut req = request("r1");
		req.worker_id = Some("other-host-999".to_string());
		req.last_heartbeat = Some(Utc::now());
		manager.persist(&mut req).await.unwrap();

		assert!(!manager.claim(&mut req).await.unwrap());
	}

	#[tokio::test]
	async fn claim_takes_over_stale_worker() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());
		let mut req = request("r1");
		req.worker_id = Some("other-host-999".to_string());
		req.last_heartbeat = Some(Utc::now() - Duration::minutes(30));
		manager.persist(&mut req).await.unwrap();

		assert!(manager.claim(&mut req).await.unwrap());
		assert_eq!(req.worker_id.as_deref(), Some(manager.worker_id()));
	}

	#[tokio::test]
	async fn resume_point_routing() {
		let storage = storage();
		let manager = CheckpointManager::new(storage);
		let mut req = request("r1");

		// No checkpoint: nothing to resume from
		assert_eq!(manager.resume_point(&req), None);

		// Analysis persisted mid-analysis: jump past it
		req.checkpoint = Some(ProcessingCheckpoint::AiAnalysisStart);
		req.analysis_json = Some(serde_json::json!({
			"query_string": "notebook",
			"natureza": "produto",
		}));
		assert_eq!(
			manager.resume_point(&req),
			Some(ProcessingCheckpoint::ShoppingSearchStart)
		);

		// Vehicles route to the FIPE path instead
		req.analysis_json = Some(serde_json::json!({
			"query_string": "fiat strada",
			"natureza": "veiculo_carro",
		}));
		assert_eq!(
			manager.resume_point(&req),
			Some(ProcessingCheckpoint::FipeSearch)
		);

		// Search response persisted: jump to extraction
		req.checkpoint = Some(ProcessingCheckpoint::ShoppingSearchDone);
		req.search_response_json = Some(serde_json::json!({"shopping_results": []}));
		assert_eq!(
			manager.resume_point(&req),
			Some(ProcessingCheckpoint::PriceExtractionStart)
		);

		// Mid-extraction progress resumes in place
		req.checkpoint = Some(ProcessingCheckpoint::PriceExtractionProgress);
		req.resume_data
			.insert("tested_products".to_string(), serde_json::json!([0, 1, 2]));
		assert_eq!(
			manager.resume_point(&req),
			Some(ProcessingCheckpoint::PriceExtractionProgress)
		);
	}

	#[tokio::test]
	async fn stuck_scan_finds_only_stale_processing() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());

		let mut stale = request("stale");
		stale.last_heartbeat = Some(Utc::now() - Duration::minutes(30));
		manager.persist(&mut stale).await.unwrap();

		let mut live = request("live");
		live.last_heartbeat = Some(Utc::now());
		manager.persist(&mut live).await.unwrap();

		let mut done = request("done");
		done.status = QuoteStatus::Done;
		done.last_heartbeat = Some(Utc::now() - Duration::minutes(30));
		manager.persist(&mut done).await.unwrap();

		let stuck = manager.find_stuck().await.unwrap();
		assert_eq!(stuck.len(), 1);
		assert_eq!(stuck[0].id, "stale");
	}

	#[tokio::test]
	async fn reset_bumps_attempt_number() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());
		let mut req = request("r1");
		manager.start(&mut req).await.unwrap();

		manager.reset_stuck(&mut req).await.unwrap();
		assert_eq!(req.attempt_number, 2);
		assert!(req.worker_id.is_none());
		assert!(req.last_heartbeat.is_none());
	}

	#[tokio::test]
	async fn ceiling_moves_old_requests_to_error() {
		let storage = storage();
		let manager = CheckpointManager::new(storage.clone());

		let mut old = request("old");
		old.started_at = Some(Utc::now() - Duration::hours(30));
		old.last_heartbeat = Some(Utc::now());
		manager.persist(&mut old).await.unwrap();

		let moved = manager.enforce_ceiling().await.unwrap();
		assert_eq!(moved, 1);
		let stored: QuoteRequest = storage
			.retrieve(StorageNamespace::Quotes.as_str(), "old")
			.await
			.unwrap();
		assert_eq!(stored.status, QuoteStatus::Error);
		assert_eq!(
			stored.error_message.as_deref(),
			Some("timeout: processing exceeded 24 hours")
		);
	}
}
