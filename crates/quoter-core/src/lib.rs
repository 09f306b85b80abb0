//! Core pipeline engine for the quotation system.
//!
//! This crate provides the orchestration that turns one item request into
//! a bundle of accepted price observations: the variation-block engine,
//! the per-candidate acquisition path, checkpointed per-request driving
//! with crash recovery, and batch fan-out. External collaborators (query
//! analysis, the vehicle price table, report generation) are injected
//! through the seam traits in [`seams`].

pub mod batch;
pub mod checkpoint;
pub mod engine;
pub mod event_bus;
pub mod orchestrator;
pub mod recovery;
pub mod seams;

use batch::BatchOrchestrator;
use checkpoint::CheckpointManager;
use chrono::{Duration as ChronoDuration, Utc};
use event_bus::EventBus;
use orchestrator::RequestOrchestrator;
use quoter_config::Config;
use quoter_policy::{BlockedDomainSet, DomainPolicy};
use quoter_render::RenderFactory;
use quoter_search::{SearchFactory, SearchService};
use quoter_storage::{StorageFactory, StorageService};
use quoter_types::{
	BatchJob, BatchStatus, InputType, PipelineParams, QuoteRequest, QuoteSource,
	QuoteSourceFailure, QuoteStatus, StorageNamespace,
};
use recovery::RecoveryService;
use seams::{ArtifactSink, FipeProvider, QueryAnalyzer, VehiclePriceBank};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
	/// Error related to configuration issues.
	#[error("Configuration error: {0}")]
	Config(String),
	/// Error from the storage layer.
	#[error("Storage error: {0}")]
	Storage(String),
	/// Error from the query analyzer.
	#[error("Analyzer error: {0}")]
	Analyzer(String),
	/// Error from the shopping search.
	#[error("Search error: {0}")]
	Search(String),
	/// Error from one of the pipeline services.
	#[error("Service error: {0}")]
	Service(String),
	/// Processing stopped because the request was cancelled.
	#[error("Cancelled")]
	Cancelled,
}

/// A unit of work on the pipeline queue.
#[derive(Debug, Clone)]
pub enum WorkItem {
	/// Process one quote request.
	Request(String),
	/// Drive one batch.
	Batch(String),
}

/// Inputs for enqueueing a new quote request.
#[derive(Debug, Clone, Default)]
pub struct NewQuoteRequest {
	pub input_text: Option<String>,
	pub input_image: Option<String>,
	pub item_code: Option<String>,
	pub project_id: Option<String>,
	/// Overrides the configured default parameters when present.
	pub params: Option<PipelineParams>,
}

/// Factory functions for the pluggable implementations.
pub struct PipelineFactories {
	pub storage_factories: HashMap<String, StorageFactory>,
	pub search_factories: HashMap<String, SearchFactory>,
	pub render_factories: HashMap<String, RenderFactory>,
}

/// Builder for constructing a QuotePipeline with pluggable
/// implementations.
///
/// Implementations are chosen by name from the configuration and built
/// through the provided factories; the external seams must be injected
/// explicitly.
pub struct PipelineBuilder {
	config: Config,
	analyzer: Option<Arc<dyn QueryAnalyzer>>,
	fipe: Option<Arc<dyn FipeProvider>>,
	sink: Option<Arc<dyn ArtifactSink>>,
}

impl PipelineBuilder {
	/// Creates a new builder with the given configuration.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			analyzer: None,
			fipe: None,
			sink: None,
		}
	}

	/// Sets the query analyzer implementation.
	pub fn with_analyzer(mut self, analyzer: Arc<dyn QueryAnalyzer>) -> Self {
		self.analyzer = Some(analyzer);
		self
	}

	/// Sets the vehicle-price provider implementation.
	pub fn with_fipe(mut self, fipe: Arc<dyn FipeProvider>) -> Self {
		self.fipe = Some(fipe);
		self
	}

	/// Sets the artifact sink implementation.
	pub fn with_artifact_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	/// Builds the pipeline using the configured factories.
	pub fn build(self, factories: PipelineFactories) -> Result<QuotePipeline, PipelineError> {
		let config = self.config;

		// Storage backend
		let storage_name = &config.storage.primary;
		let storage_config = config
			.storage
			.implementations
			.get(storage_name)
			.ok_or_else(|| {
				PipelineError::Config(format!("No configuration for storage '{}'", storage_name))
			})?;
		let storage_factory = factories.storage_factories.get(storage_name).ok_or_else(|| {
			PipelineError::Config(format!("Unknown storage backend '{}'", storage_name))
		})?;
		let backend = storage_factory(storage_config).map_err(|e| {
			PipelineError::Config(format!("Failed to create storage '{}': {}", storage_name, e))
		})?;
		backend
			.config_schema()
			.validate(storage_config)
			.map_err(|e| PipelineError::Config(format!("Invalid storage config: {}", e)))?;
		let storage = Arc::new(StorageService::new(backend));
		tracing::info!(component = "storage", implementation = %storage_name, "Loaded");

		// Search provider
		let search_name = &config.search.provider;
		let search_config = config
			.search
			.implementations
			.get(search_name)
			.ok_or_else(|| {
				PipelineError::Config(format!("No configuration for search '{}'", search_name))
			})?;
		let search_factory = factories.search_factories.get(search_name).ok_or_else(|| {
			PipelineError::Config(format!("Unknown search provider '{}'", search_name))
		})?;
		let provider = search_factory(search_config).map_err(|e| {
			PipelineError::Config(format!("Failed to create search '{}': {}", search_name, e))
		})?;
		provider
			.config_schema()
			.validate(search_config)
			.map_err(|e| PipelineError::Config(format!("Invalid search config: {}", e)))?;
		let search = Arc::new(SearchService::new(provider));
		tracing::info!(component = "search", implementation = %search_name, "Loaded");

		// Render engine
		let render_name = &config.render.engine;
		let render_config = config
			.render
			.implementations
			.get(render_name)
			.ok_or_else(|| {
				PipelineError::Config(format!("No configuration for render '{}'", render_name))
			})?;
		let render_factory = factories.render_factories.get(render_name).ok_or_else(|| {
			PipelineError::Config(format!("Unknown render engine '{}'", render_name))
		})?;
		let render = render_factory(render_config).map_err(|e| {
			PipelineError::Config(format!("Failed to create render '{}': {}", render_name, e))
		})?;
		render
			.config_schema()
			.validate(render_config)
			.map_err(|e| PipelineError::Config(format!("Invalid render config: {}", e)))?;
		let render: Arc<dyn quoter_render::RenderInterface> = Arc::from(render);
		tracing::info!(component = "render", implementation = %render_name, "Loaded");

		// External seams
		let analyzer = self
			.analyzer
			.ok_or_else(|| PipelineError::Config("Query analyzer not provided".into()))?;
		let fipe = self
			.fipe
			.ok_or_else(|| PipelineError::Config("FIPE provider not provided".into()))?;
		let sink = self
			.sink
			.ok_or_else(|| PipelineError::Config("Artifact sink not provided".into()))?;

		// Shared state
		let blocked = Arc::new(BlockedDomainSet::with_defaults());
		let policy = Arc::new(DomainPolicy::shared(blocked.clone()));
		let checkpoints = Arc::new(CheckpointManager::with_timeouts(
			storage.clone(),
			ChronoDuration::minutes(config.recovery.heartbeat_timeout_minutes as i64),
			ChronoDuration::hours(config.recovery.max_processing_hours as i64),
		));
		let event_bus = EventBus::new(1000);
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		let vehicle_bank = Arc::new(VehiclePriceBank::new(storage.clone()));

		let orchestrator = Arc::new(RequestOrchestrator::new(
			storage.clone(),
			checkpoints.clone(),
			policy,
			search,
			render,
			analyzer,
			fipe,
			sink,
			vehicle_bank,
			event_bus.clone(),
			PathBuf::from(&config.pipeline.screenshot_dir),
		));
		let batch = Arc::new(BatchOrchestrator::new(
			storage.clone(),
			event_bus.clone(),
			config.batch.concurrency,
		));
		let recovery = Arc::new(RecoveryService::new(
			storage.clone(),
			checkpoints.clone(),
			blocked,
			config.policy.extra_blocked.clone(),
			queue_tx.clone(),
		));

		Ok(QuotePipeline {
			config,
			storage,
			checkpoints,
			orchestrator,
			batch,
			recovery,
			event_bus,
			queue_tx,
			queue_rx: Mutex::new(Some(queue_rx)),
		})
	}
}

/// The assembled pipeline: queue, workers, recovery, and control
/// operations.
pub struct QuotePipeline {
	config: Config,
	storage: Arc<StorageService>,
	checkpoints: Arc<CheckpointManager>,
	orchestrator: Arc<RequestOrchestrator>,
	batch: Arc<BatchOrchestrator>,
	recovery: Arc<RecoveryService>,
	event_bus: EventBus,
	queue_tx: mpsc::UnboundedSender<WorkItem>,
	queue_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
}

impl QuotePipeline {
	/// Main worker loop.
	///
	/// Refreshes shared state, re-enqueues resumable requests from prior
	/// runs, then pulls work items under the configured concurrency until
	/// interrupted.
	pub async fn run(&self) -> Result<(), PipelineError> {
		self.recovery.refresh_blocked_domains().await?;

		for request in self.checkpoints.find_resumable().await? {
			tracing::info!(request_id = %request.id, "Re-enqueueing resumable request");
			let _ = self.queue_tx.send(WorkItem::Request(request.id));
		}

		let mut queue_rx = self
			.queue_rx
			.lock()
			.await
			.take()
			.ok_or_else(|| PipelineError::Service("Pipeline already running".into()))?;

		let recovery = self.recovery.clone();
		let interval = Duration::from_secs(self.config.recovery.scan_interval_seconds);
		let recovery_handle = tokio::spawn(async move {
			recovery.run(interval).await;
		});

		// Admin edits to the blocked set must reach workers within the
		// configured refresh bound, independent of the recovery cadence
		let refresher = self.recovery.clone();
		let refresh_interval =
			Duration::from_secs(self.config.policy.refresh_interval_seconds.max(1));
		let refresh_handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(refresh_interval);
			loop {
				ticker.tick().await;
				if let Err(e) = refresher.refresh_blocked_domains().await {
					tracing::warn!(error = %e, "Blocked-domain refresh failed");
				}
			}
		});

		let semaphore = Arc::new(Semaphore::new(self.config.pipeline.workers));
		loop {
			tokio::select! {
				Some(item) = queue_rx.recv() => {
					let permit = match semaphore.clone().acquire_owned().await {
						Ok(permit) => permit,
						Err(e) => {
							tracing::error!("Failed to acquire worker permit: {}", e);
							break;
						},
					};
					let orchestrator = self.orchestrator.clone();
					let batch = self.batch.clone();
					tokio::spawn(async move {
						let _permit = permit;
						match item {
							WorkItem::Request(id) => {
								if let Err(e) = orchestrator.process(&id).await {
									tracing::error!(request_id = %id, error = %e, "Request processing failed");
								}
							},
							WorkItem::Batch(id) => {
								if let Err(e) = batch.process(&id, orchestrator).await {
									tracing::error!(batch_id = %id, error = %e, "Batch processing failed");
								}
							},
						}
					});
				}

				// Shutdown signal
				_ = tokio::signal::ctrl_c() => {
					break;
				}
			}
		}

		recovery_handle.abort();
		refresh_handle.abort();
		Ok(())
	}

	/// Enqueues a new quote request; returns its id.
	pub async fn enqueue(&self, new: NewQuoteRequest) -> Result<String, PipelineError> {
		if new.input_text.is_none() && new.input_image.is_none() {
			return Err(PipelineError::Service(
				"request needs input_text or input_image".into(),
			));
		}

		let input_type = if new.input_image.is_some() {
			InputType::Image
		} else {
			InputType::Text
		};
		let params = new
			.params
			.unwrap_or_else(|| self.config.pipeline.to_params());

		let mut request = QuoteRequest::new(
			uuid::Uuid::new_v4().to_string(),
			input_type,
			params,
		);
		request.input_text = new.input_text;
		request.input_image = new.input_image;
		request.item_code = new.item_code;
		request.project_id = new.project_id;

		self.checkpoints.persist(&mut request).await?;
		let id = request.id.clone();
		self.queue_tx
			.send(WorkItem::Request(id.clone()))
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		tracing::info!(request_id = %id, "Enqueued");
		Ok(id)
	}

	/// Enqueues a batch of requests; returns the batch id.
	pub async fn enqueue_batch(
		&self,
		items: Vec<NewQuoteRequest>,
	) -> Result<String, PipelineError> {
		if items.is_empty() {
			return Err(PipelineError::Service("batch needs at least one item".into()));
		}

		let batch_id = uuid::Uuid::new_v4().to_string();
		let mut request_ids = Vec::with_capacity(items.len());
		for (index, item) in items.into_iter().enumerate() {
			let params = item
				.params
				.unwrap_or_else(|| self.config.pipeline.to_params());
			let input_type = if item.input_image.is_some() {
				InputType::Image
			} else {
				InputType::Text
			};
			let mut request = QuoteRequest::new(
				uuid::Uuid::new_v4().to_string(),
				input_type,
				params,
			);
			request.input_text = item.input_text;
			request.input_image = item.input_image;
			request.item_code = item.item_code;
			request.project_id = item.project_id;
			request.batch_id = Some(batch_id.clone());
			request.batch_index = Some(index);
			self.checkpoints.persist(&mut request).await?;
			request_ids.push(request.id);
		}

		let batch = BatchJob {
			id: batch_id.clone(),
			status: BatchStatus::Processing,
			total_items: request_ids.len(),
			completed_items: 0,
			failed_items: 0,
			last_processed_index: None,
			request_ids,
			created_at: Utc::now(),
			completed_at: None,
		};
		self.storage
			.store(
				StorageNamespace::Batches.as_str(),
				&batch.id,
				&batch,
				Some(
					quoter_storage::StorageIndexes::new().with_field("status", batch.status),
				),
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		self.queue_tx
			.send(WorkItem::Batch(batch_id.clone()))
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		tracing::info!(batch_id = %batch_id, items = batch.total_items, "Batch enqueued");
		Ok(batch_id)
	}

	/// Cancels a request; honored at the next checkpoint boundary.
	pub async fn cancel(&self, request_id: &str) -> Result<bool, PipelineError> {
		let mut request: QuoteRequest = self
			.storage
			.retrieve(StorageNamespace::Quotes.as_str(), request_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		if request.is_terminal() {
			return Ok(false);
		}
		request.status = QuoteStatus::Cancelled;
		self.checkpoints.persist(&mut request).await?;
		tracing::info!(request_id = %request_id, "Cancellation requested");
		Ok(true)
	}

	/// Resumes a stuck request through the recovery path.
	pub async fn resume(&self, request_id: &str) -> Result<bool, PipelineError> {
		let mut request: QuoteRequest = self
			.storage
			.retrieve(StorageNamespace::Quotes.as_str(), request_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		if request.status != QuoteStatus::Processing {
			return Ok(false);
		}
		self.checkpoints.reset_stuck(&mut request).await?;
		self.queue_tx
			.send(WorkItem::Request(request_id.to_string()))
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		Ok(true)
	}

	/// Fetches a request by id.
	pub async fn get_request(&self, request_id: &str) -> Result<QuoteRequest, PipelineError> {
		self.storage
			.retrieve(StorageNamespace::Quotes.as_str(), request_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}

	/// Fetches the observations persisted for a request.
	pub async fn get_sources(&self, request_id: &str) -> Vec<QuoteSource> {
		self.storage
			.retrieve(StorageNamespace::Sources.as_str(), request_id)
			.await
			.unwrap_or_default()
	}

	/// Fetches the failure diagnostics persisted for a request.
	pub async fn get_failures(&self, request_id: &str) -> Vec<QuoteSourceFailure> {
		self.storage
			.retrieve(StorageNamespace::Failures.as_str(), request_id)
			.await
			.unwrap_or_default()
	}

	/// Fetches a batch by id.
	pub async fn get_batch(&self, batch_id: &str) -> Result<BatchJob, PipelineError> {
		self.storage
			.retrieve(StorageNamespace::Batches.as_str(), batch_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}

	/// Returns a reference to the event bus.
	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}
}
