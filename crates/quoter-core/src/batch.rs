//! Batch orchestration: many requests under one project.
//!
//! Items run with bounded concurrency in `batch_index` order. The batch
//! record tracks the contiguous prefix of completed items so a restarted
//! batch skips work already done, and completion counters are recomputed
//! from the children so they converge after partial runs.

use crate::event_bus::EventBus;
use crate::orchestrator::RequestOrchestrator;
use crate::PipelineError;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use quoter_storage::{StorageIndexes, StorageService};
use quoter_types::{
	BatchEvent, BatchJob, BatchStatus, PipelineEvent, QuoteRequest, QuoteStatus, StorageNamespace,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Drives the items of one batch with bounded concurrency.
pub struct BatchOrchestrator {
	storage: Arc<StorageService>,
	event_bus: EventBus,
	concurrency: usize,
}

impl BatchOrchestrator {
	pub fn new(storage: Arc<StorageService>, event_bus: EventBus, concurrency: usize) -> Self {
		Self {
			storage,
			event_bus,
			concurrency: concurrency.max(1),
		}
	}

	async fn load(&self, batch_id: &str) -> Result<BatchJob, PipelineError> {
		self.storage
			.retrieve(StorageNamespace::Batches.as_str(), batch_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}

	async fn persist(&self, batch: &BatchJob) -> Result<(), PipelineError> {
		self.storage
			.store(
				StorageNamespace::Batches.as_str(),
				&batch.id,
				batch,
				Some(StorageIndexes::new().with_field("status", batch.status)),
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}

	/// Processes a batch to a terminal status.
	///
	/// Safe to call again after a crash: already-terminal items are
	/// skipped by the per-request orchestrator, and the contiguous-prefix
	/// index skips their dispatch entirely.
	#[tracing::instrument(skip_all, fields(batch_id = %quoter_types::truncate_id(batch_id)))]
	pub async fn process(
		&self,
		batch_id: &str,
		runner: Arc<RequestOrchestrator>,
	) -> Result<(), PipelineError> {
		let batch = self.load(batch_id).await?;
		if !matches!(batch.status, BatchStatus::Processing) {
			tracing::debug!("Batch already terminal");
			return Ok(());
		}

		let start = batch.last_processed_index.unwrap_or(0);
		tracing::info!(
			total = batch.total_items,
			start_index = start,
			"Processing batch"
		);

		// Completed indices ahead of the contiguous prefix
		let done_ahead: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());
		let shared_batch = Mutex::new(batch.clone());

		let request_ids: Vec<String> = batch.request_ids.clone();
		stream::iter(request_ids.into_iter().enumerate().skip(start))
			.map(|(index, request_id)| {
				let runner = runner.clone();
				async move {
					// An operator abort stops dispatching new items
					let current = self.load(batch_id).await;
					let cancelled = matches!(
						current.map(|b| b.status),
						Ok(BatchStatus::Cancelled)
					);
					if !cancelled {
						if let Err(e) = runner.process(&request_id).await {
							tracing::error!(
								request_id = %request_id,
								error = %e,
								"Batch item failed"
							);
						}
					}
					(index, request_id)
				}
			})
			.buffer_unordered(self.concurrency)
			.for_each(|(index, request_id)| {
				let done_ahead = &done_ahead;
				let shared_batch = &shared_batch;
				async move {
					let status = self.item_status(&request_id).await;
					self.event_bus
						.publish(PipelineEvent::Batch(BatchEvent::ItemCompleted {
							batch_id: batch_id.to_string(),
							index,
							status,
						}));

					// Advance the contiguous completed prefix
					let mut done = done_ahead.lock().await;
					done.insert(index);
					let mut batch = shared_batch.lock().await;
					let mut prefix = batch.last_processed_index.unwrap_or(0);
					while done.remove(&prefix) {
						prefix += 1;
					}
					batch.last_processed_index = Some(prefix);
					if let Err(e) = self.persist(&batch).await {
						tracing::warn!(error = %e, "Failed to persist batch progress");
					}
				}
			})
			.await;

		let mut batch = shared_batch.into_inner();
		self.reconcile(&mut batch).await?;
		Ok(())
	}

	async fn item_status(&self, request_id: &str) -> QuoteStatus {
		self.storage
			.retrieve::<QuoteRequest>(StorageNamespace::Quotes.as_str(), request_id)
			.await
			.map(|r| r.status)
			.unwrap_or(QuoteStatus::Error)
	}

	/// Recomputes counters from the children and derives the terminal
	/// status.
	pub async fn reconcile(&self, batch: &mut BatchJob) -> Result<(), PipelineError> {
		let mut completed = 0;
		let mut failed = 0;
		for request_id in &batch.request_ids {
			match self.item_status(request_id).await {
				QuoteStatus::Done | QuoteStatus::AwaitingReview => completed += 1,
				QuoteStatus::Error => failed += 1,
				QuoteStatus::Cancelled => failed += 1,
				QuoteStatus::Processing => {},
			}
		}
		batch.completed_items = completed;
		batch.failed_items = failed;

		if matches!(batch.status, BatchStatus::Processing)
			&& completed + failed >= batch.total_items
		{
			batch.status = BatchJob::terminal_status(completed, failed, batch.total_items);
			batch.completed_at = Some(Utc::now());
			self.event_bus
				.publish(PipelineEvent::Batch(BatchEvent::Completed {
					batch_id: batch.id.clone(),
					status: batch.status,
				}));
			tracing::info!(
				batch_id = %batch.id,
				status = ?batch.status,
				completed,
				failed,
				"Batch finished"
			);
		}
		self.persist(batch).await
	}
}
