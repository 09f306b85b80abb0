//! Background recovery for the pipeline.
//!
//! A periodic task that resets stuck requests back onto the queue,
//! enforces the 24-hour processing ceiling, refreshes the blocked-domain
//! snapshot from storage, and prunes expired cache entries.

use crate::checkpoint::CheckpointManager;
use crate::{PipelineError, WorkItem};
use quoter_policy::{default_blocked_domains, BlockedDomain, BlockedDomainSet};
use quoter_storage::StorageService;
use quoter_types::StorageNamespace;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Report of one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Stuck requests reset and re-enqueued.
	pub requeued: usize,
	/// Requests moved to ERROR by the processing ceiling.
	pub expired: usize,
	/// Size of the refreshed blocked-domain snapshot.
	pub blocked_domains: usize,
	/// Expired storage entries removed.
	pub cleaned: usize,
}

/// Periodic recovery task.
pub struct RecoveryService {
	storage: Arc<StorageService>,
	checkpoints: Arc<CheckpointManager>,
	blocked: Arc<BlockedDomainSet>,
	extra_blocked: Vec<String>,
	queue: mpsc::UnboundedSender<WorkItem>,
}

impl RecoveryService {
	pub fn new(
		storage: Arc<StorageService>,
		checkpoints: Arc<CheckpointManager>,
		blocked: Arc<BlockedDomainSet>,
		extra_blocked: Vec<String>,
		queue: mpsc::UnboundedSender<WorkItem>,
	) -> Self {
		Self {
			storage,
			checkpoints,
			blocked,
			extra_blocked,
			queue,
		}
	}

	/// Runs recovery passes forever at the given interval.
	pub async fn run(&self, interval: Duration) {
		let mut ticker = tokio::time::interval(interval);
		loop {
			ticker.tick().await;
			match self.run_once().await {
				Ok(report) => {
					if report.requeued > 0 || report.expired > 0 {
						tracing::info!(
							requeued = report.requeued,
							expired = report.expired,
							"Recovery pass"
						);
					}
				},
				Err(e) => {
					tracing::warn!(error = %e, "Recovery pass failed");
				},
			}
		}
	}

	/// One recovery pass.
	pub async fn run_once(&self) -> Result<RecoveryReport, PipelineError> {
		let mut report = RecoveryReport::default();

		// Stuck requests: dead worker, stale heartbeat
		for mut request in self.checkpoints.find_stuck().await? {
			self.checkpoints.reset_stuck(&mut request).await?;
			if self.queue.send(WorkItem::Request(request.id.clone())).is_ok() {
				report.requeued += 1;
			}
		}

		report.expired = self.checkpoints.enforce_ceiling().await?;
		report.blocked_domains = self.refresh_blocked_domains().await?;
		report.cleaned = self
			.storage
			.cleanup_expired()
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		Ok(report)
	}

	/// Rebuilds the blocked-domain snapshot from storage.
	///
	/// First run seeds storage with the default list; admin edits land in
	/// the same namespace and become visible here within one interval.
	pub async fn refresh_blocked_domains(&self) -> Result<usize, PipelineError> {
		let mut stored: Vec<(String, BlockedDomain)> = self
			.storage
			.retrieve_all(StorageNamespace::BlockedDomains.as_str())
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		if stored.is_empty() {
			for entry in default_blocked_domains() {
				self.storage
					.store(
						StorageNamespace::BlockedDomains.as_str(),
						&entry.domain,
						&entry,
						Some(
							quoter_storage::StorageIndexes::new()
								.with_field("domain", entry.domain.clone()),
						),
					)
					.await
					.map_err(|e| PipelineError::Storage(e.to_string()))?;
				stored.push((entry.domain.clone(), entry));
			}
			tracing::info!(count = stored.len(), "Seeded blocked-domain set");
		}

		let mut domains: HashSet<String> =
			stored.into_iter().map(|(_, entry)| entry.domain).collect();
		domains.extend(self.extra_blocked.iter().cloned());

		let count = domains.len();
		self.blocked.replace(domains);
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::{Duration as ChronoDuration, Utc};
	use quoter_storage::implementations::memory::MemoryStorage;
	use quoter_types::{InputType, PipelineParams, QuoteRequest};

	fn service() -> (
		RecoveryService,
		Arc<StorageService>,
		Arc<CheckpointManager>,
		mpsc::UnboundedReceiver<WorkItem>,
	) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let checkpoints = Arc::new(CheckpointManager::new(storage.clone()));
		let blocked = Arc::new(BlockedDomainSet::new());
		let (tx, rx) = mpsc::unbounded_channel();
		let recovery = RecoveryService::new(
			storage.clone(),
			checkpoints.clone(),
			blocked,
			vec!["bloqueada.com.br".to_string()],
			tx,
		);
		(recovery, storage, checkpoints, rx)
	}

	#[tokio::test]
	async fn stuck_requests_are_reset_and_requeued() {
		let (recovery, _storage, checkpoints, mut rx) = service();

		let mut stuck = QuoteRequest::new(
			"stuck".to_string(),
			InputType::Text,
			PipelineParams::default(),
		);
		stuck.worker_id = Some("dead-worker-1".to_string());
		stuck.last_heartbeat = Some(Utc::now() - ChronoDuration::minutes(30));
		checkpoints.persist(&mut stuck).await.unwrap();

		let report = recovery.run_once().await.unwrap();
		assert_eq!(report.requeued, 1);
		match rx.try_recv().unwrap() {
			WorkItem::Request(id) => assert_eq!(id, "stuck"),
			other => panic!("unexpected work item: {:?}", other),
		}
	}

	#[tokio::test]
	async fn blocked_set_is_seeded_and_extended() {
		let (recovery, _storage, _checkpoints, _rx) = service();
		let count = recovery.refresh_blocked_domains().await.unwrap();
		// Defaults plus the configured extra
		assert_eq!(count, default_blocked_domains().len() + 1);
		assert!(recovery.blocked.load().contains("bloqueada.com.br"));
		assert!(recovery.blocked.load().contains("mercadolivre.com.br"));
	}
}
