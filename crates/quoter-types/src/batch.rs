//! Batch processing types for multi-item quotation runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
	/// Items are still being dispatched or processed.
	Processing,
	/// Every item finished without a fatal failure.
	Completed,
	/// Some items succeeded and some failed.
	PartiallyCompleted,
	/// Every item failed.
	Error,
	/// Operator aborted the batch.
	Cancelled,
}

/// A batch of quote requests processed under one project.
///
/// The batch weakly references its requests: each item is a full
/// `QuoteRequest` that can also exist outside any batch. Completion
/// counters are recomputed from the children, never mutated directly, so
/// they converge after partial runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
	/// Unique identifier for this batch.
	pub id: String,
	/// Current batch status.
	pub status: BatchStatus,
	/// Total number of items in the batch.
	pub total_items: usize,
	/// Items that reached `Done` or `AwaitingReview`.
	pub completed_items: usize,
	/// Items that reached `Error`.
	pub failed_items: usize,
	/// Highest `batch_index` whose processing has finished; resumption
	/// skips indices at or below this.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_processed_index: Option<usize>,
	/// Ids of the member requests, in `batch_index` order.
	pub request_ids: Vec<String>,
	/// Timestamp when this batch was created.
	pub created_at: DateTime<Utc>,
	/// Timestamp when the batch reached a terminal status.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
	/// Derives the terminal status from completion counters.
	pub fn terminal_status(completed: usize, failed: usize, total: usize) -> BatchStatus {
		if failed == 0 && completed == total {
			BatchStatus::Completed
		} else if completed == 0 && failed > 0 {
			BatchStatus::Error
		} else {
			BatchStatus::PartiallyCompleted
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_status_derivation() {
		assert_eq!(BatchJob::terminal_status(5, 0, 5), BatchStatus::Completed);
		assert_eq!(BatchJob::terminal_status(0, 5, 5), BatchStatus::Error);
		assert_eq!(
			BatchJob::terminal_status(3, 2, 5),
			BatchStatus::PartiallyCompleted
		);
	}
}
