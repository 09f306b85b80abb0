//! Event types for inter-service communication.
//!
//! Events flow through a broadcast bus so that observers (the API, the
//! batch orchestrator, logging) can react to pipeline progress without
//! coupling to the orchestrator internals.

use crate::{BatchStatus, FailureReason, ProcessingCheckpoint, QuoteStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main event type encompassing all pipeline events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
	/// Events about the lifecycle of a single request.
	Request(RequestEvent),
	/// Events about individual acquisition attempts.
	Acquisition(AcquisitionEvent),
	/// Events about batch progress.
	Batch(BatchEvent),
}

/// Events about the lifecycle of a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestEvent {
	/// A worker claimed the request and started processing.
	Started { request_id: String, attempt: u32 },
	/// A checkpoint was persisted.
	CheckpointSaved {
		request_id: String,
		checkpoint: ProcessingCheckpoint,
	},
	/// The request reached a terminal status.
	Completed {
		request_id: String,
		status: QuoteStatus,
	},
	/// The request failed fatally.
	Failed {
		request_id: String,
		message: String,
	},
}

/// Events about individual acquisition attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AcquisitionEvent {
	/// A candidate produced an accepted observation.
	Accepted {
		request_id: String,
		url: String,
		price: Decimal,
	},
	/// A candidate was rejected.
	Rejected {
		request_id: String,
		url: String,
		reason: FailureReason,
	},
}

/// Events about batch progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchEvent {
	/// One batch item reached a terminal status.
	ItemCompleted {
		batch_id: String,
		index: usize,
		status: QuoteStatus,
	},
	/// The whole batch reached a terminal status.
	Completed {
		batch_id: String,
		status: BatchStatus,
	},
}
