//! Quote request and observation types.
//!
//! This module defines the central entities of the pipeline: the request
//! being processed, the accepted price observations it accumulates, and the
//! rejected attempts retained for diagnostics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single quotation request moving through the pipeline.
///
/// A request is created by the API, claimed by exactly one worker at a time,
/// and advances through checkpoints until it reaches a terminal status. All
/// processing parameters are resolved when the request is enqueued and stay
/// frozen for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
	/// Unique identifier for this request.
	pub id: String,
	/// Timestamp when this request was created.
	pub created_at: DateTime<Utc>,
	/// Free-text description of the item, if provided.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_text: Option<String>,
	/// Stored file reference for an item photo, if provided.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_image: Option<String>,
	/// Which of the two inputs drives the analysis.
	pub input_type: InputType,
	/// Asset code in the requesting institution's inventory.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub item_code: Option<String>,
	/// Project supplying the processing parameters.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	/// Parameters resolved at enqueue time, frozen for this request.
	pub params: PipelineParams,
	/// Current lifecycle status.
	pub status: QuoteStatus,
	/// Last completed processing checkpoint.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub checkpoint: Option<ProcessingCheckpoint>,
	/// Coarse progress indicator, 0-100.
	#[serde(default)]
	pub progress_pct: u8,
	/// Timestamp the owning worker last proved it is alive.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_heartbeat: Option<DateTime<Utc>>,
	/// Identifier of the worker currently processing this request.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub worker_id: Option<String>,
	/// Number of processing attempts, starting at 1.
	#[serde(default = "default_attempt_number")]
	pub attempt_number: u32,
	/// Timestamp processing first started.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	/// Timestamp a terminal checkpoint was reached.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
	/// Free-form per-stage state used to resume after a crash.
	#[serde(default)]
	pub resume_data: HashMap<String, serde_json::Value>,
	/// Raw query-analysis payload, persisted for resumption.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub analysis_json: Option<serde_json::Value>,
	/// Raw shopping-search response, persisted for diagnostics and resumption.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub search_response_json: Option<serde_json::Value>,
	/// Price aggregates computed at finalization.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub aggregates: Option<QuoteAggregates>,
	/// Error description when the request ends in `Error`.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	/// Reference to the generated report artifact.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub report_file: Option<String>,
	/// Owning batch, when this request is part of one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch_id: Option<String>,
	/// Position of this request inside its batch.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch_index: Option<usize>,
}

fn default_attempt_number() -> u32 {
	1
}

impl QuoteRequest {
	/// Creates a new request in `Processing` with defaulted execution state.
	pub fn new(id: String, input_type: InputType, params: PipelineParams) -> Self {
		Self {
			id,
			created_at: Utc::now(),
			input_text: None,
			input_image: None,
			input_type,
			item_code: None,
			project_id: None,
			params,
			status: QuoteStatus::Processing,
			checkpoint: None,
			progress_pct: 0,
			last_heartbeat: None,
			worker_id: None,
			attempt_number: 1,
			started_at: None,
			completed_at: None,
			resume_data: HashMap::new(),
			analysis_json: None,
			search_response_json: None,
			aggregates: None,
			error_message: None,
			report_file: None,
			batch_id: None,
			batch_index: None,
		}
	}

	/// Whether this request has reached a terminal status.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self.status,
			QuoteStatus::Done
				| QuoteStatus::AwaitingReview
				| QuoteStatus::Error
				| QuoteStatus::Cancelled
		)
	}
}

/// Which input channel produced the item description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
	/// Free-text item description.
	Text,
	/// Item photo to be analyzed.
	Image,
}

/// Lifecycle status of a quote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
	/// A worker owns the request and is advancing it.
	Processing,
	/// Finished with at least one observation, but short of the target
	/// count or outside the variation tolerance.
	AwaitingReview,
	/// Finished with the target number of observations within tolerance.
	Done,
	/// Fatal failure; `error_message` carries the cause.
	Error,
	/// Operator aborted; honored at the next checkpoint boundary.
	Cancelled,
}

/// Named progress markers stored alongside a request.
///
/// The ordering of variants is the canonical stage order; resumption picks
/// a checkpoint and replays the pipeline from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingCheckpoint {
	Init,
	AiAnalysisStart,
	AiAnalysisDone,
	FipeSearch,
	FipeDone,
	ShoppingSearchStart,
	ShoppingSearchDone,
	PriceExtractionStart,
	PriceExtractionProgress,
	PriceExtractionDone,
	Finalization,
	Completed,
}

/// Processing parameters resolved at enqueue time.
///
/// Typically sourced from the owning project's configuration; frozen for
/// the lifetime of the request so a resumed run sees identical knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParams {
	/// Target number of accepted observations (N).
	pub target_sources: usize,
	/// Soft cap on observations finalization will persist.
	pub max_stored_per_item: usize,
	/// Maximum accepted spread, `(max/min - 1) * 100`.
	pub variation_max_pct: Decimal,
	/// Ceiling on candidates kept from the shopping search.
	pub max_valid_products: usize,
	/// Ceiling on block-engine iterations before best-effort exit.
	pub max_block_iterations: u32,
	/// Retry budget for search and deep-lookup calls.
	pub deep_lookup_retries: u32,
	/// When set, extracted prices are cross-checked against listing prices.
	pub enable_price_mismatch_validation: bool,
	/// Location parameter forwarded to the shopping search.
	pub location: String,
	/// Country code for search locale parameters.
	pub country: String,
	/// Interface language for search locale parameters.
	pub language: String,
}

impl Default for PipelineParams {
	fn default() -> Self {
		Self {
			target_sources: 3,
			max_stored_per_item: 10,
			variation_max_pct: Decimal::from(25),
			max_valid_products: 150,
			max_block_iterations: 15,
			deep_lookup_retries: 3,
			enable_price_mismatch_validation: true,
			location: "Brazil".to_string(),
			country: "br".to_string(),
			language: "pt-br".to_string(),
		}
	}
}

/// Price aggregates over the accepted observations of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteAggregates {
	pub valor_min: Decimal,
	pub valor_max: Decimal,
	pub valor_avg: Decimal,
	/// `(valor_max / valor_min - 1) * 100`.
	pub variation_pct: Decimal,
}

impl QuoteAggregates {
	/// Computes aggregates over a non-empty slice of prices.
	///
	/// Returns `None` for an empty slice or a non-positive minimum.
	pub fn compute(prices: &[Decimal]) -> Option<Self> {
		let min = prices.iter().min().copied()?;
		let max = prices.iter().max().copied()?;
		if min <= Decimal::ZERO {
			return None;
		}
		let sum: Decimal = prices.iter().sum();
		let avg = sum / Decimal::from(prices.len() as u64);
		let variation_pct = (max / min - Decimal::ONE) * Decimal::from(100);
		Some(Self {
			valor_min: min,
			valor_max: max,
			valor_avg: avg,
			variation_pct,
		})
	}
}

/// One accepted price observation backing a quotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSource {
	/// Request this observation belongs to.
	pub request_id: String,
	/// Cleaned store URL the price was captured from.
	pub url: String,
	/// Host of `url`; at most one accepted observation per domain.
	pub domain: String,
	/// Title of the rendered store page, when available.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub page_title: Option<String>,
	/// Captured price.
	pub price_value: Decimal,
	/// ISO currency code; always BRL for this pipeline.
	pub currency: String,
	/// Strategy that produced the price.
	pub extraction_method: ExtractionMethod,
	/// Stored screenshot evidence for the report.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub screenshot_file: Option<String>,
	/// Timestamp of capture.
	pub captured_at: DateTime<Utc>,
	/// Whether this observation counts toward the target.
	pub is_accepted: bool,
	/// Populated on rejected observations kept for diagnostics.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failure_reason: Option<FailureReason>,
}

/// A rejected acquisition attempt, retained for diagnostics.
///
/// No failure information is discarded: every candidate the engine gives up
/// on leaves exactly one of these behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSourceFailure {
	/// Request the attempt belonged to.
	pub request_id: String,
	/// Candidate URL at the time of the attempt.
	pub url: String,
	/// Host of `url`.
	pub domain: String,
	/// Listing price reported by the shopping search.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub google_price: Option<Decimal>,
	/// Price extracted from the rendered page, when extraction got that far.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extracted_price: Option<Decimal>,
	/// Why the candidate was rejected.
	pub failure_reason: FailureReason,
	/// Free-form detail accompanying the reason.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	/// Timestamp of the attempt.
	pub attempted_at: DateTime<Utc>,
}

/// How an accepted price was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionMethod {
	/// Structured data (`application/ld+json`) on the store page.
	Jsonld,
	/// Price meta tags on the store page.
	Meta,
	/// DOM heuristics over price-like selectors.
	Dom,
	/// Model-assisted extraction.
	Llm,
	/// Listing price taken directly from the shopping search.
	GoogleShopping,
	/// Official vehicle price table.
	ApiFipe,
}

/// Closed enumeration of per-candidate rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
	/// Deep-lookup produced no acceptable store offer.
	NoStoreLink,
	/// Host is on the blocked-domain list.
	BlockedDomain,
	/// Host is outside Brazil and not an allowlisted manufacturer.
	ForeignDomain,
	/// URL points at a search/category listing, not a product page.
	ListingUrl,
	/// Host already produced an accepted observation for this request.
	DuplicateUrl,
	/// Page load timed out.
	Timeout,
	/// Navigation failed outright.
	PageLoadError,
	/// Screenshot capture failed after a successful load.
	ScreenshotError,
	/// The site served a captcha, a 403, or an empty shell.
	BlockedBySite,
	/// Transport-level failure talking to an external API.
	NetworkError,
	/// All extraction strategies came up empty.
	PriceExtractionFailed,
	/// An extracted value parsed but is not a plausible price.
	InvalidPrice,
	/// Extracted price disagrees with the listing price beyond tolerance.
	PriceMismatch,
	/// Anything not covered by the closed set above.
	Other,
}

impl std::fmt::Display for FailureReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			FailureReason::NoStoreLink => "NO_STORE_LINK",
			FailureReason::BlockedDomain => "BLOCKED_DOMAIN",
			FailureReason::ForeignDomain => "FOREIGN_DOMAIN",
			FailureReason::ListingUrl => "LISTING_URL",
			FailureReason::DuplicateUrl => "DUPLICATE_URL",
			FailureReason::Timeout => "TIMEOUT",
			FailureReason::PageLoadError => "PAGE_LOAD_ERROR",
			FailureReason::ScreenshotError => "SCREENSHOT_ERROR",
			FailureReason::BlockedBySite => "BLOCKED_BY_SITE",
			FailureReason::NetworkError => "NETWORK_ERROR",
			FailureReason::PriceExtractionFailed => "PRICE_EXTRACTION_FAILED",
			FailureReason::InvalidPrice => "INVALID_PRICE",
			FailureReason::PriceMismatch => "PRICE_MISMATCH",
			FailureReason::Other => "OTHER",
		};
		f.write_str(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aggregates_over_scenario_prices() {
		let prices = [
			Decimal::from(100),
			Decimal::from(102),
			Decimal::from(104),
		];
		let agg = QuoteAggregates::compute(&prices).unwrap();
		assert_eq!(agg.valor_min, Decimal::from(100));
		assert_eq!(agg.valor_max, Decimal::from(104));
		assert_eq!(agg.valor_avg, Decimal::from(102));
		assert_eq!(agg.variation_pct, Decimal::from(4));
	}

	#[test]
	fn aggregates_reject_empty_and_non_positive() {
		assert!(QuoteAggregates::compute(&[]).is_none());
		assert!(QuoteAggregates::compute(&[Decimal::ZERO, Decimal::ONE]).is_none());
	}

	#[test]
	fn status_serializes_screaming() {
		let s = serde_json::to_string(&QuoteStatus::AwaitingReview).unwrap();
		assert_eq!(s, "\"AWAITING_REVIEW\"");
		let c = serde_json::to_string(&ProcessingCheckpoint::ShoppingSearchStart).unwrap();
		assert_eq!(c, "\"SHOPPING_SEARCH_START\"");
	}

	#[test]
	fn checkpoint_order_matches_stage_order() {
		assert!(ProcessingCheckpoint::Init < ProcessingCheckpoint::AiAnalysisStart);
		assert!(ProcessingCheckpoint::ShoppingSearchDone < ProcessingCheckpoint::PriceExtractionStart);
		assert!(ProcessingCheckpoint::Finalization < ProcessingCheckpoint::Completed);
	}
}
