//! Per-candidate acquisition path.
//!
//! One candidate in, one outcome out: either an accepted observation with
//! its screenshot evidence, or a failure with a reason from the closed
//! enumeration. Steps run in a fixed order and the first failing step
//! decides the reason.

use async_trait::async_trait;
use chrono::Utc;
use quoter_policy::{clean_url, host_of, DomainPolicy, PolicyVerdict};
use quoter_render::{extractor, RenderError, RenderInterface};
use quoter_search::{SearchError, SearchService};
use quoter_types::{
	Candidate, ExtractionMethod, FailureReason, PipelineParams, QuoteSource, QuoteSourceFailure,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Tolerance between extracted and listing price for cross-validation.
const MISMATCH_TOLERANCE: f64 = 0.15;

/// A rejected candidate, before persistence.
#[derive(Debug, Clone)]
pub struct CandidateFailure {
	pub url: String,
	pub domain: String,
	pub reason: FailureReason,
	pub google_price: Option<Decimal>,
	pub extracted_price: Option<Decimal>,
	pub error_message: Option<String>,
}

impl CandidateFailure {
	/// Builds a failure anchored at the candidate's best-known URL.
	fn new(candidate: &Candidate, url: &str, reason: FailureReason) -> Self {
		Self {
			url: url.to_string(),
			domain: host_of(url).unwrap_or_default(),
			reason,
			google_price: Some(candidate.listing_price),
			extracted_price: None,
			error_message: None,
		}
	}

	fn with_message(mut self, message: impl Into<String>) -> Self {
		self.error_message = Some(message.into());
		self
	}

	/// Converts into the persisted diagnostics record.
	pub fn into_record(self, request_id: &str) -> QuoteSourceFailure {
		QuoteSourceFailure {
			request_id: request_id.to_string(),
			url: self.url,
			domain: self.domain,
			google_price: self.google_price,
			extracted_price: self.extracted_price,
			failure_reason: self.reason,
			error_message: self.error_message,
			attempted_at: Utc::now(),
		}
	}
}

/// Trait the block engine dispatches candidates through.
///
/// The engine never sees HTTP or browsers; tests drive it with scripted
/// implementations.
#[async_trait]
pub trait Acquirer: Send + Sync {
	async fn acquire(
		&self,
		candidate: &Candidate,
		accepted_domains: &HashSet<String>,
	) -> Result<QuoteSource, CandidateFailure>;
}

/// Production acquirer: clean → policy → deep-lookup → render → extract →
/// cross-validate.
pub struct CandidateAcquirer {
	request_id: String,
	params: PipelineParams,
	policy: Arc<DomainPolicy>,
	search: Arc<SearchService>,
	render: Arc<dyn RenderInterface>,
	screenshot_dir: PathBuf,
}

impl CandidateAcquirer {
	/// Creates an acquirer bound to one request.
	pub fn new(
		request_id: String,
		params: PipelineParams,
		policy: Arc<DomainPolicy>,
		search: Arc<SearchService>,
		render: Arc<dyn RenderInterface>,
		screenshot_dir: PathBuf,
	) -> Self {
		Self {
			request_id,
			params,
			policy,
			search,
			render,
			screenshot_dir,
		}
	}

	fn screenshot_path(&self, candidate: &Candidate) -> PathBuf {
		self.screenshot_dir
			.join(&self.request_id)
			.join(format!("{:03}.png", candidate.position))
	}

	fn map_render_error(e: &RenderError) -> FailureReason {
		match e {
			RenderError::LoadTimeout => FailureReason::Timeout,
			RenderError::Navigation(_) => FailureReason::PageLoadError,
			RenderError::BlockedBySite => FailureReason::BlockedBySite,
			RenderError::Screenshot(_) => FailureReason::ScreenshotError,
			RenderError::Browser(_) | RenderError::Configuration(_) => FailureReason::Other,
		}
	}
}

#[async_trait]
impl Acquirer for CandidateAcquirer {
	#[tracing::instrument(skip_all, fields(request_id = %quoter_types::truncate_id(&self.request_id), position = candidate.position))]
	async fn acquire(
		&self,
		candidate: &Candidate,
		accepted_domains: &HashSet<String>,
	) -> Result<QuoteSource, CandidateFailure> {
		// Clean the candidate URL before anything touches it
		let candidate_url = candidate
			.product_link
			.as_deref()
			.map(clean_url)
			.unwrap_or_default();

		// Pre-check saves the deep-lookup call on hopeless candidates
		if !candidate_url.is_empty() {
			if let PolicyVerdict::Rejected(reason) =
				self.policy.check(&candidate_url, accepted_domains)
			{
				return Err(CandidateFailure::new(candidate, &candidate_url, reason));
			}
		}

		// Resolve a concrete store offer
		let offer = match self
			.search
			.resolve_offer(
				candidate,
				self.params.deep_lookup_retries,
				&self.policy,
				accepted_domains,
			)
			.await
		{
			Ok(Some(offer)) => offer,
			Ok(None) => {
				return Err(CandidateFailure::new(
					candidate,
					&candidate_url,
					FailureReason::NoStoreLink,
				));
			},
			Err(e @ (SearchError::Network(_) | SearchError::Exhausted(_))) => {
				return Err(CandidateFailure::new(
					candidate,
					&candidate_url,
					FailureReason::NetworkError,
				)
				.with_message(e.to_string()));
			},
			Err(e) => {
				return Err(CandidateFailure::new(
					candidate,
					&candidate_url,
					FailureReason::Other,
				)
				.with_message(e.to_string()));
			},
		};

		let offer_url = clean_url(&offer.link);
		let domain = host_of(&offer_url).unwrap_or_default();

		// With mismatch validation disabled the listing price is the
		// observation and render/extract are skipped
		if !self.params.enable_price_mismatch_validation {
			return Ok(QuoteSource {
				request_id: self.request_id.clone(),
				url: offer_url,
				domain,
				page_title: Some(candidate.title.clone()),
				price_value: candidate.listing_price,
				currency: "BRL".to_string(),
				extraction_method: ExtractionMethod::GoogleShopping,
				screenshot_file: None,
				captured_at: Utc::now(),
				is_accepted: true,
				failure_reason: None,
			});
		}

		let screenshot_path = self.screenshot_path(candidate);
		if let Some(parent) = screenshot_path.parent() {
			if let Err(e) = tokio::fs::create_dir_all(parent).await {
				return Err(CandidateFailure::new(
					candidate,
					&offer_url,
					FailureReason::ScreenshotError,
				)
				.with_message(e.to_string()));
			}
		}

		let page = match self.render.render(&offer_url, &screenshot_path).await {
			Ok(page) => page,
			Err(e) => {
				return Err(CandidateFailure::new(
					candidate,
					&offer_url,
					Self::map_render_error(&e),
				)
				.with_message(e.to_string()));
			},
		};

		let (extracted, method) = match extractor::extract_price(&page) {
			Some(found) => found,
			None => {
				return Err(CandidateFailure::new(
					candidate,
					&offer_url,
					FailureReason::PriceExtractionFailed,
				));
			},
		};
		if extracted <= Decimal::ZERO {
			return Err(CandidateFailure::new(
				candidate,
				&offer_url,
				FailureReason::InvalidPrice,
			));
		}

		// Cross-validate against the listing price
		let listing = candidate.listing_price;
		let tolerance = listing
			* Decimal::from_f64_retain(MISMATCH_TOLERANCE).unwrap_or_default();
		if (extracted - listing).abs() > tolerance {
			let mut failure =
				CandidateFailure::new(candidate, &offer_url, FailureReason::PriceMismatch);
			failure.extracted_price = Some(extracted);
			return Err(failure);
		}

		tracing::info!(url = %offer_url, price = %extracted, method = ?method, "Accepted observation");

		Ok(QuoteSource {
			request_id: self.request_id.clone(),
			url: offer_url,
			domain,
			page_title: page.title.clone(),
			price_value: extracted,
			currency: "BRL".to_string(),
			extraction_method: method,
			screenshot_file: Some(screenshot_path.to_string_lossy().into_owned()),
			captured_at: Utc::now(),
			is_accepted: true,
			failure_reason: None,
		})
	}
}
