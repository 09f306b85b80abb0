//! Shopping-search module for the quotation pipeline.
//!
//! This module handles candidate discovery through an external shopping
//! search and the per-candidate deep-lookup that resolves concrete store
//! offers. Providers return raw response JSON; the transformation into the
//! canonical candidate list (merge, filter, sort, truncate) is shared by
//! all providers and lives in this crate.

use async_trait::async_trait;
use quoter_policy::DomainPolicy;
use quoter_types::{Candidate, ConfigSchema, ImplementationRegistry, PipelineParams, StoreOffer};
use std::collections::HashSet;
use thiserror::Error;

pub mod candidates;
pub mod offers;

/// Re-export implementations
pub mod implementations {
	pub mod serpapi;
}

/// Errors that can occur during search operations.
#[derive(Debug, Error)]
pub enum SearchError {
	/// The provider answered 429; retried with backoff upstream.
	#[error("Rate limited")]
	RateLimited,
	/// Transient server-side failure, retryable.
	#[error("Upstream error: {0}")]
	Upstream(String),
	/// Transport-level failure talking to the provider.
	#[error("Network error: {0}")]
	Network(String),
	/// Non-retryable HTTP failure (4xx other than 429).
	#[error("HTTP {0}")]
	Status(u16),
	/// The response body could not be interpreted.
	#[error("Parse error: {0}")]
	Parse(String),
	/// The retry budget was exhausted without a usable response.
	#[error("Retries exhausted: {0}")]
	Exhausted(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Locale and sizing parameters for one shopping-search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
	/// Query string produced by the analyzer.
	pub query: String,
	/// Country code (`gl`).
	pub country: String,
	/// Interface language (`hl`).
	pub language: String,
	/// Configured searcher location.
	pub location: String,
	/// Result page size; fixed at 100 by the pipeline.
	pub num: u32,
	/// Retry budget for this call.
	pub retries: u32,
}

impl SearchRequest {
	/// Builds the request for a query under frozen pipeline parameters.
	pub fn from_params(query: &str, params: &PipelineParams) -> Self {
		Self {
			query: query.to_string(),
			country: params.country.clone(),
			language: params.language.clone(),
			location: params.location.clone(),
			num: 100,
			retries: params.deep_lookup_retries,
		}
	}
}

/// Trait defining the interface for shopping-search providers.
///
/// Implementations own transport, authentication, and retry; they return
/// the raw response JSON so it can be persisted verbatim for diagnostics
/// and resumption.
#[async_trait]
pub trait SearchInterface: Send + Sync {
	/// Returns the configuration schema for this provider.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Issues one shopping-search call and returns the raw response JSON.
	async fn shopping_search(
		&self,
		request: &SearchRequest,
	) -> Result<serde_json::Value, SearchError>;

	/// Resolves concrete store offers for a candidate's deep-lookup handle.
	async fn deep_lookup(
		&self,
		handle_url: &str,
		retries: u32,
	) -> Result<serde_json::Value, SearchError>;
}

/// Type alias for search factory functions.
pub type SearchFactory = fn(&toml::Value) -> Result<Box<dyn SearchInterface>, SearchError>;

/// Registry trait for search implementations.
pub trait SearchProviderRegistry: ImplementationRegistry<Factory = SearchFactory> {}

/// Get all registered search implementations.
pub fn get_all_implementations() -> Vec<(&'static str, SearchFactory)> {
	use implementations::serpapi;

	vec![(serpapi::Registry::NAME, serpapi::Registry::factory())]
}

/// High-level search service shared by the orchestrator.
pub struct SearchService {
	provider: Box<dyn SearchInterface>,
}

impl SearchService {
	/// Creates a new SearchService over the configured provider.
	pub fn new(provider: Box<dyn SearchInterface>) -> Self {
		Self { provider }
	}

	/// Issues the single shopping-search call for a request and derives the
	/// canonical candidate list.
	///
	/// Returns the raw response (persisted by the caller) together with the
	/// filtered, price-sorted, truncated candidates.
	pub async fn search(
		&self,
		request: &SearchRequest,
		policy: &DomainPolicy,
		max_valid_products: usize,
	) -> Result<(serde_json::Value, Vec<Candidate>), SearchError> {
		let raw = self.provider.shopping_search(request).await?;
		let candidates = candidates::derive_candidates(&raw, policy, max_valid_products);
		tracing::info!(
			query = %request.query,
			candidates = candidates.len(),
			"Shopping search complete"
		);
		Ok((raw, candidates))
	}

	/// Re-derives candidates from a previously persisted raw response.
	///
	/// Resumption replays this instead of calling the provider again, so a
	/// resumed run sees the identical candidate ordering.
	pub fn candidates_from_raw(
		&self,
		raw: &serde_json::Value,
		policy: &DomainPolicy,
		max_valid_products: usize,
	) -> Vec<Candidate> {
		candidates::derive_candidates(raw, policy, max_valid_products)
	}

	/// Resolves the best store offer for a candidate.
	///
	/// Offers failing the 15% listing tolerance are discarded; the first
	/// remaining offer whose domain passes policy wins. A candidate without
	/// a deep-lookup handle falls back to its product link at the listing
	/// price.
	pub async fn resolve_offer(
		&self,
		candidate: &Candidate,
		retries: u32,
		policy: &DomainPolicy,
		accepted_domains: &HashSet<String>,
	) -> Result<Option<StoreOffer>, SearchError> {
		let offers = match &candidate.deep_lookup_url {
			Some(handle) => {
				let raw = self.provider.deep_lookup(handle, retries).await?;
				offers::parse_offers(&raw)
			},
			None => match &candidate.product_link {
				Some(link) => vec![StoreOffer {
					name: candidate.source_name.clone(),
					link: link.clone(),
					price: candidate.listing_price,
				}],
				None => Vec::new(),
			},
		};

		Ok(offers::select_offer(
			offers,
			candidate.listing_price,
			policy,
			accepted_domains,
		))
	}
}
