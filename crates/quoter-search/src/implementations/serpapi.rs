//! SerpApi-backed shopping search and deep-lookup.
//!
//! One `google_shopping` search per request plus one product call per
//! candidate that carries a deep-lookup handle. Rate limiting (429) and
//! transient 5xx responses are retried with exponential backoff and
//! jitter, capped by the per-request retry budget.

use crate::{SearchError, SearchInterface, SearchRequest};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use quoter_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::future::Future;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://serpapi.com/search.json";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Shopping-search provider backed by SerpApi.
pub struct SerpApiSearch {
	client: reqwest::Client,
	api_key: String,
	base_url: String,
}

impl SerpApiSearch {
	/// Creates a provider with the given credentials.
	pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self, SearchError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| SearchError::Configuration(e.to_string()))?;
		Ok(Self {
			client,
			api_key,
			base_url,
		})
	}

	/// Executes one HTTP call, classifying the status for retry routing.
	async fn execute(&self, url: &str, query: &[(&str, &str)]) -> Result<serde_json::Value, SearchError> {
		let response = self
			.client
			.get(url)
			.query(query)
			.query(&[("api_key", self.api_key.as_str())])
			.send()
			.await
			.map_err(|e| SearchError::Network(e.to_string()))?;

		let status = response.status();
		if status.as_u16() == 429 {
			return Err(SearchError::RateLimited);
		}
		if status.is_server_error() {
			return Err(SearchError::Upstream(format!("HTTP {}", status)));
		}
		if !status.is_success() {
			return Err(SearchError::Status(status.as_u16()));
		}

		response
			.json::<serde_json::Value>()
			.await
			.map_err(|e| SearchError::Parse(e.to_string()))
	}

	/// Retries an operation on 429/5xx with exponential backoff.
	///
	/// The first delay is 2 s; jitter comes from the backoff policy. Any
	/// other failure is returned immediately.
	async fn with_retries<F, Fut>(&self, retries: u32, op: F) -> Result<serde_json::Value, SearchError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<serde_json::Value, SearchError>>,
	{
		let mut policy = ExponentialBackoff {
			initial_interval: Duration::from_secs(2),
			..ExponentialBackoff::default()
		};
		let attempts = retries.max(1);
		let mut attempt = 0;
		loop {
			attempt += 1;
			match op().await {
				Ok(value) => return Ok(value),
				Err(e @ (SearchError::RateLimited | SearchError::Upstream(_))) => {
					if attempt >= attempts {
						return Err(SearchError::Exhausted(e.to_string()));
					}
					let delay = policy
						.next_backoff()
						.unwrap_or_else(|| Duration::from_secs(2));
					tracing::warn!(
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Search call failed, backing off"
					);
					tokio::time::sleep(delay).await;
				},
				Err(e) => return Err(e),
			}
		}
	}
}

#[async_trait]
impl SearchInterface for SerpApiSearch {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(SerpApiSchema)
	}

	async fn shopping_search(
		&self,
		request: &SearchRequest,
	) -> Result<serde_json::Value, SearchError> {
		let num = request.num.to_string();
		self.with_retries(request.retries, || {
			let params: Vec<(&str, &str)> = vec![
				("engine", "google_shopping"),
				("q", &request.query),
				("gl", &request.country),
				("hl", &request.language),
				("google_domain", "google.com.br"),
				("num", &num),
				("location", &request.location),
			];
			async move { self.execute(&self.base_url, &params).await }
		})
		.await
	}

	async fn deep_lookup(
		&self,
		handle_url: &str,
		retries: u32,
	) -> Result<serde_json::Value, SearchError> {
		self.with_retries(retries, || async move {
			self.execute(handle_url, &[]).await
		})
		.await
	}
}

/// Configuration schema for the SerpApi provider.
pub struct SerpApiSchema;

impl SerpApiSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		let instance = Self;
		instance.validate(config)
	}
}

impl ConfigSchema for SerpApiSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("api_key", FieldType::String)],
			vec![
				Field::new("base_url", FieldType::String),
				Field::new(
					"timeout_seconds",
					FieldType::Integer {
						min: Some(1),
						max: Some(300),
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a SerpApi provider from configuration.
///
/// Configuration parameters:
/// - `api_key`: SerpApi key (required)
/// - `base_url`: Override for the search endpoint
/// - `timeout_seconds`: HTTP timeout (default: 30)
pub fn create_search(config: &toml::Value) -> Result<Box<dyn SearchInterface>, SearchError> {
	SerpApiSchema::validate_config(config)
		.map_err(|e| SearchError::Configuration(format!("Invalid configuration: {}", e)))?;

	let api_key = config
		.get("api_key")
		.and_then(|v| v.as_str())
		.ok_or_else(|| SearchError::Configuration("api_key is required".into()))?
		.to_string();
	let base_url = config
		.get("base_url")
		.and_then(|v| v.as_str())
		.unwrap_or(DEFAULT_BASE_URL)
		.to_string();
	let timeout = config
		.get("timeout_seconds")
		.and_then(|v| v.as_integer())
		.map(|v| Duration::from_secs(v as u64))
		.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

	Ok(Box::new(SerpApiSearch::new(api_key, base_url, timeout)?))
}

/// Registry for the SerpApi search implementation.
pub struct Registry;

impl quoter_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "serpapi";
	type Factory = crate::SearchFactory;

	fn factory() -> Self::Factory {
		create_search
	}
}

impl crate::SearchProviderRegistry for Registry {}
