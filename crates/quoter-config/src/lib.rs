//! Configuration module for the quotation pipeline.
//!
//! This module provides structures and utilities for managing pipeline
//! configuration. It supports loading configuration from TOML files and
//! provides validation to ensure all required values are properly set.

use quoter_types::PipelineParams;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the quotation pipeline service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Defaults applied to requests that do not carry project overrides.
	#[serde(default)]
	pub pipeline: PipelineConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Configuration for the shopping-search provider.
	pub search: SearchConfig,
	/// Configuration for the render engine.
	pub render: RenderConfig,
	/// Domain-policy knobs.
	#[serde(default)]
	pub policy: PolicyConfig,
	/// Recovery-loop knobs.
	#[serde(default)]
	pub recovery: RecoveryConfig,
	/// Batch-orchestration knobs.
	#[serde(default)]
	pub batch: BatchConfig,
	/// Configuration for the external query-analyzer service.
	pub analyzer: Option<AnalyzerConfig>,
	/// Configuration for the external vehicle-price service.
	pub fipe: Option<FipeConfig>,
	/// Configuration for artifact emission.
	#[serde(default)]
	pub artifacts: ArtifactsConfig,
	/// Configuration for the HTTP control surface.
	pub api: Option<ApiConfig>,
}

/// Configuration for the external query-analyzer service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
	/// Endpoint that accepts the item input and returns the analysis.
	pub url: String,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
}

/// Configuration for the external vehicle-price service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FipeConfig {
	/// Endpoint that resolves a vehicle analysis to an official price.
	pub url: String,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
}

/// Configuration for artifact emission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactsConfig {
	/// Directory completed bundles are written under for the report
	/// builder.
	#[serde(default = "default_artifacts_dir")]
	pub output_dir: String,
}

fn default_artifacts_dir() -> String {
	"./artifacts".to_string()
}

impl Default for ArtifactsConfig {
	fn default() -> Self {
		Self {
			output_dir: default_artifacts_dir(),
		}
	}
}

/// Default processing parameters and worker identity settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
	/// Target number of accepted observations per request.
	#[serde(default = "default_target_sources")]
	pub target_sources: usize,
	/// Soft cap on observations persisted per request.
	#[serde(default = "default_max_stored_per_item")]
	pub max_stored_per_item: usize,
	/// Maximum accepted price spread, in percent.
	#[serde(default = "default_variation_max_pct")]
	pub variation_max_pct: f64,
	/// Ceiling on candidates kept from the shopping search.
	#[serde(default = "default_max_valid_products")]
	pub max_valid_products: usize,
	/// Ceiling on block-engine iterations.
	#[serde(default = "default_max_block_iterations")]
	pub max_block_iterations: u32,
	/// Retry budget for search and deep-lookup calls.
	#[serde(default = "default_deep_lookup_retries")]
	pub deep_lookup_retries: u32,
	/// Cross-check extracted prices against listing prices.
	#[serde(default = "default_true")]
	pub enable_price_mismatch_validation: bool,
	/// Location forwarded to the shopping search.
	#[serde(default = "default_location")]
	pub location: String,
	/// Directory screenshots are written under.
	#[serde(default = "default_screenshot_dir")]
	pub screenshot_dir: String,
	/// Number of request workers pulling from the queue.
	#[serde(default = "default_workers")]
	pub workers: usize,
}

fn default_target_sources() -> usize {
	3
}

fn default_max_stored_per_item() -> usize {
	10
}

fn default_variation_max_pct() -> f64 {
	25.0
}

fn default_max_valid_products() -> usize {
	150
}

fn default_max_block_iterations() -> u32 {
	15
}

fn default_deep_lookup_retries() -> u32 {
	3
}

fn default_true() -> bool {
	true
}

fn default_location() -> String {
	"Brazil".to_string()
}

fn default_screenshot_dir() -> String {
	"./screenshots".to_string()
}

fn default_workers() -> usize {
	2
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			target_sources: default_target_sources(),
			max_stored_per_item: default_max_stored_per_item(),
			variation_max_pct: default_variation_max_pct(),
			max_valid_products: default_max_valid_products(),
			max_block_iterations: default_max_block_iterations(),
			deep_lookup_retries: default_deep_lookup_retries(),
			enable_price_mismatch_validation: default_true(),
			location: default_location(),
			screenshot_dir: default_screenshot_dir(),
			workers: default_workers(),
		}
	}
}

impl PipelineConfig {
	/// Resolves the frozen per-request parameters from these defaults.
	pub fn to_params(&self) -> PipelineParams {
		PipelineParams {
			target_sources: self.target_sources,
			max_stored_per_item: self.max_stored_per_item,
			variation_max_pct: Decimal::from_f64_retain(self.variation_max_pct)
				.unwrap_or_else(|| Decimal::from(25)),
			max_valid_products: self.max_valid_products,
			max_block_iterations: self.max_block_iterations,
			deep_lookup_retries: self.deep_lookup_retries,
			enable_price_mismatch_validation: self.enable_price_mismatch_validation,
			location: self.location.clone(),
			country: "br".to_string(),
			language: "pt-br".to_string(),
		}
	}
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	#[serde(default = "default_cleanup_interval")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval() -> u64 {
	3600
}

/// Configuration for the shopping-search provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
	/// Which provider implementation to use.
	pub provider: String,
	/// Map of provider names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the render engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
	/// Which render implementation to use.
	pub engine: String,
	/// Map of engine names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Domain-policy knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
	/// Refresh interval for the blocked-domain snapshot, in seconds.
	#[serde(default = "default_policy_refresh")]
	pub refresh_interval_seconds: u64,
	/// Additional blocked domains merged into the stored set.
	#[serde(default)]
	pub extra_blocked: Vec<String>,
}

fn default_policy_refresh() -> u64 {
	60
}

impl Default for PolicyConfig {
	fn default() -> Self {
		Self {
			refresh_interval_seconds: default_policy_refresh(),
			extra_blocked: Vec::new(),
		}
	}
}

/// Recovery-loop knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
	/// How often the recovery task scans for stuck requests, in seconds.
	#[serde(default = "default_scan_interval")]
	pub scan_interval_seconds: u64,
	/// Minutes without a heartbeat before a request counts as stuck.
	#[serde(default = "default_heartbeat_timeout")]
	pub heartbeat_timeout_minutes: u64,
	/// Hard ceiling on total processing time, in hours.
	#[serde(default = "default_max_processing")]
	pub max_processing_hours: u64,
}

fn default_scan_interval() -> u64 {
	120
}

fn default_heartbeat_timeout() -> u64 {
	10
}

fn default_max_processing() -> u64 {
	24
}

impl Default for RecoveryConfig {
	fn default() -> Self {
		Self {
			scan_interval_seconds: default_scan_interval(),
			heartbeat_timeout_minutes: default_heartbeat_timeout(),
			max_processing_hours: default_max_processing(),
		}
	}
}

/// Batch-orchestration knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
	/// Number of requests a batch processes concurrently.
	#[serde(default = "default_batch_concurrency")]
	pub concurrency: usize,
}

fn default_batch_concurrency() -> usize {
	3
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			concurrency: default_batch_concurrency(),
		}
	}
}

/// Configuration for the HTTP control surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	8080
}

fn default_api_timeout() -> u64 {
	30
}

impl Config {
	/// Loads configuration from a TOML file.
	pub fn from_file(path: &str) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;
		content.parse()
	}

	/// Validates cross-section consistency.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.pipeline.target_sources == 0 {
			return Err(ConfigError::Validation(
				"pipeline.target_sources must be at least 1".into(),
			));
		}
		if self.pipeline.variation_max_pct < 0.0 {
			return Err(ConfigError::Validation(
				"pipeline.variation_max_pct must not be negative".into(),
			));
		}
		if self.pipeline.max_stored_per_item < self.pipeline.target_sources {
			return Err(ConfigError::Validation(
				"pipeline.max_stored_per_item must not be below target_sources".into(),
			));
		}
		if self.pipeline.workers == 0 {
			return Err(ConfigError::Validation(
				"pipeline.workers must be at least 1".into(),
			));
		}
		if !self.storage.implementations.contains_key(&self.storage.primary) {
			return Err(ConfigError::Validation(format!(
				"storage.primary '{}' has no matching implementation block",
				self.storage.primary
			)));
		}
		if !self.search.implementations.contains_key(&self.search.provider) {
			return Err(ConfigError::Validation(format!(
				"search.provider '{}' has no matching implementation block",
				self.search.provider
			)));
		}
		if !self.render.implementations.contains_key(&self.render.engine) {
			return Err(ConfigError::Validation(format!(
				"render.engine '{}' has no matching implementation block",
				self.render.engine
			)));
		}
		if self.batch.concurrency == 0 {
			return Err(ConfigError::Validation(
				"batch.concurrency must be at least 1".into(),
			));
		}
		Ok(())
	}
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let config: Config = toml::from_str(s)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
		[storage]
		primary = "memory"
		[storage.implementations.memory]

		[search]
		provider = "serpapi"
		[search.implementations.serpapi]
		api_key = "test"

		[render]
		engine = "chromium"
		[render.implementations.chromium]
	"#;

	#[test]
	fn minimal_config_applies_defaults() {
		let config: Config = MINIMAL.parse().unwrap();
		assert_eq!(config.pipeline.target_sources, 3);
		assert_eq!(config.pipeline.variation_max_pct, 25.0);
		assert_eq!(config.pipeline.max_valid_products, 150);
		assert_eq!(config.recovery.heartbeat_timeout_minutes, 10);
		assert_eq!(config.batch.concurrency, 3);
		assert!(config.api.is_none());
	}

	#[test]
	fn params_resolution_freezes_defaults() {
		let config: Config = MINIMAL.parse().unwrap();
		let params = config.pipeline.to_params();
		assert_eq!(params.target_sources, 3);
		assert_eq!(params.variation_max_pct, Decimal::from(25));
		assert_eq!(params.country, "br");
		assert_eq!(params.language, "pt-br");
	}

	#[test]
	fn unknown_primary_is_rejected() {
		let bad = MINIMAL.replace("primary = \"memory\"", "primary = \"postgres\"");
		let err = bad.parse::<Config>().unwrap_err();
		assert!(matches!(err, ConfigError::Validation(_)));
	}

	#[test]
	fn zero_targets_rejected() {
		let bad = format!("[pipeline]\ntarget_sources = 0\n{}", MINIMAL);
		let err = bad.parse::<Config>().unwrap_err();
		assert!(matches!(err, ConfigError::Validation(_)));
	}
}
