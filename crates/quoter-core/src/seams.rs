//! External collaborator seams.
//!
//! The analyzer, the vehicle price table, and the report builder are
//! external systems; the pipeline only depends on these traits. Concrete
//! implementations are injected by the service binary.

use crate::PipelineError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use quoter_types::{QueryAnalysis, QuoteAggregates, QuoteSource, StorageNamespace, VehiclePrice};
use quoter_storage::StorageService;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Input handed to the query analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerInput {
	/// Free-text item description, when the request carries one.
	pub text: Option<String>,
	/// Stored image reference, when the request carries one.
	pub image: Option<String>,
}

/// Produces the search query and item classification for a request.
///
/// Opaque to the pipeline; its raw payload is persisted so a resumed run
/// never re-analyzes.
#[async_trait]
pub trait QueryAnalyzer: Send + Sync {
	async fn analyze(&self, input: AnalyzerInput) -> Result<QueryAnalysis, PipelineError>;
}

/// One official-table vehicle price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FipeQuote {
	/// Normalized `brand/model/year` key.
	pub vehicle_key: String,
	/// Official table price.
	pub price: Decimal,
	/// Reference month of the table.
	pub reference_month: String,
	/// Canonical listing URL for the report.
	pub url: String,
}

/// Vehicle-price lookup against the official table.
#[async_trait]
pub trait FipeProvider: Send + Sync {
	async fn lookup(&self, analysis: &QueryAnalysis) -> Result<FipeQuote, PipelineError>;
}

/// The value handed to the downstream report builder on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBundle {
	/// Request the bundle belongs to.
	pub request_id: String,
	/// Item name as analyzed.
	pub item_name: String,
	/// Asset code, when provided.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub item_code: Option<String>,
	/// Accepted observations with URLs, prices and screenshot paths.
	pub sources: Vec<QuoteSource>,
	/// Price aggregates and variation.
	pub aggregates: Option<QuoteAggregates>,
	/// Searcher location metadata.
	pub location: String,
}

/// Receives completed quotation bundles for report generation.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
	/// Emits a bundle; returns a reference to the generated artifact.
	async fn emit(&self, bundle: ArtifactBundle) -> Result<String, PipelineError>;
}

/// Validity window for cached vehicle prices.
const VEHICLE_PRICE_VALIDITY_DAYS: i64 = 30;

/// Cache of official vehicle prices with a validity window.
///
/// Lookups hit the bank first and fall through to the provider only when
/// the cached entry is missing or expired.
pub struct VehiclePriceBank {
	storage: Arc<StorageService>,
}

impl VehiclePriceBank {
	/// Creates a bank over the shared storage service.
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Returns the cached price for a vehicle key, if still valid.
	pub async fn get(&self, vehicle_key: &str) -> Option<VehiclePrice> {
		let cached: VehiclePrice = self
			.storage
			.retrieve(StorageNamespace::VehiclePrices.as_str(), vehicle_key)
			.await
			.ok()?;
		cached.is_valid_at(Utc::now()).then_some(cached)
	}

	/// Stores a freshly fetched price with the standard validity window.
	pub async fn put(&self, quote: &FipeQuote) -> Result<(), PipelineError> {
		let now = Utc::now();
		let record = VehiclePrice {
			vehicle_key: quote.vehicle_key.clone(),
			price: quote.price,
			reference_month: quote.reference_month.clone(),
			fetched_at: now,
			valid_until: now + Duration::days(VEHICLE_PRICE_VALIDITY_DAYS),
		};
		self.storage
			.store_with_ttl(
				StorageNamespace::VehiclePrices.as_str(),
				&quote.vehicle_key,
				&record,
				None,
				Some(std::time::Duration::from_secs(
					(VEHICLE_PRICE_VALIDITY_DAYS * 24 * 3600) as u64,
				)),
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))
	}
}
