//! Vehicle price bank types for the FIPE path.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A cached official vehicle price.
///
/// Vehicle requests bypass the block engine; the official table price is
/// the single observation. Lookups hit this bank first and only call the
/// external API when the cached entry has expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePrice {
	/// Normalized `brand/model/year` key.
	pub vehicle_key: String,
	/// Official table price.
	pub price: Decimal,
	/// Reference month of the table, e.g. "julho de 2026".
	pub reference_month: String,
	/// Timestamp the price was fetched from the API.
	pub fetched_at: DateTime<Utc>,
	/// Timestamp after which the cached entry must be refreshed.
	pub valid_until: DateTime<Utc>,
}

impl VehiclePrice {
	/// Whether this cached entry is still within its validity window.
	pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
		now < self.valid_until
	}
}
