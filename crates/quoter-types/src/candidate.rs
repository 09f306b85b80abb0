//! Candidate types produced by the shopping search.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A raw product returned by the shopping search, pre-rendering.
///
/// Candidates are in-memory only; `position` is the index into the
/// request's canonical candidate list (sorted ascending by listing price)
/// and is the identity the block engine tracks failures by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
	/// Index into the canonical candidate list.
	pub position: usize,
	/// Product title as listed.
	pub title: String,
	/// Listing price reported by the search.
	pub listing_price: Decimal,
	/// Store name as listed.
	pub source_name: String,
	/// Deep-lookup handle from the search response, when present.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub deep_lookup_url: Option<String>,
	/// Direct product link, used when no deep-lookup handle exists.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub product_link: Option<String>,
}

/// A concrete store offer resolved for a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOffer {
	/// Store name.
	pub name: String,
	/// Offer URL.
	pub link: String,
	/// Offer price.
	pub price: Decimal,
}
