//! Storage namespace types for managing persistent data.

/// Storage namespaces for the pipeline's data collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageNamespace {
	/// Quote requests with their execution state.
	Quotes,
	/// Accepted price observations.
	Sources,
	/// Rejected acquisition attempts.
	Failures,
	/// Batch jobs.
	Batches,
	/// The administratively-editable blocked-domain set.
	BlockedDomains,
	/// Cached vehicle prices with validity windows.
	VehiclePrices,
}

impl StorageNamespace {
	/// Returns the string representation of the namespace.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageNamespace::Quotes => "quotes",
			StorageNamespace::Sources => "sources",
			StorageNamespace::Failures => "failures",
			StorageNamespace::Batches => "batches",
			StorageNamespace::BlockedDomains => "blocked_domains",
			StorageNamespace::VehiclePrices => "vehicle_prices",
		}
	}
}
