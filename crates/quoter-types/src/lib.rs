//! Common types module for the quotation pipeline.
//!
//! This module defines the core data types and structures used throughout
//! the pipeline. It provides a centralized location for shared types to
//! ensure consistency across all components.

/// Query-analysis types describing the item under quotation.
pub mod analysis;
/// Batch processing types for multi-item quotation runs.
pub mod batch;
/// Candidate types produced by the shopping search.
pub mod candidate;
/// Event types for inter-service communication.
pub mod events;
/// Quote request, observation, and failure types.
pub mod quote;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage namespace types for managing persistent data.
pub mod storage;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;
/// Vehicle price bank types for the FIPE path.
pub mod vehicle;

// Re-export all types for convenient access
pub use analysis::*;
pub use batch::*;
pub use candidate::*;
pub use events::*;
pub use quote::*;
pub use registry::*;
pub use storage::*;
pub use validation::*;
pub use vehicle::*;

/// Utility function to truncate an identifier for display purposes.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 8 {
		id.to_string()
	} else {
		format!("{}..", &id[..8])
	}
}
