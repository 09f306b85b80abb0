//! Storage module for the quotation pipeline.
//!
//! This module provides abstractions for persistent storage of pipeline
//! data, supporting different backend implementations such as in-memory or
//! file-based storage. Requests are indexed on their execution-state fields
//! so the recovery scan can find stuck work without walking every record.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use quoter_types::{ConfigSchema, ImplementationRegistry};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Query filter for storage operations.
///
/// Filters evaluate against the indexed fields a record was stored with.
/// Backends are free to evaluate them however suits their medium; the
/// shared [`filter_matches`] helper defines the semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
	/// Match records where field equals value.
	Equals(String, serde_json::Value),
	/// Match records where field does not equal value.
	NotEquals(String, serde_json::Value),
	/// Match records where field is in the list of values.
	In(String, Vec<serde_json::Value>),
	/// Match records where field is not in the list of values.
	NotIn(String, Vec<serde_json::Value>),
	/// Match records where a numeric field is strictly below value.
	///
	/// Timestamps must be indexed as Unix-epoch numbers for this to be
	/// meaningful; the heartbeat scan depends on it.
	LessThan(String, serde_json::Value),
	/// Match records where the field was not indexed or is null.
	IsNull(String),
	/// Match records satisfying every inner filter.
	And(Vec<QueryFilter>),
	/// Match records satisfying at least one inner filter.
	Or(Vec<QueryFilter>),
	/// Match all records.
	All,
}

/// Evaluates a filter against the indexed fields of one record.
pub fn filter_matches(filter: &QueryFilter, fields: &HashMap<String, serde_json::Value>) -> bool {
	match filter {
		QueryFilter::Equals(field, value) => fields.get(field) == Some(value),
		QueryFilter::NotEquals(field, value) => fields.get(field) != Some(value),
		QueryFilter::In(field, values) => fields
			.get(field)
			.map(|v| values.contains(v))
			.unwrap_or(false),
		QueryFilter::NotIn(field, values) => fields
			.get(field)
			.map(|v| !values.contains(v))
			.unwrap_or(true),
		QueryFilter::LessThan(field, value) => match (
			fields.get(field).and_then(|v| v.as_f64()),
			value.as_f64(),
		) {
			(Some(actual), Some(bound)) => actual < bound,
			_ => false,
		},
		QueryFilter::IsNull(field) => fields
			.get(field)
			.map(|v| v.is_null())
			.unwrap_or(true),
		QueryFilter::And(inner) => inner.iter().all(|f| filter_matches(f, fields)),
		QueryFilter::Or(inner) => inner.iter().any(|f| filter_matches(f, fields)),
		QueryFilter::All => true,
	}
}

/// Index values for a stored record.
///
/// Provides field values that backends can use for querying. Backends are
/// responsible for maintaining their own index structures.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageIndexes {
	/// Field name -> value for indexing.
	pub fields: HashMap<String, serde_json::Value>,
}

impl StorageIndexes {
	/// Creates a new empty StorageIndexes.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a field to be indexed.
	pub fn with_field(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
		self.fields.insert(
			name.into(),
			serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
		);
		self
	}
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested record is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Trait defining the low-level interface for storage backends.
///
/// Provides basic key-value operations with optional TTL support and
/// filtered queries over indexed fields.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes with optional indexes and time-to-live.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	///
	/// Implementations must also remove the key from any indexes.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a key exists in storage.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Query records in a namespace based on indexed fields.
	///
	/// Returns keys of records whose indexed fields satisfy the filter.
	/// Only records stored with indexes participate.
	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError>;

	/// Batch retrieve multiple values by keys.
	///
	/// Missing keys are silently skipped.
	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries from storage (optional operation).
	///
	/// Returns the number of entries removed. Backends without TTL support
	/// return Ok(0).
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// High-level storage service that provides typed operations.
///
/// Wraps a low-level backend and provides convenient methods for storing
/// and retrieving typed data with automatic JSON serialization.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Stores a serializable value with optional indexes and time-to-live.
	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key, bytes, indexes, ttl).await
	}

	/// Stores a serializable value with optional indexes but no TTL.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, indexes, None)
			.await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let key = format!("{}:{}", namespace, id);
		let bytes = self.backend.get_bytes(&key).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);
		self.backend.delete(&key).await
	}

	/// Updates an existing value in storage with optional indexes.
	///
	/// Returns an error if the key does not exist, making it semantically
	/// different from store() which creates or overwrites.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
	) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);
		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound);
		}
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key, bytes, indexes, None).await
	}

	/// Checks if a value exists in storage.
	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		let key = format!("{}:{}", namespace, id);
		self.backend.exists(&key).await
	}

	/// Removes expired entries from storage.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}

	/// Query records in a namespace based on a filter.
	///
	/// Returns a list of deserialized records matching the filter criteria.
	pub async fn query<T: DeserializeOwned>(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<(String, T)>, StorageError> {
		let keys = self.backend.query(namespace, filter).await?;
		let results = self.backend.get_batch(&keys).await?;

		let mut records = Vec::new();
		for (key, bytes) in results {
			// Extract ID from key (format: "namespace:id")
			let id = key.split(':').nth(1).unwrap_or(&key).to_string();
			match serde_json::from_slice::<T>(&bytes) {
				Ok(record) => records.push((id, record)),
				Err(e) => {
					tracing::warn!("Failed to deserialize record {}: {}", key, e);
					// Continue with other records rather than failing entirely
				},
			}
		}

		Ok(records)
	}

	/// Retrieve all records in a namespace.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		self.query(namespace, QueryFilter::All).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn fields(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.clone()))
			.collect()
	}

	#[test]
	fn less_than_is_numeric() {
		let f = fields(&[("last_heartbeat_ts", json!(100))]);
		assert!(filter_matches(
			&QueryFilter::LessThan("last_heartbeat_ts".into(), json!(200)),
			&f
		));
		assert!(!filter_matches(
			&QueryFilter::LessThan("last_heartbeat_ts".into(), json!(50)),
			&f
		));
	}

	#[test]
	fn is_null_matches_missing_and_null() {
		let f = fields(&[("worker_id", serde_json::Value::Null)]);
		assert!(filter_matches(&QueryFilter::IsNull("worker_id".into()), &f));
		assert!(filter_matches(&QueryFilter::IsNull("absent".into()), &f));
		let f = fields(&[("worker_id", json!("host-1"))]);
		assert!(!filter_matches(&QueryFilter::IsNull("worker_id".into()), &f));
	}

	#[test]
	fn stuck_scan_filter_shape() {
		// status = PROCESSING and (heartbeat stale or no worker)
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), json!("PROCESSING")),
			QueryFilter::Or(vec![
				QueryFilter::LessThan("last_heartbeat_ts".into(), json!(1000)),
				QueryFilter::IsNull("worker_id".into()),
			]),
		]);
		let stale = fields(&[
			("status", json!("PROCESSING")),
			("last_heartbeat_ts", json!(500)),
			("worker_id", json!("host-1")),
		]);
		assert!(filter_matches(&filter, &stale));

		let live = fields(&[
			("status", json!("PROCESSING")),
			("last_heartbeat_ts", json!(2000)),
			("worker_id", json!("host-1")),
		]);
		assert!(!filter_matches(&filter, &live));

		let done = fields(&[
			("status", json!("DONE")),
			("last_heartbeat_ts", json!(1)),
		]);
		assert!(!filter_matches(&filter, &done));
	}
}
