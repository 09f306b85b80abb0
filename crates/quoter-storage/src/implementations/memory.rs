//! In-memory storage backend implementation.
//!
//! Memory-based implementation of the StorageInterface trait, used by the
//! test suite and single-shot development runs where persistence across
//! restarts is not required. Unlike a pure scratch map, it tracks indexed
//! fields so filtered queries (the recovery scan, batch reconciliation)
//! behave exactly like the durable backends.

use crate::{filter_matches, QueryFilter, StorageError, StorageIndexes, StorageInterface};
use async_trait::async_trait;
use quoter_types::{ConfigSchema, Schema, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry {
	value: Vec<u8>,
	fields: Option<HashMap<String, serde_json::Value>>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.map(|t| now >= t).unwrap_or(false)
	}
}

/// In-memory storage implementation with index-aware queries.
pub struct MemoryStorage {
	/// The in-memory store protected by a read-write lock.
	store: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		match store.get(key) {
			Some(entry) if !entry.is_expired(Instant::now()) => Ok(entry.value.clone()),
			_ => Err(StorageError::NotFound),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		// A write without indexes keeps whatever fields the record already had
		let fields = match indexes {
			Some(idx) => Some(idx.fields),
			None => store.get(key).and_then(|e| e.fields.clone()),
		};
		store.insert(
			key.to_string(),
			Entry {
				value,
				fields,
				expires_at: ttl.map(|d| Instant::now() + d),
			},
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let store = self.store.read().await;
		Ok(store
			.get(key)
			.map(|e| !e.is_expired(Instant::now()))
			.unwrap_or(false))
	}

	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let now = Instant::now();
		let store = self.store.read().await;
		let mut keys: Vec<String> = store
			.iter()
			.filter(|(key, entry)| {
				key.starts_with(&prefix)
					&& !entry.is_expired(now)
					&& entry
						.fields
						.as_ref()
						.map(|f| filter_matches(&filter, f))
						.unwrap_or(false)
			})
			.map(|(key, _)| key.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}

	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		let now = Instant::now();
		let store = self.store.read().await;
		let mut results = Vec::new();
		for key in keys {
			if let Some(entry) = store.get(key) {
				if !entry.is_expired(now) {
					results.push((key.clone(), entry.value.clone()));
				}
			}
		}
		Ok(results)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let now = Instant::now();
		let mut store = self.store.write().await;
		let before = store.len();
		store.retain(|_, entry| !entry.is_expired(now));
		Ok(before - store.len())
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl MemoryStorageSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		let instance = Self;
		instance.validate(config)
	}
}

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no required configuration
		let schema = Schema::new(vec![], vec![]);
		schema.validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema::validate_config(config)
		.map_err(|e| StorageError::Configuration(format!("Invalid configuration: {}", e)))?;

	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl quoter_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let key = "quotes:abc";
		let value = b"{}".to_vec();
		storage
			.set_bytes(key, value.clone(), None, None)
			.await
			.unwrap();

		let retrieved = storage.get_bytes(key).await.unwrap();
		assert_eq!(retrieved, value);
		assert!(storage.exists(key).await.unwrap());

		storage.delete(key).await.unwrap();
		assert!(!storage.exists(key).await.unwrap());
		assert!(matches!(
			storage.get_bytes(key).await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_query_on_indexed_fields() {
		let storage = MemoryStorage::new();
		let idx = |status: &str| {
			Some(StorageIndexes::new().with_field("status", status))
		};
		storage
			.set_bytes("quotes:a", b"1".to_vec(), idx("PROCESSING"), None)
			.await
			.unwrap();
		storage
			.set_bytes("quotes:b", b"2".to_vec(), idx("DONE"), None)
			.await
			.unwrap();
		storage
			.set_bytes("batches:c", b"3".to_vec(), idx("PROCESSING"), None)
			.await
			.unwrap();

		let keys = storage
			.query(
				"quotes",
				QueryFilter::Equals("status".into(), json!("PROCESSING")),
			)
			.await
			.unwrap();
		assert_eq!(keys, vec!["quotes:a".to_string()]);
	}

	#[tokio::test]
	async fn test_indexes_survive_unindexed_overwrite() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes(
				"quotes:a",
				b"1".to_vec(),
				Some(StorageIndexes::new().with_field("status", "PROCESSING")),
				None,
			)
			.await
			.unwrap();
		// Heartbeat-style write without indexes
		storage
			.set_bytes("quotes:a", b"2".to_vec(), None, None)
			.await
			.unwrap();

		let keys = storage
			.query(
				"quotes",
				QueryFilter::Equals("status".into(), json!("PROCESSING")),
			)
			.await
			.unwrap();
		assert_eq!(keys.len(), 1);
	}

	#[tokio::test]
	async fn test_ttl_expiry() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes(
				"vehicle_prices:k",
				b"1".to_vec(),
				None,
				Some(Duration::from_millis(10)),
			)
			.await
			.unwrap();
		assert!(storage.exists("vehicle_prices:k").await.unwrap());
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!storage.exists("vehicle_prices:k").await.unwrap());
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
	}
}
