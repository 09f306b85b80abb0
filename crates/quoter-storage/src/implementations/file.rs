//! File-based storage backend implementation.
//!
//! Stores each record as a file on disk and keeps one JSON index file per
//! namespace with the indexed fields and expiration of every record. The
//! service runs as a single process, so index read-modify-write cycles are
//! guarded by an in-process lock; record files themselves are written
//! atomically via a temp-file rename.

use crate::{filter_matches, QueryFilter, StorageError, StorageIndexes, StorageInterface};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use quoter_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::Mutex;

/// Per-record metadata kept in the namespace index file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct IndexEntry {
	/// Indexed field values for query evaluation.
	#[serde(default)]
	fields: HashMap<String, serde_json::Value>,
	/// Unix-seconds expiration; absent means permanent.
	#[serde(skip_serializing_if = "Option::is_none")]
	expires_at: Option<u64>,
}

impl IndexEntry {
	fn is_expired(&self, now: u64) -> bool {
		self.expires_at.map(|t| now >= t).unwrap_or(false)
	}
}

/// Index structure for a namespace: key -> metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct NamespaceIndex {
	entries: HashMap<String, IndexEntry>,
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// File-based storage implementation.
pub struct FileStorage {
	/// Base directory path for storing files.
	base_path: PathBuf,
	/// Guards index read-modify-write cycles within this process.
	index_lock: Mutex<()>,
}

impl FileStorage {
	/// Creates a new FileStorage instance rooted at the given directory.
	pub fn new(base_path: PathBuf) -> Self {
		Self {
			base_path,
			index_lock: Mutex::new(()),
		}
	}

	/// Converts a storage key to a filesystem-safe file path.
	fn record_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace(['/', ':'], "_");
		self.base_path.join(format!("{}.json", safe_key))
	}

	fn index_path(&self, namespace: &str) -> PathBuf {
		self.base_path.join(format!("{}.index", namespace))
	}

	fn namespace_of(key: &str) -> &str {
		key.split(':').next().unwrap_or("")
	}

	async fn load_index(&self, namespace: &str) -> Result<NamespaceIndex, StorageError> {
		let path = self.index_path(namespace);
		match fs::read(&path).await {
			Ok(data) => match serde_json::from_slice(&data) {
				Ok(index) => Ok(index),
				Err(e) => {
					// Corrupted index: start over rather than refusing writes
					tracing::error!("Corrupted index file for {}: {}. Rebuilding.", namespace, e);
					Ok(NamespaceIndex::default())
				},
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NamespaceIndex::default()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn write_index(
		&self,
		namespace: &str,
		index: &NamespaceIndex,
	) -> Result<(), StorageError> {
		let path = self.index_path(namespace);
		let temp_path = path.with_extension("tmp");
		let bytes = serde_json::to_vec(index)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;
		fs::write(&temp_path, bytes)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		Ok(())
	}

	/// Merges one record's metadata into its namespace index.
	async fn update_index_entry(
		&self,
		key: &str,
		fields: Option<HashMap<String, serde_json::Value>>,
		expires_at: Option<u64>,
	) -> Result<(), StorageError> {
		let namespace = Self::namespace_of(key);
		let _guard = self.index_lock.lock().await;
		let mut index = self.load_index(namespace).await?;
		let entry = index.entries.entry(key.to_string()).or_default();
		// A write without indexes keeps the fields the record already had
		if let Some(fields) = fields {
			entry.fields = fields;
		}
		entry.expires_at = expires_at;
		self.write_index(namespace, &index).await
	}

	async fn remove_index_entry(&self, key: &str) -> Result<(), StorageError> {
		let namespace = Self::namespace_of(key);
		let _guard = self.index_lock.lock().await;
		let mut index = self.load_index(namespace).await?;
		if index.entries.remove(key).is_some() {
			self.write_index(namespace, &index).await?;
		}
		Ok(())
	}

	async fn entry_expired(&self, key: &str) -> Result<bool, StorageError> {
		let namespace = Self::namespace_of(key);
		let index = self.load_index(namespace).await?;
		Ok(index
			.entries
			.get(key)
			.map(|e| e.is_expired(unix_now()))
			.unwrap_or(false))
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		if self.entry_expired(key).await? {
			return Err(StorageError::NotFound);
		}
		match fs::read(self.record_path(key)).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.record_path(key);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		// Write atomically by writing to a temp file then renaming
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, value)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let expires_at = ttl.map(|d| unix_now().saturating_add(d.as_secs()));
		self.update_index_entry(key, indexes.map(|i| i.fields), expires_at)
			.await
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.record_path(key)).await {
			Ok(_) => {},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		}
		self.remove_index_entry(key).await
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		if self.entry_expired(key).await? {
			return Ok(false);
		}
		Ok(self.record_path(key).exists())
	}

	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError> {
		let index = self.load_index(namespace).await?;
		let now = unix_now();
		let mut keys: Vec<String> = index
			.entries
			.iter()
			.filter(|(_, entry)| !entry.is_expired(now) && filter_matches(&filter, &entry.fields))
			.map(|(key, _)| key.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}

	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		let mut results = Vec::new();
		for key in keys {
			match self.get_bytes(key).await {
				Ok(bytes) => results.push((key.clone(), bytes)),
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(results)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut removed = 0;
		let mut namespaces = Vec::new();
		let mut entries = fs::read_dir(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension() == Some(std::ffi::OsStr::new("index")) {
				if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
					namespaces.push(stem.to_string());
				}
			}
		}

		let now = unix_now();
		for namespace in namespaces {
			let expired: Vec<String> = {
				let index = self.load_index(&namespace).await?;
				index
					.entries
					.iter()
					.filter(|(_, e)| e.is_expired(now))
					.map(|(k, _)| k.clone())
					.collect()
			};
			for key in expired {
				self.delete(&key).await?;
				removed += 1;
			}
		}
		Ok(removed)
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl FileStorageSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		let instance = Self;
		instance.validate(config)
	}
}

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new("storage_path", FieldType::String)],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema::validate_config(config)
		.map_err(|e| StorageError::Configuration(format!("Invalid configuration: {}", e)))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl quoter_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
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
	async fn test_roundtrip_and_delete() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("quotes:a", b"{\"x\":1}".to_vec(), None, None)
			.await
			.unwrap();
		assert_eq!(storage.get_bytes("quotes:a").await.unwrap(), b"{\"x\":1}");

		storage.delete("quotes:a").await.unwrap();
		assert!(matches!(
			storage.get_bytes("quotes:a").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_query_uses_persisted_index() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		for (id, status) in [("a", "PROCESSING"), ("b", "DONE")] {
			storage
				.set_bytes(
					&format!("quotes:{}", id),
					b"{}".to_vec(),
					Some(StorageIndexes::new().with_field("status", status)),
					None,
				)
				.await
				.unwrap();
		}

		// A second instance over the same directory sees the same index
		let reopened = FileStorage::new(dir.path().to_path_buf());
		let keys = reopened
			.query(
				"quotes",
				QueryFilter::Equals("status".into(), json!("DONE")),
			)
			.await
			.unwrap();
		assert_eq!(keys, vec!["quotes:b".to_string()]);
	}

	#[tokio::test]
	async fn test_expired_records_are_cleaned() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes(
				"vehicle_prices:k",
				b"{}".to_vec(),
				None,
				Some(Duration::ZERO),
			)
			.await
			.unwrap();
		assert!(!storage.exists("vehicle_prices:k").await.unwrap());
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
	}
}
