//! Persistent key-value storage behind an async trait.
//!
//! The SDK persists cross-restart state (session, config cache blob, spilled
//! events) through [`KvStore`]; the backend is pluggable and only key → string
//! blob semantics are assumed. Writes must be durable before returning.

// std
use std::{collections::HashMap, path::PathBuf};
// crates.io
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
// self
use crate::_prelude::*;

/// Store key for the active session record.
pub const KEY_CURRENT_SESSION: &str = "current_session";
/// Store key for the last recorded application start time.
pub const KEY_LAST_APP_START: &str = "last_app_start";
/// Store key for the timestamp at which the app entered background.
pub const KEY_BACKGROUND_TIMESTAMP: &str = "background_timestamp";
/// Store key for the persisted config cache blob.
pub const KEY_CONFIG_CACHE_BLOB: &str = "config_cache_blob";
/// Prefix of the rolling keys holding spilled event batches.
pub const KEY_EVENTS_SPILL_PREFIX: &str = "events_spill_";

/// Async key → string blob store.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
	/// Read the value stored under `key`.
	async fn get(&self, key: &str) -> Result<Option<String>>;
	/// Durably write `value` under `key`.
	async fn set(&self, key: &str, value: &str) -> Result<()>;
	/// Remove `key` if present.
	async fn remove(&self, key: &str) -> Result<()>;
	/// List every stored key.
	async fn keys(&self) -> Result<Vec<String>>;
	/// Remove all stored keys.
	async fn clear(&self) -> Result<()>;
}

/// Volatile in-memory store used in tests and as an explicit opt-out of
/// persistence.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
	entries: RwLock<HashMap<String, String>>,
}
impl MemoryKvStore {
	/// Create an empty store.
	pub fn new() -> Self {
		Self::default()
	}
}
#[async_trait]
impl KvStore for MemoryKvStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.entries.read().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str) -> Result<()> {
		self.entries.write().await.insert(key.to_string(), value.to_string());

		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		self.entries.write().await.remove(key);

		Ok(())
	}

	async fn keys(&self) -> Result<Vec<String>> {
		Ok(self.entries.read().await.keys().cloned().collect())
	}

	async fn clear(&self) -> Result<()> {
		self.entries.write().await.clear();

		Ok(())
	}
}

/// File-backed store keeping one file per key under an SDK-owned directory.
///
/// Writes go to a sibling temp file, are synced to disk, then renamed over the
/// target so a crash never leaves a half-written value behind.
#[derive(Debug)]
pub struct FileKvStore {
	root: PathBuf,
}
impl FileKvStore {
	/// Open (creating if needed) a store rooted at `root`.
	pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();

		fs::create_dir_all(&root).await?;

		Ok(Self { root })
	}

	fn path_for(&self, key: &str) -> PathBuf {
		// Keys are SDK-owned identifiers; escape anything path-hostile anyway.
		let sanitized: String = key
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
			.collect();

		self.root.join(format!("{sanitized}.kv"))
	}
}
#[async_trait]
impl KvStore for FileKvStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		match fs::read_to_string(self.path_for(key)).await {
			Ok(value) => Ok(Some(value)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(err) => Err(err.into()),
		}
	}

	async fn set(&self, key: &str, value: &str) -> Result<()> {
		let target = self.path_for(key);
		let tmp = target.with_extension("kv.tmp");
		let mut file = fs::File::create(&tmp).await?;

		file.write_all(value.as_bytes()).await?;
		file.sync_all().await?;
		drop(file);
		fs::rename(&tmp, &target).await?;

		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		match fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	async fn keys(&self) -> Result<Vec<String>> {
		let mut keys = Vec::new();
		let mut entries = fs::read_dir(&self.root).await?;

		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else { continue };

			if let Some(stem) = name.strip_suffix(".kv") {
				keys.push(stem.to_string());
			}
		}

		Ok(keys)
	}

	async fn clear(&self) -> Result<()> {
		for key in self.keys().await? {
			self.remove(&key).await?;
		}

		Ok(())
	}
}
