//! Config cache persistence and TTL cache entries.

// crates.io
use serde::{Deserialize, Serialize, de::DeserializeOwned};
// self
use crate::{
	_prelude::*,
	flags::{ConfigMap, SettingsMetadata},
	store::{KEY_CONFIG_CACHE_BLOB, KvStore},
};

/// Fraction of TTL remaining under which a background refresh is warranted.
pub const REFRESH_THRESHOLD: f64 = 0.1;

/// Generic TTL-carrying cache entry persisted as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
	/// Cached value.
	pub value: T,
	/// Wall-clock creation time.
	pub created_at: DateTime<Utc>,
	/// Wall-clock expiry.
	pub expires_at: DateTime<Utc>,
	/// Key the entry is stored under.
	pub key: String,
	/// Free-form metadata attached by the producer.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}
impl<T> CacheEntry<T> {
	/// Create an entry expiring `ttl` from now.
	pub fn new(key: impl Into<String>, value: T, ttl: Duration) -> Self {
		let created_at = Utc::now();
		let expires_at = created_at + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::zero());

		Self { value, created_at, expires_at, key: key.into(), metadata: None }
	}

	/// Whether the entry has passed its expiry.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now > self.expires_at
	}

	/// Whether less than [`REFRESH_THRESHOLD`] of the TTL remains, signalling
	/// an opportunistic background refresh.
	pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
		let total = (self.expires_at - self.created_at).num_milliseconds().max(0);
		let remaining = (self.expires_at - now).num_milliseconds();

		remaining <= (total as f64 * REFRESH_THRESHOLD) as i64
	}
}
impl<T: Serialize> CacheEntry<T> {
	/// Serialize the entry for persistence.
	pub fn to_json(&self) -> Result<String> {
		Ok(serde_json::to_string(self)?)
	}
}
impl<T: DeserializeOwned> CacheEntry<T> {
	/// Restore an entry from its persisted form.
	pub fn from_json(json: &str) -> Result<Self> {
		Ok(serde_json::from_str(json)?)
	}
}

/// On-disk blob bundling configs with their conditional-request validators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedConfigBlob {
	/// Flag configs as of the last successful fetch.
	pub configs: ConfigMap,
	/// Validators accompanying those configs.
	#[serde(flatten)]
	pub metadata: SettingsMetadata,
	/// Wall-clock time the blob was written.
	pub cached_at: DateTime<Utc>,
}

/// Persists the config blob through the KV store.
///
/// A single blob per installation; hydration at startup seeds the config map
/// so flag reads work before the first server response.
#[derive(Clone, Debug)]
pub struct ConfigCache {
	store: Arc<dyn KvStore>,
}
impl ConfigCache {
	/// Create a cache over the given store.
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		Self { store }
	}

	/// Persist configs with their validators.
	pub async fn save(&self, configs: &ConfigMap, metadata: &SettingsMetadata) -> Result<()> {
		let blob = CachedConfigBlob {
			configs: configs.clone(),
			metadata: metadata.clone(),
			cached_at: Utc::now(),
		};

		self.store.set(KEY_CONFIG_CACHE_BLOB, &serde_json::to_string(&blob)?).await?;

		tracing::debug!(flags = configs.len(), "config cache persisted");

		Ok(())
	}

	/// Load the persisted blob, if any.
	///
	/// A corrupt blob is dropped rather than surfaced; the next successful
	/// fetch rewrites it.
	pub async fn load(&self) -> Result<Option<CachedConfigBlob>> {
		let Some(json) = self.store.get(KEY_CONFIG_CACHE_BLOB).await? else {
			return Ok(None);
		};

		match serde_json::from_str::<CachedConfigBlob>(&json) {
			Ok(blob) => Ok(Some(blob)),
			Err(err) => {
				tracing::warn!(error = %err, "discarding corrupt config cache blob");

				self.store.remove(KEY_CONFIG_CACHE_BLOB).await?;

				Ok(None)
			},
		}
	}

	/// Drop the persisted blob.
	pub async fn clear(&self) -> Result<()> {
		self.store.remove(KEY_CONFIG_CACHE_BLOB).await
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;
	use crate::{flags::ConfigValue, store::MemoryKvStore};

	#[tokio::test]
	async fn save_then_load_round_trips_configs_and_validators() {
		let cache = ConfigCache::new(Arc::new(MemoryKvStore::new()));
		let mut configs = ConfigMap::new();

		configs.insert("hero_text".into(), ConfigValue::of(json!("v1")));

		let metadata = SettingsMetadata {
			last_modified: Some("Tue, 01 Jul 2025 10:00:00 GMT".into()),
			etag: Some("\"abc\"".into()),
		};

		cache.save(&configs, &metadata).await.expect("save");

		let blob = cache.load().await.expect("load").expect("blob");

		assert_eq!(blob.configs, configs);
		assert_eq!(blob.metadata, metadata);
	}

	#[tokio::test]
	async fn corrupt_blob_loads_as_none_and_is_removed() {
		let store = Arc::new(MemoryKvStore::new());

		store.set(KEY_CONFIG_CACHE_BLOB, "not json").await.expect("seed");

		let cache = ConfigCache::new(store.clone());

		assert!(cache.load().await.expect("load").is_none());
		assert!(store.get(KEY_CONFIG_CACHE_BLOB).await.expect("get").is_none());
	}

	#[tokio::test]
	async fn empty_store_loads_as_none() {
		let cache = ConfigCache::new(Arc::new(MemoryKvStore::new()));

		assert!(cache.load().await.expect("load").is_none());
	}

	#[test]
	fn cache_entry_expiry_and_refresh_thresholds() {
		let entry = CacheEntry::new("settings", json!({}), Duration::from_secs(100));
		let now = entry.created_at;

		assert!(!entry.is_expired(now));
		assert!(!entry.should_refresh(now));
		// 95 of 100 seconds elapsed leaves 5% of the TTL.
		assert!(entry.should_refresh(now + TimeDelta::try_seconds(95).expect("delta")));
		assert!(entry.is_expired(now + TimeDelta::try_seconds(101).expect("delta")));
	}

	#[test]
	fn cache_entry_round_trips_through_json() {
		let entry = CacheEntry::new("settings", json!({ "cf_account_enabled": true }), Duration::from_secs(60));
		let restored: CacheEntry<serde_json::Value> =
			CacheEntry::from_json(&entry.to_json().expect("serialize")).expect("deserialize");

		assert_eq!(restored, entry);
	}
}
