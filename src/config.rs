//! Client configuration snapshot, builder validation, and the mutable wrapper.
//!
//! [`SdkConfig`] is an immutable snapshot built once and shared behind `Arc`;
//! runtime mutation goes through [`MutableConfig`], which swaps whole snapshots
//! and notifies per-field listeners.

// std
use std::{collections::HashMap, sync::RwLock};
// crates.io
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, http::retry::RetryPolicy, session::SessionConfig};

/// Default production API base.
pub const DEFAULT_API_BASE_URL: &str = "https://api.customfit.ai";
/// Default base for the tenant-scoped SDK settings document.
pub const DEFAULT_SETTINGS_BASE_URL: &str = "https://sdk.customfit.ai";
/// Default events queue capacity.
pub const DEFAULT_EVENTS_QUEUE_SIZE: usize = 100;
/// Default summaries queue capacity.
pub const DEFAULT_SUMMARIES_QUEUE_SIZE: usize = 100;
/// Default cap on events spilled to persistent storage.
pub const DEFAULT_MAX_STORED_EVENTS: usize = 100;
/// Default events flush cadence.
pub const DEFAULT_EVENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Default summaries flush cadence.
pub const DEFAULT_SUMMARIES_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Default foreground settings-check cadence.
pub const DEFAULT_SETTINGS_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// Default background polling cadence.
pub const DEFAULT_BACKGROUND_POLLING_INTERVAL: Duration = Duration::from_secs(3_600);
/// Default polling cadence applied when the battery is low and discharging.
pub const DEFAULT_REDUCED_POLLING_INTERVAL: Duration = Duration::from_secs(7_200);
/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-request read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable client configuration snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SdkConfig {
	/// Client key identifying the tenant; may be an opaque token or a JWT
	/// whose payload carries `dimension_id`.
	pub client_key: String,
	/// Base URL for the evaluation and telemetry API.
	pub api_base_url: Url,
	/// Base URL for the tenant-scoped settings document.
	pub settings_base_url: Url,
	/// Events queue capacity; reaching it triggers an immediate flush.
	pub events_queue_size: usize,
	/// Periodic events flush cadence.
	#[serde(with = "duration_millis")]
	pub events_flush_interval: Duration,
	/// Cap on events retained in persistent spill storage.
	pub max_stored_events: usize,
	/// Summaries queue capacity.
	pub summaries_queue_size: usize,
	/// Periodic summaries flush cadence.
	#[serde(with = "duration_millis")]
	pub summaries_flush_interval: Duration,
	/// Retry policy shared by every endpoint.
	pub retry_policy: RetryPolicy,
	/// TCP connect timeout.
	#[serde(with = "duration_millis")]
	pub connect_timeout: Duration,
	/// Per-request read timeout.
	#[serde(with = "duration_millis")]
	pub read_timeout: Duration,
	/// Foreground settings-check cadence.
	#[serde(with = "duration_millis")]
	pub settings_check_interval: Duration,
	/// Polling cadence while the application is backgrounded.
	#[serde(with = "duration_millis")]
	pub background_polling_interval: Duration,
	/// Polling cadence applied when the battery is low and discharging.
	#[serde(with = "duration_millis")]
	pub reduced_polling_interval: Duration,
	/// Suspend polling entirely while backgrounded.
	pub disable_background_polling: bool,
	/// Stretch the poll cadence to `reduced_polling_interval` on low battery.
	pub use_reduced_polling_when_battery_low: bool,
	/// Start with all network operations suppressed.
	pub offline_mode: bool,
	/// Whether the SDK installs a log subscriber at all.
	pub logging_enabled: bool,
	/// Elevate the SDK log filter to debug.
	pub debug_logging_enabled: bool,
	/// Log level directive applied when logging is enabled.
	pub log_level: String,
	/// Inject host environment attributes into the serialized user.
	pub auto_env_attributes_enabled: bool,
	/// Session rotation configuration.
	pub session: SessionConfig,
}
impl SdkConfig {
	/// Start building a configuration for the given client key.
	pub fn builder(client_key: impl Into<String>) -> SdkConfigBuilder {
		SdkConfigBuilder::new(client_key)
	}

	/// Validate the documented invariants.
	pub fn validate(&self) -> Result<()> {
		if self.client_key.trim().is_empty() {
			return Err(Error::Validation {
				field: "client_key",
				reason: "Must not be empty.".into(),
			});
		}

		for (field, duration) in [
			("events_flush_interval", self.events_flush_interval),
			("summaries_flush_interval", self.summaries_flush_interval),
			("connect_timeout", self.connect_timeout),
			("read_timeout", self.read_timeout),
			("settings_check_interval", self.settings_check_interval),
			("background_polling_interval", self.background_polling_interval),
			("reduced_polling_interval", self.reduced_polling_interval),
		] {
			if duration.is_zero() {
				return Err(Error::Validation { field, reason: "Must be greater than zero.".into() });
			}
		}

		for (field, size) in [
			("events_queue_size", self.events_queue_size),
			("summaries_queue_size", self.summaries_queue_size),
			("max_stored_events", self.max_stored_events),
		] {
			if size == 0 {
				return Err(Error::Validation { field, reason: "Must be at least 1.".into() });
			}
		}

		self.retry_policy.validate()?;
		self.session.validate()?;

		Ok(())
	}

	/// Extract the tenant dimension id from the client key.
	///
	/// When the key is a JWT the middle segment is base64url-decoded as JSON
	/// and its `dimension_id` claim returned. Any parse failure yields an
	/// empty string so a malformed key never blocks initialization.
	pub fn dimension_id(&self) -> String {
		let mut segments = self.client_key.split('.');
		let (Some(_), Some(payload), Some(_), None) =
			(segments.next(), segments.next(), segments.next(), segments.next())
		else {
			return String::new();
		};
		let Ok(decoded) = BASE64_URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
			return String::new();
		};
		let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&decoded) else {
			return String::new();
		};

		claims.get("dimension_id").and_then(|v| v.as_str()).unwrap_or_default().to_string()
	}

	/// Absolute URL of the tenant settings document.
	pub fn settings_url(&self) -> Result<Url> {
		let path = format!("{}/cf-sdk-settings.json", self.dimension_id());

		Ok(self.settings_base_url.join(&path)?)
	}

	fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
		let mut changed = Vec::new();
		macro_rules! diff {
			($($field:ident),* $(,)?) => {
				$(if self.$field != other.$field {
					changed.push(stringify!($field));
				})*
			};
		}

		diff!(
			client_key,
			api_base_url,
			settings_base_url,
			events_queue_size,
			events_flush_interval,
			max_stored_events,
			summaries_queue_size,
			summaries_flush_interval,
			retry_policy,
			connect_timeout,
			read_timeout,
			settings_check_interval,
			background_polling_interval,
			reduced_polling_interval,
			disable_background_polling,
			use_reduced_polling_when_battery_low,
			offline_mode,
			logging_enabled,
			debug_logging_enabled,
			log_level,
			auto_env_attributes_enabled,
			session,
		);

		changed
	}
}

/// Builder for [`SdkConfig`] carrying the documented defaults.
#[derive(Clone, Debug)]
pub struct SdkConfigBuilder {
	config: SdkConfig,
}
impl SdkConfigBuilder {
	/// Create a builder seeded with defaults for the given client key.
	pub fn new(client_key: impl Into<String>) -> Self {
		Self {
			config: SdkConfig {
				client_key: client_key.into(),
				api_base_url: Url::parse(DEFAULT_API_BASE_URL).expect("static url"),
				settings_base_url: Url::parse(DEFAULT_SETTINGS_BASE_URL).expect("static url"),
				events_queue_size: DEFAULT_EVENTS_QUEUE_SIZE,
				events_flush_interval: DEFAULT_EVENTS_FLUSH_INTERVAL,
				max_stored_events: DEFAULT_MAX_STORED_EVENTS,
				summaries_queue_size: DEFAULT_SUMMARIES_QUEUE_SIZE,
				summaries_flush_interval: DEFAULT_SUMMARIES_FLUSH_INTERVAL,
				retry_policy: RetryPolicy::default(),
				connect_timeout: DEFAULT_CONNECT_TIMEOUT,
				read_timeout: DEFAULT_READ_TIMEOUT,
				settings_check_interval: DEFAULT_SETTINGS_CHECK_INTERVAL,
				background_polling_interval: DEFAULT_BACKGROUND_POLLING_INTERVAL,
				reduced_polling_interval: DEFAULT_REDUCED_POLLING_INTERVAL,
				disable_background_polling: false,
				use_reduced_polling_when_battery_low: true,
				offline_mode: false,
				logging_enabled: true,
				debug_logging_enabled: false,
				log_level: "info".into(),
				auto_env_attributes_enabled: false,
				session: SessionConfig::default(),
			},
		}
	}

	/// Override the API base URL.
	pub fn api_base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
		self.config.api_base_url = Url::parse(url.as_ref())?;

		Ok(self)
	}

	/// Override the settings document base URL.
	pub fn settings_base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
		self.config.settings_base_url = Url::parse(url.as_ref())?;

		Ok(self)
	}

	/// Events queue capacity.
	pub fn events_queue_size(mut self, size: usize) -> Self {
		self.config.events_queue_size = size;

		self
	}

	/// Periodic events flush cadence in milliseconds.
	pub fn events_flush_interval_ms(mut self, millis: u64) -> Self {
		self.config.events_flush_interval = Duration::from_millis(millis);

		self
	}

	/// Periodic events flush cadence in whole seconds (coarse alias).
	pub fn events_flush_time_seconds(self, seconds: u64) -> Self {
		self.events_flush_interval_ms(seconds.saturating_mul(1_000))
	}

	/// Cap on events spilled to persistent storage.
	pub fn max_stored_events(mut self, max: usize) -> Self {
		self.config.max_stored_events = max;

		self
	}

	/// Summaries queue capacity.
	pub fn summaries_queue_size(mut self, size: usize) -> Self {
		self.config.summaries_queue_size = size;

		self
	}

	/// Periodic summaries flush cadence in milliseconds.
	pub fn summaries_flush_interval_ms(mut self, millis: u64) -> Self {
		self.config.summaries_flush_interval = Duration::from_millis(millis);

		self
	}

	/// Periodic summaries flush cadence in whole seconds (coarse alias).
	pub fn summaries_flush_time_seconds(self, seconds: u64) -> Self {
		self.summaries_flush_interval_ms(seconds.saturating_mul(1_000))
	}

	/// Replace the retry policy.
	pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.config.retry_policy = policy;

		self
	}

	/// TCP connect timeout in milliseconds.
	pub fn connect_timeout_ms(mut self, millis: u64) -> Self {
		self.config.connect_timeout = Duration::from_millis(millis);

		self
	}

	/// Per-request read timeout in milliseconds.
	pub fn read_timeout_ms(mut self, millis: u64) -> Self {
		self.config.read_timeout = Duration::from_millis(millis);

		self
	}

	/// Foreground settings-check cadence in milliseconds.
	pub fn sdk_settings_check_interval_ms(mut self, millis: u64) -> Self {
		self.config.settings_check_interval = Duration::from_millis(millis);

		self
	}

	/// Background polling cadence in milliseconds.
	pub fn background_polling_interval_ms(mut self, millis: u64) -> Self {
		self.config.background_polling_interval = Duration::from_millis(millis);

		self
	}

	/// Reduced (battery-saver) polling cadence in milliseconds.
	pub fn reduced_polling_interval_ms(mut self, millis: u64) -> Self {
		self.config.reduced_polling_interval = Duration::from_millis(millis);

		self
	}

	/// Suspend polling entirely while backgrounded.
	pub fn disable_background_polling(mut self, disable: bool) -> Self {
		self.config.disable_background_polling = disable;

		self
	}

	/// Stretch the poll cadence when the battery is low and discharging.
	pub fn use_reduced_polling_when_battery_low(mut self, enable: bool) -> Self {
		self.config.use_reduced_polling_when_battery_low = enable;

		self
	}

	/// Start with all network operations suppressed.
	pub fn offline_mode(mut self, offline: bool) -> Self {
		self.config.offline_mode = offline;

		self
	}

	/// Whether the SDK installs a log subscriber.
	pub fn logging_enabled(mut self, enabled: bool) -> Self {
		self.config.logging_enabled = enabled;

		self
	}

	/// Elevate the SDK log filter to debug.
	pub fn debug_logging_enabled(mut self, enabled: bool) -> Self {
		self.config.debug_logging_enabled = enabled;

		self
	}

	/// Log level directive applied when logging is enabled.
	pub fn log_level(mut self, level: impl Into<String>) -> Self {
		self.config.log_level = level.into();

		self
	}

	/// Inject host environment attributes into the serialized user.
	pub fn auto_env_attributes_enabled(mut self, enabled: bool) -> Self {
		self.config.auto_env_attributes_enabled = enabled;

		self
	}

	/// Replace the session rotation configuration.
	pub fn session(mut self, session: SessionConfig) -> Self {
		self.config.session = session;

		self
	}

	/// Validate and finalize the configuration.
	pub fn build(self) -> Result<SdkConfig> {
		self.config.validate()?;

		Ok(self.config)
	}
}

/// Callback invoked with the new snapshot after a watched field changed.
pub type ConfigFieldListener = Arc<dyn Fn(&SdkConfig) + Send + Sync>;

/// Atomically swappable configuration with per-field change notifications.
///
/// Listeners subscribe by field name (the struct field identifier) and refetch
/// whatever they need from the snapshot they are handed.
pub struct MutableConfig {
	current: RwLock<Arc<SdkConfig>>,
	listeners: RwLock<HashMap<&'static str, Vec<(u64, ConfigFieldListener)>>>,
	next_listener_id: std::sync::atomic::AtomicU64,
}
impl MutableConfig {
	/// Wrap an initial snapshot.
	pub fn new(config: SdkConfig) -> Self {
		Self {
			current: RwLock::new(Arc::new(config)),
			listeners: RwLock::new(HashMap::new()),
			next_listener_id: std::sync::atomic::AtomicU64::new(1),
		}
	}

	/// Current snapshot.
	pub fn snapshot(&self) -> Arc<SdkConfig> {
		self.current.read().expect("config lock").clone()
	}

	/// Subscribe to changes of a single field; returns a removal id.
	pub fn on_field_change(&self, field: &'static str, listener: ConfigFieldListener) -> u64 {
		let id = self.next_listener_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

		self.listeners.write().expect("config lock").entry(field).or_default().push((id, listener));

		id
	}

	/// Remove a previously registered field listener.
	pub fn remove_listener(&self, id: u64) {
		let mut listeners = self.listeners.write().expect("config lock");

		for entries in listeners.values_mut() {
			entries.retain(|(entry_id, _)| *entry_id != id);
		}
	}

	/// Atomically replace the snapshot and notify listeners of changed fields.
	pub fn replace(&self, config: SdkConfig) -> Result<()> {
		config.validate()?;

		let new = Arc::new(config);
		let changed = {
			let mut current = self.current.write().expect("config lock");
			let changed = current.changed_fields(&new);

			*current = new.clone();

			changed
		};

		self.notify(&changed, &new);

		Ok(())
	}

	/// Swap the offline flag, notifying `offline_mode` listeners on change.
	pub fn set_offline_mode(&self, offline: bool) {
		self.mutate(|config| config.offline_mode = offline);
	}

	/// Swap the settings-check cadence, notifying listeners on change.
	pub fn set_settings_check_interval(&self, interval: Duration) {
		self.mutate(|config| config.settings_check_interval = interval);
	}

	/// Swap the events flush cadence, notifying listeners on change.
	pub fn set_events_flush_interval(&self, interval: Duration) {
		self.mutate(|config| config.events_flush_interval = interval);
	}

	/// Swap the summaries flush cadence, notifying listeners on change.
	pub fn set_summaries_flush_interval(&self, interval: Duration) {
		self.mutate(|config| config.summaries_flush_interval = interval);
	}

	fn mutate(&self, apply: impl FnOnce(&mut SdkConfig)) {
		let (changed, new) = {
			let mut current = self.current.write().expect("config lock");
			let mut draft = (**current).clone();

			apply(&mut draft);

			let new = Arc::new(draft);
			let changed = current.changed_fields(&new);

			*current = new.clone();

			(changed, new)
		};

		self.notify(&changed, &new);
	}

	fn notify(&self, changed: &[&'static str], snapshot: &Arc<SdkConfig>) {
		if changed.is_empty() {
			return;
		}

		let listeners = self.listeners.read().expect("config lock");

		for field in changed {
			tracing::debug!(field, "configuration field changed");

			if let Some(entries) = listeners.get(field) {
				for (_, listener) in entries {
					listener(snapshot);
				}
			}
		}
	}
}
impl std::fmt::Debug for MutableConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MutableConfig").field("current", &self.snapshot()).finish_non_exhaustive()
	}
}

pub(crate) mod duration_millis {
	// std
	use std::time::Duration;
	// crates.io
	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		(value.as_millis() as u64).serialize(serializer)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;

	fn jwt_key(payload: &str) -> String {
		format!(
			"eyJhbGciOiJIUzI1NiJ9.{}.c2ln",
			BASE64_URL_SAFE_NO_PAD.encode(payload.as_bytes())
		)
	}

	#[test]
	fn builder_applies_documented_defaults() {
		let config = SdkConfig::builder("ck-test").build().expect("config");

		assert_eq!(config.events_queue_size, DEFAULT_EVENTS_QUEUE_SIZE);
		assert_eq!(config.settings_check_interval, DEFAULT_SETTINGS_CHECK_INTERVAL);
		assert_eq!(config.api_base_url.as_str(), "https://api.customfit.ai/");
		assert!(!config.offline_mode);
		assert!(config.use_reduced_polling_when_battery_low);
	}

	#[test]
	fn build_rejects_empty_client_key() {
		assert!(matches!(
			SdkConfig::builder("  ").build(),
			Err(Error::Validation { field: "client_key", .. })
		));
	}

	#[test]
	fn build_rejects_zero_queue_size() {
		assert!(SdkConfig::builder("ck-test").events_queue_size(0).build().is_err());
	}

	#[test]
	fn dimension_id_extracted_from_jwt_payload() {
		let config = SdkConfig::builder(jwt_key(r#"{"dimension_id":"acct-42"}"#))
			.build()
			.expect("config");

		assert_eq!(config.dimension_id(), "acct-42");
	}

	#[test]
	fn dimension_id_tolerates_opaque_and_malformed_keys() {
		let opaque = SdkConfig::builder("plain-key").build().expect("config");
		let garbled = SdkConfig::builder("a.###.b").build().expect("config");
		let empty_payload = SdkConfig::builder(jwt_key("{}")).build().expect("config");

		assert_eq!(opaque.dimension_id(), "");
		assert_eq!(garbled.dimension_id(), "");
		assert_eq!(empty_payload.dimension_id(), "");
	}

	#[test]
	fn settings_url_formed_even_with_empty_dimension() {
		let config = SdkConfig::builder("plain-key").build().expect("config");
		let url = config.settings_url().expect("url");

		assert!(url.as_str().ends_with("/cf-sdk-settings.json"));
	}

	#[test]
	fn flush_time_seconds_alias_sets_interval() {
		let config =
			SdkConfig::builder("ck-test").events_flush_time_seconds(45).build().expect("config");

		assert_eq!(config.events_flush_interval, Duration::from_secs(45));
	}

	#[test]
	fn mutable_config_notifies_only_changed_fields() {
		let mutable = MutableConfig::new(SdkConfig::builder("ck-test").build().expect("config"));
		let offline_hits = Arc::new(AtomicUsize::new(0));
		let interval_hits = Arc::new(AtomicUsize::new(0));

		{
			let offline_hits = offline_hits.clone();

			mutable.on_field_change(
				"offline_mode",
				Arc::new(move |_| {
					offline_hits.fetch_add(1, Ordering::SeqCst);
				}),
			);
		}
		{
			let interval_hits = interval_hits.clone();

			mutable.on_field_change(
				"settings_check_interval",
				Arc::new(move |_| {
					interval_hits.fetch_add(1, Ordering::SeqCst);
				}),
			);
		}

		mutable.set_offline_mode(true);
		// Same value again; no change, no notification.
		mutable.set_offline_mode(true);
		mutable.set_settings_check_interval(Duration::from_secs(60));

		assert_eq!(offline_hits.load(Ordering::SeqCst), 1);
		assert_eq!(interval_hits.load(Ordering::SeqCst), 1);
		assert!(mutable.snapshot().offline_mode);
	}

	#[test]
	fn removed_listener_is_not_notified() {
		let mutable = MutableConfig::new(SdkConfig::builder("ck-test").build().expect("config"));
		let hits = Arc::new(AtomicUsize::new(0));
		let id = {
			let hits = hits.clone();

			mutable.on_field_change(
				"offline_mode",
				Arc::new(move |_| {
					hits.fetch_add(1, Ordering::SeqCst);
				}),
			)
		};

		mutable.remove_listener(id);
		mutable.set_offline_mode(true);

		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}
}
