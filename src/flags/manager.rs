//! Config manager: poll loop, remote gating, diff, and notification.

// std
use std::sync::{
	Mutex, RwLock,
	atomic::{AtomicBool, Ordering},
};
// crates.io
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
	sync::{Mutex as AsyncMutex, Notify},
	task::JoinHandle,
	time,
};
// self
use crate::{
	_prelude::*,
	config::MutableConfig,
	flags::{
		ConfigMap, SdkSettings, SettingsMetadata,
		cache::{CacheEntry, ConfigCache},
		fetch::{ConfigFetcher, UserConfigsFetch},
	},
	listener::ListenerManager,
	monitor::{connection::ConnectionMonitor, device::{AppState, DeviceStateMonitor}},
	telemetry::summaries::SummaryManager,
	user::User,
};

/// Coordinates settings polling, config application, and flag reads.
///
/// At most one settings check runs per instance; concurrent callers collapse
/// against the single-flight guard and return immediately.
pub struct ConfigManager {
	fetcher: ConfigFetcher,
	cache: ConfigCache,
	listeners: Arc<ListenerManager>,
	summaries: Arc<SummaryManager>,
	connection: Arc<ConnectionMonitor>,
	device: Arc<DeviceStateMonitor>,
	config: Arc<MutableConfig>,
	user: Arc<RwLock<User>>,
	configs: RwLock<Arc<ConfigMap>>,
	metadata: Mutex<SettingsMetadata>,
	settings: Mutex<Option<CacheEntry<SdkSettings>>>,
	sdk_enabled: AtomicBool,
	cache_loaded: AtomicBool,
	check_guard: AsyncMutex<()>,
	poll_wake: Notify,
	refresh_hint: AtomicBool,
	poll_task: Mutex<Option<JoinHandle<()>>>,
}
impl ConfigManager {
	/// Wire a manager over its collaborators.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		fetcher: ConfigFetcher,
		cache: ConfigCache,
		listeners: Arc<ListenerManager>,
		summaries: Arc<SummaryManager>,
		connection: Arc<ConnectionMonitor>,
		device: Arc<DeviceStateMonitor>,
		config: Arc<MutableConfig>,
		user: Arc<RwLock<User>>,
	) -> Arc<Self> {
		Arc::new(Self {
			fetcher,
			cache,
			listeners,
			summaries,
			connection,
			device,
			config,
			user,
			configs: RwLock::new(Arc::new(ConfigMap::new())),
			metadata: Mutex::new(SettingsMetadata::default()),
			settings: Mutex::new(None),
			// Cached configs stay readable until the server says otherwise.
			sdk_enabled: AtomicBool::new(true),
			cache_loaded: AtomicBool::new(false),
			check_guard: AsyncMutex::new(()),
			poll_wake: Notify::new(),
			refresh_hint: AtomicBool::new(false),
			poll_task: Mutex::new(None),
		})
	}

	/// Whether the remote kill switches currently allow the SDK to serve.
	pub fn sdk_enabled(&self) -> bool {
		self.sdk_enabled.load(Ordering::Acquire)
	}

	/// Whether cache hydration has completed.
	pub fn cache_loaded(&self) -> bool {
		self.cache_loaded.load(Ordering::Acquire)
	}

	/// Seed configs and validators from the persisted cache blob.
	///
	/// Runs once at startup so flag reads work before the first server
	/// response; a load failure leaves the manager empty but functional.
	pub async fn hydrate(&self) {
		match self.cache.load().await {
			Ok(Some(blob)) => {
				let count = blob.configs.len();

				*self.configs.write().expect("config map lock") = Arc::new(blob.configs);
				*self.metadata.lock().expect("metadata lock") = blob.metadata;

				tracing::info!(flags = count, "config cache hydrated");
			},
			Ok(None) => {},
			Err(err) => tracing::warn!(error = %err, "config cache hydration failed"),
		}

		self.cache_loaded.store(true, Ordering::Release);
	}

	/// Run one settings check; returns whether the validators changed.
	///
	/// Concurrent calls collapse: whoever finds the guard taken returns
	/// `Ok(false)` without touching the network.
	pub async fn check_settings(&self, force: bool) -> Result<bool> {
		if self.connection.is_offline() && !force {
			return Ok(false);
		}

		let Ok(_guard) = self.check_guard.try_lock() else {
			tracing::debug!("settings check already in flight; collapsing");

			return Ok(false);
		};

		if force {
			*self.metadata.lock().expect("metadata lock") = SettingsMetadata::default();
		}

		let fetched = self.fetcher.fetch_settings_metadata().await?;
		let previous = self.metadata.lock().expect("metadata lock").clone();
		self.refresh_hint.store(false, Ordering::Release);

		let changed = fetched.differs_from(&previous);
		let settings_unset = self.settings.lock().expect("settings lock").is_none();

		if settings_unset || changed {
			let (settings, _) = self.fetcher.fetch_settings().await?;

			self.apply_settings(settings);
		}

		if changed {
			if self.sdk_enabled() {
				match self.fetcher.fetch_user_configs(&self.wire_user(), &previous).await? {
					UserConfigsFetch::Updated { configs, .. } => self.apply(configs).await,
					UserConfigsFetch::NotModified =>
						tracing::debug!("user configs unchanged (304)"),
				}
			}

			// Validators advance even while the SDK is disabled, so a later
			// re-enable does not replay old settings documents.
			*self.metadata.lock().expect("metadata lock") = fetched.clone();

			let configs = self.current();

			if let Err(err) = self.cache.save(&configs, &fetched).await {
				tracing::warn!(error = %err, "config cache persist failed");
			}
		}

		Ok(changed)
	}

	/// Clear stored validators and force a full fetch.
	pub async fn force_refresh(&self) -> Result<bool> {
		tracing::info!("force refresh requested");

		self.check_settings(true).await
	}

	/// Replace the config map, notifying listeners of every changed key.
	pub async fn apply(&self, new_configs: ConfigMap) {
		let old = self.current();
		let mut changed_keys: Vec<String> = Vec::new();

		for (key, new_value) in &new_configs {
			match old.get(key) {
				Some(old_value) if old_value.variation == new_value.variation => {},
				_ => changed_keys.push(key.clone()),
			}
		}
		for key in old.keys() {
			if !new_configs.contains_key(key) {
				changed_keys.push(key.clone());
			}
		}

		changed_keys.sort();

		let new_configs = Arc::new(new_configs);

		*self.configs.write().expect("config map lock") = new_configs.clone();

		if changed_keys.is_empty() {
			return;
		}

		tracing::info!(changed = changed_keys.len(), "config update applied");

		for key in &changed_keys {
			self.listeners.notify_flag_change(
				key,
				old.get(key).map(|value| value.variation.clone()),
				new_configs.get(key).map(|value| value.variation.clone()),
			);
		}

		self.listeners.notify_all_flags(changed_keys);
	}

	/// Read a flag, falling back to `default` on every failure path.
	///
	/// A served variation records a deduped summary; disabled SDK, missing
	/// key, and type mismatch do not.
	pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
		if !self.sdk_enabled() {
			return default;
		}

		let configs = self.current();
		let Some(config) = configs.get(key) else {
			return default;
		};

		// A settings document nearing the end of its freshness window earns an
		// opportunistic early check on the poll task.
		if self
			.settings
			.lock()
			.expect("settings lock")
			.as_ref()
			.is_some_and(|entry| entry.should_refresh(Utc::now()))
			&& !self.refresh_hint.swap(true, Ordering::AcqRel)
		{
			self.poll_wake.notify_one();
		}

		match serde_json::from_value::<T>(config.variation.clone()) {
			Ok(value) => {
				let customer_id = self
					.user
					.read()
					.expect("user lock")
					.customer_id()
					.map(|id| id.to_string());

				self.summaries.track(key, config, customer_id);

				value
			},
			Err(err) => {
				tracing::warn!(key, error = %err, "variation type mismatch; serving default");

				default
			},
		}
	}

	/// Every known flag keyed to its variation; empty while disabled.
	pub fn all_flags(&self) -> std::collections::HashMap<String, Value> {
		if !self.sdk_enabled() {
			return std::collections::HashMap::new();
		}

		self.current()
			.iter()
			.map(|(key, value)| (key.clone(), value.variation.clone()))
			.collect()
	}

	/// Current config map snapshot.
	pub fn current(&self) -> Arc<ConfigMap> {
		self.configs.read().expect("config map lock").clone()
	}

	/// Start the periodic poll loop.
	pub fn start_polling(self: &Arc<Self>) {
		let manager = self.clone();
		let task = tokio::spawn(async move {
			loop {
				match manager.effective_interval() {
					Some(interval) => {
						tokio::select! {
							_ = time::sleep(interval) => {
								if let Err(err) = manager.check_settings(false).await {
									tracing::debug!(error = %err, "periodic settings check failed");
								}
							},
							_ = manager.poll_wake.notified() => {
								// A wake either re-parameterizes the sleep or,
								// when hinted, runs an early check.
								if manager.refresh_hint.swap(false, Ordering::AcqRel) {
									if let Err(err) = manager.check_settings(false).await {
										tracing::debug!(error = %err, "hinted settings check failed");
									}
								}
							},
						}
					},
					// Polling is paused; wait for a lifecycle or config nudge.
					None => manager.poll_wake.notified().await,
				}
			}
		});

		if let Some(previous) = self.poll_task.lock().expect("poll task lock").replace(task) {
			previous.abort();
		}
	}

	/// Stop the poll loop.
	pub fn stop_polling(&self) {
		if let Some(task) = self.poll_task.lock().expect("poll task lock").take() {
			task.abort();
		}
	}

	/// Recompute the poll cadence after a config or battery change.
	pub fn poke(&self) {
		self.poll_wake.notify_one();
	}

	/// React to a foreground transition with an immediate check.
	pub async fn on_app_foreground(&self) {
		self.poke();

		if let Err(err) = self.check_settings(false).await {
			tracing::debug!(error = %err, "foreground settings check failed");
		}
	}

	/// React to a background transition by re-evaluating the cadence.
	pub fn on_app_background(&self) {
		self.poke();
	}

	fn effective_interval(&self) -> Option<Duration> {
		let config = self.config.snapshot();

		match self.device.app_state() {
			AppState::Foreground => Some(self.device.polling_interval(
				config.settings_check_interval,
				config.reduced_polling_interval,
				config.use_reduced_polling_when_battery_low,
			)),
			AppState::Background =>
				if config.disable_background_polling {
					None
				} else {
					Some(config.background_polling_interval)
				},
		}
	}

	fn apply_settings(&self, settings: SdkSettings) {
		let was_enabled = self.sdk_enabled();
		let now_enabled = settings.sdk_enabled();
		let ttl = self.config.snapshot().settings_check_interval;

		*self.settings.lock().expect("settings lock") =
			Some(CacheEntry::new("sdk_settings", settings, ttl));
		self.sdk_enabled.store(now_enabled, Ordering::Release);

		if was_enabled && !now_enabled {
			tracing::warn!("SDK disabled by remote settings");
		}
		if !was_enabled && now_enabled {
			tracing::info!("SDK re-enabled by remote settings");

			// Flags become readable again; replay them so listeners converge.
			let configs = self.current();
			let mut keys: Vec<String> = configs.keys().cloned().collect();

			keys.sort();

			for key in &keys {
				self.listeners.notify_flag_change(
					key,
					None,
					configs.get(key).map(|value| value.variation.clone()),
				);
			}

			if !keys.is_empty() {
				self.listeners.notify_all_flags(keys);
			}
		}
	}

	fn wire_user(&self) -> crate::user::WireUser {
		let auto_env = self.config.snapshot().auto_env_attributes_enabled;

		self.user.read().expect("user lock").to_wire(auto_env)
	}
}
impl std::fmt::Debug for ConfigManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConfigManager")
			.field("sdk_enabled", &self.sdk_enabled())
			.field("cache_loaded", &self.cache_loaded())
			.field("flags", &self.current().len())
			.finish_non_exhaustive()
	}
}
impl Drop for ConfigManager {
	fn drop(&mut self) {
		self.stop_polling();
	}
}
