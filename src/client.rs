//! Client facade: singleton lifecycle and wiring of every subsystem.

// std
use std::sync::{
	Mutex as StdMutex, RwLock as StdRwLock,
	atomic::{AtomicBool, Ordering},
};
// crates.io
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, task::JoinHandle, time};
// self
use crate::{
	_prelude::*,
	config::{MutableConfig, SdkConfig},
	flags::{cache::ConfigCache, fetch::ConfigFetcher, manager::ConfigManager},
	http::{breaker::BreakerRegistry, client::HttpClient},
	listener::{AllFlagsListener, ConnectionListener, FlagListener, ListenerHandle, ListenerManager},
	logging,
	monitor::{
		connection::{ConnectionInfo, ConnectionMonitor},
		device::{AppState, BatteryState, DeviceStateMonitor},
	},
	session::{SessionConfig, SessionManager},
	store::{FileKvStore, KvStore},
	telemetry::{
		SharedSessionId,
		events::{EventTracker, EventType},
		summaries::SummaryManager,
	},
	user::{ContextType, EvaluationContext, User},
};

static INIT_GUARD: Mutex<()> = Mutex::const_new(());
static INSTANCE: StdRwLock<Option<Arc<CfClient>>> = StdRwLock::new(None);
static INITIALIZING: AtomicBool = AtomicBool::new(false);

/// Wall-clock cap on the initial settings check during startup.
const INITIAL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period granted to in-flight flushes during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Name of the synthetic event emitted on every session rotation.
pub const SESSION_ROTATED_EVENT: &str = "cf_session_rotated";

#[derive(Debug, Default)]
struct FlushTasks {
	events: Option<JoinHandle<()>>,
	summaries: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Registrations {
	device_observer: Option<u64>,
	battery_observer: Option<u64>,
	connection_observer: Option<u64>,
	session_listener: Option<u64>,
}

/// SDK client facade wiring configuration, flags, telemetry, and sessions.
///
/// The process-wide instance is managed through [`CfClient::initialize`] /
/// [`CfClient::shutdown`]; [`CfClient::new_detached`] builds standalone
/// instances that bypass the singleton entirely.
pub struct CfClient {
	config: Arc<MutableConfig>,
	user: Arc<StdRwLock<User>>,
	store: Arc<dyn KvStore>,
	connection: Arc<ConnectionMonitor>,
	device: Arc<DeviceStateMonitor>,
	listeners: Arc<ListenerManager>,
	session: Arc<SessionManager>,
	session_id: Arc<SharedSessionId>,
	summaries: Arc<SummaryManager>,
	events: Arc<EventTracker>,
	config_manager: Arc<ConfigManager>,
	flush_tasks: StdMutex<FlushTasks>,
	registrations: StdMutex<Registrations>,
	detached: bool,
	closed: AtomicBool,
}
impl CfClient {
	/// Initialize the process-wide client with file-backed persistence.
	///
	/// Concurrent callers serialize; every caller after the winner receives
	/// the winner's instance and its own arguments are ignored with a warning.
	pub async fn initialize(config: SdkConfig, user: User) -> Result<Arc<CfClient>> {
		let root = std::env::temp_dir().join("customfit-sdk").join(store_namespace(&config));
		let store: Arc<dyn KvStore> = Arc::new(FileKvStore::open(root).await?);

		Self::initialize_with_store(config, user, store).await
	}

	/// Initialize the process-wide client over a host-provided store.
	pub async fn initialize_with_store(
		config: SdkConfig,
		user: User,
		store: Arc<dyn KvStore>,
	) -> Result<Arc<CfClient>> {
		let _guard = INIT_GUARD.lock().await;

		if let Some(existing) = Self::instance() {
			tracing::warn!("client already initialized; ignoring new configuration and user");

			return Ok(existing);
		}

		INITIALIZING.store(true, Ordering::Release);

		let built = Self::bootstrap(config, user, store, false).await;

		INITIALIZING.store(false, Ordering::Release);

		let client = built?;

		*INSTANCE.write().expect("instance lock") = Some(client.clone());

		Ok(client)
	}

	/// Current process-wide instance, when initialized.
	pub fn instance() -> Option<Arc<CfClient>> {
		INSTANCE.read().expect("instance lock").clone()
	}

	/// Whether a process-wide instance is live.
	pub fn is_initialized() -> bool {
		INSTANCE.read().expect("instance lock").is_some()
	}

	/// Whether an initialize call is currently in flight.
	pub fn is_initializing() -> bool {
		INITIALIZING.load(Ordering::Acquire)
	}

	/// Tear down the process-wide instance, flushing pending telemetry.
	pub async fn shutdown() -> Result<()> {
		let taken = INSTANCE.write().expect("instance lock").take();

		if let Some(client) = taken {
			client.close().await?;
		}

		Ok(())
	}

	/// Replace the process-wide instance with a freshly initialized one.
	pub async fn reinitialize(config: SdkConfig, user: User) -> Result<Arc<CfClient>> {
		Self::shutdown().await?;
		Self::initialize(config, user).await
	}

	/// Build a standalone client that bypasses the singleton; intended for
	/// tests and embedded multi-tenant setups.
	pub async fn new_detached(
		config: SdkConfig,
		user: User,
		store: Arc<dyn KvStore>,
	) -> Result<Arc<CfClient>> {
		Self::bootstrap(config, user, store, true).await
	}

	async fn bootstrap(
		config: SdkConfig,
		user: User,
		store: Arc<dyn KvStore>,
		detached: bool,
	) -> Result<Arc<CfClient>> {
		config.validate()?;
		logging::init(&config);

		tracing::info!(offline = config.offline_mode, detached, "client starting");

		let http = HttpClient::new(&config)?;
		let connection =
			Arc::new(ConnectionMonitor::new(http.offline_flag(), config.retry_policy.clone()));
		let device = Arc::new(DeviceStateMonitor::new());
		let listeners = Arc::new(ListenerManager::new());
		let breakers = Arc::new(BreakerRegistry::new());
		let fetcher = ConfigFetcher::new(&config, http, breakers, connection.clone())?;
		let session_config = config.session.clone();
		let session = if detached {
			SessionManager::new_detached(session_config, store.clone()).await?
		} else {
			SessionManager::initialize(session_config, store.clone()).await?
		};
		let session_id = SharedSessionId::new(session.session_id());
		let summaries = SummaryManager::new(
			Arc::new(fetcher.clone()),
			session_id.clone(),
			config.summaries_queue_size,
		);
		let events = EventTracker::new(
			Arc::new(fetcher.clone()),
			store.clone(),
			summaries.clone(),
			session_id.clone(),
			config.events_queue_size,
			config.max_stored_events,
		);
		let user = Arc::new(StdRwLock::new(user));
		let mutable_config = Arc::new(MutableConfig::new(config));
		let config_manager = ConfigManager::new(
			fetcher,
			ConfigCache::new(store.clone()),
			listeners.clone(),
			summaries.clone(),
			connection.clone(),
			device.clone(),
			mutable_config.clone(),
			user.clone(),
		);

		config_manager.hydrate().await;

		let client = Arc::new(Self {
			config: mutable_config,
			user,
			store,
			connection,
			device,
			listeners,
			session,
			session_id,
			summaries,
			events,
			config_manager,
			flush_tasks: StdMutex::new(FlushTasks::default()),
			registrations: StdMutex::new(Registrations::default()),
			detached,
			closed: AtomicBool::new(false),
		});

		client.run_initial_check().await;
		client.register_observers();
		client.start_pollers();

		tracing::info!(session_id = %client.session_id(), "client started");

		Ok(client)
	}

	// ------------------------------------------------------------------
	// Flag reads
	// ------------------------------------------------------------------

	/// Read a flag, falling back to `default` on every failure path.
	pub fn get_feature_flag<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
		self.config_manager.get(key, default)
	}

	/// Read a boolean flag.
	pub fn get_bool(&self, key: &str, default: bool) -> bool {
		self.config_manager.get(key, default)
	}

	/// Read a string flag.
	pub fn get_string(&self, key: &str, default: String) -> String {
		self.config_manager.get(key, default)
	}

	/// Read a numeric flag.
	pub fn get_number(&self, key: &str, default: f64) -> f64 {
		self.config_manager.get(key, default)
	}

	/// Read a flag as raw JSON.
	pub fn get_json(&self, key: &str, default: Value) -> Value {
		self.config_manager.get(key, default)
	}

	/// Every known flag keyed to its variation; empty while disabled.
	pub fn get_all_flags(&self) -> std::collections::HashMap<String, Value> {
		self.config_manager.all_flags()
	}

	// ------------------------------------------------------------------
	// Telemetry writes
	// ------------------------------------------------------------------

	/// Queue a custom event; success means queued, not transmitted.
	pub fn track_event(
		&self,
		name: impl Into<String>,
		properties: Option<Map<String, Value>>,
	) -> Result<()> {
		self.track(EventType::Track, name, properties)
	}

	/// Queue a screen-view event.
	pub fn track_screen_view(&self, screen: impl Into<String>) -> Result<()> {
		self.track(EventType::ScreenView, screen, None)
	}

	/// Queue a feature-usage event.
	pub fn track_feature_usage(&self, feature: impl Into<String>) -> Result<()> {
		self.track(EventType::FeatureUsage, feature, None)
	}

	/// Flush queued events now (summaries first, per the pipeline contract).
	pub async fn flush_events(&self) -> Result<usize> {
		self.events.flush().await
	}

	/// Flush queued summaries now.
	pub async fn flush_summaries(&self) -> Result<usize> {
		self.summaries.flush().await
	}

	fn track(
		&self,
		event_type: EventType,
		name: impl Into<String>,
		properties: Option<Map<String, Value>>,
	) -> Result<()> {
		self.events.track(event_type, name, properties)?;

		// Event activity keeps the session alive (and may rotate it).
		let session = self.session.clone();

		tokio::spawn(async move {
			if let Err(err) = session.update_activity().await {
				tracing::debug!(error = %err, "session activity update failed");
			}
		});

		Ok(())
	}

	// ------------------------------------------------------------------
	// User mutation
	// ------------------------------------------------------------------

	/// Current user snapshot.
	pub fn user(&self) -> User {
		self.user.read().expect("user lock").clone()
	}

	/// Set one user property.
	pub fn set_user_attribute(&self, key: impl Into<String>, value: Value) {
		let mut user = self.user.write().expect("user lock");
		let next = user.with_property(key, value);

		*user = next;
	}

	/// Merge several user properties.
	pub fn set_user_attributes(&self, properties: Map<String, Value>) {
		let mut user = self.user.write().expect("user lock");
		let next = user.with_properties(properties);

		*user = next;
	}

	/// Attach (or replace) an evaluation context.
	pub fn add_context(&self, context: EvaluationContext) {
		let mut user = self.user.write().expect("user lock");
		let next = user.with_context(context);

		*user = next;
	}

	/// Remove an evaluation context.
	pub fn remove_context(&self, context_type: ContextType, key: &str) {
		let mut user = self.user.write().expect("user lock");
		let next = user.without_context(context_type, key);

		*user = next;
	}

	/// Swap the active user after an authentication change, rotating the
	/// session when the configuration asks for it.
	pub async fn on_authentication_change(&self, user: User) -> Result<()> {
		{
			let mut current = self.user.write().expect("user lock");

			*current = user;
		}

		self.session.on_auth_change().await?;

		Ok(())
	}

	// ------------------------------------------------------------------
	// Control surface
	// ------------------------------------------------------------------

	/// Engage or release offline mode.
	pub fn set_offline_mode(&self, offline: bool) {
		self.connection.set_offline_mode(offline);
		self.config.set_offline_mode(offline);

		if !offline {
			self.config_manager.poke();
		}
	}

	/// Whether offline mode is engaged.
	pub fn is_offline(&self) -> bool {
		self.connection.is_offline()
	}

	/// Connectivity snapshot.
	pub fn connection_info(&self) -> ConnectionInfo {
		self.connection.info()
	}

	/// Clear stored validators and force a full config fetch.
	pub async fn force_refresh(&self) -> Result<bool> {
		self.config_manager.force_refresh().await
	}

	/// Change the foreground settings-check cadence.
	pub fn update_settings_check_interval(&self, interval: Duration) {
		self.config.set_settings_check_interval(interval);
		self.config_manager.poke();
	}

	/// Change the events flush cadence.
	pub fn update_events_flush_interval(&self, interval: Duration) {
		self.config.set_events_flush_interval(interval);

		let mut tasks = self.flush_tasks.lock().expect("flush tasks lock");

		if let Some(task) = tasks.events.replace(self.events.spawn_flush_loop(interval)) {
			task.abort();
		}
	}

	/// Change the summaries flush cadence.
	pub fn update_summaries_flush_interval(&self, interval: Duration) {
		self.config.set_summaries_flush_interval(interval);

		let mut tasks = self.flush_tasks.lock().expect("flush tasks lock");

		if let Some(task) = tasks.summaries.replace(self.summaries.spawn_flush_loop(interval)) {
			task.abort();
		}
	}

	/// Current configuration snapshot.
	pub fn config(&self) -> Arc<SdkConfig> {
		self.config.snapshot()
	}

	// ------------------------------------------------------------------
	// Listeners
	// ------------------------------------------------------------------

	/// Register a per-flag listener invoked with `(old, new)` variations.
	pub fn on_flag_change(&self, key: impl Into<String>, listener: FlagListener) -> ListenerHandle {
		self.listeners.on_flag_change(key, listener)
	}

	/// Register a typed per-flag listener.
	pub fn on_flag_value<T, F>(&self, key: impl Into<String>, listener: F) -> ListenerHandle
	where
		T: DeserializeOwned + 'static,
		F: Fn(Option<T>, Option<T>) + Send + Sync + 'static,
	{
		self.listeners.on_flag_value(key, listener)
	}

	/// Register an all-flags listener receiving changed-key lists.
	pub fn on_all_flags_change(&self, listener: AllFlagsListener) -> ListenerHandle {
		self.listeners.on_all_flags(listener)
	}

	/// Register a connection-status listener.
	pub fn on_connection_change(&self, listener: ConnectionListener) -> ListenerHandle {
		self.listeners.on_connection(listener)
	}

	/// Remove any listener by its handle.
	pub fn remove_listener(&self, handle: ListenerHandle) {
		self.listeners.remove(handle);
	}

	/// Drop all listeners registered for one flag key.
	pub fn clear_flag_listeners(&self, key: &str) {
		self.listeners.clear_key(key);
	}

	// ------------------------------------------------------------------
	// Session surface
	// ------------------------------------------------------------------

	/// Current session id; cheap synchronous read.
	pub fn session_id(&self) -> String {
		self.session_id.get()
	}

	/// Rotate the session immediately, returning the new id.
	pub async fn force_session_rotation(&self) -> Result<String> {
		self.session.force_rotation().await
	}

	/// Register a session rotation listener.
	pub fn on_session_rotation(&self, listener: crate::session::SessionListener) -> u64 {
		self.session.on_rotation(listener)
	}

	// ------------------------------------------------------------------
	// Lifecycle dispatch (fed by platform glue)
	// ------------------------------------------------------------------

	/// Feed a foreground transition from the host platform.
	pub fn on_app_foreground(&self) {
		self.device.set_app_state(AppState::Foreground);
	}

	/// Feed a background transition from the host platform.
	pub fn on_app_background(&self) {
		self.device.set_app_state(AppState::Background);
	}

	/// Feed a battery reading from the host platform.
	pub fn set_battery_state(&self, battery: BatteryState) {
		self.device.set_battery_state(battery);
	}

	/// Tear down a detached client; the singleton path uses [`Self::shutdown`].
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		tracing::info!("client shutting down");

		self.config_manager.stop_polling();

		{
			let mut tasks = self.flush_tasks.lock().expect("flush tasks lock");

			if let Some(task) = tasks.events.take() {
				task.abort();
			}
			if let Some(task) = tasks.summaries.take() {
				task.abort();
			}
		}
		{
			let registrations = std::mem::take(
				&mut *self.registrations.lock().expect("registrations lock"),
			);

			if let Some(id) = registrations.device_observer {
				self.device.remove_observer(id);
			}
			if let Some(id) = registrations.battery_observer {
				self.device.remove_observer(id);
			}
			if let Some(id) = registrations.connection_observer {
				self.connection.unsubscribe(id);
			}
			if let Some(id) = registrations.session_listener {
				self.session.remove_listener(id);
			}
		}

		// Final flush: summaries first, then events, within the grace period.
		let drained = time::timeout(SHUTDOWN_GRACE, async {
			let _ = self.summaries.flush().await;

			self.events.flush().await.is_ok()
		})
		.await;

		if !matches!(drained, Ok(true)) {
			match self.events.persist_pending().await {
				Ok(spilled) if spilled > 0 =>
					tracing::info!(spilled, "unsent events persisted for next launch"),
				Ok(_) => {},
				Err(err) => tracing::warn!(error = %err, "failed to persist unsent events"),
			}
		}

		self.listeners.shutdown();

		if !self.detached {
			SessionManager::reset_shared().await;
		}

		tracing::info!("client shut down");

		Ok(())
	}

	// ------------------------------------------------------------------
	// Internal wiring
	// ------------------------------------------------------------------

	async fn run_initial_check(&self) {
		if self.connection.is_offline() {
			tracing::info!("offline at startup; skipping initial settings check");

			return;
		}

		match time::timeout(INITIAL_CHECK_TIMEOUT, self.config_manager.check_settings(false)).await
		{
			Ok(Ok(_)) => {},
			// Startup never fails on a bad first check; the poll loop retries.
			Ok(Err(err)) => tracing::warn!(error = %err, "initial settings check failed"),
			Err(_) => tracing::warn!("initial settings check timed out"),
		}
	}

	fn register_observers(self: &Arc<Self>) {
		let device_observer = {
			let config_manager = self.config_manager.clone();
			let session = self.session.clone();

			self.device.observe_app_state(Arc::new(move |state| {
				let config_manager = config_manager.clone();
				let session = session.clone();

				tokio::spawn(async move {
					match state {
						AppState::Foreground => {
							if let Err(err) = session.on_app_foreground().await {
								tracing::warn!(error = %err, "session foreground handling failed");
							}

							config_manager.on_app_foreground().await;
						},
						AppState::Background => {
							if let Err(err) = session.on_app_background().await {
								tracing::warn!(error = %err, "session background handling failed");
							}

							config_manager.on_app_background();
						},
					}
				});
			}))
		};
		let battery_observer = {
			let config_manager = self.config_manager.clone();

			self.device.observe_battery(Arc::new(move |_| {
				config_manager.poke();
			}))
		};
		let connection_observer = {
			let listeners = self.listeners.clone();

			self.connection.subscribe(Arc::new(move |info| {
				listeners.notify_connection(info.clone());
			}))
		};
		let session_listener = {
			let session_id = self.session_id.clone();
			let summaries = self.summaries.clone();
			let events = self.events.clone();

			self.session.on_rotation(Arc::new(move |old_id, new_id, reason| {
				session_id.set(new_id);
				summaries.on_session_rotated();

				let mut properties = Map::new();

				properties.insert("old_session_id".into(), Value::String(old_id.to_string()));
				properties.insert("new_session_id".into(), Value::String(new_id.to_string()));
				properties.insert("rotation_reason".into(), Value::String(reason.as_str().into()));

				if let Err(err) =
					events.track(EventType::Track, SESSION_ROTATED_EVENT, Some(properties))
				{
					tracing::debug!(error = %err, "session rotation event not queued");
				}
			}))
		};

		let mut registrations = self.registrations.lock().expect("registrations lock");

		registrations.device_observer = Some(device_observer);
		registrations.battery_observer = Some(battery_observer);
		registrations.connection_observer = Some(connection_observer);
		registrations.session_listener = Some(session_listener);
	}

	fn start_pollers(self: &Arc<Self>) {
		let config = self.config.snapshot();

		self.config_manager.start_polling();

		let mut tasks = self.flush_tasks.lock().expect("flush tasks lock");

		tasks.events = Some(self.events.spawn_flush_loop(config.events_flush_interval));
		tasks.summaries = Some(self.summaries.spawn_flush_loop(config.summaries_flush_interval));
	}

	/// Session rotation configuration in effect.
	pub fn session_config(&self) -> &SessionConfig {
		self.session.config()
	}

	/// Store backing this client's persistence.
	pub fn store(&self) -> Arc<dyn KvStore> {
		self.store.clone()
	}
}
impl std::fmt::Debug for CfClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CfClient")
			.field("detached", &self.detached)
			.field("session_id", &self.session_id())
			.field("offline", &self.is_offline())
			.finish_non_exhaustive()
	}
}

fn store_namespace(config: &SdkConfig) -> String {
	let dimension = config.dimension_id();
	let seed = if dimension.is_empty() { config.client_key.as_str() } else { dimension.as_str() };
	let sanitized: String = seed
		.chars()
		.take(24)
		.map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
		.collect();

	if sanitized.is_empty() { "default".into() } else { sanitized }
}
