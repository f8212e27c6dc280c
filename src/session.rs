//! Session lifecycle: time-based rotation, persistence, and listener fanout.

// std
use std::{
	cell::RefCell,
	sync::{
		Mutex as StdMutex, RwLock,
		atomic::{AtomicU64, Ordering},
	},
};
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
// self
use crate::{
	_prelude::*,
	store::{KEY_BACKGROUND_TIMESTAMP, KEY_CURRENT_SESSION, KEY_LAST_APP_START, KvStore},
};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

static SHARED: Mutex<Option<Arc<SessionManager>>> = Mutex::const_new(None);

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_SUFFIX_LEN: usize = 8;

/// Default maximum session age.
pub const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(3_600);
/// Default minimum session age before an app restart rotates.
pub const DEFAULT_MIN_SESSION_DURATION: Duration = Duration::from_secs(300);
/// Default background dwell time that rotates on return to foreground.
pub const DEFAULT_BACKGROUND_THRESHOLD: Duration = Duration::from_secs(900);
/// Default session id prefix.
pub const DEFAULT_SESSION_ID_PREFIX: &str = "cf_session";

/// Why a session was rotated.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationReason {
	AppStart,
	MaxDurationExceeded,
	BackgroundTimeout,
	AuthChange,
	ManualRotation,
}
impl RotationReason {
	/// Wire name of the reason.
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::AppStart => "APP_START",
			Self::MaxDurationExceeded => "MAX_DURATION_EXCEEDED",
			Self::BackgroundTimeout => "BACKGROUND_TIMEOUT",
			Self::AuthChange => "AUTH_CHANGE",
			Self::ManualRotation => "MANUAL_ROTATION",
		}
	}
}

/// Session rotation configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
	/// Maximum session age before time-based rotation.
	#[serde(with = "crate::config::duration_millis")]
	pub max_session_duration: Duration,
	/// Minimum age under which an app restart restores instead of rotating.
	#[serde(with = "crate::config::duration_millis")]
	pub min_session_duration: Duration,
	/// Background dwell time that rotates on return to foreground.
	#[serde(with = "crate::config::duration_millis")]
	pub background_threshold: Duration,
	/// Rotate when the app cold-starts past the minimum session age.
	pub rotate_on_app_restart: bool,
	/// Rotate when the authenticated user changes.
	pub rotate_on_auth_change: bool,
	/// Prefix of generated session ids.
	pub session_id_prefix: String,
	/// Enable max-duration rotation on activity.
	pub enable_time_based_rotation: bool,
}
impl SessionConfig {
	/// Validate the documented invariants.
	pub fn validate(&self) -> Result<()> {
		for (field, duration) in [
			("session.max_session_duration", self.max_session_duration),
			("session.min_session_duration", self.min_session_duration),
			("session.background_threshold", self.background_threshold),
		] {
			if duration.is_zero() {
				return Err(Error::Validation { field, reason: "Must be greater than zero.".into() });
			}
		}
		if self.session_id_prefix.is_empty() {
			return Err(Error::Validation {
				field: "session.session_id_prefix",
				reason: "Must not be empty.".into(),
			});
		}

		Ok(())
	}
}
impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			max_session_duration: DEFAULT_MAX_SESSION_DURATION,
			min_session_duration: DEFAULT_MIN_SESSION_DURATION,
			background_threshold: DEFAULT_BACKGROUND_THRESHOLD,
			rotate_on_app_restart: true,
			rotate_on_auth_change: true,
			session_id_prefix: DEFAULT_SESSION_ID_PREFIX.into(),
			enable_time_based_rotation: true,
		}
	}
}

/// Persisted session record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
	/// Session id in `{prefix}_{unix_ms}_{8-char base36}` form.
	pub session_id: String,
	/// Wall-clock creation milliseconds.
	pub created_at: i64,
	/// Wall-clock milliseconds of the last recorded activity.
	pub last_active_at: i64,
	/// Wall-clock milliseconds of the app start that produced the session.
	pub app_start_time: i64,
	/// Reason the session was created, when rotated.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rotation_reason: Option<RotationReason>,
}
impl SessionData {
	/// Whether the stored session can be restored at `now_ms`.
	pub fn is_valid(&self, now_ms: i64, config: &SessionConfig) -> bool {
		let age = now_ms.saturating_sub(self.created_at);
		let inactive = now_ms.saturating_sub(self.last_active_at);

		age < config.max_session_duration.as_millis() as i64
			&& inactive < config.background_threshold.as_millis() as i64
	}
}

/// Callback observing session rotations as `(old_id, new_id, reason)`.
pub type SessionListener = Arc<dyn Fn(&str, &str, RotationReason) + Send + Sync>;

/// Owns the active session and applies the rotation state machine.
///
/// Transitions run under one mutex, persist to the KV store before the lock
/// is released, and are therefore totally ordered.
pub struct SessionManager {
	config: SessionConfig,
	store: Arc<dyn KvStore>,
	data: Mutex<SessionData>,
	current_id: RwLock<String>,
	listeners: StdMutex<Vec<(u64, SessionListener)>>,
	next_listener_id: AtomicU64,
}
impl SessionManager {
	/// Initialize (or fetch) the process-wide shared manager.
	///
	/// Concurrent callers serialize on a guard and receive the same instance;
	/// only the first caller's configuration takes effect.
	pub async fn initialize(
		config: SessionConfig,
		store: Arc<dyn KvStore>,
	) -> Result<Arc<SessionManager>> {
		let mut shared = SHARED.lock().await;

		if let Some(existing) = shared.as_ref() {
			return Ok(existing.clone());
		}

		let manager = Self::new_detached(config, store).await?;

		*shared = Some(manager.clone());

		Ok(manager)
	}

	/// Shared instance, when initialized.
	pub async fn shared() -> Option<Arc<SessionManager>> {
		SHARED.lock().await.clone()
	}

	/// Drop the shared instance so a later initialize starts fresh.
	pub async fn reset_shared() {
		*SHARED.lock().await = None;
	}

	/// Build a standalone manager, bypassing the singleton.
	///
	/// Applies the cold-start branch of the state machine against whatever
	/// the store holds.
	pub async fn new_detached(
		config: SessionConfig,
		store: Arc<dyn KvStore>,
	) -> Result<Arc<SessionManager>> {
		config.validate()?;

		let now_ms = Utc::now().timestamp_millis();
		let last_app_start = read_millis(&*store, KEY_LAST_APP_START).await?;
		let stored: Option<SessionData> = match store.get(KEY_CURRENT_SESSION).await? {
			Some(json) => serde_json::from_str(&json)
				.map_err(|err| {
					tracing::warn!(error = %err, "discarding corrupt stored session");
				})
				.ok(),
			None => None,
		};

		store.set(KEY_LAST_APP_START, &now_ms.to_string()).await?;

		let restart_rotation = config.rotate_on_app_restart
			&& last_app_start.is_some_and(|start| {
				now_ms.saturating_sub(start) > config.min_session_duration.as_millis() as i64
			});
		let data = match stored {
			Some(stored) if !restart_rotation && stored.is_valid(now_ms, &config) => {
				let mut restored = stored;

				restored.last_active_at = now_ms;

				tracing::info!(session_id = %restored.session_id, "session restored");

				restored
			},
			_ => {
				let data = fresh_session(&config, now_ms, RotationReason::AppStart);

				tracing::info!(session_id = %data.session_id, "session rotated on app start");

				data
			},
		};

		store.set(KEY_CURRENT_SESSION, &serde_json::to_string(&data)?).await?;

		let manager = Arc::new(Self {
			config,
			store,
			current_id: RwLock::new(data.session_id.clone()),
			data: Mutex::new(data),
			listeners: StdMutex::new(Vec::new()),
			next_listener_id: AtomicU64::new(1),
		});

		Ok(manager)
	}

	/// Current session id; cheap synchronous read.
	pub fn session_id(&self) -> String {
		self.current_id.read().expect("session id lock").clone()
	}

	/// Snapshot of the active session record.
	pub async fn current(&self) -> SessionData {
		self.data.lock().await.clone()
	}

	/// Session rotation configuration in effect.
	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	/// Register a rotation listener; returns a handle for removal.
	pub fn on_rotation(&self, listener: SessionListener) -> u64 {
		let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

		self.listeners.lock().expect("session listeners").push((id, listener));

		id
	}

	/// Remove a rotation listener.
	pub fn remove_listener(&self, id: u64) {
		self.listeners.lock().expect("session listeners").retain(|(entry, _)| *entry != id);
	}

	/// Record user activity, rotating when the session exceeded its maximum
	/// age and time-based rotation is enabled.
	pub async fn update_activity(&self) -> Result<()> {
		let mut data = self.data.lock().await;
		let now_ms = Utc::now().timestamp_millis();

		self.record_activity_locked(&mut data, now_ms).await
	}

	/// Record the transition into background.
	pub async fn on_app_background(&self) -> Result<()> {
		let data = self.data.lock().await;
		let now_ms = Utc::now().timestamp_millis();

		self.store.set(KEY_BACKGROUND_TIMESTAMP, &now_ms.to_string()).await?;

		tracing::debug!(session_id = %data.session_id, "app backgrounded");

		Ok(())
	}

	/// Record the transition back to foreground, rotating after a long stay.
	pub async fn on_app_foreground(&self) -> Result<()> {
		let mut data = self.data.lock().await;
		let now_ms = Utc::now().timestamp_millis();
		let background_since = read_millis(&*self.store, KEY_BACKGROUND_TIMESTAMP).await?;

		self.store.remove(KEY_BACKGROUND_TIMESTAMP).await?;

		let dwell = background_since.map(|since| now_ms.saturating_sub(since));

		if dwell.is_some_and(|dwell| dwell > self.config.background_threshold.as_millis() as i64) {
			self.rotate_locked(&mut data, now_ms, RotationReason::BackgroundTimeout).await?;
		} else {
			// A short stay is plain activity, so the max-duration guard still
			// applies to a session that aged out while backgrounded.
			self.record_activity_locked(&mut data, now_ms).await?;
		}

		Ok(())
	}

	/// React to an authentication change.
	pub async fn on_auth_change(&self) -> Result<Option<String>> {
		if !self.config.rotate_on_auth_change {
			return Ok(None);
		}

		let mut data = self.data.lock().await;
		let now_ms = Utc::now().timestamp_millis();
		let new_id = self.rotate_locked(&mut data, now_ms, RotationReason::AuthChange).await?;

		Ok(Some(new_id))
	}

	/// Rotate immediately; returns the new session id.
	pub async fn force_rotation(&self) -> Result<String> {
		let mut data = self.data.lock().await;
		let now_ms = Utc::now().timestamp_millis();

		self.rotate_locked(&mut data, now_ms, RotationReason::ManualRotation).await
	}

	async fn record_activity_locked(&self, data: &mut SessionData, now_ms: i64) -> Result<()> {
		let age = now_ms.saturating_sub(data.created_at);

		if self.config.enable_time_based_rotation
			&& age >= self.config.max_session_duration.as_millis() as i64
		{
			self.rotate_locked(data, now_ms, RotationReason::MaxDurationExceeded).await?;

			return Ok(());
		}

		data.last_active_at = now_ms;
		self.persist(data).await
	}

	async fn rotate_locked(
		&self,
		data: &mut SessionData,
		now_ms: i64,
		reason: RotationReason,
	) -> Result<String> {
		let old_id = data.session_id.clone();
		let mut next = fresh_session(&self.config, now_ms, reason);

		next.app_start_time = data.app_start_time;
		*data = next;

		self.persist(data).await?;
		*self.current_id.write().expect("session id lock") = data.session_id.clone();

		tracing::info!(
			old_session_id = %old_id,
			new_session_id = %data.session_id,
			reason = reason.as_str(),
			"session rotated"
		);

		let listeners: Vec<SessionListener> = {
			let listeners = self.listeners.lock().expect("session listeners");

			listeners.iter().map(|(_, listener)| listener.clone()).collect()
		};

		for listener in listeners {
			listener(&old_id, &data.session_id, reason);
		}

		Ok(data.session_id.clone())
	}

	async fn persist(&self, data: &SessionData) -> Result<()> {
		self.store.set(KEY_CURRENT_SESSION, &serde_json::to_string(data)?).await
	}
}
impl std::fmt::Debug for SessionManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionManager")
			.field("session_id", &self.session_id())
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

fn fresh_session(config: &SessionConfig, now_ms: i64, reason: RotationReason) -> SessionData {
	SessionData {
		session_id: generate_session_id(&config.session_id_prefix, now_ms),
		created_at: now_ms,
		last_active_at: now_ms,
		app_start_time: now_ms,
		rotation_reason: Some(reason),
	}
}

fn generate_session_id(prefix: &str, now_ms: i64) -> String {
	let suffix: String = SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();

		(0..SESSION_SUFFIX_LEN)
			.map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
			.collect()
	});

	format!("{prefix}_{now_ms}_{suffix}")
}

async fn read_millis(store: &dyn KvStore, key: &str) -> Result<Option<i64>> {
	Ok(store.get(key).await?.and_then(|raw| raw.parse::<i64>().ok()))
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::AtomicUsize;
	// self
	use super::*;
	use crate::store::MemoryKvStore;

	fn test_config() -> SessionConfig {
		SessionConfig {
			max_session_duration: Duration::from_secs(3_600),
			min_session_duration: Duration::from_secs(300),
			background_threshold: Duration::from_secs(5),
			..SessionConfig::default()
		}
	}

	async fn seed_session(store: &MemoryKvStore, data: &SessionData) {
		store
			.set(KEY_CURRENT_SESSION, &serde_json::to_string(data).expect("serialize"))
			.await
			.expect("seed");
	}

	#[test]
	fn generated_ids_have_the_documented_shape() {
		let id = generate_session_id("cf_session", 1_700_000_000_000);
		let mut parts = id.rsplitn(3, '_');
		let suffix = parts.next().expect("suffix");
		let millis = parts.next().expect("millis");

		assert!(id.starts_with("cf_session_"));
		assert_eq!(suffix.len(), SESSION_SUFFIX_LEN);
		assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
		assert_eq!(millis, "1700000000000");
	}

	#[tokio::test]
	async fn cold_start_without_history_creates_a_session() {
		let store = Arc::new(MemoryKvStore::new());
		let manager = SessionManager::new_detached(test_config(), store.clone())
			.await
			.expect("manager");

		assert!(manager.session_id().starts_with("cf_session_"));
		assert!(store.get(KEY_CURRENT_SESSION).await.expect("get").is_some());
		assert!(store.get(KEY_LAST_APP_START).await.expect("get").is_some());
	}

	#[tokio::test]
	async fn quick_restart_restores_the_stored_session() {
		let store = Arc::new(MemoryKvStore::new());
		let now = Utc::now().timestamp_millis();
		let stored = SessionData {
			session_id: "cf_session_1_abcdefgh".into(),
			created_at: now - 1_000,
			last_active_at: now - 1_000,
			app_start_time: now - 1_000,
			rotation_reason: None,
		};

		seed_session(&store, &stored).await;
		// Restarted ten seconds after the previous launch, well under the
		// minimum session duration.
		store.set(KEY_LAST_APP_START, &(now - 10_000).to_string()).await.expect("seed");

		let manager = SessionManager::new_detached(test_config(), store).await.expect("manager");

		assert_eq!(manager.session_id(), "cf_session_1_abcdefgh");
	}

	#[tokio::test]
	async fn stale_restart_rotates_on_app_start() {
		let store = Arc::new(MemoryKvStore::new());
		let now = Utc::now().timestamp_millis();
		let stored = SessionData {
			session_id: "cf_session_1_abcdefgh".into(),
			created_at: now - 1_000,
			last_active_at: now - 1_000,
			app_start_time: now - 1_000,
			rotation_reason: None,
		};

		seed_session(&store, &stored).await;
		store.set(KEY_LAST_APP_START, &(now - 600_000).to_string()).await.expect("seed");

		let manager = SessionManager::new_detached(test_config(), store).await.expect("manager");

		assert_ne!(manager.session_id(), "cf_session_1_abcdefgh");
		assert_eq!(
			manager.current().await.rotation_reason,
			Some(RotationReason::AppStart)
		);
	}

	#[tokio::test]
	async fn expired_stored_session_is_not_restored() {
		let store = Arc::new(MemoryKvStore::new());
		let now = Utc::now().timestamp_millis();
		let stored = SessionData {
			session_id: "cf_session_1_abcdefgh".into(),
			// Older than max_session_duration.
			created_at: now - 4_000_000,
			last_active_at: now - 4_000_000,
			app_start_time: now - 4_000_000,
			rotation_reason: None,
		};

		seed_session(&store, &stored).await;
		store.set(KEY_LAST_APP_START, &(now - 10_000).to_string()).await.expect("seed");

		let manager = SessionManager::new_detached(test_config(), store).await.expect("manager");

		assert_ne!(manager.session_id(), "cf_session_1_abcdefgh");
	}

	#[tokio::test]
	async fn background_timeout_rotates_with_reason_and_listener_fanout() {
		let store = Arc::new(MemoryKvStore::new());
		let manager =
			SessionManager::new_detached(test_config(), store.clone()).await.expect("manager");
		let rotations = Arc::new(StdMutex::new(Vec::new()));

		{
			let rotations = rotations.clone();

			manager.on_rotation(Arc::new(move |old, new, reason| {
				rotations.lock().expect("rotations").push((
					old.to_string(),
					new.to_string(),
					reason,
				));
			}));
		}

		let old_id = manager.session_id();
		let now = Utc::now().timestamp_millis();

		// Backgrounded six seconds ago against a five-second threshold.
		store.set(KEY_BACKGROUND_TIMESTAMP, &(now - 6_000).to_string()).await.expect("seed");
		manager.on_app_foreground().await.expect("foreground");

		let rotations = rotations.lock().expect("rotations");

		assert_eq!(rotations.len(), 1);
		assert_eq!(rotations[0].0, old_id);
		assert_eq!(rotations[0].1, manager.session_id());
		assert_eq!(rotations[0].2, RotationReason::BackgroundTimeout);
		assert!(manager.session_id().starts_with("cf_session_"));
	}

	#[tokio::test]
	async fn short_background_stay_only_touches_activity() {
		let store = Arc::new(MemoryKvStore::new());
		let manager =
			SessionManager::new_detached(test_config(), store.clone()).await.expect("manager");
		let old_id = manager.session_id();

		manager.on_app_background().await.expect("background");
		manager.on_app_foreground().await.expect("foreground");

		assert_eq!(manager.session_id(), old_id);
		// The marker is consumed either way.
		assert!(store.get(KEY_BACKGROUND_TIMESTAMP).await.expect("get").is_none());
	}

	#[tokio::test]
	async fn short_background_stay_still_rotates_an_overaged_session() {
		let store = Arc::new(MemoryKvStore::new());
		let manager =
			SessionManager::new_detached(test_config(), store.clone()).await.expect("manager");

		{
			// Age the active session past the maximum in place.
			let mut data = manager.data.lock().await;

			data.created_at -= 4_000_000;
		}

		manager.on_app_background().await.expect("background");
		// Back within the threshold, so the dwell itself does not rotate.
		manager.on_app_foreground().await.expect("foreground");

		assert_eq!(
			manager.current().await.rotation_reason,
			Some(RotationReason::MaxDurationExceeded)
		);
	}

	#[tokio::test]
	async fn max_duration_rotation_on_activity() {
		let store = Arc::new(MemoryKvStore::new());
		let manager =
			SessionManager::new_detached(test_config(), store.clone()).await.expect("manager");

		{
			// Age the active session past the maximum in place.
			let mut data = manager.data.lock().await;

			data.created_at -= 4_000_000;
		}

		manager.update_activity().await.expect("activity");

		assert_eq!(
			manager.current().await.rotation_reason,
			Some(RotationReason::MaxDurationExceeded)
		);
	}

	#[tokio::test]
	async fn auth_change_respects_the_config_switch() {
		let store = Arc::new(MemoryKvStore::new());
		let mut config = test_config();

		config.rotate_on_auth_change = false;

		let manager = SessionManager::new_detached(config, store.clone()).await.expect("manager");

		assert!(manager.on_auth_change().await.expect("auth").is_none());

		let manager =
			SessionManager::new_detached(test_config(), store).await.expect("manager");
		let rotated = manager.on_auth_change().await.expect("auth");

		assert_eq!(rotated, Some(manager.session_id()));
		assert_eq!(
			manager.current().await.rotation_reason,
			Some(RotationReason::AuthChange)
		);
	}

	#[tokio::test]
	async fn forced_rotations_yield_distinct_ids_and_one_notification_each() {
		let store = Arc::new(MemoryKvStore::new());
		let manager =
			SessionManager::new_detached(test_config(), store.clone()).await.expect("manager");
		let notifications = Arc::new(AtomicUsize::new(0));

		{
			let notifications = notifications.clone();

			manager.on_rotation(Arc::new(move |_, _, _| {
				notifications.fetch_add(1, Ordering::SeqCst);
			}));
		}

		let mut ids = std::collections::HashSet::new();

		ids.insert(manager.session_id());

		for _ in 0..5 {
			let new_id = manager.force_rotation().await.expect("rotate");

			assert!(ids.insert(new_id), "rotation produced a duplicate session id");
		}

		assert_eq!(notifications.load(Ordering::SeqCst), 5);

		let data = manager.current().await;

		assert_eq!(data.rotation_reason, Some(RotationReason::ManualRotation));
		// Persisted state matches the in-memory session.
		let persisted: SessionData = serde_json::from_str(
			&store.get(KEY_CURRENT_SESSION).await.expect("get").expect("stored"),
		)
		.expect("deserialize");

		assert_eq!(persisted.session_id, data.session_id);
	}
}
