//! Connection state tracking and offline-mode control.

// std
use std::sync::{
	Mutex,
	atomic::{AtomicBool, AtomicU64, Ordering},
};
// self
use crate::{_prelude::*, http::retry::RetryPolicy};

/// Connectivity state reported to listeners.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
	Connected,
	Connecting,
	Disconnected,
	Error,
}

/// Point-in-time connectivity information.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
	/// Connectivity state.
	pub status: ConnectionStatus,
	/// Informational transport description fed by the host platform.
	pub network_type: String,
	/// Whether offline mode is engaged.
	pub is_offline_mode: bool,
	/// Description of the most recent failure.
	pub last_error: Option<String>,
	/// Wall-clock milliseconds of the last successful exchange.
	pub last_success_ms: Option<i64>,
	/// Consecutive failures since the last success.
	pub failure_count: u32,
	/// Suggested wall-clock milliseconds for the next reconnect attempt.
	pub next_reconnect_ms: Option<i64>,
}

/// Callback observing connection changes.
pub type ConnectionObserver = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

/// Tracks connectivity from fetch outcomes and fans changes out to observers.
///
/// The monitor shares the offline flag with the HTTP client, so engaging
/// offline mode short-circuits network operations before any I/O.
pub struct ConnectionMonitor {
	offline: Arc<AtomicBool>,
	retry_policy: RetryPolicy,
	inner: Mutex<ConnectionInfo>,
	observers: Mutex<Vec<(u64, ConnectionObserver)>>,
	next_observer_id: AtomicU64,
}
impl ConnectionMonitor {
	/// Create a monitor sharing the transport's offline flag.
	pub fn new(offline: Arc<AtomicBool>, retry_policy: RetryPolicy) -> Self {
		let is_offline = offline.load(Ordering::Acquire);

		Self {
			offline,
			retry_policy,
			inner: Mutex::new(ConnectionInfo {
				status: if is_offline {
					ConnectionStatus::Disconnected
				} else {
					ConnectionStatus::Connecting
				},
				network_type: "unknown".into(),
				is_offline_mode: is_offline,
				last_error: None,
				last_success_ms: None,
				failure_count: 0,
				next_reconnect_ms: None,
			}),
			observers: Mutex::new(Vec::new()),
			next_observer_id: AtomicU64::new(1),
		}
	}

	/// Current connectivity snapshot.
	pub fn info(&self) -> ConnectionInfo {
		self.inner.lock().expect("connection lock").clone()
	}

	/// Whether offline mode is engaged.
	pub fn is_offline(&self) -> bool {
		self.offline.load(Ordering::Acquire)
	}

	/// Subscribe to connection changes; returns a handle for unsubscribing.
	pub fn subscribe(&self, observer: ConnectionObserver) -> u64 {
		let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);

		self.observers.lock().expect("connection lock").push((id, observer));

		id
	}

	/// Drop a previously registered observer.
	pub fn unsubscribe(&self, id: u64) {
		self.observers.lock().expect("connection lock").retain(|(entry, _)| *entry != id);
	}

	/// Engage or release offline mode.
	pub fn set_offline_mode(&self, offline: bool) {
		self.offline.store(offline, Ordering::Release);
		self.update(|info| {
			info.is_offline_mode = offline;
			info.status =
				if offline { ConnectionStatus::Disconnected } else { ConnectionStatus::Connecting };

			if offline {
				info.next_reconnect_ms = None;
			}
		});

		tracing::info!(offline, "offline mode changed");
	}

	/// Record the informational network type fed by the host platform.
	pub fn set_network_type(&self, network_type: impl Into<String>) {
		self.update(|info| info.network_type = network_type.into());
	}

	/// Record a successful network exchange.
	pub fn record_success(&self) {
		self.update(|info| {
			info.status = ConnectionStatus::Connected;
			info.last_error = None;
			info.last_success_ms = Some(Utc::now().timestamp_millis());
			info.failure_count = 0;
			info.next_reconnect_ms = None;
		});
	}

	/// Record a failed network exchange with a reconnect hint derived from the
	/// retry policy.
	pub fn record_failure(&self, reason: impl Into<String>) {
		let reason = reason.into();

		self.update(|info| {
			info.failure_count = info.failure_count.saturating_add(1);
			info.status = ConnectionStatus::Error;
			info.last_error = Some(reason.clone());
			info.next_reconnect_ms = Some(
				Utc::now().timestamp_millis()
					+ self.retry_policy.base_backoff(info.failure_count).as_millis() as i64,
			);
		});
	}

	fn update(&self, apply: impl FnOnce(&mut ConnectionInfo)) {
		let (changed, snapshot) = {
			let mut info = self.inner.lock().expect("connection lock");
			let before = info.clone();

			apply(&mut info);

			let changed = before.status != info.status
				|| before.is_offline_mode != info.is_offline_mode
				|| before.failure_count != info.failure_count
				|| before.network_type != info.network_type;

			(changed, info.clone())
		};

		if !changed {
			return;
		}

		let observers: Vec<ConnectionObserver> = {
			let observers = self.observers.lock().expect("connection lock");

			observers.iter().map(|(_, observer)| observer.clone()).collect()
		};

		for observer in observers {
			observer(&snapshot);
		}
	}
}
impl std::fmt::Debug for ConnectionMonitor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionMonitor").field("info", &self.info()).finish_non_exhaustive()
	}
}
