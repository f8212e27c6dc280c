//! Listener registries and the asynchronous notification dispatcher.
//!
//! Registration hands back an opaque [`ListenerHandle`]; closure identity is
//! never relied upon for removal. Notifications are queued onto a dedicated
//! task so listener code cannot block the poll loop, and a panicking callback
//! is isolated from both the dispatcher and its peers.

// std
use std::{
	collections::HashMap,
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		RwLock,
		atomic::{AtomicU64, Ordering},
	},
};
// crates.io
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
// self
use crate::{_prelude::*, monitor::connection::ConnectionInfo};

/// Opaque registration handle used for listener removal.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Per-flag listener receiving `(old, new)` variations.
pub type FlagListener = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;
/// Listener receiving the full list of changed flag keys.
pub type AllFlagsListener = Arc<dyn Fn(&[String]) + Send + Sync>;
/// Listener receiving connection status changes.
pub type ConnectionListener = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

#[derive(Debug)]
enum Notification {
	Flag { key: String, old: Option<Value>, new: Option<Value> },
	AllFlags { keys: Vec<String> },
	Connection { info: ConnectionInfo },
}

#[derive(Default)]
struct Registries {
	flag: HashMap<String, Vec<(ListenerHandle, FlagListener)>>,
	all_flags: Vec<(ListenerHandle, AllFlagsListener)>,
	connection: Vec<(ListenerHandle, ConnectionListener)>,
}

/// Thread-safe listener registries plus the dispatch queue.
pub struct ListenerManager {
	registries: Arc<RwLock<Registries>>,
	tx: mpsc::UnboundedSender<Notification>,
	dispatcher: JoinHandle<()>,
	next_handle: AtomicU64,
}
impl ListenerManager {
	/// Create the manager and start its dispatch task.
	pub fn new() -> Self {
		let registries = Arc::new(RwLock::new(Registries::default()));
		let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
		let dispatcher = {
			let registries = registries.clone();

			tokio::spawn(async move {
				while let Some(notification) = rx.recv().await {
					dispatch(&registries, notification);
				}
			})
		};

		Self { registries, tx, dispatcher, next_handle: AtomicU64::new(1) }
	}

	/// Register a per-flag listener invoked with `(old, new)` variations.
	pub fn on_flag_change(&self, key: impl Into<String>, listener: FlagListener) -> ListenerHandle {
		let handle = self.handle();

		self.registries
			.write()
			.expect("listener lock")
			.flag
			.entry(key.into())
			.or_default()
			.push((handle, listener));

		handle
	}

	/// Register a typed per-flag listener.
	///
	/// The callback fires with deserialized `(old, new)` values; a stored
	/// variation that no longer satisfies `T` arrives as `None`.
	pub fn on_flag_value<T, F>(&self, key: impl Into<String>, listener: F) -> ListenerHandle
	where
		T: serde::de::DeserializeOwned + 'static,
		F: Fn(Option<T>, Option<T>) + Send + Sync + 'static,
	{
		self.on_flag_change(
			key,
			Arc::new(move |old, new| {
				let decode = |value: Option<&Value>| {
					value.and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
				};

				listener(decode(old), decode(new));
			}),
		)
	}

	/// Register a listener receiving the changed-key list of every apply.
	pub fn on_all_flags(&self, listener: AllFlagsListener) -> ListenerHandle {
		let handle = self.handle();

		self.registries.write().expect("listener lock").all_flags.push((handle, listener));

		handle
	}

	/// Register a connection status listener.
	pub fn on_connection(&self, listener: ConnectionListener) -> ListenerHandle {
		let handle = self.handle();

		self.registries.write().expect("listener lock").connection.push((handle, listener));

		handle
	}

	/// Remove whatever registration the handle refers to.
	pub fn remove(&self, handle: ListenerHandle) {
		let mut registries = self.registries.write().expect("listener lock");

		for listeners in registries.flag.values_mut() {
			listeners.retain(|(entry, _)| *entry != handle);
		}

		registries.flag.retain(|_, listeners| !listeners.is_empty());
		registries.all_flags.retain(|(entry, _)| *entry != handle);
		registries.connection.retain(|(entry, _)| *entry != handle);
	}

	/// Drop every listener registered for a flag key.
	pub fn clear_key(&self, key: &str) {
		self.registries.write().expect("listener lock").flag.remove(key);
	}

	/// Drop every registration.
	pub fn clear_all(&self) {
		*self.registries.write().expect("listener lock") = Registries::default();
	}

	/// Queue a per-flag change notification.
	pub fn notify_flag_change(&self, key: &str, old: Option<Value>, new: Option<Value>) {
		let _ = self.tx.send(Notification::Flag { key: key.to_string(), old, new });
	}

	/// Queue an all-flags notification with the changed-key list.
	pub fn notify_all_flags(&self, keys: Vec<String>) {
		let _ = self.tx.send(Notification::AllFlags { keys });
	}

	/// Queue a connection status notification.
	pub fn notify_connection(&self, info: ConnectionInfo) {
		let _ = self.tx.send(Notification::Connection { info });
	}

	/// Stop the dispatch task; queued notifications may be dropped.
	pub fn shutdown(&self) {
		self.dispatcher.abort();
		self.clear_all();
	}

	fn handle(&self) -> ListenerHandle {
		ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
	}
}
impl Default for ListenerManager {
	fn default() -> Self {
		Self::new()
	}
}
impl std::fmt::Debug for ListenerManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ListenerManager").finish_non_exhaustive()
	}
}
impl Drop for ListenerManager {
	fn drop(&mut self) {
		self.dispatcher.abort();
	}
}

fn dispatch(registries: &RwLock<Registries>, notification: Notification) {
	match notification {
		Notification::Flag { key, old, new } => {
			let listeners: Vec<FlagListener> = {
				let registries = registries.read().expect("listener lock");

				registries
					.flag
					.get(&key)
					.map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
					.unwrap_or_default()
			};

			for listener in listeners {
				invoke_guarded("flag", || listener(old.as_ref(), new.as_ref()));
			}
		},
		Notification::AllFlags { keys } => {
			let listeners: Vec<AllFlagsListener> = {
				let registries = registries.read().expect("listener lock");

				registries.all_flags.iter().map(|(_, l)| l.clone()).collect()
			};

			for listener in listeners {
				invoke_guarded("all_flags", || listener(&keys));
			}
		},
		Notification::Connection { info } => {
			let listeners: Vec<ConnectionListener> = {
				let registries = registries.read().expect("listener lock");

				registries.connection.iter().map(|(_, l)| l.clone()).collect()
			};

			for listener in listeners {
				invoke_guarded("connection", || listener(&info));
			}
		},
	}
}

fn invoke_guarded(kind: &str, call: impl FnOnce()) {
	if catch_unwind(AssertUnwindSafe(call)).is_err() {
		tracing::error!(kind, "listener callback panicked; continuing");
	}
}
