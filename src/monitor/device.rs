//! Application lifecycle and battery signals driving the polling cadence.
//!
//! The host platform feeds transitions in through the setters; the SDK never
//! probes the OS itself.

// std
use std::sync::{
	Mutex,
	atomic::{AtomicU64, Ordering},
};
// self
use crate::_prelude::*;

/// Application lifecycle state.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum AppState {
	Foreground,
	Background,
}

/// Battery reading fed by the host platform.
#[derive(Clone, Debug, Copy, PartialEq)]
pub struct BatteryState {
	/// Charge level in `[0.0, 1.0]`.
	pub level: f64,
	/// Whether the platform reports the battery as low.
	pub is_low: bool,
	/// Whether the device is charging.
	pub is_charging: bool,
}
impl Default for BatteryState {
	fn default() -> Self {
		Self { level: 1.0, is_low: false, is_charging: false }
	}
}

/// Callback observing app-state transitions.
pub type AppStateObserver = Arc<dyn Fn(AppState) + Send + Sync>;
/// Callback observing battery updates.
pub type BatteryObserver = Arc<dyn Fn(BatteryState) + Send + Sync>;

/// Tracks foreground/background and battery state for cadence decisions.
pub struct DeviceStateMonitor {
	app_state: Mutex<AppState>,
	battery: Mutex<BatteryState>,
	app_observers: Mutex<Vec<(u64, AppStateObserver)>>,
	battery_observers: Mutex<Vec<(u64, BatteryObserver)>>,
	next_observer_id: AtomicU64,
}
impl DeviceStateMonitor {
	/// Create a monitor assuming a foregrounded app on a healthy battery.
	pub fn new() -> Self {
		Self {
			app_state: Mutex::new(AppState::Foreground),
			battery: Mutex::new(BatteryState::default()),
			app_observers: Mutex::new(Vec::new()),
			battery_observers: Mutex::new(Vec::new()),
			next_observer_id: AtomicU64::new(1),
		}
	}

	/// Current app lifecycle state.
	pub fn app_state(&self) -> AppState {
		*self.app_state.lock().expect("device lock")
	}

	/// Current battery reading.
	pub fn battery(&self) -> BatteryState {
		*self.battery.lock().expect("device lock")
	}

	/// Feed an app lifecycle transition; observers fire only on change.
	pub fn set_app_state(&self, state: AppState) {
		{
			let mut current = self.app_state.lock().expect("device lock");

			if *current == state {
				return;
			}

			*current = state;
		}

		tracing::debug!(?state, "app state transition");

		for observer in self.cloned_app_observers() {
			observer(state);
		}
	}

	/// Feed a battery update; observers fire only on change.
	pub fn set_battery_state(&self, battery: BatteryState) {
		{
			let mut current = self.battery.lock().expect("device lock");

			if *current == battery {
				return;
			}

			*current = battery;
		}

		for observer in self.cloned_battery_observers() {
			observer(battery);
		}
	}

	/// Subscribe to app-state transitions; returns a handle for removal.
	pub fn observe_app_state(&self, observer: AppStateObserver) -> u64 {
		let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);

		self.app_observers.lock().expect("device lock").push((id, observer));

		id
	}

	/// Subscribe to battery updates; returns a handle for removal.
	pub fn observe_battery(&self, observer: BatteryObserver) -> u64 {
		let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);

		self.battery_observers.lock().expect("device lock").push((id, observer));

		id
	}

	/// Drop an observer registered through either subscribe call.
	pub fn remove_observer(&self, id: u64) {
		self.app_observers.lock().expect("device lock").retain(|(entry, _)| *entry != id);
		self.battery_observers.lock().expect("device lock").retain(|(entry, _)| *entry != id);
	}

	/// Effective poll cadence given the current battery state.
	///
	/// The reduced cadence applies only while the battery is low and the
	/// device is not charging, and only when the caller opted in.
	pub fn polling_interval(
		&self,
		normal: Duration,
		reduced: Duration,
		use_reduced_when_low: bool,
	) -> Duration {
		let battery = self.battery();

		if use_reduced_when_low && battery.is_low && !battery.is_charging {
			reduced
		} else {
			normal
		}
	}

	fn cloned_app_observers(&self) -> Vec<AppStateObserver> {
		self.app_observers
			.lock()
			.expect("device lock")
			.iter()
			.map(|(_, observer)| observer.clone())
			.collect()
	}

	fn cloned_battery_observers(&self) -> Vec<BatteryObserver> {
		self.battery_observers
			.lock()
			.expect("device lock")
			.iter()
			.map(|(_, observer)| observer.clone())
			.collect()
	}
}
impl Default for DeviceStateMonitor {
	fn default() -> Self {
		Self::new()
	}
}
impl std::fmt::Debug for DeviceStateMonitor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DeviceStateMonitor")
			.field("app_state", &self.app_state())
			.field("battery", &self.battery())
			.finish_non_exhaustive()
	}
}
