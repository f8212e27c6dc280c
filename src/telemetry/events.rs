//! Bounded event queue with flush triggers and persistent overflow.

// std
use std::{
	collections::VecDeque,
	sync::{
		Mutex,
		atomic::{AtomicI64, Ordering},
	},
};
// crates.io
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{sync::Notify, task::JoinHandle, time};
use uuid::Uuid;
// self
use crate::{
	_prelude::*,
	store::{KEY_EVENTS_SPILL_PREFIX, KvStore},
	telemetry::{SharedSessionId, summaries::SummaryManager},
};

/// Kind of telemetry event.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	Track,
	ScreenView,
	FeatureUsage,
}

/// Telemetry event as delivered to the ingestion endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
	/// Unique event id.
	pub event_id: String,
	/// Caller-assigned event identifier (the event name).
	pub event_customer_id: String,
	/// Event kind.
	pub event_type: EventType,
	/// Caller-provided properties.
	#[serde(default)]
	pub properties: Map<String, Value>,
	/// Wall-clock milliseconds; non-decreasing within a process.
	pub event_timestamp: i64,
	/// Session the event belongs to.
	pub session_id: String,
	/// Idempotency id for server-side dedup.
	pub insert_id: String,
}

/// Delivery sink for event batches; implemented by the config fetcher.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
	/// Deliver one batch.
	async fn deliver_events(&self, batch: &[EventRecord]) -> Result<()>;
}

/// Bounded event queue with size/time/manual flush triggers.
///
/// Every flush cycle first awaits the summary manager so no event is sent
/// whose summary has not at least been attempted. Batches that keep failing
/// once the queue holds `max_stored_events` spill to the KV store and are
/// drained ahead of fresh events on the next successful flush.
#[derive(Debug)]
pub struct EventTracker {
	sink: Arc<dyn EventSink>,
	store: Arc<dyn KvStore>,
	summaries: Arc<SummaryManager>,
	session_id: Arc<SharedSessionId>,
	queue_size: usize,
	max_stored_events: usize,
	queue: Mutex<VecDeque<EventRecord>>,
	last_timestamp: AtomicI64,
	flush_signal: Notify,
}
impl EventTracker {
	/// Create a tracker delivering through `sink` and spilling into `store`.
	pub fn new(
		sink: Arc<dyn EventSink>,
		store: Arc<dyn KvStore>,
		summaries: Arc<SummaryManager>,
		session_id: Arc<SharedSessionId>,
		queue_size: usize,
		max_stored_events: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			sink,
			store,
			summaries,
			session_id,
			queue_size: queue_size.max(1),
			max_stored_events: max_stored_events.max(1),
			queue: Mutex::new(VecDeque::new()),
			last_timestamp: AtomicI64::new(0),
			flush_signal: Notify::new(),
		})
	}

	/// Queue an event; success means queued, not transmitted.
	pub fn track(
		&self,
		event_type: EventType,
		name: impl Into<String>,
		properties: Option<Map<String, Value>>,
	) -> Result<EventRecord> {
		let record = EventRecord {
			event_id: Uuid::new_v4().to_string(),
			event_customer_id: name.into(),
			event_type,
			properties: properties.unwrap_or_default(),
			event_timestamp: self.next_timestamp(),
			session_id: self.session_id.get(),
			insert_id: Uuid::new_v4().to_string(),
		};
		let should_flush = {
			let mut queue = self.queue.lock().expect("event lock");

			queue.push_back(record.clone());

			queue.len() >= self.queue_size
		};

		if should_flush {
			self.flush_signal.notify_one();
		}

		Ok(record)
	}

	/// Number of events waiting in memory.
	pub fn pending(&self) -> usize {
		self.queue.lock().expect("event lock").len()
	}

	/// Deliver everything queued, spillover first.
	///
	/// Returns the number of events delivered.
	pub async fn flush(&self) -> Result<usize> {
		// Summaries must have been attempted before any event is sent; the
		// outcome does not gate event delivery.
		if let Err(err) = self.summaries.flush().await {
			tracing::debug!(error = %err, "summary flush before events failed");
		}

		let (spill_keys, mut batch) = self.load_spillover().await?;

		{
			let mut queue = self.queue.lock().expect("event lock");

			batch.extend(queue.drain(..));
		}

		if batch.is_empty() {
			return Ok(0);
		}

		match self.sink.deliver_events(&batch).await {
			Ok(()) => {
				for key in &spill_keys {
					self.store.remove(key).await?;
				}

				tracing::debug!(count = batch.len(), "events delivered");

				Ok(batch.len())
			},
			Err(err) => {
				let overflowing = {
					let mut queue = self.queue.lock().expect("event lock");

					for record in batch.into_iter().rev() {
						queue.push_front(record);
					}

					queue.len() >= self.max_stored_events
				};

				// Requeued spillover now lives in memory; the disk copies
				// would double-deliver on the next cycle.
				for key in &spill_keys {
					self.store.remove(key).await?;
				}

				if overflowing {
					self.persist_pending().await?;
				}

				tracing::warn!(error = %err, "event delivery failed");

				Err(err)
			},
		}
	}

	/// Move every queued event into persistent spill storage.
	pub async fn persist_pending(&self) -> Result<usize> {
		let batch: Vec<EventRecord> = {
			let mut queue = self.queue.lock().expect("event lock");

			queue.drain(..).collect()
		};

		if batch.is_empty() {
			return Ok(0);
		}

		let key = self.next_spill_key().await?;

		self.store.set(&key, &serde_json::to_string(&batch)?).await?;

		tracing::info!(count = batch.len(), key, "events spilled to persistent store");

		Ok(batch.len())
	}

	/// Spawn the periodic flush loop.
	pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
		let tracker = self.clone();

		tokio::spawn(async move {
			let mut ticker = time::interval(interval);

			// The first tick fires immediately; skip it.
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = ticker.tick() => {},
					_ = tracker.flush_signal.notified() => {},
				}

				if let Err(err) = tracker.flush().await {
					tracing::debug!(error = %err, "periodic event flush failed");
				}
			}
		})
	}

	async fn load_spillover(&self) -> Result<(Vec<String>, Vec<EventRecord>)> {
		let mut spill_keys: Vec<(u64, String)> = self
			.store
			.keys()
			.await?
			.into_iter()
			.filter_map(|key| {
				key.strip_prefix(KEY_EVENTS_SPILL_PREFIX)
					.and_then(|suffix| suffix.parse::<u64>().ok())
					.map(|index| (index, key))
			})
			.collect();

		spill_keys.sort_by_key(|(index, _)| *index);

		let mut events = Vec::new();
		let mut keys = Vec::new();

		for (_, key) in spill_keys {
			let Some(json) = self.store.get(&key).await? else { continue };

			match serde_json::from_str::<Vec<EventRecord>>(&json) {
				Ok(batch) => {
					events.extend(batch);
					keys.push(key);
				},
				Err(err) => {
					tracing::warn!(key, error = %err, "discarding corrupt event spill batch");

					self.store.remove(&key).await?;
				},
			}
		}

		Ok((keys, events))
	}

	async fn next_spill_key(&self) -> Result<String> {
		let next = self
			.store
			.keys()
			.await?
			.into_iter()
			.filter_map(|key| {
				key.strip_prefix(KEY_EVENTS_SPILL_PREFIX)
					.and_then(|suffix| suffix.parse::<u64>().ok())
			})
			.max()
			.map(|index| index + 1)
			.unwrap_or(0);

		Ok(format!("{KEY_EVENTS_SPILL_PREFIX}{next}"))
	}

	fn next_timestamp(&self) -> i64 {
		let now = Utc::now().timestamp_millis();
		let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);

		now.max(previous)
	}
}
