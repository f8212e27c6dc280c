//! Deduplicated per-flag evaluation summaries.

// std
use std::{
	collections::{HashSet, VecDeque},
	sync::Mutex,
};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle, time};
// self
use crate::{_prelude::*, flags::ConfigValue, telemetry::SharedSessionId};

/// Compact record capturing that a variation was observed by a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
	/// Config attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub config_id: Option<String>,
	/// Variation attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation_id: Option<String>,
	/// Experience attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub experience_id: Option<String>,
	/// Rule attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rule_id: Option<String>,
	/// Flag key that was read.
	pub flag_key: String,
	/// Customer id active at read time.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_customer_id: Option<String>,
	/// Session id active at read time.
	pub session_id: String,
	/// Wall-clock milliseconds of the observation.
	pub summary_time_ms: i64,
	/// Behaviour attribution id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub behaviour_id: Option<String>,
}

/// Delivery sink for summary batches; implemented by the config fetcher.
#[async_trait::async_trait]
pub trait SummarySink: Send + Sync + std::fmt::Debug {
	/// Deliver one batch.
	async fn deliver_summaries(&self, batch: &[SummaryRecord]) -> Result<()>;
}

#[derive(Debug, Default)]
struct SummaryQueue {
	pending: VecDeque<SummaryRecord>,
	seen: HashSet<(String, String, String)>,
}

/// Dedup-keyed summary queue with size/time/demand flush triggers.
#[derive(Debug)]
pub struct SummaryManager {
	sink: Arc<dyn SummarySink>,
	session_id: Arc<SharedSessionId>,
	queue_size: usize,
	queue: Mutex<SummaryQueue>,
	flush_signal: Notify,
}
impl SummaryManager {
	/// Create a manager delivering through `sink`.
	pub fn new(
		sink: Arc<dyn SummarySink>,
		session_id: Arc<SharedSessionId>,
		queue_size: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			sink,
			session_id,
			queue_size: queue_size.max(1),
			queue: Mutex::new(SummaryQueue::default()),
			flush_signal: Notify::new(),
		})
	}

	/// Record that `flag_key` served `config`; duplicates within the session
	/// are dropped.
	///
	/// Returns whether a record was enqueued. The call never blocks beyond a
	/// short mutex, so it is safe on the flag-read path.
	pub fn track(
		&self,
		flag_key: &str,
		config: &ConfigValue,
		user_customer_id: Option<String>,
	) -> bool {
		let session_id = self.session_id.get();
		let dedup_key = (
			session_id.clone(),
			flag_key.to_string(),
			config.variation_id.clone().unwrap_or_default(),
		);
		let should_flush = {
			let mut queue = self.queue.lock().expect("summary lock");

			if !queue.seen.insert(dedup_key) {
				return false;
			}

			queue.pending.push_back(SummaryRecord {
				config_id: config.config_id.clone(),
				variation_id: config.variation_id.clone(),
				experience_id: config.experience_id.clone(),
				rule_id: config.rule_id.clone(),
				flag_key: flag_key.to_string(),
				user_customer_id,
				session_id,
				summary_time_ms: Utc::now().timestamp_millis(),
				behaviour_id: None,
			});

			queue.pending.len() >= self.queue_size
		};

		if should_flush {
			self.flush_signal.notify_one();
		}

		true
	}

	/// Number of records waiting to be delivered.
	pub fn pending(&self) -> usize {
		self.queue.lock().expect("summary lock").pending.len()
	}

	/// Forget dedup state from earlier sessions after a rotation.
	pub fn on_session_rotated(&self) {
		let current = self.session_id.get();
		let mut queue = self.queue.lock().expect("summary lock");

		queue.seen.retain(|(session, _, _)| *session == current);
	}

	/// Deliver everything queued; requeues the batch on failure.
	///
	/// Returns the number of records delivered.
	pub async fn flush(&self) -> Result<usize> {
		let batch: Vec<SummaryRecord> = {
			let mut queue = self.queue.lock().expect("summary lock");

			queue.pending.drain(..).collect()
		};

		if batch.is_empty() {
			return Ok(0);
		}

		match self.sink.deliver_summaries(&batch).await {
			Ok(()) => {
				tracing::debug!(count = batch.len(), "summaries delivered");

				Ok(batch.len())
			},
			Err(err) => {
				let mut queue = self.queue.lock().expect("summary lock");

				for record in batch.into_iter().rev() {
					queue.pending.push_front(record);
				}

				while queue.pending.len() > self.queue_size {
					queue.pending.pop_back();
				}

				tracing::warn!(error = %err, "summary delivery failed; batch requeued");

				Err(err)
			},
		}
	}

	/// Spawn the periodic flush loop.
	pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
		let manager = self.clone();

		tokio::spawn(async move {
			let mut ticker = time::interval(interval);

			// The first tick fires immediately; skip it.
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = ticker.tick() => {},
					_ = manager.flush_signal.notified() => {},
				}

				if let Err(err) = manager.flush().await {
					tracing::debug!(error = %err, "periodic summary flush failed");
				}
			}
		})
	}
}
