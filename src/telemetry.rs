//! Event and summary pipelines.

pub mod events;
pub mod summaries;

// std
use std::sync::RwLock;
// self
use crate::_prelude::*;

/// Session id shared between the pipelines and the session manager.
///
/// Reads are taken on every enqueue, so the handle keeps them to a short
/// read lock; the facade swaps the value on rotation.
#[derive(Debug)]
pub struct SharedSessionId {
	id: RwLock<String>,
}
impl SharedSessionId {
	/// Create a handle seeded with the given session id.
	pub fn new(id: impl Into<String>) -> Arc<Self> {
		Arc::new(Self { id: RwLock::new(id.into()) })
	}

	/// Current session id.
	pub fn get(&self) -> String {
		self.id.read().expect("session id lock").clone()
	}

	/// Replace the session id after a rotation.
	pub fn set(&self, id: impl Into<String>) {
		*self.id.write().expect("session id lock") = id.into();
	}
}
