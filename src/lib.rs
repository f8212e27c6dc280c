//! Async client-side feature-flag, configuration, and analytics SDK core with
//! conditional polling, resilient delivery, and session management.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod config;
pub mod flags;
pub mod http;
pub mod listener;
pub mod monitor;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod user;

mod client;
mod error;
mod logging;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
pub use crate::{
	client::{CfClient, SESSION_ROTATED_EVENT},
	config::{MutableConfig, SdkConfig, SdkConfigBuilder},
	error::{Error, ErrorCategory, Result, ResultExt},
	flags::{ConfigMap, ConfigValue, SdkSettings, SettingsMetadata},
	http::retry::RetryPolicy,
	listener::ListenerHandle,
	session::{RotationReason, SessionConfig, SessionData},
	telemetry::events::{EventRecord, EventType},
	user::{ContextType, EvaluationContext, User},
};
