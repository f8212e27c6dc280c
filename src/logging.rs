//! Log subscriber installation driven by the client configuration.

// crates.io
use tracing_subscriber::EnvFilter;
// self
use crate::config::SdkConfig;

/// Install the fmt subscriber according to the logging flags.
///
/// Installation is best-effort: when the embedding application already owns a
/// global subscriber, the existing one wins and SDK spans flow into it.
pub(crate) fn init(config: &SdkConfig) {
	if !config.logging_enabled {
		return;
	}

	let level = if config.debug_logging_enabled { "debug" } else { config.log_level.as_str() };
	let directive = format!("customfit_sdk={level}");
	let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("customfit_sdk=info"));

	if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
		tracing::debug!(level, "log subscriber installed");
	}
}
