//! Crate-wide error types, category taxonomy, and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories surfaced to callers and used to drive retry decisions.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
	Network,
	Timeout,
	Validation,
	Authentication,
	State,
	Serialization,
	Internal,
	Unknown,
}

/// Unified error type for the SDK core.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Circuit breaker open for endpoint '{endpoint}'; retry after {cooldown_remaining_ms} ms.")]
	CircuitOpen { endpoint: String, cooldown_remaining_ms: u64 },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Internal error: {0}")]
	Internal(String),
	#[error("SDK client is not initialized.")]
	NotInitialized,
	#[error("Offline mode is enabled; network operations are suppressed.")]
	Offline,
	#[error("Invalid state: {0}")]
	State(String),
	#[error("Operation timed out after {0} ms.")]
	Timeout(u64),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Project the error onto the public failure taxonomy.
	pub fn category(&self) -> ErrorCategory {
		match self {
			Self::Io(_) | Self::Internal(_) | Self::Cache(_) | Self::Http(_) =>
				ErrorCategory::Internal,
			Self::Reqwest(err) =>
				if err.is_timeout() {
					ErrorCategory::Timeout
				} else if err.is_connect() || err.is_request() || err.is_redirect() {
					ErrorCategory::Network
				} else if err.is_decode() {
					ErrorCategory::Serialization
				} else {
					ErrorCategory::Unknown
				},
			Self::Serde(_) => ErrorCategory::Serialization,
			Self::Url(_) | Self::Validation { .. } => ErrorCategory::Validation,
			Self::CircuitOpen { .. } | Self::Offline => ErrorCategory::Network,
			Self::HttpStatus { status, .. } => categorize_status(*status),
			Self::NotInitialized | Self::State(_) => ErrorCategory::State,
			Self::Timeout(_) => ErrorCategory::Timeout,
		}
	}

	/// Whether the retry layer is permitted to re-attempt the failed operation.
	///
	/// Covers transient transport failures, timeouts, 5xx, and the 408/429
	/// status codes; every other 4xx is terminal. An open circuit breaker is
	/// non-retriable so callers back off until the cooldown ends.
	pub fn is_retriable(&self) -> bool {
		match self {
			Self::CircuitOpen { .. } | Self::Offline => false,
			Self::HttpStatus { status, .. } => retriable_status(*status),
			_ => matches!(self.category(), ErrorCategory::Network | ErrorCategory::Timeout),
		}
	}
}

/// Side-effect hooks layered over [`Result`].
///
/// Hooks are observation points, never control flow: a panicking callback is
/// swallowed and logged, and the original result passes through untouched.
/// Transformation combinators (`map`, `and_then`, `unwrap_or`) are the std
/// `Result` surface and are not duplicated here.
pub trait ResultExt<T> {
	/// Run `hook` against the success value, if any.
	fn on_success(self, hook: impl FnOnce(&T)) -> Self;
	/// Run `hook` against the error, if any.
	fn on_error(self, hook: impl FnOnce(&Error)) -> Self;
}
impl<T> ResultExt<T> for Result<T> {
	fn on_success(self, hook: impl FnOnce(&T)) -> Self {
		if let Ok(value) = &self
			&& std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(value))).is_err()
		{
			tracing::error!("success hook panicked; result preserved");
		}

		self
	}

	fn on_error(self, hook: impl FnOnce(&Error)) -> Self {
		if let Err(err) = &self
			&& std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(err))).is_err()
		{
			tracing::error!("error hook panicked; result preserved");
		}

		self
	}
}

fn categorize_status(status: http::StatusCode) -> ErrorCategory {
	match status.as_u16() {
		401 | 403 => ErrorCategory::Authentication,
		408 => ErrorCategory::Timeout,
		429 => ErrorCategory::Network,
		_ if status.is_server_error() => ErrorCategory::Network,
		_ if status.is_client_error() => ErrorCategory::Validation,
		_ => ErrorCategory::Unknown,
	}
}

fn retriable_status(status: http::StatusCode) -> bool {
	status.is_server_error() || matches!(status.as_u16(), 408 | 429)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn status_error(code: u16) -> Error {
		Error::HttpStatus {
			status: http::StatusCode::from_u16(code).expect("status"),
			url: url::Url::parse("https://api.customfit.ai/v1/cfe").expect("url"),
			body: None,
		}
	}

	#[test]
	fn server_errors_are_retriable() {
		assert!(status_error(500).is_retriable());
		assert!(status_error(503).is_retriable());
		assert_eq!(status_error(500).category(), ErrorCategory::Network);
	}

	#[test]
	fn client_errors_are_terminal_except_408_and_429() {
		assert!(!status_error(400).is_retriable());
		assert!(!status_error(404).is_retriable());
		assert!(status_error(408).is_retriable());
		assert!(status_error(429).is_retriable());
	}

	#[test]
	fn auth_statuses_map_to_authentication() {
		assert_eq!(status_error(401).category(), ErrorCategory::Authentication);
		assert_eq!(status_error(403).category(), ErrorCategory::Authentication);
		assert!(!status_error(401).is_retriable());
	}

	#[test]
	fn offline_is_network_but_not_retriable() {
		assert_eq!(Error::Offline.category(), ErrorCategory::Network);
		assert!(!Error::Offline.is_retriable());
	}

	#[test]
	fn timeout_is_retriable() {
		assert_eq!(Error::Timeout(2_500).category(), ErrorCategory::Timeout);
		assert!(Error::Timeout(2_500).is_retriable());
	}

	#[test]
	fn hooks_observe_without_consuming() {
		let mut seen = None;
		let result: Result<u32> = Ok(7);
		let result = result.on_success(|value| seen = Some(*value)).on_error(|_| panic!("unreachable"));

		assert_eq!(seen, Some(7));
		assert_eq!(result.expect("value"), 7);
	}

	#[test]
	fn panicking_hook_is_swallowed() {
		let result: Result<u32> = Err(Error::Timeout(1));
		let result = result.on_error(|_| panic!("hook bug"));

		assert!(result.is_err());
	}
}
