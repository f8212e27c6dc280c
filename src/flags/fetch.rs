//! Config, settings, and telemetry endpoint interactions.
//!
//! Every request runs inside the retry executor with per-attempt circuit
//! breaker admission, reports its outcome to the connection monitor, and is
//! short-circuited entirely in offline mode.

// crates.io
use http::{
	HeaderMap, HeaderValue,
	header::{IF_MODIFIED_SINCE, IF_NONE_MATCH},
};
use serde::Serialize;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::SdkConfig,
	error::ErrorCategory,
	flags::{ConfigMap, SdkSettings, SettingsMetadata},
	http::{
		breaker::BreakerRegistry,
		client::{Auth, HttpClient, HttpResponse},
		retry::RetryExecutor,
	},
	monitor::connection::ConnectionMonitor,
	telemetry::{events::EventRecord, summaries::SummaryRecord},
	user::WireUser,
};

/// Breaker endpoint key for the settings document.
pub const ENDPOINT_SETTINGS: &str = "settings";
/// Breaker endpoint key for user-config evaluation.
pub const ENDPOINT_USER_CONFIGS: &str = "user_configs";
/// Breaker endpoint key for event delivery.
pub const ENDPOINT_EVENTS: &str = "events";
/// Breaker endpoint key for summary delivery.
pub const ENDPOINT_SUMMARIES: &str = "summaries";

/// Outcome of a conditional user-config fetch.
#[derive(Clone, Debug)]
pub enum UserConfigsFetch {
	/// Fresh configs with the validators that accompanied them.
	Updated {
		/// Replacement config map.
		configs: ConfigMap,
		/// Validators from the response, when present.
		metadata: SettingsMetadata,
	},
	/// The origin answered 304; cached configs remain authoritative.
	NotModified,
}

/// Client for every remote endpoint the SDK talks to.
#[derive(Clone, Debug)]
pub struct ConfigFetcher {
	http: HttpClient,
	retry: RetryExecutor,
	breakers: Arc<BreakerRegistry>,
	connection: Arc<ConnectionMonitor>,
	settings_url: Url,
	user_configs_url: Url,
	events_url: Url,
	summaries_url: Url,
}
impl ConfigFetcher {
	/// Build a fetcher for the configured endpoints.
	pub fn new(
		config: &SdkConfig,
		http: HttpClient,
		breakers: Arc<BreakerRegistry>,
		connection: Arc<ConnectionMonitor>,
	) -> Result<Self> {
		Ok(Self {
			http,
			retry: RetryExecutor::new(config.retry_policy.clone()),
			breakers,
			connection,
			settings_url: config.settings_url()?,
			user_configs_url: config.api_base_url.join("v1/users/configs")?,
			events_url: config.api_base_url.join("v1/cfe")?,
			summaries_url: config.api_base_url.join("v1/summaries")?,
		})
	}

	/// Cheap validator read via HEAD on the settings document.
	///
	/// The settings document is public; no client key rides along.
	pub async fn fetch_settings_metadata(&self) -> Result<SettingsMetadata> {
		let response = self
			.guarded(ENDPOINT_SETTINGS, || async {
				self.http.head(&self.settings_url, HeaderMap::new(), Auth::None).await
			})
			.await?;

		Ok(metadata_from(&response))
	}

	/// Full settings document fetch.
	pub async fn fetch_settings(&self) -> Result<(SdkSettings, SettingsMetadata)> {
		let response = self
			.guarded(ENDPOINT_SETTINGS, || async {
				self.http.get(&self.settings_url, HeaderMap::new(), Auth::None).await
			})
			.await?;
		let settings = response.json::<SdkSettings>()?;

		Ok((settings, metadata_from(&response)))
	}

	/// Conditional user-config evaluation POST.
	pub async fn fetch_user_configs(
		&self,
		user: &WireUser,
		metadata: &SettingsMetadata,
	) -> Result<UserConfigsFetch> {
		let headers = conditional_headers(metadata);
		let body = UserConfigsRequest { user };
		let response = self
			.guarded(ENDPOINT_USER_CONFIGS, || async {
				self.http
					.post_json(&self.user_configs_url, headers.clone(), &body, Auth::ClientKey)
					.await
			})
			.await?;

		if response.is_not_modified() {
			return Ok(UserConfigsFetch::NotModified);
		}

		Ok(UserConfigsFetch::Updated {
			configs: response.json::<ConfigMap>()?,
			metadata: metadata_from(&response),
		})
	}

	/// Batched event delivery POST.
	pub async fn post_events(&self, events: &[EventRecord]) -> Result<()> {
		let body = EventsRequest { events };

		self.guarded(ENDPOINT_EVENTS, || async {
			self.http.post_json(&self.events_url, HeaderMap::new(), &body, Auth::ClientKey).await
		})
		.await?;

		Ok(())
	}

	/// Batched summary delivery POST.
	pub async fn post_summaries(&self, summaries: &[SummaryRecord]) -> Result<()> {
		let body = SummariesRequest { summaries };

		self.guarded(ENDPOINT_SUMMARIES, || async {
			self.http
				.post_json(&self.summaries_url, HeaderMap::new(), &body, Auth::ClientKey)
				.await
		})
		.await?;

		Ok(())
	}

	async fn guarded<T, Fut, Op>(&self, endpoint: &str, operation: Op) -> Result<T>
	where
		Fut: Future<Output = Result<T>>,
		Op: Fn() -> Fut,
	{
		if self.http.is_offline() {
			return Err(Error::Offline);
		}

		let breaker = self.breakers.breaker(endpoint);
		let result = self.retry.execute(|| breaker.execute(&operation)).await;

		match &result {
			Ok(_) => self.connection.record_success(),
			Err(Error::Offline) => {},
			Err(err)
				if matches!(err.category(), ErrorCategory::Network | ErrorCategory::Timeout) =>
				self.connection.record_failure(err.to_string()),
			Err(_) => {},
		}

		result
	}
}

#[async_trait::async_trait]
impl crate::telemetry::summaries::SummarySink for ConfigFetcher {
	async fn deliver_summaries(&self, batch: &[SummaryRecord]) -> Result<()> {
		self.post_summaries(batch).await
	}
}
#[async_trait::async_trait]
impl crate::telemetry::events::EventSink for ConfigFetcher {
	async fn deliver_events(&self, batch: &[EventRecord]) -> Result<()> {
		self.post_events(batch).await
	}
}

#[derive(Debug, Serialize)]
struct UserConfigsRequest<'a> {
	user: &'a WireUser,
}

#[derive(Debug, Serialize)]
struct EventsRequest<'a> {
	events: &'a [EventRecord],
}

#[derive(Debug, Serialize)]
struct SummariesRequest<'a> {
	summaries: &'a [SummaryRecord],
}

fn metadata_from(response: &HttpResponse) -> SettingsMetadata {
	SettingsMetadata { last_modified: response.last_modified(), etag: response.etag() }
}

fn conditional_headers(metadata: &SettingsMetadata) -> HeaderMap {
	let mut headers = HeaderMap::new();

	if let Some(last_modified) = &metadata.last_modified
		&& let Ok(value) = HeaderValue::from_str(last_modified)
	{
		headers.insert(IF_MODIFIED_SINCE, value);
	}
	if let Some(etag) = &metadata.etag
		&& let Ok(value) = HeaderValue::from_str(etag)
	{
		headers.insert(IF_NONE_MATCH, value);
	}

	headers
}
