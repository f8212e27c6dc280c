//! Thin reqwest wrapper owning timeouts, authentication, and offline gating.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use http::{
	HeaderMap, Method, StatusCode,
	header::{ETAG, LAST_MODIFIED},
};
use reqwest::Client;
use serde::{Serialize, de::DeserializeOwned};
use url::Url;
// self
use crate::{_prelude::*, config::SdkConfig};

/// Query parameter carrying the client key on authenticated requests.
pub const AUTH_QUERY_PARAM: &str = "cfenc";

/// Credential mode for an outbound request.
///
/// The settings document is public and fetched bare; the evaluation and
/// telemetry endpoints expect the client key in the query string.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Auth {
	/// No credentials attached.
	None,
	/// Append `cfenc={client_key}` to the query string.
	ClientKey,
}

/// Response surface handed back to callers.
#[derive(Clone, Debug)]
pub struct HttpResponse {
	/// Response status; 304 is surfaced, not treated as an error.
	pub status: StatusCode,
	/// Response headers.
	pub headers: HeaderMap,
	/// Raw body bytes; empty for HEAD and 304 responses.
	pub body: Vec<u8>,
}
impl HttpResponse {
	/// `ETag` header value, when present.
	pub fn etag(&self) -> Option<String> {
		header_string(&self.headers, &ETAG)
	}

	/// Raw `Last-Modified` header value, when present.
	pub fn last_modified(&self) -> Option<String> {
		header_string(&self.headers, &LAST_MODIFIED)
	}

	/// `Last-Modified` parsed as a UTC timestamp, when present and valid.
	pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
		self.last_modified()
			.and_then(|raw| httpdate::parse_http_date(&raw).ok())
			.map(<DateTime<Utc>>::from)
	}

	/// Whether the origin answered 304 Not Modified.
	pub fn is_not_modified(&self) -> bool {
		self.status == StatusCode::NOT_MODIFIED
	}

	/// Deserialize the body as JSON.
	pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
		Ok(serde_json::from_slice(&self.body)?)
	}
}

/// HTTP transport shared by the fetcher and the telemetry pipelines.
///
/// Authentication, where an endpoint calls for it, is the client key appended
/// as the `cfenc` query parameter; no Authorization header is ever sent. The
/// offline switch short-circuits every call with [`Error::Offline`] before
/// any I/O happens.
#[derive(Clone, Debug)]
pub struct HttpClient {
	client: Client,
	client_key: Arc<str>,
	read_timeout: Duration,
	offline: Arc<AtomicBool>,
}
impl HttpClient {
	/// Build a transport from the configuration snapshot.
	pub fn new(config: &SdkConfig) -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("customfit-sdk/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(config.connect_timeout)
			.build()?;

		Ok(Self {
			client,
			client_key: Arc::from(config.client_key.as_str()),
			read_timeout: config.read_timeout,
			offline: Arc::new(AtomicBool::new(config.offline_mode)),
		})
	}

	/// Shared offline flag, also held by the connection monitor.
	pub fn offline_flag(&self) -> Arc<AtomicBool> {
		self.offline.clone()
	}

	/// Whether offline mode is currently engaged.
	pub fn is_offline(&self) -> bool {
		self.offline.load(Ordering::Acquire)
	}

	/// Issue a HEAD request with extra headers.
	pub async fn head(&self, url: &Url, headers: HeaderMap, auth: Auth) -> Result<HttpResponse> {
		self.request(Method::HEAD, url, headers, None::<&()>, auth).await
	}

	/// Issue a GET request with extra headers.
	pub async fn get(&self, url: &Url, headers: HeaderMap, auth: Auth) -> Result<HttpResponse> {
		self.request(Method::GET, url, headers, None::<&()>, auth).await
	}

	/// Issue a POST request with a JSON body and extra headers.
	pub async fn post_json<B: Serialize + ?Sized>(
		&self,
		url: &Url,
		headers: HeaderMap,
		body: &B,
		auth: Auth,
	) -> Result<HttpResponse> {
		self.request(Method::POST, url, headers, Some(body), auth).await
	}

	async fn request<B: Serialize + ?Sized>(
		&self,
		method: Method,
		url: &Url,
		headers: HeaderMap,
		body: Option<&B>,
		auth: Auth,
	) -> Result<HttpResponse> {
		if self.is_offline() {
			return Err(Error::Offline);
		}

		let mut url = url.clone();

		if auth == Auth::ClientKey {
			url.query_pairs_mut().append_pair(AUTH_QUERY_PARAM, &self.client_key);
		}

		let mut builder =
			self.client.request(method.clone(), url.clone()).timeout(self.read_timeout);

		for (name, value) in headers.iter() {
			builder = builder.header(name, value);
		}
		if let Some(body) = body {
			builder = builder.json(body);
		}

		let started = Instant::now();
		let response = builder.send().await?;
		let status = response.status();
		let response_headers = response.headers().clone();

		tracing::debug!(%method, %status, elapsed = ?started.elapsed(), path = url.path(), "http exchange");

		if status == StatusCode::NOT_MODIFIED {
			return Ok(HttpResponse { status, headers: response_headers, body: Vec::new() });
		}
		if !status.is_success() {
			let body = response.text().await.ok();

			// Strip the query so the client key never reaches logs or errors.
			url.set_query(None);

			return Err(Error::HttpStatus { status, url, body });
		}

		let body = response.bytes().await?.to_vec();

		Ok(HttpResponse { status, headers: response_headers, body })
	}
}

fn header_string(headers: &HeaderMap, name: &http::HeaderName) -> Option<String> {
	headers.get(name).and_then(|value| value.to_str().ok()).map(|s| s.to_string())
}
