//! Integration tests for event/summary delivery and flush ordering.

// std
use std::{
	sync::Arc,
	time::Duration,
};
// crates.io
use customfit_sdk::{
	ConfigValue, EventType, RetryPolicy, SdkConfig,
	flags::fetch::ConfigFetcher,
	http::{breaker::BreakerRegistry, client::HttpClient},
	monitor::connection::ConnectionMonitor,
	store::{KvStore, MemoryKvStore},
	telemetry::{SharedSessionId, events::EventTracker, summaries::SummaryManager},
};
use serde_json::json;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

struct Fixture {
	events: Arc<EventTracker>,
	summaries: Arc<SummaryManager>,
	store: Arc<MemoryKvStore>,
}

fn build_fixture(server: &MockServer, events_queue_size: usize, max_stored: usize) -> Fixture {
	let config = SdkConfig::builder("ck-test")
		.api_base_url(server.uri())
		.expect("api base")
		.settings_base_url(server.uri())
		.expect("settings base")
		.retry_policy(RetryPolicy {
			max_attempts: 0,
			initial_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(2),
			backoff_multiplier: 2.0,
		})
		.events_queue_size(events_queue_size)
		.max_stored_events(max_stored)
		.build()
		.expect("config");
	let http = HttpClient::new(&config).expect("http client");
	let connection =
		Arc::new(ConnectionMonitor::new(http.offline_flag(), config.retry_policy.clone()));
	let fetcher =
		ConfigFetcher::new(&config, http, Arc::new(BreakerRegistry::new()), connection)
			.expect("fetcher");
	let session_id = SharedSessionId::new("cf_session_test");
	let summaries = SummaryManager::new(Arc::new(fetcher.clone()), session_id.clone(), 100);
	let store = Arc::new(MemoryKvStore::new());
	let events = EventTracker::new(
		Arc::new(fetcher),
		store.clone(),
		summaries.clone(),
		session_id,
		events_queue_size,
		max_stored,
	);

	Fixture { events, summaries, store }
}

fn sample_config(variation_id: &str) -> ConfigValue {
	ConfigValue {
		variation: json!("v"),
		experience_id: None,
		config_id: Some("cfg-1".into()),
		rule_id: None,
		variation_id: Some(variation_id.into()),
		version: None,
	}
}

async fn request_paths(server: &MockServer) -> Vec<String> {
	server
		.received_requests()
		.await
		.expect("requests")
		.iter()
		.map(|request| request.url.path().to_string())
		.collect()
}

#[tokio::test]
async fn summaries_post_completes_before_events_post_starts() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/v1/summaries"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/cfe"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let fixture = build_fixture(&server, 100, 100);

	for (index, flag) in ["hero_text", "show_banner", "cta_color"].iter().enumerate() {
		fixture.summaries.track(flag, &sample_config(&format!("var-{index}")), None);
		fixture.events.track(EventType::FeatureUsage, *flag, None).expect("track");
	}

	assert_eq!(fixture.events.flush().await.expect("flush"), 3);

	let paths = request_paths(&server).await;

	assert_eq!(paths, vec!["/v1/summaries".to_string(), "/v1/cfe".to_string()]);
	server.verify().await;
}

#[tokio::test]
async fn events_proceed_after_summary_delivery_exhausts_retries() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/v1/summaries"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/v1/cfe"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let fixture = build_fixture(&server, 100, 100);

	fixture.summaries.track("hero_text", &sample_config("var-a"), None);
	fixture.events.track(EventType::Track, "signup", None).expect("track");

	assert_eq!(fixture.events.flush().await.expect("flush"), 1);

	let paths = request_paths(&server).await;

	// The summary attempt happened first even though it failed.
	assert_eq!(paths.first().map(String::as_str), Some("/v1/summaries"));
	assert!(paths.contains(&"/v1/cfe".to_string()));
	// The failed batch is retained for the next cycle.
	assert_eq!(fixture.summaries.pending(), 1);
	server.verify().await;
}

#[tokio::test]
async fn queue_capacity_triggers_immediate_flush() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/v1/cfe"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let fixture = build_fixture(&server, 1, 100);
	// Timer far in the future; only the capacity signal can flush.
	let _loop = fixture.events.spawn_flush_loop(Duration::from_secs(3_600));

	fixture.events.track(EventType::Track, "signup", None).expect("track");

	for _ in 0..50 {
		if fixture.events.pending() == 0 {
			break;
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(fixture.events.pending(), 0);
	server.verify().await;
}

#[tokio::test]
async fn periodic_timer_flushes_without_capacity_pressure() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/v1/cfe"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let fixture = build_fixture(&server, 100, 100);
	let _loop = fixture.events.spawn_flush_loop(Duration::from_millis(50));

	fixture.events.track(EventType::Track, "signup", None).expect("track");

	for _ in 0..50 {
		if fixture.events.pending() == 0 {
			break;
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(fixture.events.pending(), 0);
}

#[tokio::test]
async fn failed_batches_spill_and_drain_on_recovery() {
	let server = MockServer::start().await;
	let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));

	{
		let fail = fail.clone();

		Mock::given(method("POST"))
			.and(path("/v1/cfe"))
			.respond_with(move |_: &wiremock::Request| {
				if fail.load(std::sync::atomic::Ordering::SeqCst) {
					ResponseTemplate::new(503)
				} else {
					ResponseTemplate::new(200)
				}
			})
			.mount(&server)
			.await;
	}

	let fixture = build_fixture(&server, 100, 2);

	fixture.events.track(EventType::Track, "one", None).expect("track");
	fixture.events.track(EventType::Track, "two", None).expect("track");

	assert!(fixture.events.flush().await.is_err());
	// The queue hit max_stored_events, so the batch moved to the store.
	assert_eq!(fixture.events.pending(), 0);
	assert!(!fixture.store.keys().await.expect("keys").is_empty());

	fail.store(false, std::sync::atomic::Ordering::SeqCst);
	fixture.events.track(EventType::Track, "three", None).expect("track");

	assert_eq!(fixture.events.flush().await.expect("flush"), 3);
	assert!(fixture.store.keys().await.expect("keys").is_empty());
}
