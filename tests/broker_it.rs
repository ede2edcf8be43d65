// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use time::OffsetDateTime;
// self
use credential_broker::{
	broker::{Broker, ServiceState},
	config::BrokerConfig,
	error::{Error, ErrorKind, FetchError},
	fetcher::{FetchFuture, TokenFetcher},
	token::{CacheKey, CredentialSet, RawToken, TokenOrigin},
};

/// Upstream double that mints `{prefix}-{n}` tokens and can be switched off.
struct Upstream {
	ttl: Duration,
	latency: Duration,
	down: AtomicBool,
	calls: AtomicUsize,
}
impl Upstream {
	fn new(ttl: Duration, latency: Duration) -> Arc<Self> {
		Arc::new(Self { ttl, latency, down: AtomicBool::new(false), calls: AtomicUsize::new(0) })
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	fn set_down(&self, down: bool) {
		self.down.store(down, Ordering::SeqCst);
	}
}
impl TokenFetcher for Upstream {
	fn fetch<'a>(&'a self, credentials: Option<&'a CredentialSet>) -> FetchFuture<'a, RawToken> {
		Box::pin(async move {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

			tokio::time::sleep(self.latency).await;

			if self.down.load(Ordering::SeqCst) {
				return Err(FetchError::network(std::io::Error::other("connection refused")));
			}

			let prefix = credentials.and_then(|set| set.get("sp_dc")).unwrap_or("anon");
			let expires_at = OffsetDateTime::now_utc() + self.ttl;

			Ok(RawToken::new(
				format!("{prefix}-{call}"),
				(expires_at.unix_timestamp_nanos() / 1_000_000) as i64,
				credentials.is_none(),
				prefix,
			))
		})
	}
}

fn credentials(cookie: &str) -> CredentialSet {
	CredentialSet::single("sp_dc", cookie).expect("Credential fixture should be valid.")
}

fn broker(upstream: Arc<Upstream>) -> Broker {
	Broker::new(upstream, BrokerConfig::default()).expect("Default configuration should be valid.")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_anonymous_requests_trigger_a_single_fetch() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::from_millis(50));
	let broker = broker(upstream.clone());
	let tasks = (0..32)
		.map(|_| {
			let broker = broker.clone();

			tokio::spawn(async move { broker.request(CacheKey::Anonymous, None).await })
		})
		.collect::<Vec<_>>();
	let mut values = Vec::new();

	for task in tasks {
		let token = task
			.await
			.expect("Request task should not panic.")
			.expect("Anonymous request should succeed.");

		values.push(token.value.expose().to_owned());
	}

	values.dedup();

	assert_eq!(values, vec!["anon-1".to_owned()]);
	assert_eq!(upstream.calls(), 1);
	assert_eq!(broker.state(), ServiceState::Ready);

	let stats = broker.stats();

	assert_eq!(stats.refresh.fetches, 1);
	assert_eq!(stats.refresh.attempts, 32);
	assert_eq!(stats.refresh.cache_hits, 31);
}

#[tokio::test]
async fn named_keys_are_isolated_and_credential_bound() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::ZERO);
	let broker = broker(upstream.clone());
	let alice = CacheKey::named("alice").expect("Key fixture should be valid.");
	let bob = CacheKey::named("bob").expect("Key fixture should be valid.");
	let first = broker
		.request(alice.clone(), Some(credentials("alice-cookie")))
		.await
		.expect("Alice's request should succeed.");
	let cached = broker
		.request(alice.clone(), Some(credentials("alice-cookie")))
		.await
		.expect("Alice's repeated request should be cached.");

	assert_eq!(first.value, cached.value);
	assert_eq!(cached.origin, TokenOrigin::Cached);
	assert!(!cached.is_anonymous);
	assert_eq!(upstream.calls(), 1);

	let other = broker
		.request(bob, Some(credentials("bob-cookie")))
		.await
		.expect("Bob's request should succeed.");

	assert_eq!(other.value.expose(), "bob-cookie-2");

	let rotated = broker
		.request(alice.clone(), Some(credentials("alice-rotated")))
		.await
		.expect("Rotated credentials should mint a new token.");

	assert_eq!(rotated.value.expose(), "alice-rotated-3");
	assert_eq!(upstream.calls(), 3);

	let missing = broker.request(alice, None).await;

	assert!(matches!(missing, Err(Error::Unauthorized { .. })));
	assert_eq!(broker.stats().cache.count, 2);
}

#[tokio::test]
async fn anonymous_failures_fall_back_to_the_last_good_token() {
	// Valid for two minutes: inside the buffer, so every request refetches, but above the floor.
	let upstream = Upstream::new(Duration::from_secs(120), Duration::ZERO);
	let broker = broker(upstream.clone());
	let fresh = broker.initialize().await.expect("Initialization should succeed.");

	upstream.set_down(true);

	let degraded =
		broker.request(CacheKey::Anonymous, None).await.expect("Fallback should be served.");

	assert_eq!(degraded.value, fresh.value);
	assert_eq!(degraded.origin, TokenOrigin::Cached);
	assert_eq!(broker.stats().refresh.fallbacks, 1);
	assert_eq!(broker.stats().error_count, 1);

	let forced = broker.force_refresh(CacheKey::Anonymous, None).await;

	assert!(
		matches!(forced, Err(Error::ServiceUnavailable { cause: ErrorKind::TransientNetwork, .. })),
		"Forced refreshes never fall back."
	);
}

#[tokio::test]
async fn service_enters_error_after_threshold_and_recovers_on_request() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::ZERO);
	let config = BrokerConfig::builder()
		.error_threshold(2)
		.build()
		.expect("Threshold override should be valid.");
	let broker = Broker::new(upstream.clone(), config).expect("Configuration should be valid.");

	broker.initialize().await.expect("Initialization should succeed.");
	upstream.set_down(true);

	for _ in 0..2 {
		assert!(broker.force_refresh(CacheKey::Anonymous, None).await.is_err());
	}

	assert_eq!(broker.state(), ServiceState::Error);

	upstream.set_down(false);
	broker.invalidate(&CacheKey::Anonymous);

	let token =
		broker.request(CacheKey::Anonymous, None).await.expect("Request should trigger recovery.");

	assert_eq!(broker.state(), ServiceState::Ready);
	assert_eq!(broker.stats().recovery_runs, 1);
	assert_eq!(broker.stats().error_count, 0);
	assert_eq!(token.value.expose(), "anon-4");
}

#[tokio::test]
async fn error_state_still_serves_valid_cached_tokens() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::ZERO);
	let broker = broker(upstream.clone());
	let anonymous = broker.initialize().await.expect("Initialization should succeed.");

	upstream.set_down(true);

	for _ in 0..5 {
		let failed = broker.request(CacheKey::Authenticated, Some(credentials("cookie"))).await;

		assert!(matches!(failed, Err(Error::ServiceUnavailable { .. })));
	}

	assert_eq!(broker.state(), ServiceState::Error);

	let cached = broker
		.request(CacheKey::Anonymous, None)
		.await
		.expect("A valid cached anonymous token should be served in the error state.");

	assert_eq!(cached.value, anonymous.value);
	assert_eq!(cached.origin, TokenOrigin::Cached);
	assert_eq!(broker.state(), ServiceState::Error);
	assert_eq!(broker.stats().recovery_runs, 0);
	assert_eq!(upstream.calls(), 6);
}

#[tokio::test]
async fn evicted_keys_release_their_refresh_lanes() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::ZERO);
	let config =
		BrokerConfig::builder().max_entries(2).build().expect("Capacity override should be valid.");
	let broker = Broker::new(upstream.clone(), config).expect("Configuration should be valid.");

	for tenant in 0..20 {
		let key = CacheKey::named(format!("tenant-{tenant}")).expect("Key fixture should be valid.");

		broker
			.request(key, Some(credentials(&format!("cookie-{tenant}"))))
			.await
			.expect("Tenant request should succeed.");
	}

	let stats = broker.stats();

	assert_eq!(stats.cache.count, 2);
	assert_eq!(stats.mutexes.len(), 2);
	assert!(stats.mutexes.keys().all(|key| stats.cache.keys().contains(key)));

	upstream.set_down(true);

	let key = CacheKey::named("tenant-failing").expect("Key fixture should be valid.");

	assert!(broker.request(key, Some(credentials("cookie-failing"))).await.is_err());
	assert_eq!(broker.stats().mutexes.len(), 2, "Failed keys must not keep a lane.");
}

#[tokio::test]
async fn shutdown_rejects_requests_and_empties_the_cache() {
	let upstream = Upstream::new(Duration::from_secs(3_600), Duration::ZERO);
	let broker = Broker::start(upstream.clone(), BrokerConfig::default())
		.await
		.expect("Broker should start.");

	assert_eq!(broker.state(), ServiceState::Ready);
	assert!(broker.stats().scheduler_running);

	broker.shutdown();
	broker.shutdown();

	let stats = broker.stats();

	assert_eq!(stats.state, ServiceState::Shutdown);
	assert_eq!(stats.cache.count, 0);
	assert!(!stats.scheduler_running);
	assert!(matches!(broker.request(CacheKey::Anonymous, None).await, Err(Error::Shutdown)));
	assert!(matches!(broker.force_refresh(CacheKey::Anonymous, None).await, Err(Error::Shutdown)));
}
