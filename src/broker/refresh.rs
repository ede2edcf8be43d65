//! Single-flight refresh coordination with degraded fallback and per-entry timers.
//!
//! Every key owns a lane: a FIFO [`AsyncMutex`], the credentials its cached token was minted for,
//! and the last good token. [`RefreshCoordinator::obtain`] serves valid cached tokens without
//! touching the lock; otherwise it queues on the lane, re-checks the cache once it holds the lock
//! (so callers that queued behind a fetch reuse its result), and only then calls the fetcher.
//! Authenticated-class tokens arm a timer that refreshes them just before they enter the buffer
//! window, using the credentials remembered by the lane.

mod metrics;

pub use metrics::*;

// crates.io
use tokio::task::AbortHandle;
// self
use crate::{
	_prelude::*,
	broker::state::ServiceStateMachine,
	cache::{RefreshTicket, TokenCache},
	config::BrokerConfig,
	error::FetchError,
	fetcher::TokenFetcher,
	obs::{self, RefreshOutcome, RefreshSpan, RefreshTrigger, trace_event},
	sync::{AsyncMutex, MutexConfig, MutexStats},
	token::{CacheKey, CredentialSet, KeyClass, Token},
};

/// Input of [`RefreshCoordinator::obtain`].
#[derive(Clone, Debug)]
pub struct RefreshRequest {
	/// Key to serve.
	pub key: CacheKey,
	/// Credentials for authenticated-class keys; ignored for the anonymous key.
	pub credentials: Option<CredentialSet>,
	/// What caused the request.
	pub trigger: RefreshTrigger,
	/// Skip the cache unless an entry was stored after the request was made.
	pub force: bool,
	/// Serve the last good anonymous token when the refresh fails.
	pub allow_fallback: bool,
}
impl RefreshRequest {
	/// Creates a cache-first request without credentials.
	pub fn new(key: CacheKey) -> Self {
		Self {
			key,
			credentials: None,
			trigger: RefreshTrigger::Request,
			force: false,
			allow_fallback: true,
		}
	}

	/// Attaches credentials.
	pub fn with_credentials(mut self, credentials: Option<CredentialSet>) -> Self {
		self.credentials = credentials;

		self
	}

	/// Overrides the trigger label.
	pub fn with_trigger(mut self, trigger: RefreshTrigger) -> Self {
		self.trigger = trigger;

		self
	}

	/// Marks the request as forced.
	pub fn with_force(mut self, force: bool) -> Self {
		self.force = force;

		self
	}

	/// Disables the degraded fallback.
	pub fn without_fallback(mut self) -> Self {
		self.allow_fallback = false;

		self
	}
}

/// Serializes refreshes per key and keeps the cache populated.
pub struct RefreshCoordinator {
	fetcher: Arc<dyn TokenFetcher>,
	cache: Arc<TokenCache>,
	state: Arc<ServiceStateMachine>,
	metrics: Arc<RefreshMetrics>,
	mutex_config: MutexConfig,
	fetch_timeout: Duration,
	stale_fallback_floor: Duration,
	lanes: Mutex<HashMap<CacheKey, Arc<Lane>>>,
}
impl RefreshCoordinator {
	/// Creates a coordinator over `cache`, reporting outcomes to `state`.
	pub fn new(
		fetcher: Arc<dyn TokenFetcher>,
		cache: Arc<TokenCache>,
		state: Arc<ServiceStateMachine>,
		config: &BrokerConfig,
	) -> Self {
		Self {
			fetcher,
			cache,
			state,
			metrics: Default::default(),
			mutex_config: config.mutex,
			fetch_timeout: config.fetch_timeout,
			stale_fallback_floor: config.stale_fallback_floor,
			lanes: Default::default(),
		}
	}

	/// Cache the coordinator writes to.
	pub fn cache(&self) -> &Arc<TokenCache> {
		&self.cache
	}

	/// Refresh counters.
	pub fn metrics(&self) -> &Arc<RefreshMetrics> {
		&self.metrics
	}

	/// Lock statistics for every lane created so far.
	pub fn mutex_stats(&self) -> BTreeMap<CacheKey, MutexStats> {
		self.lanes.lock().iter().map(|(key, lane)| (key.clone(), lane.mutex.stats())).collect()
	}

	/// Drops the cached token and the last good token for `key`.
	pub fn invalidate(&self, key: &CacheKey) -> bool {
		let removed = self.cache.invalidate(key);

		if key.is_anonymous() {
			let lane = self.lanes.lock().get(key).cloned();

			if let Some(lane) = lane {
				lane.session.lock().last_good = None;
			}
		} else {
			self.prune(std::slice::from_ref(key));
		}

		removed
	}

	/// Serves a valid cached token for `request` without queueing on its lane.
	///
	/// Returns `None` for forced requests, cache misses, and credential mismatches.
	pub fn cached(&self, request: &RefreshRequest) -> Option<Token> {
		if request.force {
			return None;
		}

		let credentials = match request.key.class() {
			KeyClass::Anonymous => None,
			KeyClass::Authenticated => Some(request.credentials.as_ref()?),
		};
		let lane = self.lanes.lock().get(&request.key).cloned()?;
		let token = lane.cached(&self.cache, &request.key, credentials, None)?;

		self.record_cache_hit(request.key.class());

		Some(token)
	}

	/// Last good anonymous token still valid beyond the fallback floor.
	pub fn fallback(&self, key: &CacheKey) -> Option<Token> {
		if !key.is_anonymous() {
			return None;
		}

		let lane = self.lanes.lock().get(key).cloned()?;
		let token = lane.fallback(OffsetDateTime::now_utc(), self.stale_fallback_floor)?;

		self.metrics.record_fallback();

		obs::record_refresh_outcome(key.class(), RefreshOutcome::Fallback);

		Some(token.as_cached())
	}

	/// Returns a valid token for `request.key`, fetching at most once per key at a time.
	pub async fn obtain(self: &Arc<Self>, request: RefreshRequest) -> Result<Token> {
		let RefreshRequest { key, credentials, trigger, force, allow_fallback } = request;
		let class = key.class();
		let span = RefreshSpan::new(&key, trigger);

		obs::record_refresh_outcome(class, RefreshOutcome::Attempt);
		self.metrics.record_attempt();

		span.instrument(async move {
			let credentials = match (class, trigger) {
				(KeyClass::Anonymous, _) => None,
				(KeyClass::Authenticated, RefreshTrigger::Timer) =>
					self.lanes.lock().get(&key).and_then(|lane| lane.credentials()),
				(KeyClass::Authenticated, _) => credentials,
			};

			if class == KeyClass::Authenticated && credentials.is_none() {
				return self.fail(
					&key,
					Error::Unauthorized { reason: format!("credentials are required for `{key}`") },
					false,
				);
			}

			let lane = self.lane(&key);

			if !force {
				if let Some(token) = lane.cached(&self.cache, &key, credentials.as_ref(), None) {
					self.record_cache_hit(class);

					return Ok(token);
				}
			}

			let watermark = self.cache.sequence();
			let (key_ref, lane_ref) = (&key, &*lane);
			let result = lane
				.mutex
				.run_exclusive(move || {
					self.fetch_and_store(key_ref, lane_ref, credentials, force, watermark)
				})
				.await;

			drop(lane);

			match result {
				Ok(token) => Ok(token),
				Err(err) => {
					let outcome = self.fail(&key, err, allow_fallback);

					self.prune(std::slice::from_ref(&key));

					outcome
				},
			}
		})
		.await
	}

	fn lane(&self, key: &CacheKey) -> Arc<Lane> {
		let mut lanes = self.lanes.lock();

		lanes
			.entry(key.clone())
			.or_insert_with(|| {
				Arc::new(Lane {
					mutex: AsyncMutex::new(format!("refresh:{key}"), self.mutex_config),
					session: Mutex::new(LaneSession::default()),
				})
			})
			.clone()
	}

	async fn fetch_and_store(
		self: &Arc<Self>,
		key: &CacheKey,
		lane: &Lane,
		credentials: Option<CredentialSet>,
		force: bool,
		watermark: u64,
	) -> Result<Token> {
		let class = key.class();
		let newer_than = force.then_some(watermark);

		if let Some(token) = lane.cached(&self.cache, key, credentials.as_ref(), newer_than) {
			trace_event!(debug, "Reused a token stored while this caller was queued.");

			self.record_cache_hit(class);

			return Ok(token);
		}

		let in_flight = self.state.refresh_started(class);

		self.metrics.record_fetch();

		let raw = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(credentials.as_ref()))
			.await
			.map_err(|_| FetchError::Timeout { after: self.fetch_timeout })??;
		let token = Token::from_raw(raw, OffsetDateTime::now_utc())?;

		self.store(key, lane, &token, credentials)?;
		self.metrics.record_success();
		in_flight.succeeded();

		obs::record_refresh_outcome(class, RefreshOutcome::Fetched);
		trace_event!(
			info,
			fingerprint = %token.value.fingerprint(),
			expires_at_ms = token.expires_at_ms(),
			"Token refreshed."
		);

		Ok(token)
	}

	fn store(
		self: &Arc<Self>,
		key: &CacheKey,
		lane: &Lane,
		token: &Token,
		credentials: Option<CredentialSet>,
	) -> Result<()> {
		let evicted = {
			// The lane lock spans the cache write so readers never pair new credentials with a
			// token minted for the previous ones.
			let mut session = lane.session.lock();
			let evicted = if key.is_anonymous() {
				self.cache.put(key.clone(), token.clone())?
			} else {
				self.cache.put_scheduled(key.clone(), token.clone(), |ticket| {
					self.arm_timer(key.clone(), ticket)
				})?
			};

			session.credentials = credentials;
			session.last_good = key.is_anonymous().then(|| token.clone());

			evicted
		};

		// Session locks are released first: pruning takes other lanes' session locks.
		self.prune(&evicted);

		Ok(())
	}

	/// Forgets credential-bound lanes whose keys have no cache entry.
	///
	/// Lanes nobody else references are removed; lanes with callers in flight only lose their
	/// credentials. The anonymous lane is kept for its last good token.
	fn prune(&self, keys: &[CacheKey]) {
		if keys.is_empty() {
			return;
		}

		let mut lanes = self.lanes.lock();

		for key in keys {
			if key.is_anonymous() || self.cache.remaining(key).is_some() {
				continue;
			}

			let Some(lane) = lanes.get(key) else {
				continue;
			};

			if Arc::strong_count(lane) == 1 {
				lanes.remove(key);
			} else {
				*lane.session.lock() = LaneSession::default();
			}
		}

		trace_event!(debug, lanes = lanes.len(), "Refresh lanes pruned.");
	}

	fn arm_timer(self: &Arc<Self>, key: CacheKey, ticket: RefreshTicket) -> AbortHandle {
		let coordinator = Arc::downgrade(self);

		tokio::spawn(async move {
			tokio::time::sleep(ticket.delay).await;

			let Some(coordinator) = coordinator.upgrade() else {
				return;
			};

			if !coordinator.cache.disarm(&key, ticket.id) {
				return;
			}

			let request = RefreshRequest::new(key)
				.with_trigger(RefreshTrigger::Timer)
				.with_force(true)
				.without_fallback();

			// Failures are already logged and counted by `obtain`.
			let _ = coordinator.obtain(request).await;
		})
		.abort_handle()
	}

	fn record_cache_hit(&self, class: KeyClass) {
		self.metrics.record_cache_hit();

		obs::record_refresh_outcome(class, RefreshOutcome::CacheHit);
	}

	fn fail(&self, key: &CacheKey, err: Error, allow_fallback: bool) -> Result<Token> {
		let class = key.class();

		if matches!(err, Error::Shutdown) {
			return Err(err);
		}

		self.metrics.record_failure();

		if matches!(err, Error::Fetch(_) | Error::MutexForceReleased) {
			self.state.refresh_failed(class, &err);
		}
		if let Some(token) = allow_fallback.then(|| self.fallback(key)).flatten() {
			trace_event!(
				warn,
				error = %err,
				fingerprint = %token.value.fingerprint(),
				"Refresh failed; serving the last good anonymous token."
			);

			return Ok(token);
		}

		obs::record_refresh_outcome(class, RefreshOutcome::Failure);
		trace_event!(warn, error = %err, kind = err.kind().as_str(), "Refresh failed.");

		Err(err)
	}
}
impl Debug for RefreshCoordinator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RefreshCoordinator")
			.field("lanes", &self.lanes.lock().len())
			.field("fetch_timeout", &self.fetch_timeout)
			.field("stale_fallback_floor", &self.stale_fallback_floor)
			.finish()
	}
}

struct Lane {
	mutex: AsyncMutex,
	session: Mutex<LaneSession>,
}
impl Lane {
	fn cached(
		&self,
		cache: &TokenCache,
		key: &CacheKey,
		credentials: Option<&CredentialSet>,
		newer_than: Option<u64>,
	) -> Option<Token> {
		let session = self.session.lock();

		if session.credentials.as_ref() != credentials {
			return None;
		}

		match newer_than {
			Some(seq) => cache.get_stored_after(key, seq),
			None => cache.get(key),
		}
	}

	fn credentials(&self) -> Option<CredentialSet> {
		self.session.lock().credentials.clone()
	}

	fn fallback(&self, now: OffsetDateTime, floor: Duration) -> Option<Token> {
		self.session.lock().last_good.clone().filter(|token| token.remaining_at(now) > floor)
	}
}

#[derive(Default)]
struct LaneSession {
	credentials: Option<CredentialSet>,
	last_good: Option<Token>,
}
