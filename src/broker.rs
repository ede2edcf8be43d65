//! Caller-facing broker facade.
//!
//! [`Broker`] owns the cache, the refresh coordinator, the service state machine, recovery, and
//! the proactive scheduler. Cloning is cheap; every clone drives the same broker.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use credential_broker::{
//! 	broker::Broker, config::BrokerConfig, error::FetchError, fetcher::FnFetcher,
//! 	token::{CacheKey, RawToken},
//! };
//!
//! # async fn demo() -> credential_broker::error::Result<()> {
//! let fetcher = FnFetcher::new(|_credentials| async {
//! 	Ok::<_, FetchError>(RawToken::new("BQD", 4_102_444_800_000, true, "demo"))
//! });
//! let broker = Broker::start(Arc::new(fetcher), BrokerConfig::default()).await?;
//! let token = broker.request(CacheKey::Anonymous, None).await?;
//!
//! println!("token expires at {}", token.expires_at);
//! broker.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod recovery;
pub mod refresh;
pub mod scheduler;
pub mod state;

pub use recovery::*;
pub use refresh::*;
pub use scheduler::*;
pub use state::*;

// self
use crate::{
	_prelude::*,
	cache::{CacheStats, TokenCache},
	config::BrokerConfig,
	error::FetchError,
	fetcher::TokenFetcher,
	obs::{RefreshTrigger, trace_event},
	sync::MutexStats,
	token::{CacheKey, CredentialSet, KeyClass, Token},
};

/// Serializable snapshot returned by [`Broker::stats`]. Never carries token values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
	/// Current service state.
	pub state: ServiceState,
	/// Refresh failures since the last success.
	pub error_count: u32,
	/// Last successful refresh in Unix epoch milliseconds.
	pub last_success_at_ms: Option<i64>,
	/// Last failure, cleared by the next success.
	pub last_error: Option<LastError>,
	/// Cache contents.
	pub cache: CacheStats,
	/// Refresh lock statistics per key.
	pub mutexes: BTreeMap<CacheKey, MutexStats>,
	/// Refresh counters.
	pub refresh: RefreshMetricsSnapshot,
	/// Completed recovery runs.
	pub recovery_runs: u64,
	/// Whether the proactive scheduler loop is running.
	pub scheduler_running: bool,
}

/// Token broker serving cached, single-flight refreshed tokens to concurrent callers.
#[derive(Clone)]
pub struct Broker {
	shared: Arc<Shared>,
}
impl Broker {
	/// Creates an idle broker; call [`initialize`](Self::initialize) and
	/// [`start_scheduler`](Self::start_scheduler), or use [`start`](Self::start).
	pub fn new(fetcher: Arc<dyn TokenFetcher>, config: BrokerConfig) -> Result<Self> {
		config.validate()?;

		let cache = Arc::new(TokenCache::new(config.buffer, config.max_entries));
		let state = Arc::new(ServiceStateMachine::new(config.error_threshold));
		let coordinator = Arc::new(RefreshCoordinator::new(
			fetcher.clone(),
			cache.clone(),
			state.clone(),
			&config,
		));
		let recovery = RecoveryManager::new(coordinator.clone(), fetcher, state.clone());

		Ok(Self {
			shared: Arc::new(Shared {
				config,
				cache,
				state,
				coordinator,
				recovery,
				scheduler: Mutex::new(None),
			}),
		})
	}

	/// Creates a broker, attempts the initial anonymous fetch, and starts the scheduler.
	///
	/// A failed initial fetch leaves the broker in [`ServiceState::Error`]; the scheduler's next
	/// check runs recovery.
	pub async fn start(fetcher: Arc<dyn TokenFetcher>, config: BrokerConfig) -> Result<Self> {
		let broker = Self::new(fetcher, config)?;

		if let Err(err) = broker.initialize().await {
			trace_event!(warn, error = %err, "Initial anonymous fetch failed.");
		}

		broker.start_scheduler();

		Ok(broker)
	}

	/// Fetches the first anonymous token, moving the service to [`ServiceState::Ready`].
	pub async fn initialize(&self) -> Result<Token> {
		self.request(CacheKey::Anonymous, None).await
	}

	/// Starts the proactive scheduler; returns `false` if it is already running or the broker is
	/// shut down.
	pub fn start_scheduler(&self) -> bool {
		let mut scheduler = self.shared.scheduler.lock();

		if self.shared.state.is_shutdown()
			|| scheduler.as_ref().is_some_and(|running| !running.is_finished())
		{
			return false;
		}

		*scheduler = Some(ProactiveScheduler::spawn(
			Arc::downgrade(&self.shared),
			self.shared.config.check_interval,
		));

		true
	}

	/// Stops the proactive scheduler if it is running.
	pub fn stop_scheduler(&self) {
		if let Some(scheduler) = self.shared.scheduler.lock().take() {
			scheduler.stop();
		}
	}

	/// Returns a valid token for `key`.
	///
	/// Authenticated-class keys need `credentials`. Failures surface as
	/// [`Error::Unauthorized`] (missing or rejected credentials), [`Error::Shutdown`], or
	/// [`Error::ServiceUnavailable`] carrying the underlying [`ErrorKind`](crate::error::ErrorKind).
	pub async fn request(
		&self,
		key: CacheKey,
		credentials: Option<CredentialSet>,
	) -> Result<Token> {
		self.serve(RefreshRequest::new(key).with_credentials(credentials)).await
	}

	/// Refreshes `key` even if a valid token is cached.
	///
	/// Callers queued behind an in-flight refresh of the same key reuse its result.
	pub async fn force_refresh(
		&self,
		key: CacheKey,
		credentials: Option<CredentialSet>,
	) -> Result<Token> {
		let request = RefreshRequest::new(key)
			.with_credentials(credentials)
			.with_trigger(RefreshTrigger::Forced)
			.with_force(true)
			.without_fallback();

		self.serve(request).await
	}

	/// Runs one scheduler check right away.
	pub async fn run_scheduler_tick(&self) -> Result<TickOutcome> {
		scheduler::tick(&self.shared).await
	}

	/// Runs recovery if the service is in [`ServiceState::Error`].
	pub async fn recover(&self) -> Result<()> {
		self.shared.recovery.recover().await
	}

	/// Drops the cached and last good tokens for `key`.
	pub fn invalidate(&self, key: &CacheKey) -> bool {
		self.shared.coordinator.invalidate(key)
	}

	/// Current service state.
	pub fn state(&self) -> ServiceState {
		self.shared.state.current()
	}

	/// Configuration in effect.
	pub fn config(&self) -> &BrokerConfig {
		&self.shared.config
	}

	/// Returns a serializable snapshot of the broker.
	pub fn stats(&self) -> BrokerStats {
		let StateSnapshot { state, error_count, last_success_at_ms, last_error } =
			self.shared.state.snapshot();

		BrokerStats {
			state,
			error_count,
			last_success_at_ms,
			last_error,
			cache: self.shared.cache.stats(),
			mutexes: self.shared.coordinator.mutex_stats(),
			refresh: self.shared.coordinator.metrics().snapshot(),
			recovery_runs: self.shared.recovery.runs(),
			scheduler_running: self
				.shared
				.scheduler
				.lock()
				.as_ref()
				.is_some_and(|scheduler| !scheduler.is_finished()),
		}
	}

	/// Stops the scheduler, aborts every refresh timer, clears the cache, and rejects later calls
	/// with [`Error::Shutdown`]. Idempotent.
	pub fn shutdown(&self) {
		if !self.shared.state.shutdown() {
			return;
		}

		self.stop_scheduler();
		self.shared.cache.close();

		trace_event!(info, "Broker shut down.");
	}

	async fn serve(&self, request: RefreshRequest) -> Result<Token> {
		match self.shared.state.current() {
			ServiceState::Shutdown => return Err(Error::Shutdown),
			ServiceState::Error => {
				// Valid cached tokens are served without waiting on recovery.
				if let Some(token) = self.shared.coordinator.cached(&request) {
					return Ok(token);
				}
				if let Err(err) = self.shared.recovery.recover().await {
					return self.degrade(&request, err);
				}
			},
			_ => {},
		}

		let class = request.key.class();

		self.shared.coordinator.obtain(request).await.map_err(|err| surface(class, err))
	}

	fn degrade(&self, request: &RefreshRequest, err: Error) -> Result<Token> {
		if matches!(err, Error::Shutdown) {
			return Err(err);
		}

		let fallback = request
			.allow_fallback
			.then(|| self.shared.coordinator.fallback(&request.key))
			.flatten();

		match fallback {
			Some(token) => {
				trace_event!(
					warn,
					error = %err,
					fingerprint = %token.value.fingerprint(),
					"Recovery failed; serving the last good anonymous token."
				);

				Ok(token)
			},
			None => Err(err),
		}
	}
}
impl Debug for Broker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Broker")
			.field("state", &self.state())
			.field("config", &self.shared.config)
			.finish()
	}
}

pub(crate) struct Shared {
	config: BrokerConfig,
	cache: Arc<TokenCache>,
	state: Arc<ServiceStateMachine>,
	coordinator: Arc<RefreshCoordinator>,
	recovery: RecoveryManager,
	scheduler: Mutex<Option<ProactiveScheduler>>,
}

/// Maps coordinator failures onto the caller-facing error surface.
fn surface(class: KeyClass, err: Error) -> Error {
	match err {
		Error::Fetch(FetchError::Rejected { reason }) if class == KeyClass::Authenticated =>
			Error::Unauthorized { reason },
		Error::Unauthorized { .. }
		| Error::ServiceUnavailable { .. }
		| Error::Shutdown
		| Error::Config(_)
		| Error::InvalidKey(_)
		| Error::InvalidCredentials(_) => err,
		other => Error::ServiceUnavailable { cause: other.kind(), message: other.to_string() },
	}
}
