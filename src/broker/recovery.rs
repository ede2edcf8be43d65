//! Error-state recovery: probe, reset, and one forced anonymous refresh.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	broker::{
		refresh::{RefreshCoordinator, RefreshRequest},
		state::{LastError, ServiceState, ServiceStateMachine},
	},
	error::ErrorKind,
	fetcher::TokenFetcher,
	obs::{RefreshTrigger, trace_event},
	token::CacheKey,
};

/// Runs recovery when the service is in [`ServiceState::Error`].
///
/// Concurrent triggers collapse: callers that queued behind a running recovery receive its outcome
/// instead of starting another one.
pub struct RecoveryManager {
	coordinator: Arc<RefreshCoordinator>,
	fetcher: Arc<dyn TokenFetcher>,
	state: Arc<ServiceStateMachine>,
	gate: async_lock::Mutex<()>,
	completed: AtomicU64,
	last_outcome: Mutex<Option<LastError>>,
}
impl RecoveryManager {
	/// Creates a manager driving `coordinator` and `state`.
	pub fn new(
		coordinator: Arc<RefreshCoordinator>,
		fetcher: Arc<dyn TokenFetcher>,
		state: Arc<ServiceStateMachine>,
	) -> Self {
		Self {
			coordinator,
			fetcher,
			state,
			gate: async_lock::Mutex::new(()),
			completed: AtomicU64::new(0),
			last_outcome: Mutex::new(None),
		}
	}

	/// Number of recovery runs that reached a verdict.
	pub fn runs(&self) -> u64 {
		self.completed.load(Ordering::Acquire)
	}

	/// Recovers the service if it is in the error state; a no-op otherwise.
	///
	/// Fails with [`Error::ServiceUnavailable`] carrying the cause when the recovery refresh fails,
	/// or with [`Error::Shutdown`] after shutdown.
	pub async fn recover(&self) -> Result<()> {
		let observed = self.runs();
		let _gate = self.gate.lock().await;

		if self.runs() != observed {
			return self.last_outcome();
		}

		match self.state.current() {
			ServiceState::Shutdown => return Err(Error::Shutdown),
			ServiceState::Error => {},
			_ => return Ok(()),
		}

		if !self.state.begin_recovery() {
			return Ok(());
		}

		trace_event!(info, error_count = self.state.error_count(), "Recovery started.");

		let outcome = self.run().await;

		*self.last_outcome.lock() = outcome
			.as_ref()
			.err()
			.map(|err| LastError { kind: err.kind(), message: err.to_string() });

		self.completed.fetch_add(1, Ordering::AcqRel);

		match outcome {
			Ok(()) => {
				trace_event!(info, "Recovery succeeded.");

				Ok(())
			},
			Err(err) => {
				trace_event!(warn, error = %err, "Recovery failed.");

				// Errors that bypass the failure counter (lock timeouts) still leave `Initializing`.
				if self.state.current() == ServiceState::Initializing {
					self.state.recovery_failed(&err);
				}

				Err(unavailable(err.kind(), err.to_string()))
			},
		}
	}

	async fn run(&self) -> Result<()> {
		if let Err(probe) = self.fetcher.probe().await {
			trace_event!(warn, error = %probe, "Fetcher probe failed; resetting it.");

			self.fetcher.reset().await?;
		}

		let request = RefreshRequest::new(CacheKey::Anonymous)
			.with_trigger(RefreshTrigger::Recovery)
			.with_force(true)
			.without_fallback();

		self.coordinator.obtain(request).await.map(drop)
	}

	fn last_outcome(&self) -> Result<()> {
		match self.last_outcome.lock().clone() {
			Some(LastError { kind, message }) => Err(unavailable(kind, message)),
			None => Ok(()),
		}
	}
}
impl Debug for RecoveryManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RecoveryManager").field("runs", &self.runs()).finish()
	}
}

fn unavailable(cause: ErrorKind, message: String) -> Error {
	Error::ServiceUnavailable { cause, message }
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		cache::TokenCache, config::BrokerConfig, testutil::ScriptedFetcher, token::KeyClass,
	};

	fn manager(fetcher: Arc<ScriptedFetcher>) -> (Arc<RecoveryManager>, Arc<ServiceStateMachine>) {
		let config = BrokerConfig::default();
		let cache = Arc::new(TokenCache::new(config.buffer, config.max_entries));
		let state = Arc::new(ServiceStateMachine::new(config.error_threshold));
		let coordinator =
			Arc::new(RefreshCoordinator::new(fetcher.clone(), cache, state.clone(), &config));

		(Arc::new(RecoveryManager::new(coordinator, fetcher, state.clone())), state)
	}

	fn enter_error(state: &ServiceStateMachine) {
		state.refresh_failed(KeyClass::Anonymous, &Error::Unauthorized { reason: "test".into() });

		assert_eq!(state.current(), ServiceState::Error);
	}

	#[tokio::test]
	async fn recovery_is_a_noop_outside_error_state() {
		let fetcher = ScriptedFetcher::new(Duration::from_secs(3_600));
		let (manager, state) = manager(fetcher.clone());

		manager.recover().await.expect("Recovery outside the error state should be a no-op.");

		assert_eq!(state.current(), ServiceState::Initializing);
		assert_eq!(fetcher.calls(), 0);
		assert_eq!(manager.runs(), 0);
	}

	#[tokio::test]
	async fn recovery_resets_unhealthy_fetcher_and_reaches_ready() {
		let fetcher = ScriptedFetcher::new(Duration::from_secs(3_600));
		let (manager, state) = manager(fetcher.clone());

		enter_error(&state);
		fetcher.set_healthy(false);
		manager.recover().await.expect("Recovery should succeed once the fetcher is reset.");

		assert_eq!(state.current(), ServiceState::Ready);
		assert_eq!(state.error_count(), 0);
		assert_eq!(fetcher.resets(), 1);
		assert_eq!(fetcher.calls(), 1);
	}

	#[tokio::test]
	async fn failed_recovery_stays_in_error() {
		let fetcher = ScriptedFetcher::new(Duration::from_secs(3_600));
		let (manager, state) = manager(fetcher.clone());

		enter_error(&state);
		fetcher.set_failing(true);

		let err = manager.recover().await.expect_err("Recovery should fail while upstream is down.");

		assert!(matches!(
			err,
			Error::ServiceUnavailable { cause: ErrorKind::TransientNetwork, .. }
		));
		assert_eq!(state.current(), ServiceState::Error);
		assert_eq!(state.error_count(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_triggers_collapse_into_one_run() {
		let fetcher = ScriptedFetcher::new(Duration::from_secs(3_600));
		let (manager, state) = manager(fetcher.clone());

		enter_error(&state);
		fetcher.set_delay(Duration::from_millis(200));

		let tasks = (0..3)
			.map(|_| {
				let manager = manager.clone();

				tokio::spawn(async move { manager.recover().await })
			})
			.collect::<Vec<_>>();

		for task in tasks {
			task.await
				.expect("Recovery task should not panic.")
				.expect("Collapsed recovery should succeed.");
		}

		assert_eq!(manager.runs(), 1);
		assert_eq!(fetcher.calls(), 1);
		assert_eq!(state.current(), ServiceState::Ready);
	}
}
