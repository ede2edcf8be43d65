//! Proactive background refresh of the anonymous token.
//!
//! The loop checks once immediately and then every `check_interval`. A check refreshes the
//! anonymous token when it is missing or expires within `proactive_buffer`, and runs recovery
//! when the service is in the error state. Checks never overlap; a slow check delays the next one.

// crates.io
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
// self
use crate::{
	_prelude::*,
	broker::{Shared, refresh::RefreshRequest, state::ServiceState},
	obs::{RefreshTrigger, trace_event},
	token::CacheKey,
};

/// What a scheduler check did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
	/// The anonymous token is fresh enough.
	Idle,
	/// The anonymous token was refreshed.
	Refreshed,
	/// Recovery ran and succeeded.
	Recovered,
	/// The broker is shut down; the loop exits.
	Stopped,
}

/// Handle of the running scheduler loop; dropping it stops the loop.
#[derive(Debug)]
pub struct ProactiveScheduler {
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}
impl ProactiveScheduler {
	pub(crate) fn spawn(shared: Weak<Shared>, period: Duration) -> Self {
		let (stop, mut stopped) = watch::channel(false);
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);

			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					biased;
					_ = stopped.changed() => break,
					_ = ticker.tick() => {},
				}

				let Some(shared) = shared.upgrade() else {
					break;
				};

				match tick(&shared).await {
					Ok(TickOutcome::Stopped) => break,
					Ok(outcome) => trace_event!(debug, ?outcome, "Scheduler check completed."),
					Err(err) => trace_event!(warn, error = %err, "Scheduler check failed."),
				}
			}

			trace_event!(debug, "Scheduler loop exited.");
		});

		Self { stop, task }
	}

	/// Stops the loop; no further check starts, and a check in progress is cancelled.
	pub fn stop(&self) {
		let _ = self.stop.send(true);

		self.task.abort();
	}

	/// Whether the loop has exited.
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}
}
impl Drop for ProactiveScheduler {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Runs one scheduler check.
pub(crate) async fn tick(shared: &Shared) -> Result<TickOutcome> {
	match shared.state.current() {
		ServiceState::Shutdown => return Ok(TickOutcome::Stopped),
		ServiceState::Error => {
			shared.recovery.recover().await?;

			return Ok(TickOutcome::Recovered);
		},
		_ => {},
	}

	let due = shared
		.cache
		.remaining(&CacheKey::Anonymous)
		.is_none_or(|remaining| remaining <= shared.config.proactive_buffer);

	if !due {
		return Ok(TickOutcome::Idle);
	}

	let request = RefreshRequest::new(CacheKey::Anonymous)
		.with_trigger(RefreshTrigger::Scheduled)
		.with_force(true)
		.without_fallback();

	shared.coordinator.obtain(request).await?;

	Ok(TickOutcome::Refreshed)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{broker::Broker, config::BrokerConfig, testutil::ScriptedFetcher};

	// Inside the five-minute proactive window from the moment it is minted.
	const SHORT_TTL: Duration = Duration::from_secs(240);

	fn broker(fetcher: Arc<ScriptedFetcher>) -> Broker {
		Broker::new(fetcher, BrokerConfig::default()).expect("Default configuration should be valid.")
	}

	#[tokio::test]
	async fn fresh_token_leaves_tick_idle() {
		let fetcher = ScriptedFetcher::new(Duration::from_secs(3_600));
		let broker = broker(fetcher.clone());

		broker.initialize().await.expect("Initialization should succeed.");

		assert_eq!(
			broker.run_scheduler_tick().await.expect("Idle tick should succeed."),
			TickOutcome::Idle
		);
		assert_eq!(fetcher.calls(), 1);
	}

	#[tokio::test]
	async fn failing_ticks_reach_error_and_recovery_restores_ready() {
		let fetcher = ScriptedFetcher::new(SHORT_TTL);
		let broker = broker(fetcher.clone());

		broker.initialize().await.expect("Initialization should succeed.");

		assert_eq!(broker.state(), ServiceState::Ready);

		fetcher.set_failing(true);

		for round in 1..=5 {
			assert!(broker.run_scheduler_tick().await.is_err());

			let expected = if round < 5 { ServiceState::Ready } else { ServiceState::Error };

			assert_eq!(broker.state(), expected, "Unexpected state after failing tick {round}.");
		}

		let still_down = broker.run_scheduler_tick().await;

		assert!(matches!(still_down, Err(Error::ServiceUnavailable { .. })));
		assert_eq!(broker.state(), ServiceState::Error);

		fetcher.set_failing(false);

		assert_eq!(
			broker.run_scheduler_tick().await.expect("Recovery tick should succeed."),
			TickOutcome::Recovered
		);
		assert_eq!(broker.state(), ServiceState::Ready);
		assert_eq!(broker.stats().error_count, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn loop_checks_immediately_and_stops_cleanly() {
		let fetcher = ScriptedFetcher::new(SHORT_TTL);
		let broker = broker(fetcher.clone());

		assert!(broker.start_scheduler());
		assert!(!broker.start_scheduler(), "A second scheduler must not start.");

		tokio::time::sleep(Duration::from_secs(150)).await;

		assert_eq!(fetcher.calls(), 3, "Checks at 0 s, 60 s, and 120 s should each refresh.");
		assert_eq!(broker.state(), ServiceState::Ready);

		broker.stop_scheduler();
		tokio::time::sleep(Duration::from_secs(600)).await;

		assert_eq!(fetcher.calls(), 3);
		assert!(!broker.stats().scheduler_running);
	}
}
