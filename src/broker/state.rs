//! Service health state machine and cumulative error accounting.

// self
use crate::{
	_prelude::*,
	error::ErrorKind,
	obs::{self, trace_event},
	token::{KeyClass, to_epoch_ms},
};

/// Overall health of the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
	/// No anonymous token has been minted yet, or recovery is in progress.
	Initializing,
	/// Serving tokens.
	Ready,
	/// An anonymous refresh is in flight; tokens are still served.
	Refreshing,
	/// Refreshes keep failing; the next request or scheduler tick runs recovery.
	Error,
	/// Terminal.
	Shutdown,
}
impl ServiceState {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			ServiceState::Initializing => "initializing",
			ServiceState::Ready => "ready",
			ServiceState::Refreshing => "refreshing",
			ServiceState::Error => "error",
			ServiceState::Shutdown => "shutdown",
		}
	}

	/// Returns the state reached after `event`. Events that do not apply leave the state unchanged.
	pub const fn on(self, event: StateEvent) -> Self {
		use ServiceState::*;
		use StateEvent as E;

		match (self, event) {
			(Shutdown, _) | (_, E::Shutdown) => Shutdown,
			(_, E::ThresholdExceeded | E::RecoveryFailed) => Error,
			(Error, E::RecoveryStarted) => Initializing,
			(Initializing, E::RefreshSucceeded) => Ready,
			(Initializing, E::RefreshFailed) => Error,
			(Ready, E::RefreshStarted) => Refreshing,
			(Refreshing, E::RefreshSucceeded | E::RefreshFailed | E::RefreshAbandoned) => Ready,
			(Error, E::RefreshSucceeded) => Ready,
			(state, _) => state,
		}
	}
}
impl Display for ServiceState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Inputs of [`ServiceState::on`].
///
/// The refresh events refer to the anonymous key; authenticated refreshes only move the error
/// counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateEvent {
	/// An anonymous fetch started.
	RefreshStarted,
	/// An anonymous fetch produced a token.
	RefreshSucceeded,
	/// An anonymous fetch failed.
	RefreshFailed,
	/// An anonymous fetch ended without an outcome (failed before recording, or was cancelled).
	RefreshAbandoned,
	/// Cumulative failures reached the error threshold.
	ThresholdExceeded,
	/// Recovery began.
	RecoveryStarted,
	/// Recovery could not restore the fetcher.
	RecoveryFailed,
	/// The broker is shutting down.
	Shutdown,
}

/// Last failure observed by the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LastError {
	/// Classification of the failure.
	pub kind: ErrorKind,
	/// Rendered error message.
	pub message: String,
}

/// Serializable view of the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
	/// Current state.
	pub state: ServiceState,
	/// Failures since the last successful refresh.
	pub error_count: u32,
	/// Last successful refresh in Unix epoch milliseconds.
	pub last_success_at_ms: Option<i64>,
	/// Last failure, cleared by the next success.
	pub last_error: Option<LastError>,
}

/// Shared service state, read by the request path and driven by refreshes and recovery.
#[derive(Debug)]
pub struct ServiceStateMachine {
	error_threshold: u32,
	inner: RwLock<StateInner>,
}
impl ServiceStateMachine {
	/// Creates a machine in [`ServiceState::Initializing`].
	pub fn new(error_threshold: u32) -> Self {
		Self {
			error_threshold,
			inner: RwLock::new(StateInner {
				state: ServiceState::Initializing,
				error_count: 0,
				last_success_at: None,
				last_error: None,
			}),
		}
	}

	/// Current state.
	pub fn current(&self) -> ServiceState {
		self.inner.read().state
	}

	/// Whether the broker has shut down.
	pub fn is_shutdown(&self) -> bool {
		self.current() == ServiceState::Shutdown
	}

	/// Failures since the last successful refresh.
	pub fn error_count(&self) -> u32 {
		self.inner.read().error_count
	}

	/// Applies `event` and returns the resulting state.
	pub fn apply(&self, event: StateEvent) -> ServiceState {
		let mut inner = self.inner.write();

		Self::transition(&mut inner, event)
	}

	/// Records the start of a fetch for a key of `class`.
	///
	/// Dropping the returned guard without calling [`InFlightRefresh::succeeded`] leaves
	/// `Refreshing`, so a cancelled caller cannot strand the service there.
	pub fn refresh_started(&self, class: KeyClass) -> InFlightRefresh<'_> {
		if class == KeyClass::Anonymous {
			self.apply(StateEvent::RefreshStarted);
		}

		InFlightRefresh { machine: self, class, settled: false }
	}

	/// Records a successful fetch; any success resets the error counter.
	pub fn refresh_succeeded(&self, class: KeyClass) {
		let mut inner = self.inner.write();

		inner.error_count = 0;
		inner.last_success_at = Some(OffsetDateTime::now_utc());
		inner.last_error = None;

		if class == KeyClass::Anonymous {
			Self::transition(&mut inner, StateEvent::RefreshSucceeded);
		}
	}

	/// Records a failed fetch and moves to [`ServiceState::Error`] once the threshold is reached.
	pub fn refresh_failed(&self, class: KeyClass, err: &Error) {
		let mut inner = self.inner.write();

		inner.error_count = inner.error_count.saturating_add(1);
		inner.last_error = Some(LastError { kind: err.kind(), message: err.to_string() });

		if class == KeyClass::Anonymous {
			Self::transition(&mut inner, StateEvent::RefreshFailed);
		}
		if inner.error_count >= self.error_threshold {
			Self::transition(&mut inner, StateEvent::ThresholdExceeded);
		}
	}

	/// Moves `Error` to `Initializing`; returns `false` when the state was not `Error`.
	pub fn begin_recovery(&self) -> bool {
		let mut inner = self.inner.write();

		inner.state == ServiceState::Error
			&& Self::transition(&mut inner, StateEvent::RecoveryStarted)
				== ServiceState::Initializing
	}

	/// Records a recovery that failed before a refresh could be attempted.
	pub fn recovery_failed(&self, err: &Error) {
		let mut inner = self.inner.write();

		inner.last_error = Some(LastError { kind: err.kind(), message: err.to_string() });

		Self::transition(&mut inner, StateEvent::RecoveryFailed);
	}

	/// Moves to the terminal state; returns `false` when already shut down.
	pub fn shutdown(&self) -> bool {
		let mut inner = self.inner.write();

		if inner.state == ServiceState::Shutdown {
			return false;
		}

		Self::transition(&mut inner, StateEvent::Shutdown);

		true
	}

	/// Returns a serializable view of the machine.
	pub fn snapshot(&self) -> StateSnapshot {
		let inner = self.inner.read();

		StateSnapshot {
			state: inner.state,
			error_count: inner.error_count,
			last_success_at_ms: inner.last_success_at.map(to_epoch_ms),
			last_error: inner.last_error.clone(),
		}
	}

	fn transition(inner: &mut StateInner, event: StateEvent) -> ServiceState {
		let from = inner.state;
		let to = from.on(event);

		if from != to {
			inner.state = to;

			obs::record_state_transition(to.as_str());

			match to {
				ServiceState::Error => trace_event!(
					warn,
					from = from.as_str(),
					?event,
					error_count = inner.error_count,
					"Service entered the error state."
				),
				_ => trace_event!(
					info,
					from = from.as_str(),
					to = to.as_str(),
					?event,
					"Service state changed."
				),
			}
		}

		to
	}
}

/// Fetch in progress, returned by [`ServiceStateMachine::refresh_started`].
#[must_use = "dropping the guard records the refresh as abandoned"]
#[derive(Debug)]
pub struct InFlightRefresh<'a> {
	machine: &'a ServiceStateMachine,
	class: KeyClass,
	settled: bool,
}
impl InFlightRefresh<'_> {
	/// Records the fetch as successful.
	pub fn succeeded(mut self) {
		self.settled = true;

		self.machine.refresh_succeeded(self.class);
	}
}
impl Drop for InFlightRefresh<'_> {
	fn drop(&mut self) {
		if !self.settled && self.class == KeyClass::Anonymous {
			self.machine.apply(StateEvent::RefreshAbandoned);
		}
	}
}

#[derive(Debug)]
struct StateInner {
	state: ServiceState,
	error_count: u32,
	last_success_at: Option<OffsetDateTime>,
	last_error: Option<LastError>,
}
