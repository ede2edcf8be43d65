//! Optional observability helpers for refresh paths.
//!
//! # Feature Flags
//!
//! - Enable `tracing` (default) to emit structured spans named `credential_broker.refresh` with the
//!   `key` and `trigger` fields, plus events for fallbacks, state transitions, evictions, and lock
//!   force releases. Token values never reach a span or event; log their fingerprint instead.
//! - Enable `metrics` to increment `credential_broker_refresh_total` (labeled by `key_class` +
//!   `outcome`) and `credential_broker_state_transitions_total` (labeled by `to`).

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

pub(crate) use tracing::trace_event;

// self
use crate::_prelude::*;

/// What caused a refresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
	/// A caller asked for a token.
	Request,
	/// A caller forced a refresh.
	Forced,
	/// The proactive scheduler found the anonymous token close to expiry.
	Scheduled,
	/// A per-entry refresh timer fired.
	Timer,
	/// The recovery procedure.
	Recovery,
}
impl RefreshTrigger {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RefreshTrigger::Request => "request",
			RefreshTrigger::Forced => "forced",
			RefreshTrigger::Scheduled => "scheduled",
			RefreshTrigger::Timer => "timer",
			RefreshTrigger::Recovery => "recovery",
		}
	}
}
impl Display for RefreshTrigger {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each refresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshOutcome {
	/// Entry to the coordinator.
	Attempt,
	/// Served from the cache without calling the fetcher.
	CacheHit,
	/// The fetcher minted a new token.
	Fetched,
	/// A last-good token was served after a failed fetch.
	Fallback,
	/// Failure propagated back to the caller.
	Failure,
}
impl RefreshOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RefreshOutcome::Attempt => "attempt",
			RefreshOutcome::CacheHit => "cache_hit",
			RefreshOutcome::Fetched => "fetched",
			RefreshOutcome::Fallback => "fallback",
			RefreshOutcome::Failure => "failure",
		}
	}
}
impl Display for RefreshOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
