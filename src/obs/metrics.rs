// self
use crate::{obs::RefreshOutcome, token::KeyClass};

/// Records a refresh outcome via the global metrics recorder (when enabled).
pub fn record_refresh_outcome(class: KeyClass, outcome: RefreshOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"credential_broker_refresh_total",
			"key_class" => class.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (class, outcome);
	}
}

/// Records a service state transition via the global metrics recorder (when enabled).
pub fn record_state_transition(to: &'static str) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!("credential_broker_state_transitions_total", "to" => to).increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = to;
	}
}
