//! Broker-level error types shared across the cache, refresh coordinator, and service facade.

// self
use crate::{
	_prelude::*,
	token::{CredentialError, KeyError},
};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// A refresh waited in the key's queue longer than the configured wait budget.
	#[error("Timed out after {waited:?} waiting for the refresh lock.")]
	MutexTimeout {
		/// Time spent queued before giving up.
		waited: Duration,
	},
	/// The lock holder exceeded its hold budget and every queued waiter was rejected.
	#[error("Refresh lock was force-released after its holder exceeded the hold budget.")]
	MutexForceReleased,
	/// The upstream fetch failed.
	#[error(transparent)]
	Fetch(#[from] FetchError),
	/// Credentials are missing or were rejected for an authenticated-class key.
	#[error("Unauthorized: {reason}.")]
	Unauthorized {
		/// Broker- or upstream-supplied reason string.
		reason: String,
	},
	/// The broker cannot serve a token right now; `cause` carries the underlying classification.
	#[error("Service unavailable ({cause}): {message}")]
	ServiceUnavailable {
		/// Classification of the failure that made the service unavailable.
		cause: ErrorKind,
		/// Human-readable description of the underlying failure.
		message: String,
	},
	/// The broker has been shut down.
	#[error("Broker has been shut down.")]
	Shutdown,
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Cache key failed validation.
	#[error(transparent)]
	InvalidKey(#[from] KeyError),
	/// Credential set failed validation.
	#[error(transparent)]
	InvalidCredentials(#[from] CredentialError),
}
impl Error {
	/// Returns the tagged classification for this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::MutexTimeout { .. } | Self::MutexForceReleased => ErrorKind::MutexTimeout,
			Self::Fetch(err) => err.kind(),
			Self::Unauthorized { .. } => ErrorKind::Unauthorized,
			Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
			Self::Shutdown => ErrorKind::Shutdown,
			Self::Config(_) | Self::InvalidKey(_) | Self::InvalidCredentials(_) =>
				ErrorKind::InvalidInput,
		}
	}

	/// Whether a caller may retry the same request after backing off.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::MutexTimeout { .. } | Self::MutexForceReleased => true,
			Self::Fetch(err) => err.is_retryable(),
			Self::ServiceUnavailable { cause, .. } => !matches!(
				cause,
				ErrorKind::UpstreamRejected | ErrorKind::InvalidInput | ErrorKind::Shutdown
			),
			Self::Unauthorized { .. }
			| Self::Shutdown
			| Self::Config(_)
			| Self::InvalidKey(_)
			| Self::InvalidCredentials(_) => false,
		}
	}
}

/// Tagged failure categories callers can branch on without matching concrete error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// Queue wait or hold budget of the refresh lock was exceeded.
	MutexTimeout,
	/// The fetcher did not produce a token in time.
	FetchTimeout,
	/// The fetcher produced a structurally invalid token.
	InvalidUpstreamResponse,
	/// Upstream rejected the credentials; not retried.
	UpstreamRejected,
	/// Transport failure that survived the fetcher's own retry policy.
	TransientNetwork,
	/// Credentials missing or rejected for an authenticated-class key.
	Unauthorized,
	/// The broker could not serve a token.
	ServiceUnavailable,
	/// The broker has been shut down.
	Shutdown,
	/// Caller-supplied configuration, key, or credentials are invalid.
	InvalidInput,
}
impl ErrorKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::MutexTimeout => "mutex_timeout",
			Self::FetchTimeout => "fetch_timeout",
			Self::InvalidUpstreamResponse => "invalid_upstream_response",
			Self::UpstreamRejected => "upstream_rejected",
			Self::TransientNetwork => "transient_network",
			Self::Unauthorized => "unauthorized",
			Self::ServiceUnavailable => "service_unavailable",
			Self::Shutdown => "shutdown",
			Self::InvalidInput => "invalid_input",
		}
	}
}
impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Failures reported by a [`TokenFetcher`](crate::fetcher::TokenFetcher).
#[derive(Debug, ThisError)]
pub enum FetchError {
	/// The fetch did not complete within its time budget.
	#[error("Token fetch timed out after {after:?}.")]
	Timeout {
		/// Budget that elapsed.
		after: Duration,
	},
	/// Upstream answered, but the token is unusable (empty value, expiry in the past, ...).
	#[error("Upstream returned an invalid token: {reason}.")]
	InvalidResponse {
		/// Description of the structural problem.
		reason: String,
	},
	/// Upstream answered with JSON that does not match the token shape.
	#[error("Upstream returned a malformed token payload.")]
	Malformed {
		/// Structured parsing failure, including the offending JSON path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// Upstream refused the credentials; retrying with the same input will not help.
	#[error("Upstream rejected the credentials: {reason}.")]
	Rejected {
		/// Upstream-supplied reason string.
		reason: String,
	},
	/// Transport failure (DNS, TCP, TLS, browser crash) after the fetcher's own retries.
	#[error("Network error occurred while fetching a token.")]
	Network {
		/// Transport-specific failure.
		#[source]
		source: BoxError,
	},
}
impl FetchError {
	/// Wraps a transport-specific failure.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Builds an [`FetchError::InvalidResponse`] from a reason string.
	pub fn invalid(reason: impl Into<String>) -> Self {
		Self::InvalidResponse { reason: reason.into() }
	}

	/// Builds a [`FetchError::Rejected`] from a reason string.
	pub fn rejected(reason: impl Into<String>) -> Self {
		Self::Rejected { reason: reason.into() }
	}

	/// Returns the tagged classification for this failure.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Timeout { .. } => ErrorKind::FetchTimeout,
			Self::InvalidResponse { .. } | Self::Malformed { .. } =>
				ErrorKind::InvalidUpstreamResponse,
			Self::Rejected { .. } => ErrorKind::UpstreamRejected,
			Self::Network { .. } => ErrorKind::TransientNetwork,
		}
	}

	/// Whether the failure is transient and the caller may retry with backoff.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Timeout { .. } | Self::Network { .. })
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// A duration setting must be strictly positive.
	#[error("The {field} setting must be greater than zero.")]
	ZeroDuration {
		/// Name of the offending setting.
		field: &'static str,
	},
	/// The cache must be able to hold at least one entry.
	#[error("The cache must allow at least one entry.")]
	ZeroMaxEntries,
	/// The error threshold must be at least one.
	#[error("The error threshold must be at least one.")]
	ZeroErrorThreshold,
	/// The stale fallback floor cannot exceed the buffer window.
	#[error("The stale fallback floor ({floor:?}) exceeds the buffer window ({buffer:?}).")]
	FallbackFloorExceedsBuffer {
		/// Configured fallback floor.
		floor: Duration,
		/// Configured buffer window.
		buffer: Duration,
	},
	/// A fetch must finish within the refresh lock's hold budget.
	#[error("The fetch timeout ({fetch_timeout:?}) must be shorter than the lock hold budget ({max_hold:?}).")]
	FetchTimeoutExceedsHold {
		/// Configured fetch budget.
		fetch_timeout: Duration,
		/// Configured lock hold budget.
		max_hold: Duration,
	},
	/// Configuration document could not be parsed.
	#[error("Configuration document is malformed.")]
	Parse {
		/// Structured parsing failure, including the offending JSON path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
}
