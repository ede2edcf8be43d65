//! Immutable token value object and its validity helpers.

// crates.io
use time::Duration as TimeDelta;
// self
use crate::{
	_prelude::*,
	error::FetchError,
	token::{RawToken, TokenSecret},
};

/// Where a served token came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOrigin {
	/// Minted by the fetch that served this request.
	Fresh,
	/// Served from the cache (including degraded fallbacks).
	Cached,
}

/// Bearer token with its validity window.
///
/// Tokens are treated as immutable: the cache hands out clones produced by
/// [`Token::as_cached`] and replaces entries wholesale on refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
	/// Bearer value; callers must avoid logging it.
	pub value: TokenSecret,
	/// Instant the broker accepted the token.
	pub issued_at: OffsetDateTime,
	/// Absolute expiry reported by upstream.
	pub expires_at: OffsetDateTime,
	/// Whether upstream minted the token without credentials.
	pub is_anonymous: bool,
	/// Subject or client identifier reported by upstream.
	pub subject_id: String,
	/// Fresh fetch or cache hit.
	pub origin: TokenOrigin,
}
impl Token {
	/// Creates a fresh token with the given validity window.
	pub fn new(
		value: impl Into<String>,
		issued_at: OffsetDateTime,
		expires_at: OffsetDateTime,
	) -> Self {
		Self {
			value: TokenSecret::new(value),
			issued_at,
			expires_at,
			is_anonymous: false,
			subject_id: String::new(),
			origin: TokenOrigin::Fresh,
		}
	}

	/// Validates a raw upstream token received at `received_at`.
	pub fn from_raw(raw: RawToken, received_at: OffsetDateTime) -> Result<Self, FetchError> {
		if raw.value.trim().is_empty() {
			return Err(FetchError::invalid("access token is empty"));
		}

		let expires_at = from_epoch_ms(raw.expires_at_ms)
			.ok_or_else(|| FetchError::invalid("expiry timestamp is out of range"))?;

		if expires_at <= received_at {
			return Err(FetchError::invalid("token is already expired"));
		}

		Ok(Self {
			value: TokenSecret::new(raw.value),
			issued_at: received_at,
			expires_at,
			is_anonymous: raw.is_anonymous,
			subject_id: raw.subject_id,
			origin: TokenOrigin::Fresh,
		})
	}

	/// Sets the anonymous flag.
	pub fn with_anonymous(mut self, is_anonymous: bool) -> Self {
		self.is_anonymous = is_anonymous;

		self
	}

	/// Sets the subject identifier.
	pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
		self.subject_id = subject_id.into();

		self
	}

	/// Returns a copy marked as served from the cache.
	pub fn as_cached(&self) -> Self {
		Self { origin: TokenOrigin::Cached, ..self.clone() }
	}

	/// Expiry in Unix epoch milliseconds.
	pub fn expires_at_ms(&self) -> i64 {
		to_epoch_ms(self.expires_at)
	}

	/// Issue instant in Unix epoch milliseconds.
	pub fn issued_at_ms(&self) -> i64 {
		to_epoch_ms(self.issued_at)
	}

	/// Time left before expiry; negative once expired.
	pub fn remaining_at(&self, now: OffsetDateTime) -> TimeDelta {
		self.expires_at - now
	}

	/// Whether the token has expired at `now`.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		now >= self.expires_at
	}

	/// Whether the token is still outside the `buffer` window before expiry at `now`.
	pub fn is_usable_at(&self, now: OffsetDateTime, buffer: Duration) -> bool {
		self.remaining_at(now) > buffer
	}
}

pub(crate) fn to_epoch_ms(instant: OffsetDateTime) -> i64 {
	let millis = instant.unix_timestamp_nanos() / 1_000_000;

	i64::try_from(millis).unwrap_or(i64::MAX)
}

pub(crate) fn from_epoch_ms(millis: i64) -> Option<OffsetDateTime> {
	OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
