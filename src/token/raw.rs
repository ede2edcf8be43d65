//! Raw token shape produced by fetchers before the broker validates it.

// self
use crate::{_prelude::*, error::FetchError};

/// Token exactly as the upstream reported it.
///
/// The serde field names follow the common web-player token payload
/// (`accessToken`, `accessTokenExpirationTimestampMs`, `isAnonymous`, `clientId`), so fetchers that
/// intercept that JSON can hand it to [`RawToken::from_json_slice`] unchanged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawToken {
	/// Opaque bearer value.
	#[serde(rename = "accessToken")]
	pub value: String,
	/// Absolute expiry in Unix epoch milliseconds.
	#[serde(rename = "accessTokenExpirationTimestampMs")]
	pub expires_at_ms: i64,
	/// Whether upstream minted the token without credentials.
	#[serde(rename = "isAnonymous")]
	pub is_anonymous: bool,
	/// Identifier of the subject or client the token was minted for.
	#[serde(rename = "clientId", default)]
	pub subject_id: String,
}
impl RawToken {
	/// Creates a raw token from its parts.
	pub fn new(
		value: impl Into<String>,
		expires_at_ms: i64,
		is_anonymous: bool,
		subject_id: impl Into<String>,
	) -> Self {
		Self { value: value.into(), expires_at_ms, is_anonymous, subject_id: subject_id.into() }
	}

	/// Parses the upstream JSON payload, reporting the offending path on failure.
	pub fn from_json_slice(payload: &[u8]) -> Result<Self, FetchError> {
		let mut de = serde_json::Deserializer::from_slice(payload);

		serde_path_to_error::deserialize(&mut de).map_err(|source| FetchError::Malformed { source })
	}
}
impl Debug for RawToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RawToken")
			.field("value", &"<redacted>")
			.field("expires_at_ms", &self.expires_at_ms)
			.field("is_anonymous", &self.is_anonymous)
			.field("subject_id", &self.subject_id)
			.finish()
	}
}
