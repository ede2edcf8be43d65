//! Bearer value wrapper: formatting prints a fingerprint, never the secret itself.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

const FINGERPRINT_LEN: usize = 12;

/// Bearer token value.
///
/// `Debug` renders `TokenSecret(sha256:<fingerprint>)` and `Display` renders `<redacted>`, so a
/// token that ends up in a log line or a panic message only leaks enough to correlate refreshes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps `value`.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// The raw bearer value, for building the outgoing `Authorization` header only.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// Whether the wrapped value is empty.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// First twelve characters of the unpadded base64 SHA-256 digest.
	pub fn fingerprint(&self) -> String {
		let mut encoded = STANDARD_NO_PAD.encode(Sha256::digest(self.0.as_bytes()));

		encoded.truncate(FINGERPRINT_LEN);

		encoded
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "TokenSecret(sha256:{})", self.fingerprint())
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}
