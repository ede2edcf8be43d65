//! Credential sets handed to the fetcher for authenticated-class keys.

// std
use std::sync::OnceLock;
// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{_prelude::*, token::TokenSecret};

/// Errors emitted when validating credential sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CredentialError {
	/// A credential set must carry at least one field.
	#[error("Credential set cannot be empty.")]
	Empty,
	/// Field names cannot be empty or contain whitespace.
	#[error("Credential field name `{name}` is invalid.")]
	InvalidName {
		/// The offending field name.
		name: String,
	},
	/// Field values cannot be empty.
	#[error("Credential field `{name}` has an empty value.")]
	EmptyValue {
		/// Field whose value was empty.
		name: String,
	},
}

/// Normalized credential fields (for example a session cookie) with a cached fingerprint.
///
/// Fields are kept sorted by name so two sets carrying the same values compare equal and
/// produce the same [`fingerprint`](Self::fingerprint) regardless of insertion order. Values are
/// wrapped in [`TokenSecret`] and never printed by the `Debug` implementation.
#[derive(Clone)]
pub struct CredentialSet {
	fields: Arc<BTreeMap<String, TokenSecret>>,
	fingerprint_cache: OnceLock<String>,
}
impl CredentialSet {
	/// Builds a credential set from `(name, value)` pairs. Later duplicates win.
	pub fn new<I, K, V>(fields: I) -> Result<Self, CredentialError>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let mut normalized = BTreeMap::new();

		for (name, value) in fields {
			let name = name.into();
			let value = value.into();

			if name.is_empty() || name.chars().any(char::is_whitespace) {
				return Err(CredentialError::InvalidName { name });
			}
			if value.is_empty() {
				return Err(CredentialError::EmptyValue { name });
			}

			normalized.insert(name, TokenSecret::new(value));
		}

		if normalized.is_empty() {
			return Err(CredentialError::Empty);
		}

		Ok(Self { fields: Arc::new(normalized), fingerprint_cache: OnceLock::new() })
	}

	/// Convenience constructor for a single-field set.
	pub fn single(name: impl Into<String>, value: impl Into<String>) -> Result<Self, CredentialError> {
		Self::new([(name.into(), value.into())])
	}

	/// Returns the value of a field. Callers must avoid logging it.
	pub fn get(&self, name: &str) -> Option<&str> {
		self.fields.get(name).map(TokenSecret::expose)
	}

	/// Iterates over field names in sorted order.
	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.fields.keys().map(String::as_str)
	}

	/// Number of fields.
	pub fn len(&self) -> usize {
		self.fields.len()
	}

	/// Whether the set has no fields. Always `false` for validated sets.
	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	/// Stable, log-safe fingerprint of the normalized fields.
	///
	/// The fingerprint is a base64 (no padding) encoding of the SHA-256 digest over the sorted
	/// `name=value` lines.
	pub fn fingerprint(&self) -> &str {
		self.fingerprint_cache.get_or_init(|| compute_fingerprint(&self.fields))
	}
}
impl PartialEq for CredentialSet {
	fn eq(&self, other: &Self) -> bool {
		self.fields == other.fields
	}
}
impl Eq for CredentialSet {}
impl Debug for CredentialSet {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialSet")
			.field("fields", &self.fields.keys().collect::<Vec<_>>())
			.field("fingerprint", &self.fingerprint())
			.finish()
	}
}

fn compute_fingerprint(fields: &BTreeMap<String, TokenSecret>) -> String {
	let mut hasher = Sha256::new();

	for (name, value) in fields {
		hasher.update(name.as_bytes());
		hasher.update(b"=");
		hasher.update(value.expose().as_bytes());
		hasher.update(b"\n");
	}

	STANDARD_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn sets_normalize_order_and_compare_by_value() {
		let lhs = CredentialSet::new([("sp_dc", "cookie-a"), ("sp_key", "key-a")])
			.expect("Credential fixture should be valid.");
		let rhs = CredentialSet::new([("sp_key", "key-a"), ("sp_dc", "cookie-a")])
			.expect("Credential fixture should be valid.");
		let other = CredentialSet::single("sp_dc", "cookie-b")
			.expect("Credential fixture should be valid.");

		assert_eq!(lhs, rhs);
		assert_eq!(lhs.fingerprint(), rhs.fingerprint());
		assert_ne!(lhs, other);
		assert_ne!(lhs.fingerprint(), other.fingerprint());
		assert_eq!(lhs.names().collect::<Vec<_>>(), vec!["sp_dc", "sp_key"]);
		assert_eq!(lhs.get("sp_dc"), Some("cookie-a"));
	}

	#[test]
	fn validation_rejects_empty_and_malformed_fields() {
		assert_eq!(
			CredentialSet::new(Vec::<(String, String)>::new()),
			Err(CredentialError::Empty)
		);
		assert!(matches!(
			CredentialSet::single("bad name", "value"),
			Err(CredentialError::InvalidName { .. })
		));
		assert!(matches!(
			CredentialSet::single("sp_dc", ""),
			Err(CredentialError::EmptyValue { .. })
		));
	}

	#[test]
	fn debug_output_redacts_values() {
		let set = CredentialSet::single("sp_dc", "very-secret-cookie")
			.expect("Credential fixture should be valid.");
		let rendered = format!("{set:?}");

		assert!(rendered.contains("sp_dc"));
		assert!(!rendered.contains("very-secret-cookie"));
	}
}
