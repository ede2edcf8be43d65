//! Cache keys identifying independent refresh lanes.

// std
use std::{borrow::Borrow, ops::Deref};
// self
use crate::_prelude::*;

const KEY_MAX_LEN: usize = 128;
const ANONYMOUS: &str = "anonymous";
const AUTHENTICATED: &str = "authenticated";

/// Error returned when cache key validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum KeyError {
	/// The key was empty.
	#[error("Cache key cannot be empty.")]
	Empty,
	/// The key contains whitespace characters.
	#[error("Cache key contains whitespace.")]
	ContainsWhitespace,
	/// The key exceeded the allowed length.
	#[error("Cache key exceeds {max} characters.")]
	TooLong {
		/// Maximum permitted length in bytes.
		max: usize,
	},
	/// A named key tried to reuse one of the built-in key names.
	#[error("Cache key `{name}` is reserved.")]
	Reserved {
		/// The reserved name.
		name: String,
	},
}

/// Token class of a key, which decides fallback and scheduling behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
	/// Anonymous tokens: refreshed by the proactive scheduler, eligible for degraded fallback.
	Anonymous,
	/// Credential-bound tokens: refreshed by per-entry timers, never served stale.
	Authenticated,
}
impl KeyClass {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Anonymous => "anonymous",
			Self::Authenticated => "authenticated",
		}
	}
}
impl Display for KeyClass {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Caller-supplied key name used in multi-tenant mode.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyName(String);
impl KeyName {
	/// Creates a new key name after validation.
	pub fn new(value: impl AsRef<str>) -> Result<Self, KeyError> {
		let view = value.as_ref();

		validate_view(view)?;

		if view == ANONYMOUS || view == AUTHENTICATED {
			return Err(KeyError::Reserved { name: view.to_owned() });
		}

		Ok(Self(view.to_owned()))
	}
}
impl Deref for KeyName {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl AsRef<str> for KeyName {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Borrow<str> for KeyName {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl From<KeyName> for String {
	fn from(value: KeyName) -> Self {
		value.0
	}
}
impl TryFrom<String> for KeyName {
	type Error = KeyError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}
impl Debug for KeyName {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "KeyName({})", self.0)
	}
}
impl Display for KeyName {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

/// Identifies one refresh lane: its cache slot, single-flight lock, and schedule.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheKey {
	/// The shared anonymous token.
	Anonymous,
	/// The default credential-bound token.
	Authenticated,
	/// A caller-supplied credential-bound key.
	Named(KeyName),
}
impl CacheKey {
	/// Parses a key, mapping the built-in names to their fixed variants.
	pub fn parse(value: impl AsRef<str>) -> Result<Self, KeyError> {
		match value.as_ref() {
			ANONYMOUS => Ok(Self::Anonymous),
			AUTHENTICATED => Ok(Self::Authenticated),
			other => KeyName::new(other).map(Self::Named),
		}
	}

	/// Builds a named key.
	pub fn named(value: impl AsRef<str>) -> Result<Self, KeyError> {
		KeyName::new(value).map(Self::Named)
	}

	/// Returns the token class of this key.
	pub const fn class(&self) -> KeyClass {
		match self {
			Self::Anonymous => KeyClass::Anonymous,
			Self::Authenticated | Self::Named(_) => KeyClass::Authenticated,
		}
	}

	/// Whether this is the anonymous key.
	pub const fn is_anonymous(&self) -> bool {
		matches!(self, Self::Anonymous)
	}

	/// Returns the key as a string slice.
	pub fn as_str(&self) -> &str {
		match self {
			Self::Anonymous => ANONYMOUS,
			Self::Authenticated => AUTHENTICATED,
			Self::Named(name) => name,
		}
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
impl FromStr for CacheKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}
impl TryFrom<String> for CacheKey {
	type Error = KeyError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(value)
	}
}
impl From<CacheKey> for String {
	fn from(value: CacheKey) -> Self {
		match value {
			CacheKey::Named(name) => name.into(),
			other => other.as_str().to_owned(),
		}
	}
}
impl From<KeyName> for CacheKey {
	fn from(value: KeyName) -> Self {
		Self::Named(value)
	}
}

fn validate_view(view: &str) -> Result<(), KeyError> {
	if view.is_empty() {
		return Err(KeyError::Empty);
	}
	if view.chars().any(char::is_whitespace) {
		return Err(KeyError::ContainsWhitespace);
	}
	if view.len() > KEY_MAX_LEN {
		return Err(KeyError::TooLong { max: KEY_MAX_LEN });
	}

	Ok(())
}
