//! Broker tuning knobs, their defaults, and validation.

// self
use crate::{_prelude::*, error::ConfigError, sync::MutexConfig};

/// Validated broker configuration.
///
/// Construct it through [`BrokerConfig::builder`], [`BrokerConfig::from_json_str`], or
/// [`Default`]; all three paths enforce the same invariants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
	/// Tokens are treated as stale this long before they expire.
	pub buffer: Duration,
	/// The scheduler refreshes the anonymous token once it expires within this window.
	pub proactive_buffer: Duration,
	/// Period of the proactive scheduler.
	pub check_interval: Duration,
	/// Budgets of every per-key refresh lock.
	pub mutex: MutexConfig,
	/// Upper bound on a single fetcher call.
	pub fetch_timeout: Duration,
	/// Cache capacity.
	pub max_entries: usize,
	/// Cumulative refresh failures since the last success that put the service into `Error`.
	pub error_threshold: u32,
	/// Minimum remaining validity of a last-good anonymous token served as a degraded fallback.
	pub stale_fallback_floor: Duration,
}
impl BrokerConfig {
	/// Default buffer window.
	pub const DEFAULT_BUFFER: Duration = Duration::from_secs(5 * 60);
	/// Default proactive refresh window.
	pub const DEFAULT_PROACTIVE_BUFFER: Duration = Duration::from_secs(5 * 60);
	/// Default scheduler period.
	pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
	/// Default fetch budget.
	pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
	/// Default cache capacity.
	pub const DEFAULT_MAX_ENTRIES: usize = 100;
	/// Default error threshold.
	pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;
	/// Default degraded fallback floor.
	pub const DEFAULT_STALE_FALLBACK_FLOOR: Duration = Duration::from_secs(30);

	/// Starts a builder seeded with the defaults.
	pub fn builder() -> BrokerConfigBuilder {
		BrokerConfigBuilder::default()
	}

	/// Parses a JSON document with millisecond fields (`bufferMs`, `checkIntervalMs`, ...).
	///
	/// Missing fields keep their defaults; unknown fields are rejected.
	pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
		Self::from_json_slice(document.as_bytes())
	}

	/// Byte-slice variant of [`from_json_str`](Self::from_json_str).
	pub fn from_json_slice(document: &[u8]) -> Result<Self, ConfigError> {
		let mut de = serde_json::Deserializer::from_slice(document);
		let document: ConfigDocument = serde_path_to_error::deserialize(&mut de)
			.map_err(|source| ConfigError::Parse { source })?;

		document.apply(Self::builder()).build()
	}

	/// Checks the invariants enforced by the builder.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let non_zero = [
			("check_interval", self.check_interval),
			("mutex.max_wait", self.mutex.max_wait),
			("mutex.max_hold", self.mutex.max_hold),
			("fetch_timeout", self.fetch_timeout),
		];

		for (field, value) in non_zero {
			if value.is_zero() {
				return Err(ConfigError::ZeroDuration { field });
			}
		}

		if self.max_entries == 0 {
			return Err(ConfigError::ZeroMaxEntries);
		}
		if self.error_threshold == 0 {
			return Err(ConfigError::ZeroErrorThreshold);
		}
		if self.fetch_timeout >= self.mutex.max_hold {
			return Err(ConfigError::FetchTimeoutExceedsHold {
				fetch_timeout: self.fetch_timeout,
				max_hold: self.mutex.max_hold,
			});
		}
		if self.stale_fallback_floor > self.buffer {
			return Err(ConfigError::FallbackFloorExceedsBuffer {
				floor: self.stale_fallback_floor,
				buffer: self.buffer,
			});
		}

		Ok(())
	}
}
impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			buffer: Self::DEFAULT_BUFFER,
			proactive_buffer: Self::DEFAULT_PROACTIVE_BUFFER,
			check_interval: Self::DEFAULT_CHECK_INTERVAL,
			mutex: MutexConfig::default(),
			fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT,
			max_entries: Self::DEFAULT_MAX_ENTRIES,
			error_threshold: Self::DEFAULT_ERROR_THRESHOLD,
			stale_fallback_floor: Self::DEFAULT_STALE_FALLBACK_FLOOR,
		}
	}
}

/// Builder for [`BrokerConfig`] values.
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
	config: BrokerConfig,
}
impl BrokerConfigBuilder {
	/// Sets the buffer window.
	pub fn buffer(mut self, buffer: Duration) -> Self {
		self.config.buffer = buffer;

		self
	}

	/// Sets the proactive refresh window.
	pub fn proactive_buffer(mut self, window: Duration) -> Self {
		self.config.proactive_buffer = window;

		self
	}

	/// Sets the scheduler period.
	pub fn check_interval(mut self, interval: Duration) -> Self {
		self.config.check_interval = interval;

		self
	}

	/// Sets the refresh lock wait budget.
	pub fn mutex_max_wait(mut self, max_wait: Duration) -> Self {
		self.config.mutex.max_wait = max_wait;

		self
	}

	/// Sets the refresh lock hold budget.
	pub fn mutex_max_hold(mut self, max_hold: Duration) -> Self {
		self.config.mutex.max_hold = max_hold;

		self
	}

	/// Sets the fetch budget.
	pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
		self.config.fetch_timeout = timeout;

		self
	}

	/// Sets the cache capacity.
	pub fn max_entries(mut self, max_entries: usize) -> Self {
		self.config.max_entries = max_entries;

		self
	}

	/// Sets the error threshold.
	pub fn error_threshold(mut self, threshold: u32) -> Self {
		self.config.error_threshold = threshold;

		self
	}

	/// Sets the degraded fallback floor.
	pub fn stale_fallback_floor(mut self, floor: Duration) -> Self {
		self.config.stale_fallback_floor = floor;

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<BrokerConfig, ConfigError> {
		self.config.validate()?;

		Ok(self.config)
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigDocument {
	buffer_ms: Option<u64>,
	proactive_buffer_ms: Option<u64>,
	check_interval_ms: Option<u64>,
	mutex_max_wait_ms: Option<u64>,
	mutex_max_hold_ms: Option<u64>,
	fetch_timeout_ms: Option<u64>,
	max_entries: Option<usize>,
	error_threshold: Option<u32>,
	stale_fallback_floor_ms: Option<u64>,
}
impl ConfigDocument {
	fn apply(self, mut builder: BrokerConfigBuilder) -> BrokerConfigBuilder {
		let millis = Duration::from_millis;

		if let Some(ms) = self.buffer_ms {
			builder = builder.buffer(millis(ms));
		}
		if let Some(ms) = self.proactive_buffer_ms {
			builder = builder.proactive_buffer(millis(ms));
		}
		if let Some(ms) = self.check_interval_ms {
			builder = builder.check_interval(millis(ms));
		}
		if let Some(ms) = self.mutex_max_wait_ms {
			builder = builder.mutex_max_wait(millis(ms));
		}
		if let Some(ms) = self.mutex_max_hold_ms {
			builder = builder.mutex_max_hold(millis(ms));
		}
		if let Some(ms) = self.fetch_timeout_ms {
			builder = builder.fetch_timeout(millis(ms));
		}
		if let Some(max_entries) = self.max_entries {
			builder = builder.max_entries(max_entries);
		}
		if let Some(threshold) = self.error_threshold {
			builder = builder.error_threshold(threshold);
		}
		if let Some(ms) = self.stale_fallback_floor_ms {
			builder = builder.stale_fallback_floor(millis(ms));
		}

		builder
	}
}
