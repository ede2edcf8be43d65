//! Single-flight credential broker: fetch short-lived bearer tokens once, cache them with a safety
//! buffer, refresh them before they expire, and keep serving through upstream hiccups.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod obs;
pub mod sync;
pub mod token;

#[cfg(test)] mod testutil;

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::{Arc, Weak},
		time::Duration,
	};

	pub use parking_lot::{Mutex, RwLock};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;

	pub use crate::error::{Error, Result};
}

pub use broker::{Broker, BrokerStats};
pub use config::BrokerConfig;
pub use error::{Error, ErrorKind, FetchError, Result};
pub use fetcher::{FnFetcher, TokenFetcher};
pub use token::{CacheKey, CredentialSet, RawToken, Token};

#[cfg(test)] use color_eyre as _;
