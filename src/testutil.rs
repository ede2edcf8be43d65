//! Scripted fetcher shared by unit tests.

// std
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
// self
use crate::{
	_prelude::*,
	error::FetchError,
	fetcher::{FetchFuture, TokenFetcher},
	token::{CredentialSet, RawToken, to_epoch_ms},
};

/// Mints `token-{n}` values valid for `ttl`, optionally after a delay or failing on demand.
#[derive(Debug)]
pub(crate) struct ScriptedFetcher {
	ttl: Duration,
	delay: Mutex<Duration>,
	failing: AtomicBool,
	healthy: AtomicBool,
	calls: AtomicUsize,
	resets: AtomicUsize,
}
impl ScriptedFetcher {
	pub(crate) fn new(ttl: Duration) -> Arc<Self> {
		Arc::new(Self {
			ttl,
			delay: Mutex::new(Duration::ZERO),
			failing: AtomicBool::new(false),
			healthy: AtomicBool::new(true),
			calls: AtomicUsize::new(0),
			resets: AtomicUsize::new(0),
		})
	}

	pub(crate) fn set_delay(&self, delay: Duration) {
		*self.delay.lock() = delay;
	}

	pub(crate) fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub(crate) fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::SeqCst);
	}

	pub(crate) fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub(crate) fn resets(&self) -> usize {
		self.resets.load(Ordering::SeqCst)
	}
}
impl TokenFetcher for ScriptedFetcher {
	fn fetch<'a>(&'a self, credentials: Option<&'a CredentialSet>) -> FetchFuture<'a, RawToken> {
		Box::pin(async move {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			let delay = *self.delay.lock();

			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
			if self.failing.load(Ordering::SeqCst) {
				return Err(FetchError::network(std::io::Error::other("upstream unreachable")));
			}

			let expires_at = OffsetDateTime::now_utc() + self.ttl;
			let subject = credentials.map(|set| set.fingerprint().to_owned()).unwrap_or_default();

			Ok(RawToken::new(
				format!("token-{call}"),
				to_epoch_ms(expires_at),
				credentials.is_none(),
				subject,
			))
		})
	}

	fn probe(&self) -> FetchFuture<'_, ()> {
		Box::pin(async move {
			if self.healthy.load(Ordering::SeqCst) {
				Ok(())
			} else {
				Err(FetchError::network(std::io::Error::other("browser crashed")))
			}
		})
	}

	fn reset(&self) -> FetchFuture<'_, ()> {
		Box::pin(async move {
			self.resets.fetch_add(1, Ordering::SeqCst);
			self.healthy.store(true, Ordering::SeqCst);

			Ok(())
		})
	}
}
