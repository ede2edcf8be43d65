//! Contract for the component that actually mints tokens.
//!
//! The broker never talks to the network itself. Implementations of [`TokenFetcher`] own the
//! transport (HTTP client, headless browser, ...) and its retry policy; the broker serializes calls
//! per key, bounds them with `fetch_timeout`, and validates whatever comes back.

// self
use crate::{
	_prelude::*,
	error::FetchError,
	token::{CredentialSet, RawToken},
};

/// Boxed future returned by [`TokenFetcher`] methods.
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + 'a + Send>>;

/// Upstream token source.
///
/// Must be safe to call concurrently for different keys. Implementations must fail rather than
/// return an empty token.
pub trait TokenFetcher
where
	Self: Send + Sync,
{
	/// Mints a token; `None` requests an anonymous token.
	fn fetch<'a>(&'a self, credentials: Option<&'a CredentialSet>) -> FetchFuture<'a, RawToken>;

	/// Liveness check used by recovery. Defaults to healthy.
	fn probe(&self) -> FetchFuture<'_, ()> {
		Box::pin(async { Ok(()) })
	}

	/// Recreates underlying resources after a failed probe. Defaults to a no-op.
	fn reset(&self) -> FetchFuture<'_, ()> {
		Box::pin(async { Ok(()) })
	}
}

/// [`TokenFetcher`] backed by an async closure.
///
/// The closure receives an owned copy of the credentials so the returned future can be `'static`.
///
/// ```
/// use credential_broker::{error::FetchError, fetcher::FnFetcher, token::RawToken};
///
/// let fetcher = FnFetcher::new(|_credentials| async {
/// 	Ok::<_, FetchError>(RawToken::new("BQD", 4_102_444_800_000, true, "demo"))
/// });
/// # let _ = fetcher;
/// ```
pub struct FnFetcher<F> {
	fetch: F,
}
impl<F> FnFetcher<F> {
	/// Wraps `fetch`.
	pub fn new<Fut>(fetch: F) -> Self
	where
		F: Fn(Option<CredentialSet>) -> Fut,
		Fut: Future<Output = Result<RawToken, FetchError>>,
	{
		Self { fetch }
	}
}
impl<F, Fut> TokenFetcher for FnFetcher<F>
where
	F: Send + Sync + Fn(Option<CredentialSet>) -> Fut,
	Fut: 'static + Send + Future<Output = Result<RawToken, FetchError>>,
{
	fn fetch<'a>(&'a self, credentials: Option<&'a CredentialSet>) -> FetchFuture<'a, RawToken> {
		Box::pin((self.fetch)(credentials.cloned()))
	}
}
impl<F> Debug for FnFetcher<F> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("FnFetcher(..)")
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn fn_fetcher_forwards_credentials() {
		let fetcher = FnFetcher::new(|credentials: Option<CredentialSet>| async move {
			match credentials {
				Some(set) => Ok(RawToken::new(
					set.get("sp_dc").unwrap_or_default(),
					4_102_444_800_000,
					false,
					"user",
				)),
				None => Err(FetchError::rejected("credentials required")),
			}
		});
		let credentials =
			CredentialSet::single("sp_dc", "cookie").expect("Credential fixture should be valid.");
		let raw = fetcher.fetch(Some(&credentials)).await.expect("Fetch should forward credentials.");

		assert_eq!(raw.value, "cookie");
		assert!(matches!(fetcher.fetch(None).await, Err(FetchError::Rejected { .. })));
		assert!(fetcher.probe().await.is_ok());
		assert!(fetcher.reset().await.is_ok());
	}
}
