//! Demonstrates serving anonymous tokens from a broker backed by a closure fetcher, including the
//! single-flight behavior under concurrent load and the stats snapshot.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use color_eyre::Result;
use time::OffsetDateTime;
// self
use credential_broker::{
	broker::Broker,
	config::BrokerConfig,
	error::FetchError,
	fetcher::FnFetcher,
	token::{CacheKey, CredentialSet, RawToken},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let minted = Arc::new(AtomicUsize::new(0));
	let counter = minted.clone();
	let fetcher = FnFetcher::new(move |credentials: Option<CredentialSet>| {
		let serial = counter.fetch_add(1, Ordering::SeqCst) + 1;

		async move {
			// Stand-in for the real upstream round trip.
			tokio::time::sleep(Duration::from_millis(250)).await;

			let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(3_600);

			Ok::<_, FetchError>(RawToken::new(
				format!("demo-token-{serial}"),
				(expires_at.unix_timestamp_nanos() / 1_000_000) as i64,
				credentials.is_none(),
				"demo-client",
			))
		}
	});
	let config = BrokerConfig::from_json_str(r#"{ "bufferMs": 120000, "checkIntervalMs": 30000 }"#)?;
	let broker = Broker::start(Arc::new(fetcher), config).await?;
	let tasks = (0..8)
		.map(|_| {
			let broker = broker.clone();

			tokio::spawn(async move { broker.request(CacheKey::Anonymous, None).await })
		})
		.collect::<Vec<_>>();

	for task in tasks {
		let token = task.await??;

		println!(
			"Served {} ({:?}), expires at {}.",
			token.value.fingerprint(),
			token.origin,
			token.expires_at
		);
	}

	println!("Upstream minted {} token(s).", minted.load(Ordering::SeqCst));
	println!("{}", serde_json::to_string_pretty(&broker.stats())?);

	broker.shutdown();

	Ok(())
}
