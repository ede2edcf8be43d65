//! Bounded token cache with buffer-window validity and per-entry refresh timers.
//!
//! Entries are replaced wholesale on every store and remember a monotonically increasing
//! `stored_seq`; eviction walks that sequence from the oldest store forwards. An entry may own a
//! [`ScheduledRefresh`], the abort handle of the task that will refresh it shortly before it enters
//! the buffer window. Dropping the entry (replace, evict, invalidate, clear) aborts that task.

// crates.io
use time::Duration as TimeDelta;
use tokio::task::AbortHandle;
// self
use crate::{
	_prelude::*,
	obs::trace_event,
	token::{CacheKey, Token, to_epoch_ms},
};

/// Pending refresh timer owned by a cache entry.
///
/// The timer task is aborted when this handle drops, unless the task detached itself first via
/// [`TokenCache::disarm`].
#[derive(Debug)]
pub struct ScheduledRefresh {
	ticket: u64,
	fires_at: OffsetDateTime,
	handle: Option<AbortHandle>,
}
impl ScheduledRefresh {
	/// Ticket identifying this timer within its entry.
	pub fn ticket(&self) -> u64 {
		self.ticket
	}

	/// Wall-clock instant the timer is due.
	pub fn fires_at(&self) -> OffsetDateTime {
		self.fires_at
	}

	fn detach(&mut self) {
		self.handle = None;
	}
}
impl Drop for ScheduledRefresh {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}
}

/// Timer request handed to the arming callback of [`TokenCache::put_scheduled`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshTicket {
	/// Ticket the timer must present to [`TokenCache::disarm`] when it fires.
	pub id: u64,
	/// Delay until the timer should fire.
	pub delay: Duration,
}

/// Cached token slot.
#[derive(Debug)]
pub struct CacheEntry {
	/// Key the entry belongs to.
	pub key: CacheKey,
	/// Token as fetched.
	pub token: Token,
	/// Store sequence used for oldest-first eviction.
	pub stored_seq: u64,
	/// Wall-clock instant the entry was stored.
	pub stored_at: OffsetDateTime,
	schedule: Option<ScheduledRefresh>,
}
impl CacheEntry {
	/// Pending refresh timer, if one is armed.
	pub fn schedule(&self) -> Option<&ScheduledRefresh> {
		self.schedule.as_ref()
	}

	fn stats(&self) -> EntryStats {
		EntryStats {
			key: self.key.clone(),
			stored_seq: self.stored_seq,
			stored_at_ms: to_epoch_ms(self.stored_at),
			expires_at_ms: self.token.expires_at_ms(),
			refresh_at_ms: self.schedule.as_ref().map(|schedule| to_epoch_ms(schedule.fires_at)),
		}
	}
}

/// Serializable description of one cache entry. Never carries the token value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryStats {
	/// Entry key.
	pub key: CacheKey,
	/// Store sequence.
	pub stored_seq: u64,
	/// Store instant in Unix epoch milliseconds.
	pub stored_at_ms: i64,
	/// Token expiry in Unix epoch milliseconds.
	pub expires_at_ms: i64,
	/// Due instant of the armed refresh timer in Unix epoch milliseconds.
	pub refresh_at_ms: Option<i64>,
}

/// Serializable snapshot of the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
	/// Number of stored entries.
	pub count: usize,
	/// Capacity bound.
	pub max_entries: usize,
	/// Entries ordered oldest store first.
	pub entries: Vec<EntryStats>,
}
impl CacheStats {
	/// Keys ordered oldest store first.
	pub fn keys(&self) -> Vec<CacheKey> {
		self.entries.iter().map(|entry| entry.key.clone()).collect()
	}

	/// Number of entries with an armed refresh timer.
	pub fn scheduled(&self) -> usize {
		self.entries.iter().filter(|entry| entry.refresh_at_ms.is_some()).count()
	}
}

/// Thread-safe token cache keyed by [`CacheKey`].
#[derive(Debug)]
pub struct TokenCache {
	buffer: Duration,
	max_entries: usize,
	state: Mutex<CacheState>,
}
impl TokenCache {
	/// Creates an empty cache that treats tokens as stale `buffer` before expiry.
	pub fn new(buffer: Duration, max_entries: usize) -> Self {
		Self { buffer, max_entries, state: Mutex::new(CacheState::default()) }
	}

	/// Validity buffer before expiry.
	pub fn buffer(&self) -> Duration {
		self.buffer
	}

	/// Returns a valid cached token for `key`.
	pub fn get(&self, key: &CacheKey) -> Option<Token> {
		self.get_at(key, OffsetDateTime::now_utc())
	}

	/// Same as [`get`](Self::get) with an explicit clock.
	///
	/// Entries inside the buffer window are evicted as a side effect.
	pub fn get_at(&self, key: &CacheKey, now: OffsetDateTime) -> Option<Token> {
		self.lookup(key, now, None)
	}

	/// Returns a valid token for `key` only if it was stored after `seq`.
	pub fn get_stored_after(&self, key: &CacheKey, seq: u64) -> Option<Token> {
		self.lookup(key, OffsetDateTime::now_utc(), Some(seq))
	}

	/// Current store sequence; entries stored from now on carry a larger value.
	pub fn sequence(&self) -> u64 {
		self.state.lock().next_seq
	}

	/// Stores `token` for `key` without a refresh timer.
	///
	/// Returns the keys evicted to respect the capacity bound.
	pub fn put(&self, key: CacheKey, token: Token) -> Result<Vec<CacheKey>> {
		self.store(key, token, None::<fn(RefreshTicket) -> AbortHandle>)
	}

	/// Stores `token` for `key` and arms a refresh timer through `arm` when the refresh instant
	/// lies in the future.
	///
	/// `arm` runs under the cache lock, so a timer that fires immediately still observes its own
	/// entry when it calls [`disarm`](Self::disarm).
	pub fn put_scheduled<F>(&self, key: CacheKey, token: Token, arm: F) -> Result<Vec<CacheKey>>
	where
		F: FnOnce(RefreshTicket) -> AbortHandle,
	{
		self.store(key, token, Some(arm))
	}

	/// Removes the entry for `key`, aborting its timer.
	pub fn invalidate(&self, key: &CacheKey) -> bool {
		self.state.lock().entries.remove(key).is_some()
	}

	/// Removes every entry, aborting every timer.
	pub fn clear(&self) {
		let drained = {
			let mut state = self.state.lock();

			state.entries.drain().collect::<Vec<_>>()
		};

		trace_event!(debug, entries = drained.len(), "Token cache cleared.");

		drop(drained);
	}

	/// Clears the cache and rejects every later store with [`Error::Shutdown`].
	pub fn close(&self) {
		self.state.lock().closed = true;
		self.clear();
	}

	/// Whether [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	/// Detaches the timer identified by `ticket` from the entry for `key`.
	///
	/// Called by a firing timer before it refreshes, so the store it performs does not abort the
	/// task doing the storing. Returns `false` when the entry was replaced or removed meanwhile.
	pub fn disarm(&self, key: &CacheKey, ticket: u64) -> bool {
		let mut state = self.state.lock();
		let Some(entry) = state.entries.get_mut(key) else {
			return false;
		};

		if entry.schedule.as_ref().map(ScheduledRefresh::ticket) != Some(ticket) {
			return false;
		}
		if let Some(mut schedule) = entry.schedule.take() {
			schedule.detach();
		}

		true
	}

	/// Time left before the stored token for `key` expires, ignoring the buffer window.
	///
	/// Does not evict.
	pub fn remaining(&self, key: &CacheKey) -> Option<TimeDelta> {
		self.remaining_at(key, OffsetDateTime::now_utc())
	}

	/// Same as [`remaining`](Self::remaining) with an explicit clock.
	pub fn remaining_at(&self, key: &CacheKey, now: OffsetDateTime) -> Option<TimeDelta> {
		self.state.lock().entries.get(key).map(|entry| entry.token.remaining_at(now))
	}

	/// Time left before the stored token for `key` enters the buffer window. Does not evict.
	pub fn time_to_refresh(&self, key: &CacheKey) -> Option<TimeDelta> {
		self.remaining(key).map(|remaining| remaining - self.buffer)
	}

	/// Delay until `token` should be refreshed; `None` when that instant is not in the future.
	pub fn refresh_delay(&self, token: &Token, now: OffsetDateTime) -> Option<Duration> {
		let until = token.remaining_at(now) - self.buffer;

		if !until.is_positive() {
			return None;
		}

		Duration::try_from(until).ok()
	}

	/// Number of stored entries.
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	/// Whether the cache holds no entries.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns a serializable snapshot, entries ordered oldest first.
	pub fn stats(&self) -> CacheStats {
		let state = self.state.lock();
		let mut entries = state.entries.values().map(CacheEntry::stats).collect::<Vec<_>>();

		entries.sort_by_key(|entry| entry.stored_seq);

		CacheStats { count: entries.len(), max_entries: self.max_entries, entries }
	}

	fn lookup(&self, key: &CacheKey, now: OffsetDateTime, newer_than: Option<u64>) -> Option<Token> {
		let mut state = self.state.lock();
		let entry = state.entries.get(key)?;

		if entry.token.is_usable_at(now, self.buffer) {
			return newer_than
				.is_none_or(|seq| entry.stored_seq > seq)
				.then(|| entry.token.as_cached());
		}

		let stale = state.entries.remove(key);

		drop(state);
		drop(stale);

		trace_event!(debug, %key, "Evicted token inside its buffer window.");

		None
	}

	fn store<F>(&self, key: CacheKey, token: Token, arm: Option<F>) -> Result<Vec<CacheKey>>
	where
		F: FnOnce(RefreshTicket) -> AbortHandle,
	{
		let now = OffsetDateTime::now_utc();
		let mut state = self.state.lock();

		if state.closed {
			return Err(Error::Shutdown);
		}

		let stored_seq = state.next_seq;

		state.next_seq += 1;

		let schedule = match (arm, self.refresh_delay(&token, now)) {
			(Some(arm), Some(delay)) => {
				let ticket = state.next_ticket;

				state.next_ticket += 1;

				let handle = arm(RefreshTicket { id: ticket, delay });

				Some(ScheduledRefresh { ticket, fires_at: now + delay, handle: Some(handle) })
			},
			_ => None,
		};
		let replaced = state.entries.insert(
			key.clone(),
			CacheEntry { key: key.clone(), token, stored_seq, stored_at: now, schedule },
		);
		let mut evicted = Vec::new();

		drop(replaced);

		while state.entries.len() > self.max_entries {
			let Some(oldest) = state
				.entries
				.values()
				.filter(|entry| entry.key != key)
				.min_by_key(|entry| entry.stored_seq)
				.map(|entry| entry.key.clone())
			else {
				break;
			};

			state.entries.remove(&oldest);
			evicted.push(oldest);
		}

		drop(state);

		if !evicted.is_empty() {
			trace_event!(debug, ?evicted, "Evicted oldest cache entries to respect the capacity bound.");
		}

		Ok(evicted)
	}
}

#[derive(Debug, Default)]
struct CacheState {
	entries: HashMap<CacheKey, CacheEntry>,
	next_seq: u64,
	next_ticket: u64,
	closed: bool,
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// crates.io
	use time::macros;
	// self
	use super::*;

	const FIVE_MINUTES: Duration = Duration::from_secs(300);

	fn token_expiring_in(delta: TimeDelta) -> Token {
		let now = OffsetDateTime::now_utc();

		Token::new("BQD", now, now + delta)
	}

	fn named(name: &str) -> CacheKey {
		CacheKey::named(name).expect("Named key fixture should be valid.")
	}

	#[test]
	fn get_returns_cached_copy_until_buffer_window() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);

		cache
			.put(CacheKey::Authenticated, token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");

		let hit = cache.get(&CacheKey::Authenticated).expect("Fresh token should be served.");

		assert_eq!(hit.origin, crate::token::TokenOrigin::Cached);

		cache
			.put(CacheKey::Authenticated, token_expiring_in(TimeDelta::seconds(60)))
			.expect("Store should succeed on an open cache.");

		assert!(cache.get(&CacheKey::Authenticated).is_none());
		assert!(cache.is_empty(), "Stale entries are evicted by lookups.");
	}

	#[test]
	fn get_at_uses_explicit_clock() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);
		let start = macros::datetime!(2025-01-01 00:00 UTC);

		cache
			.put(CacheKey::Anonymous, Token::new("BQD", start, start + TimeDelta::minutes(30)))
			.expect("Store should succeed on an open cache.");

		assert!(cache.get_at(&CacheKey::Anonymous, start + TimeDelta::minutes(24)).is_some());
		assert!(cache.get_at(&CacheKey::Anonymous, start + TimeDelta::minutes(25)).is_none());
	}

	#[test]
	fn eviction_removes_oldest_stored_first() {
		let cache = TokenCache::new(FIVE_MINUTES, 2);

		for name in ["a", "b"] {
			cache
				.put(named(name), token_expiring_in(TimeDelta::hours(1)))
				.expect("Store should succeed on an open cache.");
		}

		// Replacing `a` makes `b` the oldest store.
		cache
			.put(named("a"), token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");

		let evicted = cache
			.put(named("c"), token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");

		assert_eq!(evicted, vec![named("b")]);
		assert_eq!(cache.stats().keys(), vec![named("a"), named("c")]);

		for round in 0..10 {
			cache
				.put(named(&format!("k{round}")), token_expiring_in(TimeDelta::hours(1)))
				.expect("Store should succeed on an open cache.");

			assert!(cache.len() <= 2);
		}
	}

	#[test]
	fn forced_lookups_only_accept_newer_entries() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);

		cache
			.put(CacheKey::Anonymous, token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");

		let watermark = cache.sequence();

		assert!(cache.get_stored_after(&CacheKey::Anonymous, watermark).is_none());

		cache
			.put(CacheKey::Anonymous, token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");

		assert!(cache.get_stored_after(&CacheKey::Anonymous, watermark).is_some());
	}

	#[test]
	fn refresh_delay_subtracts_buffer() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);
		let now = macros::datetime!(2025-01-01 00:00 UTC);
		let hour = Token::new("BQD", now, now + TimeDelta::hours(1));
		let short = Token::new("BQD", now, now + TimeDelta::minutes(4));

		assert_eq!(cache.refresh_delay(&hour, now), Some(Duration::from_secs(55 * 60)));
		assert_eq!(cache.refresh_delay(&short, now), None);
	}

	#[test]
	fn closed_cache_rejects_stores() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);

		cache
			.put(CacheKey::Anonymous, token_expiring_in(TimeDelta::hours(1)))
			.expect("Store should succeed on an open cache.");
		cache.close();

		assert!(cache.is_empty());
		assert!(matches!(
			cache.put(CacheKey::Anonymous, token_expiring_in(TimeDelta::hours(1))),
			Err(Error::Shutdown)
		));
	}

	#[tokio::test]
	async fn replacing_or_removing_entries_aborts_timers() {
		let cache = TokenCache::new(FIVE_MINUTES, 1);
		let fired = Arc::new(AtomicUsize::new(0));
		let arm = |fired: Arc<AtomicUsize>| {
			move |ticket: RefreshTicket| {
				assert!(ticket.delay <= Duration::from_secs(55 * 60));

				tokio::spawn(async move {
					tokio::time::sleep(Duration::from_millis(10)).await;
					fired.fetch_add(1, Ordering::SeqCst);
				})
				.abort_handle()
			}
		};

		cache
			.put_scheduled(named("a"), token_expiring_in(TimeDelta::hours(1)), arm(fired.clone()))
			.expect("Store should succeed on an open cache.");

		assert_eq!(cache.stats().scheduled(), 1);

		// Replace, then evict by capacity, then invalidate.
		cache
			.put_scheduled(named("a"), token_expiring_in(TimeDelta::hours(1)), arm(fired.clone()))
			.expect("Store should succeed on an open cache.");
		cache
			.put_scheduled(named("b"), token_expiring_in(TimeDelta::hours(1)), arm(fired.clone()))
			.expect("Store should succeed on an open cache.");

		assert!(cache.invalidate(&named("b")));

		tokio::time::sleep(Duration::from_millis(50)).await;

		assert_eq!(fired.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn disarm_detaches_only_matching_ticket() {
		let cache = TokenCache::new(FIVE_MINUTES, 10);
		let mut ticket_id = None;

		cache
			.put_scheduled(named("a"), token_expiring_in(TimeDelta::hours(1)), |ticket| {
				ticket_id = Some(ticket.id);

				tokio::spawn(async {}).abort_handle()
			})
			.expect("Store should succeed on an open cache.");

		let ticket_id = ticket_id.expect("A future refresh instant should arm a timer.");

		assert!(!cache.disarm(&named("a"), ticket_id + 1));
		assert!(cache.disarm(&named("a"), ticket_id));
		assert_eq!(cache.stats().scheduled(), 0);
		assert!(!cache.disarm(&named("a"), ticket_id));
	}
}
