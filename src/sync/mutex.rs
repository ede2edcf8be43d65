//! FIFO-fair async mutex with per-waiter wait budgets and a holder hold budget.
//!
//! Waiters queue in arrival order and each carries its own wait timer; a waiter whose timer
//! expires leaves the queue with [`Error::MutexTimeout`] without disturbing the holder. Every
//! grant starts a hold timer; if the holder outlives it, the lock is force-released and every
//! queued waiter fails with [`Error::MutexForceReleased`]. Hand-off happens under the internal
//! lock, so no late arrival can slip in between a release and the next waiter's grant.
//!
//! The mutex is not re-entrant: acquiring it again from inside [`AsyncMutex::run_exclusive`]
//! waits for itself until the wait budget runs out.

// crates.io
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};
// self
use crate::{_prelude::*, obs::trace_event};

type Grant = Result<u64>;

/// Wait and hold budgets for an [`AsyncMutex`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexConfig {
	/// Maximum time a waiter stays queued before failing with [`Error::MutexTimeout`].
	pub max_wait: Duration,
	/// Maximum time a holder keeps the lock before it is force-released.
	pub max_hold: Duration,
}
impl MutexConfig {
	/// Default queue wait budget.
	pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
	/// Default hold budget.
	pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(60);
}
impl Default for MutexConfig {
	fn default() -> Self {
		Self { max_wait: Self::DEFAULT_MAX_WAIT, max_hold: Self::DEFAULT_MAX_HOLD }
	}
}

/// Point-in-time view of an [`AsyncMutex`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MutexStats {
	/// Whether a holder currently owns the lock.
	pub locked: bool,
	/// Number of queued waiters.
	pub queue_depth: usize,
	/// How long the current holder has owned the lock.
	pub held_for: Option<Duration>,
}

/// FIFO-fair exclusive lock guarding a refresh lane.
#[derive(Clone)]
pub struct AsyncMutex {
	inner: Arc<Inner>,
}
impl AsyncMutex {
	/// Creates an unlocked mutex; `label` shows up in logs.
	pub fn new(label: impl Into<String>, config: MutexConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				label: label.into(),
				config,
				state: Mutex::new(LockState::default()),
			}),
		}
	}

	/// Label used in logs.
	pub fn label(&self) -> &str {
		&self.inner.label
	}

	/// Acquires the lock, queueing behind earlier waiters.
	///
	/// Fails with [`Error::MutexTimeout`] once the wait budget elapses, or with
	/// [`Error::MutexForceReleased`] when the holder blew its hold budget while this caller was
	/// queued.
	pub async fn acquire(&self) -> Result<MutexGuard> {
		let (id, rx) = {
			let mut state = self.inner.state.lock();

			if state.holder.is_none() {
				let generation = self.inner.grant_locked(&mut state);

				return Ok(MutexGuard { inner: self.inner.clone(), generation });
			}

			let id = state.next_waiter;
			let (tx, rx) = oneshot::channel();

			state.next_waiter += 1;
			state.queue.push_back(Waiter { id, grant: tx });

			(id, rx)
		};
		let started = Instant::now();
		let mut pending = PendingAcquire { inner: self.inner.clone(), id, rx, settled: false };
		let outcome = tokio::time::timeout(self.inner.config.max_wait, &mut pending.rx).await;

		match outcome {
			Ok(Ok(grant)) => pending.settle(grant),
			Ok(Err(_)) => pending.settle(Err(Error::MutexForceReleased)),
			Err(_) => pending.abandon(started.elapsed()),
		}
	}

	/// Runs `body` while holding the lock; the lock is released on every exit path.
	pub async fn run_exclusive<F, Fut, T>(&self, body: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let _guard = self.acquire().await?;

		body().await
	}

	/// Whether a holder currently owns the lock.
	pub fn is_locked(&self) -> bool {
		self.inner.state.lock().holder.is_some()
	}

	/// Number of queued waiters.
	pub fn queue_depth(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// Returns a point-in-time view of the lock.
	pub fn stats(&self) -> MutexStats {
		let state = self.inner.state.lock();

		MutexStats {
			locked: state.holder.is_some(),
			queue_depth: state.queue.len(),
			held_for: state.holder.as_ref().map(|holder| holder.acquired_at.elapsed()),
		}
	}
}
impl Debug for AsyncMutex {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AsyncMutex")
			.field("label", &self.inner.label)
			.field("stats", &self.stats())
			.finish()
	}
}

/// RAII guard returned by [`AsyncMutex::acquire`]; dropping it releases the lock.
///
/// A guard whose hold was force-released becomes inert and never releases a later holder.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard {
	inner: Arc<Inner>,
	generation: u64,
}
impl Drop for MutexGuard {
	fn drop(&mut self) {
		let mut state = self.inner.state.lock();

		self.inner.release_locked(&mut state, self.generation);
	}
}
impl Debug for MutexGuard {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("MutexGuard")
			.field("label", &self.inner.label)
			.field("generation", &self.generation)
			.finish()
	}
}

struct Inner {
	label: String,
	config: MutexConfig,
	state: Mutex<LockState>,
}
impl Inner {
	fn grant_locked(self: &Arc<Self>, state: &mut LockState) -> u64 {
		let generation = state.next_generation;

		state.next_generation += 1;
		state.holder = Some(Holder {
			generation,
			acquired_at: Instant::now(),
			hold_timer: self.spawn_hold_timer(generation),
		});

		generation
	}

	fn spawn_hold_timer(self: &Arc<Self>, generation: u64) -> Option<AbortHandle> {
		// Guards dropped outside a runtime skip the hold timer.
		let runtime = tokio::runtime::Handle::try_current().ok()?;
		let inner = Arc::downgrade(self);
		let max_hold = self.config.max_hold;
		let task = runtime.spawn(async move {
			tokio::time::sleep(max_hold).await;

			if let Some(inner) = inner.upgrade() {
				inner.force_release(generation);
			}
		});

		Some(task.abort_handle())
	}

	fn release_locked(self: &Arc<Self>, state: &mut LockState, generation: u64) {
		if !state.is_held_by(generation) {
			return;
		}
		if let Some(timer) = state.holder.take().and_then(|holder| holder.hold_timer) {
			timer.abort();
		}

		while let Some(waiter) = state.queue.pop_front() {
			let next = self.grant_locked(state);

			if waiter.grant.send(Ok(next)).is_ok() {
				return;
			}

			// The waiter gave up between queueing and hand-off.
			if let Some(timer) = state.holder.take().and_then(|holder| holder.hold_timer) {
				timer.abort();
			}
		}
	}

	fn force_release(&self, generation: u64) {
		let mut state = self.state.lock();

		if !state.is_held_by(generation) {
			return;
		}

		state.holder = None;

		trace_event!(
			warn,
			lock = %self.label,
			max_hold = ?self.config.max_hold,
			rejected = state.queue.len(),
			"Refresh lock holder exceeded its hold budget; lock force-released."
		);

		for waiter in state.queue.drain(..) {
			let _ = waiter.grant.send(Err(Error::MutexForceReleased));
		}
	}
}

#[derive(Default)]
struct LockState {
	holder: Option<Holder>,
	queue: VecDeque<Waiter>,
	next_generation: u64,
	next_waiter: u64,
}
impl LockState {
	fn is_held_by(&self, generation: u64) -> bool {
		self.holder.as_ref().is_some_and(|holder| holder.generation == generation)
	}
}

struct Holder {
	generation: u64,
	acquired_at: Instant,
	hold_timer: Option<AbortHandle>,
}

struct Waiter {
	id: u64,
	grant: oneshot::Sender<Grant>,
}

/// Queue slot owned by a waiting `acquire` call; cleans up after cancelled waiters.
struct PendingAcquire {
	inner: Arc<Inner>,
	id: u64,
	rx: oneshot::Receiver<Grant>,
	settled: bool,
}
impl PendingAcquire {
	fn settle(&mut self, grant: Grant) -> Result<MutexGuard> {
		self.settled = true;

		grant.map(|generation| MutexGuard { inner: self.inner.clone(), generation })
	}

	fn abandon(&mut self, waited: Duration) -> Result<MutexGuard> {
		let mut state = self.inner.state.lock();

		if let Some(position) = state.queue.iter().position(|waiter| waiter.id == self.id) {
			state.queue.remove(position);

			self.settled = true;

			trace_event!(debug, lock = %self.inner.label, ?waited, "Refresh lock wait timed out.");

			return Err(Error::MutexTimeout { waited });
		}

		drop(state);

		// Hand-off raced the timer; the grant (or rejection) is already in the channel.
		match self.rx.try_recv() {
			Ok(grant) => self.settle(grant),
			Err(_) => {
				self.settled = true;

				Err(Error::MutexTimeout { waited })
			},
		}
	}
}
impl Drop for PendingAcquire {
	fn drop(&mut self) {
		if self.settled {
			return;
		}

		let mut state = self.inner.state.lock();

		if let Some(position) = state.queue.iter().position(|waiter| waiter.id == self.id) {
			state.queue.remove(position);
		} else if let Ok(Ok(generation)) = self.rx.try_recv() {
			self.inner.release_locked(&mut state, generation);
		}
	}
}
