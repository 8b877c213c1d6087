//! Timer services backing entry timeouts.
//!
//! The correlation table never sleeps on its own; it asks an injected
//! [`TimerService`] to run a callback after a delay and cancels the returned
//! [`TimerToken`] when the entry settles first.
//!
//! * [`TokioTimer`] spawns one sleeping task per timer on a tokio runtime.
//! * [`ManualTimer`] is a deterministic clock that only moves when
//!   [`ManualTimer::advance`] is called. Tests, the fuzz target, and the replay
//!   engine use it so timeouts are reproducible.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::error::{Error, Result};

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Capability to schedule and cancel delayed callbacks.
pub trait TimerService: Send + Sync {
    /// Run `callback` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerToken;

    /// Cancel a scheduled timer.
    ///
    /// Cancelling an unknown, already-cancelled, or already-fired token is a
    /// no-op.
    fn cancel(&self, token: TimerToken);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Tokio-backed timers
// =============================================================================

/// Wall-clock timers running on a tokio runtime.
pub struct TokioTimer {
    handle: Handle,
    next_token: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerToken, AbortHandle>>>,
}

impl TokioTimer {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_token: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Timer bound to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Timer(e.to_string()))
    }

    /// Number of timers scheduled and neither fired nor cancelled.
    #[must_use]
    pub fn scheduled(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let tasks = Arc::clone(&self.tasks);

        // Held across spawn so the task cannot look itself up before it is
        // recorded.
        let mut pending = lock(&self.tasks);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let armed = lock(&tasks).remove(&token).is_some();
            if armed {
                trace!(timer = token.0, "timer fired");
                callback();
            }
        });
        pending.insert(token, task.abort_handle());
        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some(task) = lock(&self.tasks).remove(&token) {
            task.abort();
            trace!(timer = token.0, "timer cancelled");
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

// =============================================================================
// Deterministic timers
// =============================================================================

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_token: u64,
    queue: BTreeMap<(Duration, TimerToken), TimerCallback>,
    deadlines: HashMap<TimerToken, Duration>,
}

/// Deterministic clock for tests and replays.
///
/// Time starts at zero and only moves forward through [`advance`]. Timers due
/// at the same instant fire in the order they were scheduled. Callbacks run
/// without the clock's lock held, so they may schedule or cancel timers.
///
/// [`advance`]: ManualTimer::advance
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed on this clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// Number of timers waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Deadline of the earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        lock(&self.state).queue.keys().next().map(|(at, _)| *at)
    }

    /// Move the clock forward by `by`, firing every timer that comes due.
    ///
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.state).now.saturating_add(by);
        let mut fired = 0;
        loop {
            let due = {
                let mut state = lock(&self.state);
                let next = state.queue.keys().next().copied();
                match next {
                    Some((at, token)) if at <= target => {
                        state.now = state.now.max(at);
                        state.deadlines.remove(&token);
                        state.queue.remove(&(at, token))
                    }
                    _ => None,
                }
            };
            match due {
                Some(callback) => {
                    callback();
                    fired += 1;
                }
                None => break,
            }
        }
        let mut state = lock(&self.state);
        state.now = state.now.max(target);
        fired
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let mut state = lock(&self.state);
        state.next_token += 1;
        let token = TimerToken(state.next_token);
        let at = state.now.saturating_add(delay);
        state.deadlines.insert(token, at);
        state.queue.insert((at, token), callback);
        token
    }

    fn cancel(&self, token: TimerToken) {
        let mut state = lock(&self.state);
        if let Some(at) = state.deadlines.remove(&token) {
            state.queue.remove(&(at, token));
        }
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .finish()
    }
}
