//! Generic request/response correlation table.
//!
//! A [`CorrelationTable`] tracks pending operations by key. A caller
//! [`register`]s continuations when it sends a request; the transport later
//! [`resolve`]s the key when the matching response arrives. An optional delay
//! arms a timer that rejects the entry if no response comes first.
//!
//! ```text
//!            ┌──► Resolved   (resolve: on_success(result))
//! Pending ───┼──► TimedOut   (timer:   on_failure(TimedOut))
//!            └──► Cancelled  (cancel:  no continuation)
//! ```
//!
//! Exactly one terminal transition happens per entry. Each transition removes
//! the entry while holding the table lock and runs the continuation after the
//! lock is released, so a continuation may re-register the same key.
//!
//! Resolving or cancelling a key that is not pending is a silent no-op: late,
//! duplicate, and unsolicited responses are expected on real transports.
//!
//! [`register`]: CorrelationTable::register
//! [`resolve`]: CorrelationTable::resolve

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::TableConfig;
use crate::delay::Delay;
use crate::error::{Error, Result, TimedOut};
use crate::timer::{TimerService, TimerToken};

/// Success continuation.
pub type SuccessFn<T> = Box<dyn FnOnce(T) + Send + 'static>;
/// Failure continuation, only invoked on timeout.
pub type FailureFn = Box<dyn FnOnce(TimedOut) + Send + 'static>;
/// Post-processing applied to a result before the success continuation.
pub type TransformFn<T> = Box<dyn FnOnce(T) -> T + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Registration options
// =============================================================================

/// Options accepted by [`CorrelationTable::register`].
pub struct RegisterOptions<T> {
    /// Timeout; `None` waits forever.
    pub delay: Option<Delay>,
    /// Message carried by [`TimedOut`]; defaults to the table's configured
    /// failure message.
    pub failure_message: Option<String>,
    /// Applied to the resolved result before `on_success`.
    pub transform: Option<TransformFn<T>>,
}

impl<T> Default for RegisterOptions<T> {
    fn default() -> Self {
        Self {
            delay: None,
            failure_message: None,
            transform: None,
        }
    }
}

impl<T> RegisterOptions<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    #[must_use]
    pub fn failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn transform(mut self, transform: impl FnOnce(T) -> T + Send + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }
}

impl<T> fmt::Debug for RegisterOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("delay", &self.delay)
            .field("failure_message", &self.failure_message)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    unmatched: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time counters for a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Entries accepted by `register`.
    pub registered: u64,
    /// Entries settled by `resolve`.
    pub resolved: u64,
    /// Entries rejected by their timer.
    pub timed_out: u64,
    /// Entries removed by `cancel` or `close`.
    pub cancelled: u64,
    /// `resolve` calls naming a key that was not pending.
    pub unmatched: u64,
    /// `register` calls refused (duplicate key, full, or closed).
    pub rejected: u64,
    /// Entries currently pending.
    pub pending: usize,
}

// =============================================================================
// Table internals
// =============================================================================

struct Entry<T> {
    seq: u64,
    on_success: SuccessFn<T>,
    on_failure: FailureFn,
    transform: Option<TransformFn<T>>,
    timer: Option<TimerToken>,
    registered_at: Instant,
}

struct State<K, T> {
    entries: HashMap<K, Entry<T>>,
    next_seq: u64,
    closed: bool,
}

struct Shared<K, T> {
    state: Mutex<State<K, T>>,
    timer: Arc<dyn TimerService>,
    config: TableConfig,
    counters: Counters,
}

impl<K, T> Shared<K, T>
where
    K: Eq + Hash + fmt::Debug,
{
    /// Timer path: only removes the entry the timer was armed for.
    fn expire(&self, key: &K, seq: u64, delay: Delay, message: String) {
        let entry = {
            let mut state = lock(&self.state);
            match state.entries.get(key) {
                Some(entry) if entry.seq == seq => state.entries.remove(key),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            trace!(key = ?key, seq, "stale timer ignored");
            return;
        };

        Counters::bump(&self.counters.timed_out);
        warn!(
            key = ?key,
            seq,
            delay_ms = delay.as_duration().as_millis() as u64,
            "pending request timed out"
        );
        (entry.on_failure)(TimedOut {
            message,
            delay: delay.as_duration(),
        });
    }
}

impl<K, T> Drop for Shared<K, T> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for entry in state.entries.values() {
            if let Some(token) = entry.timer {
                self.timer.cancel(token);
            }
        }
    }
}

// =============================================================================
// Correlation table
// =============================================================================

/// Keyed registry of pending operations.
///
/// The table is a cheap handle: clones share the same entries, so a
/// transport's receive loop and its callers can each hold one. The entry map is
/// guarded by a mutex, which makes the table safe to use from several threads;
/// no operation blocks beyond that short critical section.
///
/// Registering a key that is already pending is rejected with
/// [`Error::DuplicateKey`] and leaves the existing entry untouched.
///
/// Dropping the last handle cancels every timer still armed; pending
/// continuations are dropped without being called.
pub struct CorrelationTable<K, T> {
    shared: Arc<Shared<K, T>>,
}

impl<K, T> Clone for CorrelationTable<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, T> CorrelationTable<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: Send + 'static,
{
    /// Create a table with default configuration.
    pub fn new(timer: Arc<dyn TimerService>) -> Self {
        Self::with_config(timer, TableConfig::default())
    }

    pub fn with_config(timer: Arc<dyn TimerService>, config: TableConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    next_seq: 0,
                    closed: false,
                }),
                timer,
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Register continuations for `key`.
    ///
    /// When `options.delay` is set a timer is armed; if it fires before the
    /// key is resolved or cancelled the entry is removed and `on_failure` is
    /// invoked with a [`TimedOut`] carrying the failure message.
    pub fn register<S, F>(
        &self,
        key: K,
        on_success: S,
        on_failure: F,
        options: RegisterOptions<T>,
    ) -> Result<()>
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(TimedOut) + Send + 'static,
    {
        let shared = &self.shared;
        let mut state = lock(&shared.state);

        if state.closed {
            Counters::bump(&shared.counters.rejected);
            return Err(Error::Closed);
        }
        if state.entries.contains_key(&key) {
            Counters::bump(&shared.counters.rejected);
            warn!(key = ?key, "duplicate registration rejected");
            return Err(Error::DuplicateKey {
                key: format!("{key:?}"),
            });
        }
        let capacity = shared.config.max_pending;
        if capacity > 0 && state.entries.len() >= capacity {
            Counters::bump(&shared.counters.rejected);
            return Err(Error::TableFull { capacity });
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let RegisterOptions {
            delay,
            failure_message,
            transform,
        } = options;

        let timer = delay.map(|delay| {
            let message =
                failure_message.unwrap_or_else(|| shared.config.default_failure_message.clone());
            self.arm_timeout(key.clone(), seq, delay, message)
        });

        debug!(key = ?key, seq, delay = ?delay, "registered pending request");
        state.entries.insert(
            key,
            Entry {
                seq,
                on_success: Box::new(on_success),
                on_failure: Box::new(on_failure),
                transform,
                timer,
                registered_at: Instant::now(),
            },
        );
        Counters::bump(&shared.counters.registered);
        Ok(())
    }

    /// Register a key whose outcome is delivered through a [`promise::Future`].
    ///
    /// The future yields the (transformed) result on resolve, a [`TimedOut`]
    /// error on timeout, and [`promise::BrokenPromise`] if the entry is
    /// cancelled or the table is torn down.
    pub fn register_promise(
        &self,
        key: K,
        options: RegisterOptions<T>,
    ) -> Result<promise::Future<T>> {
        let (promise, future) = promise::pair();
        let on_success_slot = Arc::new(Mutex::new(Some(promise)));
        let on_failure_slot = Arc::clone(&on_success_slot);

        self.register(
            key,
            move |value| {
                let promise = lock(&on_success_slot).take();
                if let Some(promise) = promise {
                    promise.ok(value);
                }
            },
            move |failure| {
                let promise = lock(&on_failure_slot).take();
                if let Some(promise) = promise {
                    promise.err(failure.into());
                }
            },
            options,
        )?;
        Ok(future)
    }

    fn arm_timeout(&self, key: K, seq: u64, delay: Delay, message: String) -> TimerToken {
        let weak: Weak<Shared<K, T>> = Arc::downgrade(&self.shared);
        self.shared.timer.schedule(
            delay.as_duration(),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(&key, seq, delay, message);
                }
            }),
        )
    }

    /// Remove the entry for `key` without invoking either continuation.
    ///
    /// Returns whether an entry was removed. Cancelling a key that was never
    /// registered, or has already settled, is a no-op.
    pub fn cancel<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let entry = lock(&self.shared.state).entries.remove(key);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(token) = entry.timer {
            self.shared.timer.cancel(token);
        }
        Counters::bump(&self.shared.counters.cancelled);
        debug!(key = ?key, seq = entry.seq, "pending request cancelled");
        true
    }

    /// Settle the entry for `key` with `result`.
    ///
    /// Cancels the entry's timer, removes it, then invokes `on_success` with
    /// `result` (or `transform(result)`). Returns `false` without side effects
    /// when `key` is not pending.
    pub fn resolve<Q>(&self, key: &Q, result: T) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let entry = lock(&self.shared.state).entries.remove(key);
        let Some(entry) = entry else {
            Counters::bump(&self.shared.counters.unmatched);
            trace!(key = ?key, "resolve for unknown key ignored");
            return false;
        };
        if let Some(token) = entry.timer {
            self.shared.timer.cancel(token);
        }
        Counters::bump(&self.shared.counters.resolved);
        debug!(
            key = ?key,
            seq = entry.seq,
            elapsed_us = entry.registered_at.elapsed().as_micros() as u64,
            "pending request resolved"
        );

        let value = match entry.transform {
            Some(transform) => transform(result),
            None => result,
        };
        (entry.on_success)(value);
        true
    }

    /// Tear the table down: cancel every timer and drop every pending entry
    /// without invoking continuations. Later registrations fail with
    /// [`Error::Closed`].
    ///
    /// Returns the number of entries dropped.
    pub fn close(&self) -> usize {
        let drained: Vec<(K, Entry<T>)> = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.entries.drain().collect()
        };
        for (_, entry) in &drained {
            if let Some(token) = entry.timer {
                self.shared.timer.cancel(token);
            }
        }
        let count = drained.len();
        self.shared
            .counters
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            debug!(dropped = count, "correlation table closed with pending entries");
        }
        count
    }
}

impl<K, T> CorrelationTable<K, T>
where
    K: Eq + Hash + Clone,
{
    /// Whether `key` is currently pending.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        lock(&self.shared.state).entries.contains_key(key)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of all pending entries, in no particular order.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<K> {
        lock(&self.shared.state).entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    #[must_use]
    pub fn config(&self) -> &TableConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        let c = &self.shared.counters;
        TableStats {
            registered: c.registered.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

impl<K, T> fmt::Debug for CorrelationTable<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("CorrelationTable")
            .field("pending", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
