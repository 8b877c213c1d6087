//! Single-shot promise/future pair.
//!
//! A [`Promise`] is the producer half: it is settled exactly once, either by
//! [`Promise::ok`] / [`Promise::err`] or implicitly by being dropped, which
//! rejects the paired [`Future`] with [`BrokenPromise`]. The consumer half can
//! be `.await`ed or polled synchronously with [`Future::try_take`].

use anyhow::Error;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Promise was dropped before completion")]
pub struct BrokenPromise {}

#[derive(Debug)]
struct Core<T> {
    result: Option<anyhow::Result<T>>,
    waker: Option<Waker>,
}

fn lock<T>(core: &Mutex<Core<T>>) -> MutexGuard<'_, Core<T>> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Promise<T> {
    core: Arc<Mutex<Core<T>>>,
    future_taken: bool,
    settled: bool,
}

#[derive(Debug)]
pub struct Future<T> {
    core: Arc<Mutex<Core<T>>>,
}

/// Create a connected promise and future.
pub fn pair<T>() -> (Promise<T>, Future<T>) {
    let mut promise = Promise::new();
    let future = Future {
        core: Arc::clone(&promise.core),
    };
    promise.future_taken = true;
    (promise, future)
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                result: None,
                waker: None,
            })),
            future_taken: false,
            settled: false,
        }
    }

    /// Returns the consumer half. Only the first call yields a future.
    pub fn get_future(&mut self) -> Option<Future<T>> {
        if self.future_taken {
            return None;
        }
        self.future_taken = true;
        Some(Future {
            core: Arc::clone(&self.core),
        })
    }

    pub fn ok(self, value: T) {
        self.result(Ok(value));
    }

    pub fn err(self, err: Error) {
        self.result(Err(err));
    }

    pub fn result(mut self, result: anyhow::Result<T>) {
        self.settle(result);
    }

    fn settle(&mut self, result: anyhow::Result<T>) {
        if self.settled {
            return;
        }
        self.settled = true;
        let waker = {
            let mut core = lock(&self.core);
            core.result = Some(result);
            core.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err(BrokenPromise {}.into()));
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("future_taken", &self.future_taken)
            .field("settled", &self.settled)
            .finish()
    }
}

impl<T> Future<T> {
    /// Create a leaf future which is immediately ready with
    /// the provided value
    pub fn ok(value: T) -> Self {
        Self::result(Ok(value))
    }

    /// Create a leaf future which is immediately ready with
    /// the provided error
    pub fn err(err: Error) -> Self {
        Self::result(Err(err))
    }

    /// Create a leaf future which is immediately ready with
    /// the provided result
    pub fn result(result: anyhow::Result<T>) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                result: Some(result),
                waker: None,
            })),
        }
    }

    /// Whether the paired promise has been settled and the result not yet taken.
    pub fn is_ready(&self) -> bool {
        lock(&self.core).result.is_some()
    }

    /// Take the result without an async context, if one is available.
    pub fn try_take(&mut self) -> Option<anyhow::Result<T>> {
        lock(&self.core).result.take()
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = anyhow::Result<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let mut core = lock(&self.core);
        if let Some(result) = core.result.take() {
            Poll::Ready(result)
        } else {
            core.waker.replace(ctx.waker().clone());
            Poll::Pending
        }
    }
}
