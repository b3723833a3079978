//! Testing utilities for actions and registries.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! flightcache = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Using `ManualWork` to control settlement
//!
//! ```ignore
//! use flightcache::testing::ManualWork;
//!
//! let work = ManualWork::<String, u32>::new();
//! let action = Action::new(work.clone());
//!
//! let fut = action.run(1, None);
//! assert!(action.is_running());
//!
//! let call = work.next_call().await;   // the work function was called with 1
//! call.ctx.yield_value("partial".into());
//! call.resolve("done".into());
//!
//! assert_eq!(fut.await?, "done");
//! ```
//!
//! ## Using `CallCounter` to prove work was skipped
//!
//! ```ignore
//! use flightcache::testing::CallCounter;
//!
//! let counter = CallCounter::new();
//! let entry = registry.get_or_create(counter.wrap(fetch_user), EntryOptions::keyed("u/7"));
//!
//! assert_eq!(counter.count(), 0); // served from a restored snapshot
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::work::{Payload, Work, WorkContext};

/// How long `next_call` waits before failing the test.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// ManualWork
// =============================================================================

/// Work whose futures settle only when the test says so.
///
/// Every call is queued as a [`ManualCall`]; the work future stays pending
/// until the call is resolved, rejected, or dropped (which rejects it).
///
/// # Philosophy
///
/// Tests should wait for meaning, not time.
pub struct ManualWork<D, I> {
    sender: mpsc::UnboundedSender<ManualCall<D, I>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<ManualCall<D, I>>>>,
    calls: Arc<AtomicUsize>,
}

impl<D, I> Clone for ManualWork<D, I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl<D: Payload, I: Payload> ManualWork<D, I> {
    /// Create a new manual work function.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for the next queued call, in call order.
    ///
    /// # Panics
    ///
    /// Panics if no call arrives within five seconds.
    pub async fn next_call(&self) -> ManualCall<D, I> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(CALL_TIMEOUT, receiver.recv()).await {
            Ok(Some(call)) => call,
            Ok(None) => panic!("manual work channel closed"),
            Err(_) => panic!("no call to manual work within {:?}", CALL_TIMEOUT),
        }
    }

    /// Resolve the next queued call with `value`.
    pub async fn resolve_next(&self, value: D) {
        self.next_call().await.resolve(value);
    }

    /// Reject the next queued call with `error`.
    pub async fn reject_next(&self, error: anyhow::Error) {
        self.next_call().await.reject(error);
    }

    /// Total number of times the work function was called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<D: Payload, I: Payload> Default for ManualWork<D, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Payload, I: Payload> Work<D, I> for ManualWork<D, I> {
    fn call(&self, input: I, ctx: WorkContext<D>) -> BoxFuture<'static, anyhow::Result<D>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Queued at call time, so tests see the call even if the invocation
        // is aborted before its future is ever polled.
        let (responder, response) = oneshot::channel();
        let _ = self.sender.send(ManualCall {
            input,
            ctx,
            responder,
        });

        Box::pin(async move {
            response
                .await
                .map_err(|_| anyhow::anyhow!("manual call dropped without a response"))?
        })
    }
}

/// One pending call to a [`ManualWork`].
pub struct ManualCall<D, I> {
    /// Input the work function was called with.
    pub input: I,
    /// Context handed to the work function.
    pub ctx: WorkContext<D>,
    responder: oneshot::Sender<anyhow::Result<D>>,
}

impl<D, I> ManualCall<D, I> {
    /// Complete the call successfully. Ignored if the invocation stopped
    /// listening.
    pub fn resolve(self, value: D) {
        let _ = self.responder.send(Ok(value));
    }

    /// Fail the call.
    pub fn reject(self, error: anyhow::Error) {
        let _ = self.responder.send(Err(error));
    }
}

// =============================================================================
// CallCounter
// =============================================================================

/// Counts calls across every work function it wraps.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    count: Arc<AtomicUsize>,
}

impl CallCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `work` so each call increments this counter.
    pub fn wrap<W>(&self, work: W) -> Counted<W> {
        Counted {
            inner: work,
            count: self.count.clone(),
        }
    }

    /// Calls made so far through every wrapped work function.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Work wrapped by a [`CallCounter`].
pub struct Counted<W> {
    inner: W,
    count: Arc<AtomicUsize>,
}

impl<D, I, W: Work<D, I>> Work<D, I> for Counted<W> {
    fn call(&self, input: I, ctx: WorkContext<D>) -> BoxFuture<'static, anyhow::Result<D>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.call(input, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    #[tokio::test]
    async fn test_manual_work_resolves_in_call_order() {
        let work = ManualWork::<u32, u32>::new();
        let a = Action::new(work.clone());
        let b = Action::new(work.clone());

        let fa = a.run(1, None);
        let fb = b.run(2, None);

        let first = work.next_call().await;
        let second = work.next_call().await;
        assert_eq!((first.input, second.input), (1, 2));

        second.resolve(20);
        first.reject(anyhow::anyhow!("nope"));

        assert_eq!(fb.await.unwrap(), 20);
        assert_eq!(fa.await.unwrap_err().to_string(), "nope");
        assert_eq!(work.calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_call_rejects() {
        let work = ManualWork::<u32, ()>::new();
        let action = Action::new(work.clone());

        let fut = action.run((), None);
        drop(work.next_call().await);

        assert!(!fut.await.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn test_counter_is_shared_across_wraps() {
        let counter = CallCounter::new();
        let double = |n: u32, _ctx: WorkContext<u32>| async move { Ok::<_, anyhow::Error>(n * 2) };

        Action::new(counter.wrap(double)).run(1, None).await.unwrap();
        Action::new(counter.wrap(double)).run(2, None).await.unwrap();

        assert_eq!(counter.count(), 2);
    }
}
