//! One attempt to run an action's work function.
//!
//! # Lifecycle
//!
//! ```text
//! created ──start()──► started ──work returns / abort()──► settled
//!
//! seeded (from a Snapshot) ─────────────────────────────► settled
//! ```
//!
//! An invocation owns its [`CancelToken`] and its [`ObservableFuture`]. The
//! token's first listener rejects the future, so `abort` settles the
//! invocation synchronously; the driver task that polls the work future
//! notices the token and stops polling.
//!
//! Settlement is claimed under the invocation's state lock (`finished_at`
//! is written exactly once), the owning action is told, and only then is the
//! future published. Anything woken by the future therefore sees the action
//! already updated.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{error, trace};

use crate::action::ActionCore;
use crate::cancel::{CancelToken, ListenerId};
use crate::error::{panic_message, AbortReason, ActionError};
use crate::future::{ObservableFuture, Status};
use crate::snapshot::Snapshot;
use crate::work::{Payload, Work, WorkContext};

// =============================================================================
// Invocation Id
// =============================================================================

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvocationId(u64);

impl InvocationId {
    pub(crate) fn next() -> Self {
        InvocationId(NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv-{}", self.0)
    }
}

// =============================================================================
// Invocation
// =============================================================================

struct InvocationState<D, I> {
    input: Option<I>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    current: Option<D>,
    aborted: bool,
    external: Option<(CancelToken, ListenerId)>,
}

pub(crate) struct InvocationInner<D, I> {
    id: InvocationId,
    action: Weak<ActionCore<D, I>>,
    work: Option<Arc<dyn Work<D, I>>>,
    token: CancelToken,
    state: Mutex<InvocationState<D, I>>,
    future: ObservableFuture<D>,
}

/// Handle to one invocation. Clones share the same invocation.
pub struct Invocation<D, I> {
    inner: Arc<InvocationInner<D, I>>,
}

impl<D, I> Clone for Invocation<D, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Payload, I: Payload> Invocation<D, I> {
    /// Create an unstarted invocation that belongs to no action.
    pub fn new<W: Work<D, I>>(work: W) -> Self {
        Self::create(Weak::new(), Arc::new(work))
    }

    pub(crate) fn create(action: Weak<ActionCore<D, I>>, work: Arc<dyn Work<D, I>>) -> Self {
        let id = InvocationId::next();
        let inner = Arc::new_cyclic(|weak: &Weak<InvocationInner<D, I>>| {
            let token = CancelToken::new();
            let weak = weak.clone();
            // Registered first, so the rejection precedes every other listener.
            token.on_cancel(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    Invocation { inner }.settle(Err(ActionError::Aborted(reason.clone())));
                }
            });

            InvocationInner {
                id,
                action,
                work: Some(work),
                token,
                state: Mutex::new(InvocationState {
                    input: None,
                    started_at: None,
                    finished_at: None,
                    current: None,
                    aborted: false,
                    external: None,
                }),
                future: ObservableFuture::pending(id),
            }
        });
        Self { inner }
    }

    /// Create an already-settled invocation from a snapshot.
    ///
    /// Returns `None` if the snapshot carries neither a value nor an error.
    pub fn seeded(snapshot: Snapshot<D, I>) -> Option<Self> {
        Self::restore(Weak::new(), snapshot)
    }

    pub(crate) fn restore(action: Weak<ActionCore<D, I>>, snapshot: Snapshot<D, I>) -> Option<Self> {
        let (result, input, time) = snapshot.into_parts()?;
        let id = InvocationId::next();
        let time = time.unwrap_or_else(Utc::now);
        let current = result.as_ref().ok().cloned();

        Some(Self {
            inner: Arc::new(InvocationInner {
                id,
                action,
                work: None,
                token: CancelToken::inert(),
                state: Mutex::new(InvocationState {
                    input,
                    started_at: Some(time),
                    finished_at: Some(time),
                    current,
                    aborted: false,
                    external: None,
                }),
                future: ObservableFuture::settled_for(id, result),
            }),
        })
    }

    fn notify_action(&self) {
        if let Some(action) = self.inner.action.upgrade() {
            action.touch();
        }
    }

    /// Start the work function.
    ///
    /// Idempotent: later calls return the existing future and ignore their
    /// input. An invocation that already settled (aborted before it started,
    /// or seeded) is left untouched. If `external` already fired, the
    /// invocation is aborted with its reason and the work function is never
    /// called. Otherwise `external` firing later aborts this invocation.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the work future is driven
    /// on a spawned task.
    pub fn start(&self, input: I, external: Option<&CancelToken>) -> ObservableFuture<D> {
        {
            let mut state = self.state();
            if state.started_at.is_some() || state.finished_at.is_some() {
                return self.inner.future.clone();
            }
            state.input = Some(input.clone());
            state.started_at = Some(Utc::now());
        }
        trace!(invocation = %self.inner.id, "invocation started");

        if let Some(external) = external {
            if let Some(reason) = external.reason() {
                trace!(invocation = %self.inner.id, %reason, "external cancellation already fired");
                self.abort(reason);
                return self.inner.future.clone();
            }

            let weak = Arc::downgrade(&self.inner);
            let listener = external.on_cancel(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    Invocation { inner }.abort(reason.clone());
                }
            });
            let mut state = self.state();
            if state.finished_at.is_none() {
                state.external = Some((external.clone(), listener));
            }
        }

        if self.inner.token.is_cancelled() {
            return self.inner.future.clone();
        }
        let Some(work) = self.inner.work.clone() else {
            return self.inner.future.clone();
        };

        let ctx = WorkContext::new(self.inner.id, self.inner.token.clone(), self.yielder());
        let id = self.inner.id;

        // A panic while calling the work function is funneled into the same
        // rejection path as a failed future.
        let work_future: BoxFuture<'static, Result<D, ActionError>> =
            match catch_unwind(AssertUnwindSafe(|| work.call(input, ctx))) {
                Ok(fut) => Box::pin(async move {
                    match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(ActionError::failed(err)),
                        Err(payload) => {
                            let message = panic_message(&*payload);
                            error!(invocation = %id, panic = %message, "work function panicked");
                            Err(ActionError::Panicked(message))
                        }
                    }
                }),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(invocation = %id, panic = %message, "work function panicked on call");
                    Box::pin(future::ready(Err(ActionError::Panicked(message))))
                }
            };

        let this = self.clone();
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                result = work_future => {
                    this.settle(result);
                }
            }
        });

        self.inner.future.clone()
    }

    fn yielder(&self) -> Arc<dyn Fn(D) -> bool + Send + Sync> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |value| match weak.upgrade() {
            Some(inner) => Invocation { inner }.yield_value(value),
            None => false,
        })
    }

    /// Publish a progressive value.
    ///
    /// No-op once this invocation's cancellation fired or it settled, so a
    /// stale continuation cannot overwrite what a cancelled run displays.
    pub fn yield_value(&self, value: D) -> bool {
        {
            let mut state = self.state();
            // Checked under the lock: the abort's settlement waits on it, so
            // no yield lands once `abort` has returned.
            if self.inner.token.is_cancelled() || state.finished_at.is_some() {
                return false;
            }
            state.current = Some(value);
        }
        trace!(invocation = %self.inner.id, "invocation yielded");
        self.notify_action();
        true
    }

    /// Fire this invocation's cancellation scope.
    ///
    /// Rejects the future with [`ActionError::Aborted`] unless it already
    /// settled. Returns `true` if this call fired the scope.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.inner.token.cancel(reason)
    }

    fn settle(&self, result: Result<D, ActionError>) -> bool {
        let external = {
            let mut state = self.state();
            if state.finished_at.is_some() {
                return false;
            }
            state.finished_at = Some(Utc::now());
            state.aborted = matches!(result, Err(ActionError::Aborted(_)));
            if let Ok(value) = &result {
                state.current = Some(value.clone());
            }
            state.external.take()
        };

        if let Some((token, listener)) = external {
            token.remove_listener(listener);
        }

        let status = if result.is_ok() {
            Status::Resolved
        } else {
            Status::Rejected
        };
        trace!(invocation = %self.inner.id, %status, "invocation settled");

        let action = self.inner.action.upgrade();
        if let Some(action) = &action {
            action.on_settled(self);
        }

        match result {
            Ok(value) => self.inner.future.resolve(value),
            Err(err) => self.inner.future.reject(err),
        };

        if let Some(action) = &action {
            action.touch();
        }
        true
    }

    /// The persisted form of this invocation, once settled.
    pub fn serialize(&self) -> Option<Snapshot<D, I>> {
        let result = self.inner.future.result()?;
        let state = self.state();
        Some(Snapshot {
            value: result.as_ref().ok().cloned(),
            error: result.err(),
            input: state.input.clone(),
            time: state.finished_at.map(|t| t.timestamp_millis()),
        })
    }

    /// Input fixed at start (or restored from a snapshot).
    pub fn input(&self) -> Option<I> {
        self.state().input.clone()
    }

    /// Latest progressive value, or the resolved value once settled.
    pub fn current(&self) -> Option<D> {
        self.state().current.clone()
    }

    /// The settled value, present iff resolved.
    pub fn value(&self) -> Option<D> {
        self.inner.future.value()
    }
}

impl<D, I> Invocation<D, I> {
    /// Process-unique id.
    pub fn id(&self) -> InvocationId {
        self.inner.id
    }

    /// Status of the owned future.
    pub fn status(&self) -> Status {
        self.inner.future.status()
    }

    /// The owned future.
    pub fn future(&self) -> ObservableFuture<D> {
        self.inner.future.clone()
    }

    /// The owned cancellation scope.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// The rejection error, present iff rejected.
    pub fn error(&self) -> Option<ActionError> {
        self.inner.future.error()
    }

    fn state(&self) -> MutexGuard<'_, InvocationState<D, I>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// When the invocation started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    /// When the invocation settled. Written exactly once.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    /// Returns true once started (seeded invocations count as started).
    pub fn is_started(&self) -> bool {
        self.state().started_at.is_some()
    }

    /// Returns true once settled.
    pub fn is_settled(&self) -> bool {
        self.state().finished_at.is_some()
    }

    /// Returns true once the cancellation scope fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns true if the invocation settled because it was aborted.
    pub fn was_aborted(&self) -> bool {
        self.state().aborted
    }

    /// Returns true if both handles refer to the same invocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D, I> fmt::Debug for Invocation<D, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
