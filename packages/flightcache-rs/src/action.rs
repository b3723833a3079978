//! Stable handles over the run history of one async operation.
//!
//! An [`Action`] owns a fixed work function and three invocation slots:
//!
//! - **initial**: always present. Reused by the first `run` if it never
//!   started, or pre-settled from a snapshot.
//! - **running**: the invocation currently in flight, if any.
//! - **finished**: the last invocation that settled without being aborted.
//!
//! Derived reads follow `latest = running ?? finished ?? initial`, except the
//! settled value and error, which follow `finished`. A refresh in flight
//! therefore keeps reporting the last good value, and a superseded run
//! disappears without touching it.
//!
//! # Superseding
//!
//! ```text
//! run(1) ──► R1 running
//! run(2) ──► R2 installed as running, then R1.abort(Superseded)
//!            R1 rejects (still observable through its own future)
//!            R2 settles ──► finished = R2
//! ```
//!
//! # Observing changes
//!
//! Hosts that re-render on state changes subscribe to the action's version
//! counter. It is bumped on every run, yield, and settlement.
//!
//! ```ignore
//! let mut changes = action.subscribe();
//! while changes.changed().await.is_ok() {
//!     render(action.status(), action.current());
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{AbortReason, ActionError, FlightError};
use crate::future::{ObservableFuture, Status};
use crate::invocation::Invocation;
use crate::snapshot::Snapshot;
use crate::work::{Payload, Work};

struct ActionState<D, I> {
    initial: Invocation<D, I>,
    initial_claimed: bool,
    running: Option<Invocation<D, I>>,
    finished: Option<Invocation<D, I>>,
}

pub(crate) struct ActionCore<D, I> {
    work: Arc<dyn Work<D, I>>,
    state: Mutex<ActionState<D, I>>,
    version: watch::Sender<u64>,
}

impl<D, I> ActionCore<D, I> {
    fn state(&self) -> MutexGuard<'_, ActionState<D, I>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bump the change counter.
    pub(crate) fn touch(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Called by an invocation after it claimed settlement, before its
    /// future is published.
    pub(crate) fn on_settled(&self, invocation: &Invocation<D, I>) {
        let mut state = self.state();
        if state
            .running
            .as_ref()
            .is_some_and(|running| running.ptr_eq(invocation))
        {
            state.running = None;
        }
        // `finished` only moves forward: a run that settles late never
        // replaces the result of a newer one.
        let newer = state
            .finished
            .as_ref()
            .map_or(true, |finished| finished.id() < invocation.id());
        if !invocation.was_aborted() && newer {
            state.finished = Some(invocation.clone());
        }
    }
}

/// Stable handle to one async operation. Clones share the same action.
pub struct Action<D, I> {
    core: Arc<ActionCore<D, I>>,
}

impl<D, I> Clone for Action<D, I> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<D: Payload, I: Payload> Action<D, I> {
    /// Create an action around a work function.
    pub fn new<W: Work<D, I>>(work: W) -> Self {
        Self::build(Arc::new(work), None)
    }

    /// Create an action whose initial invocation is restored from a snapshot.
    ///
    /// The action starts settled and the work function is not called. A
    /// snapshot with neither value nor error is ignored.
    pub fn seeded<W: Work<D, I>>(work: W, snapshot: Snapshot<D, I>) -> Self {
        Self::build(Arc::new(work), Some(snapshot))
    }

    pub(crate) fn build(work: Arc<dyn Work<D, I>>, seed: Option<Snapshot<D, I>>) -> Self {
        let core = Arc::new_cyclic(|weak| {
            let seeded = seed.and_then(|snapshot| Invocation::restore(weak.clone(), snapshot));
            let (initial, finished) = match seeded {
                Some(invocation) => (invocation.clone(), Some(invocation)),
                None => (Invocation::create(weak.clone(), work.clone()), None),
            };
            let (version, _) = watch::channel(0);

            ActionCore {
                work,
                state: Mutex::new(ActionState {
                    initial,
                    initial_claimed: false,
                    running: None,
                    finished,
                }),
                version,
            }
        });
        Self { core }
    }

    /// Run the work function with `input`.
    ///
    /// Any invocation already running is aborted with
    /// [`AbortReason::Superseded`]; by the time this returns,
    /// [`running`](Action::running) is the new invocation (unless it already
    /// settled). `external` links a caller-owned token into the new
    /// invocation's cancellation scope.
    pub fn run(&self, input: I, external: Option<&CancelToken>) -> ObservableFuture<D> {
        let (invocation, superseded) = {
            let mut state = self.core.state();
            let reuse_initial = !state.initial_claimed
                && !state.initial.is_started()
                && !state.initial.is_cancelled();
            let invocation = if reuse_initial {
                state.initial_claimed = true;
                state.initial.clone()
            } else {
                Invocation::create(Arc::downgrade(&self.core), self.core.work.clone())
            };
            let superseded = state.running.replace(invocation.clone());
            (invocation, superseded)
        };

        if let Some(previous) = superseded {
            debug!(
                superseded = %previous.id(),
                by = %invocation.id(),
                "aborting superseded run"
            );
            previous.abort(AbortReason::Superseded);
        }

        let future = invocation.start(input, external);
        self.core.touch();
        future
    }

    /// Run again with the latest invocation's input.
    pub fn rerun(&self, external: Option<&CancelToken>) -> Result<ObservableFuture<D>, FlightError> {
        let input = self.latest().input().ok_or(FlightError::MissingInput)?;
        Ok(self.run(input, external))
    }

    /// Abort the running invocation, if any. Returns `true` if one was aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let running = self.core.state().running.clone();
        match running {
            Some(invocation) => invocation.abort(reason),
            None => false,
        }
    }

    /// The settled value of the finished invocation.
    pub fn value(&self) -> Option<D> {
        self.finished().and_then(|invocation| invocation.value())
    }

    /// Progressive value of the latest invocation, falling back to the
    /// finished value.
    pub fn current(&self) -> Option<D> {
        self.latest().current().or_else(|| self.value())
    }

    /// Input of the latest invocation.
    pub fn input(&self) -> Option<I> {
        self.latest().input()
    }

    /// The finished invocation's snapshot.
    pub fn serialize(&self) -> Option<Snapshot<D, I>> {
        self.finished().and_then(|invocation| invocation.serialize())
    }
}

impl<D, I> Action<D, I> {
    /// The always-present initial invocation.
    pub fn initial(&self) -> Invocation<D, I> {
        self.core.state().initial.clone()
    }

    /// The invocation currently in flight.
    pub fn running(&self) -> Option<Invocation<D, I>> {
        self.core.state().running.clone()
    }

    /// The last invocation that settled without being aborted.
    pub fn finished(&self) -> Option<Invocation<D, I>> {
        self.core.state().finished.clone()
    }

    /// `running ?? finished ?? initial`.
    pub fn latest(&self) -> Invocation<D, I> {
        let state = self.core.state();
        state
            .running
            .clone()
            .or_else(|| state.finished.clone())
            .unwrap_or_else(|| state.initial.clone())
    }

    /// Status of the latest invocation.
    pub fn status(&self) -> Status {
        self.latest().status()
    }

    /// Returns true while an invocation is in flight.
    pub fn is_running(&self) -> bool {
        self.core.state().running.is_some()
    }

    /// Start time of the latest invocation.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.latest().started_at()
    }

    /// Finish time of the latest invocation.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.latest().finished_at()
    }

    /// The settled error of the finished invocation.
    pub fn error(&self) -> Option<ActionError> {
        self.finished().and_then(|invocation| invocation.error())
    }

    /// Current value of the change counter.
    pub fn version(&self) -> u64 {
        *self.core.version.borrow()
    }

    /// Subscribe to the change counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.version.subscribe()
    }

    /// Returns true if both handles refer to the same action.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<D, I> fmt::Debug for Action<D, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("status", &self.status())
            .field("running", &self.running().map(|invocation| invocation.id()))
            .field("finished", &self.finished().map(|invocation| invocation.id()))
            .finish()
    }
}
