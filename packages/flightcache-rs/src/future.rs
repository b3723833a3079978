//! Awaitable results whose state can be read without awaiting.
//!
//! An [`ObservableFuture`] is a handle to one settlement slot. Any clone can
//! read [`status`](ObservableFuture::status), [`value`](ObservableFuture::value)
//! and [`error`](ObservableFuture::error) synchronously, or `.await` the final
//! result. The slot moves from `Pending` to `Resolved` or `Rejected` exactly
//! once; the state is written before awaiting tasks are woken, so a woken task
//! always reads the settled state.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ActionError;
use crate::invocation::InvocationId;

/// Lifecycle status of a future, invocation, or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with an error.
    Rejected,
}

impl Status {
    /// Returns true for `Resolved` and `Rejected`.
    pub fn is_settled(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Resolved => write!(f, "resolved"),
            Status::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone)]
enum Settlement<D> {
    Pending,
    Resolved(D),
    Rejected(ActionError),
}

impl<D> Settlement<D> {
    fn is_settled(&self) -> bool {
        !matches!(self, Settlement::Pending)
    }

    fn status(&self) -> Status {
        match self {
            Settlement::Pending => Status::Pending,
            Settlement::Resolved(_) => Status::Resolved,
            Settlement::Rejected(_) => Status::Rejected,
        }
    }
}

struct Shared<D> {
    invocation: Option<InvocationId>,
    state: watch::Sender<Settlement<D>>,
}

/// A settle-once result slot with synchronous accessors.
pub struct ObservableFuture<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for ObservableFuture<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D> ObservableFuture<D> {
    fn with_state(invocation: Option<InvocationId>, state: Settlement<D>) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            shared: Arc::new(Shared { invocation, state }),
        }
    }

    /// A pending future owned by the given invocation.
    pub(crate) fn pending(invocation: InvocationId) -> Self {
        Self::with_state(Some(invocation), Settlement::Pending)
    }

    /// A settled future restored for the given invocation.
    pub(crate) fn settled_for(invocation: InvocationId, result: Result<D, ActionError>) -> Self {
        let state = match result {
            Ok(value) => Settlement::Resolved(value),
            Err(err) => Settlement::Rejected(err),
        };
        Self::with_state(Some(invocation), state)
    }

    /// A future already resolved to `value`, not tied to any invocation.
    pub fn resolved(value: D) -> Self {
        Self::with_state(None, Settlement::Resolved(value))
    }

    /// A future already rejected with `error`, not tied to any invocation.
    pub fn rejected(error: ActionError) -> Self {
        Self::with_state(None, Settlement::Rejected(error))
    }

    /// Settle with a value. Returns `false` if already settled.
    pub(crate) fn resolve(&self, value: D) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub(crate) fn reject(&self, error: ActionError) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    fn settle(&self, next: Settlement<D>) -> bool {
        let mut next = Some(next);
        self.shared.state.send_if_modified(|current| {
            // Explicit guard: a second settlement is a no-op.
            if current.is_settled() {
                return false;
            }
            match next.take() {
                Some(next) => {
                    *current = next;
                    true
                }
                None => false,
            }
        })
    }

    /// The invocation that owns this future, if any.
    pub fn invocation_id(&self) -> Option<InvocationId> {
        self.shared.invocation
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.shared.state.borrow().status()
    }

    /// Returns true until the future settles.
    pub fn is_pending(&self) -> bool {
        !self.is_settled()
    }

    /// Returns true once resolved or rejected.
    pub fn is_settled(&self) -> bool {
        self.shared.state.borrow().is_settled()
    }

    /// Returns true if both handles point at the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The rejection error, present iff rejected.
    pub fn error(&self) -> Option<ActionError> {
        match &*self.shared.state.borrow() {
            Settlement::Rejected(err) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<D: Clone> ObservableFuture<D> {
    /// The resolved value, present iff resolved.
    pub fn value(&self) -> Option<D> {
        match &*self.shared.state.borrow() {
            Settlement::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The settled result, or `None` while pending.
    pub fn result(&self) -> Option<Result<D, ActionError>> {
        match &*self.shared.state.borrow() {
            Settlement::Pending => None,
            Settlement::Resolved(value) => Some(Ok(value.clone())),
            Settlement::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

impl<D: Clone + Send + Sync> ObservableFuture<D> {
    /// Wait for settlement and return the result.
    pub async fn settled(&self) -> Result<D, ActionError> {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `self.shared`, so this only returns once settled.
        let _ = rx.wait_for(Settlement::is_settled).await;
        match self.result() {
            Some(result) => result,
            None => Err(ActionError::Panicked(
                "observable future closed while pending".to_string(),
            )),
        }
    }
}

impl<D> IntoFuture for ObservableFuture<D>
where
    D: Clone + Send + Sync + 'static,
{
    type Output = Result<D, ActionError>;
    type IntoFuture = BoxFuture<'static, Result<D, ActionError>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.settled().await })
    }
}

impl<D> fmt::Debug for ObservableFuture<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableFuture")
            .field("invocation", &self.shared.invocation)
            .field("status", &self.status())
            .finish()
    }
}
