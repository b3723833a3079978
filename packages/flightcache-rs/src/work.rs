//! The work-function contract.
//!
//! Work is anything callable as `(input, WorkContext) -> Future<Output =
//! anyhow::Result<D>>`. Plain async closures satisfy it through the blanket
//! impl; types that need their own state can implement [`Work`] directly.
//!
//! ```ignore
//! let greet = |name: String, _ctx: WorkContext<String>| async move {
//!     Ok(format!("Hello {}!", name))
//! };
//! let action = Action::new(greet);
//! ```
//!
//! The context is the only channel back into the core: it exposes the
//! invocation's cancellation token and lets the work publish progressive
//! values before it finishes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cancel::CancelToken;
use crate::invocation::InvocationId;

/// Bound shared by action results and inputs.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// A unit of async work run by an [`Action`](crate::Action).
pub trait Work<D, I>: Send + Sync + 'static {
    /// Start the work. Called synchronously when an invocation starts.
    fn call(&self, input: I, ctx: WorkContext<D>) -> BoxFuture<'static, anyhow::Result<D>>;
}

impl<D, I, F, Fut> Work<D, I> for F
where
    F: Fn(I, WorkContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
{
    fn call(&self, input: I, ctx: WorkContext<D>) -> BoxFuture<'static, anyhow::Result<D>> {
        Box::pin(self(input, ctx))
    }
}

type Yielder<D> = Arc<dyn Fn(D) -> bool + Send + Sync>;

/// Handed to the work function of one invocation.
pub struct WorkContext<D> {
    invocation: InvocationId,
    token: CancelToken,
    yielder: Yielder<D>,
}

impl<D> WorkContext<D> {
    pub(crate) fn new(invocation: InvocationId, token: CancelToken, yielder: Yielder<D>) -> Self {
        Self {
            invocation,
            token,
            yielder,
        }
    }

    /// The invocation this context belongs to.
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation
    }

    /// The invocation's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// Returns true once the invocation has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the invocation is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Publish a progressive value.
    ///
    /// Returns `false` (and drops the value) once the invocation was aborted
    /// or has settled.
    pub fn yield_value(&self, value: D) -> bool {
        (self.yielder)(value)
    }
}

impl<D> Clone for WorkContext<D> {
    fn clone(&self) -> Self {
        Self {
            invocation: self.invocation,
            token: self.token.clone(),
            yielder: self.yielder.clone(),
        }
    }
}

impl<D> fmt::Debug for WorkContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("invocation", &self.invocation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
