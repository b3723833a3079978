//! Cooperative cancellation tokens that carry a reason.
//!
//! A [`CancelToken`] fires at most once. Firing records an [`AbortReason`],
//! runs every registered listener synchronously, and wakes anything awaiting
//! [`CancelToken::cancelled`]. Listeners are how cancellation propagates
//! without a scheduler hop: an invocation rejects its future from inside the
//! listener, so the rejection is visible as soon as `cancel` returns.
//!
//! # Example
//!
//! ```ignore
//! let page = CancelToken::new();
//!
//! // Every run linked to `page` is aborted when the user navigates away.
//! registry.run(fetch_profile, EntryOptions::keyed("profile"), user_id, Some(&page));
//!
//! page.cancel(AbortReason::requested("navigated away"));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::AbortReason;

type Listener = Box<dyn FnOnce(&AbortReason) + Send>;

/// Handle returned by [`CancelToken::on_cancel`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners {
    next_id: u64,
    pending: Vec<(ListenerId, Listener)>,
}

struct TokenInner {
    inert: bool,
    reason: watch::Sender<Option<AbortReason>>,
    // Serializes firing against listener registration.
    listeners: Mutex<Listeners>,
}

/// A cancellation signal shared by everyone holding a clone.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a token that has not fired.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Create a token that never fires.
    ///
    /// Used for invocations restored from snapshots: they are already settled
    /// and have nothing to cancel.
    pub fn inert() -> Self {
        Self::build(true)
    }

    fn build(inert: bool) -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            inner: Arc::new(TokenInner {
                inert,
                reason,
                listeners: Mutex::new(Listeners {
                    next_id: 0,
                    pending: Vec::new(),
                }),
            }),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fire the token.
    ///
    /// Returns `true` if this call fired it. Listeners run before this
    /// returns, in registration order. Inert tokens ignore the call.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        if self.inner.inert {
            return false;
        }

        let pending = {
            let mut listeners = self.listeners();
            let fired = self.inner.reason.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(reason.clone());
                true
            });
            if !fired {
                return false;
            }
            std::mem::take(&mut listeners.pending)
        };

        for (_, listener) in pending {
            listener(&reason);
        }
        true
    }

    /// Returns true once the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.borrow().is_some()
    }

    /// Returns true for tokens created with [`CancelToken::inert`].
    pub fn is_inert(&self) -> bool {
        self.inner.inert
    }

    /// The reason recorded when the token fired.
    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.borrow().clone()
    }

    /// Completes once the token fires. Never completes for inert tokens.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.reason.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }

    /// Register a one-shot listener.
    ///
    /// If the token already fired, the listener runs immediately on the
    /// calling thread.
    pub fn on_cancel<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        let mut listeners = self.listeners();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;

        let fired = self.inner.reason.borrow().clone();
        match fired {
            Some(reason) => {
                drop(listeners);
                listener(&reason);
            }
            None => listeners.pending.push((id, Box::new(listener))),
        }
        id
    }

    /// Unregister a listener that has not run yet.
    ///
    /// Returns `false` if the listener already ran or was never registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.pending.len();
        listeners.pending.retain(|(existing, _)| *existing != id);
        listeners.pending.len() != before
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners().pending.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("inert", &self.inner.inert)
            .field("reason", &self.reason())
            .finish()
    }
}
