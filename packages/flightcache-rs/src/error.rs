//! Structured error types for flightcache.
//!
//! Two error families live here:
//!
//! - [`ActionError`] is the rejection type of every [`ObservableFuture`]. It is
//!   `Clone` because one settlement is observed by many readers, and it is
//!   serde-friendly because rejected results can be exported in snapshots.
//! - [`FlightError`] reports API misuse (rerun without input, keys that cannot
//!   be encoded). It never appears as a rejection.
//!
//! # Cancelled vs Failed
//!
//! Cancellation and failure travel the same path: both reject the future.
//! The convention for telling them apart is the variant:
//!
//! ```ignore
//! match action.run(input, None).await {
//!     Ok(data) => render(data),
//!     Err(e) if e.is_aborted() => {} // superseded or removed, nothing to show
//!     Err(ActionError::Failed(inner)) => {
//!         if let Some(http) = inner.downcast_ref::<HttpError>() {
//!             show_status(http.status);
//!         }
//!     }
//!     Err(e) => show_error(e),
//! }
//! ```
//!
//! [`ObservableFuture`]: crate::ObservableFuture

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// =============================================================================
// Abort Reason
// =============================================================================

/// Why an invocation's cancellation scope fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum AbortReason {
    /// A newer run started on the same action before this one finished.
    Superseded,
    /// The owning entry was deleted from (or cleared out of) a registry.
    Removed,
    /// Caller-initiated cancellation, with a free-form message.
    Requested(String),
}

impl AbortReason {
    /// Caller-initiated cancellation.
    pub fn requested(message: impl Into<String>) -> Self {
        AbortReason::Requested(message.into())
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Superseded => write!(f, "superseded by a newer run"),
            AbortReason::Removed => write!(f, "removed from registry"),
            AbortReason::Requested(message) => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// Shared Error
// =============================================================================

/// A work-function error shared between every reader of a settlement.
///
/// Wraps the original `anyhow::Error` without altering it, so callers can
/// still [`downcast_ref`](SharedError::downcast_ref) to their own error types.
///
/// Serializes as its display string. A deserialized `SharedError` carries the
/// message only; the original type is gone after a round-trip.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    /// Create a shared error from a plain message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        SharedError(Arc::new(anyhow::Error::msg(message)))
    }

    /// Attempt to downcast to the original error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Borrow the underlying `anyhow::Error`.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(err: anyhow::Error) -> Self {
        SharedError(Arc::new(err))
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = &**self.0;
        inner.source()
    }
}

impl Serialize for SharedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for SharedError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let message = String::deserialize(deserializer)?;
        Ok(SharedError::msg(message))
    }
}

// =============================================================================
// Action Error
// =============================================================================

/// Rejection reason of an invocation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    /// The work function returned an error. Propagated unchanged.
    #[error(transparent)]
    Failed(SharedError),

    /// The invocation's cancellation scope fired before it settled.
    #[error("aborted: {0}")]
    Aborted(AbortReason),

    /// The work function panicked, either while being called or while polled.
    #[error("work function panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Wrap a work-function error.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        ActionError::Failed(SharedError::from(err.into()))
    }

    /// Returns true when this rejection came from cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ActionError::Aborted(_))
    }

    /// The abort reason, if this rejection came from cancellation.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            ActionError::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<AbortReason> for ActionError {
    fn from(reason: AbortReason) -> Self {
        ActionError::Aborted(reason)
    }
}

// =============================================================================
// Flight Error
// =============================================================================

/// Errors from misusing the action and registry API.
#[derive(Debug, Error)]
pub enum FlightError {
    /// `rerun` was called on an action whose latest invocation has no input.
    #[error("cannot rerun: the latest invocation has no input")]
    MissingInput,

    /// A structured cache key could not be encoded.
    #[error("cache key could not be encoded: {0}")]
    InvalidKey(#[from] serde_json::Error),
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
