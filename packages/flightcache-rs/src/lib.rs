//! # Flightcache
//!
//! Cancellable async actions with observable state, deduplicated by key.
//!
//! ## Core Concepts
//!
//! - [`ObservableFuture`] = a one-shot result whose status can be read
//!   synchronously at any time
//! - [`Invocation`] = one attempt to run a work function, with its own
//!   cancellation scope ([`CancelToken`])
//! - [`Action`] = a stable handle over the run history of one operation
//! - [`Registry`] = keyed, single-flight store of actions
//!
//! The key principle: **one key = one action**. Every caller asking for the
//! same key shares the same entry, and a newer run supersedes the older one
//! instead of racing it.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼ run(work, key, input)
//! Registry ──── canonical id ──► CacheEntry (created once, seeded from snapshot)
//!                                    │
//!                                    ▼ Action.run(input)
//!                             ┌──────┴──────────────┐
//!                             │                     │
//!                   previous running?        new Invocation
//!                   abort(Superseded)               │
//!                                                   ▼ start()
//!                                          work(input, ctx) on a Tokio task
//!                                                   │
//!                          ctx.yield_value() ───────┤ (progressive values)
//!                                                   │
//!                                                   ▼ settle
//!                                   Action.finished updated, future published
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Settle once** - An invocation's future transitions out of pending once
//! 2. **Abort is synchronous** - After `abort`, the future is already rejected
//! 3. **Last good value** - A refresh or superseded run never clears `value()`
//! 4. **Single flight** - Structurally equal keys always map to one entry
//! 5. **Seeds are not retroactive** - `restore` only affects entries created later
//!
//! ## Example
//!
//! ```ignore
//! use flightcache::{EntryOptions, Registry, WorkContext};
//!
//! async fn fetch_user(id: u64, ctx: WorkContext<User>) -> anyhow::Result<User> {
//!     tokio::select! {
//!         user = api::user(id) => user,
//!         _ = ctx.cancelled() => anyhow::bail!("cancelled"),
//!     }
//! }
//!
//! let registry: Registry<User, u64> = Registry::builder()
//!     .name("users")
//!     .seed(saved_pairs)
//!     .build();
//!
//! let user = registry.run(fetch_user, EntryOptions::keyed("user/7").tag("user"), 7, None).await?;
//!
//! // Later, from anywhere that knows the key:
//! let entry = registry.get("user/7").unwrap();
//! println!("{} {:?}", entry.status(), entry.value());
//!
//! // Persist for the next process.
//! let pairs = registry.serialize();
//! ```
//!
//! ## What This Is Not
//!
//! Flightcache is **not**:
//! - A TTL or eviction cache
//! - A retry or backoff layer
//! - A storage backend for snapshots

// Core modules
mod action;
mod cancel;
mod error;
mod future;
mod invocation;
mod key;
mod registry;
mod snapshot;
mod work;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use action::Action;
pub use cancel::{CancelToken, ListenerId};
pub use future::{ObservableFuture, Status};
pub use invocation::{Invocation, InvocationId};
pub use work::{Payload, Work, WorkContext};

// Re-export registry types
pub use key::CacheKey;
pub use registry::{CacheEntry, Criteria, EntryMatcher, EntryOptions, Registry, RegistryBuilder};
pub use snapshot::{Snapshot, SnapshotPairs};

// Re-export error types
pub use error::{AbortReason, ActionError, FlightError, SharedError};
