//! Keyed, single-flight store of actions.
//!
//! The [`Registry`] maps canonical ids to [`CacheEntry`] values. Every
//! `get_or_create`/`run` call that resolves to the same id operates on the
//! identical entry, whether or not a previous run has settled. Overlapping
//! runs on that entry are resolved by the action's superseding rule.
//!
//! # Persistence
//!
//! ```text
//! registry.serialize() ──► [(id, Snapshot)] ──► (caller stores it)
//!                                                   │
//! fresh.restore(pairs) ◄────────────────────────────┘
//! fresh.get_or_create(work, key) ──► entry already settled, work not called
//! ```
//!
//! Restored pairs only seed entries created afterwards; each seed is consumed
//! the first time its id is created.
//!
//! # Locking
//!
//! The id map sits behind one mutex. Matchers, work functions, and aborts
//! always run after the lock is released, so they may call back into the
//! registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use smallvec::SmallVec;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::cancel::CancelToken;
use crate::error::AbortReason;
use crate::future::{ObservableFuture, Status};
use crate::key::CacheKey;
use crate::snapshot::{Snapshot, SnapshotPairs};
use crate::work::{Payload, Work};

// =============================================================================
// Entry Options
// =============================================================================

/// Identity of an entry to look up or create.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    key: Option<CacheKey>,
    tags: BTreeSet<String>,
}

impl EntryOptions {
    /// Options for a private entry (no key, never deduplicated).
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for the entry identified by `key`.
    pub fn keyed(key: impl Into<CacheKey>) -> Self {
        Self::new().key(key)
    }

    /// Set the key.
    pub fn key(mut self, key: impl Into<CacheKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a tag. Tags only apply when the entry is created.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags.
    pub fn tags<T: Into<String>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Map slot of an entry. Private entries live in their own namespace, so no
/// key can ever resolve to one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum EntryId {
    Keyed(String),
    Private(Uuid),
}

struct EntryInner<D, I> {
    slot: EntryId,
    id: String,
    key: Option<CacheKey>,
    tags: BTreeSet<String>,
    action: Action<D, I>,
}

/// An action plus its registry identity. Dereferences to the [`Action`].
pub struct CacheEntry<D, I> {
    inner: Arc<EntryInner<D, I>>,
}

impl<D, I> Clone for CacheEntry<D, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, I> CacheEntry<D, I> {
    /// Canonical id. Private entries report `private:{uuid}`, which is only a
    /// label: looking it up as a key never finds the entry.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The key the entry was created with; `None` for private entries.
    pub fn key(&self) -> Option<&CacheKey> {
        self.inner.key.as_ref()
    }

    /// Returns true for entries created without a key.
    pub fn is_private(&self) -> bool {
        self.inner.key.is_none()
    }

    /// Tags attached at creation.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.inner.tags
    }

    /// Returns true if the entry carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.inner.tags.contains(tag)
    }

    /// The underlying action.
    pub fn action(&self) -> &Action<D, I> {
        &self.inner.action
    }

    /// Returns true if both handles refer to the same entry.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D, I> Deref for CacheEntry<D, I> {
    type Target = Action<D, I>;

    fn deref(&self) -> &Action<D, I> {
        &self.inner.action
    }
}

impl<D, I> fmt::Debug for CacheEntry<D, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.inner.id)
            .field("tags", &self.inner.tags)
            .field("action", &self.inner.action)
            .finish()
    }
}

// =============================================================================
// Matching
// =============================================================================

/// Selects entries for [`Registry::find`], [`Registry::filter`] and
/// [`Registry::delete`].
///
/// Implemented by [`Criteria`] and by any `Fn(&CacheEntry) -> bool`.
pub trait EntryMatcher<D, I> {
    /// Returns true if `entry` is selected.
    fn matches(&self, entry: &CacheEntry<D, I>) -> bool;
}

impl<D, I, F> EntryMatcher<D, I> for F
where
    F: Fn(&CacheEntry<D, I>) -> bool,
{
    fn matches(&self, entry: &CacheEntry<D, I>) -> bool {
        self(entry)
    }
}

/// Declarative entry selection. All given conditions must hold.
///
/// ```ignore
/// // Every pending entry tagged "user".
/// registry.filter(Criteria::new().tag("user").status(Status::Pending));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    key: Option<CacheKey>,
    tags: Vec<String>,
    statuses: SmallVec<[Status; 3]>,
}

impl Criteria {
    /// Criteria matching every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match the entry whose key canonicalizes like `key`.
    pub fn key(mut self, key: impl Into<CacheKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Require a tag. Every listed tag must be present.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Allow a status. With several statuses, any of them matches.
    pub fn status(mut self, status: Status) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }
}

impl<D, I> EntryMatcher<D, I> for Criteria {
    fn matches(&self, entry: &CacheEntry<D, I>) -> bool {
        if let Some(key) = &self.key {
            if entry.is_private() || entry.id() != key.canonical_id() {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| entry.has_tag(tag)) {
            return false;
        }
        self.statuses.is_empty() || self.statuses.contains(&entry.status())
    }
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryState<D, I> {
    entries: BTreeMap<EntryId, CacheEntry<D, I>>,
    seeds: HashMap<String, Snapshot<D, I>>,
}

/// Keyed store of actions with single-flight creation.
pub struct Registry<D, I> {
    name: String,
    state: Mutex<RegistryState<D, I>>,
}

impl<D: Payload, I: Payload> Registry<D, I> {
    /// Create an empty registry.
    pub fn new() -> Self {
        RegistryBuilder::new().build()
    }

    /// Create a builder.
    pub fn builder() -> RegistryBuilder<D, I> {
        RegistryBuilder::new()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState<D, I>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Label used in log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the entry for `options.key`, creating it if needed.
    ///
    /// `work` is only used when the entry is created. A new entry consumes
    /// the seed snapshot stored under its id, if any, and starts settled.
    /// Without a key, a private entry is always created.
    pub fn get_or_create<W: Work<D, I>>(&self, work: W, options: EntryOptions) -> CacheEntry<D, I> {
        let EntryOptions { key, tags } = options;
        let (slot, id) = match &key {
            Some(key) => {
                let id = key.canonical_id();
                (EntryId::Keyed(id.clone()), id)
            }
            None => {
                let uuid = Uuid::new_v4();
                (EntryId::Private(uuid), format!("private:{}", uuid))
            }
        };

        let mut state = self.state();
        if let Some(entry) = state.entries.get(&slot) {
            return entry.clone();
        }

        let seed = match &slot {
            EntryId::Keyed(id) => state.seeds.remove(id),
            EntryId::Private(_) => None,
        };
        let seeded = match &seed {
            Some(snapshot) if snapshot.status().is_none() => {
                warn!(registry = %self.name, %id, "ignoring seed with neither value nor error");
                false
            }
            Some(_) => true,
            None => false,
        };

        let entry = CacheEntry {
            inner: Arc::new(EntryInner {
                slot: slot.clone(),
                id,
                key,
                tags,
                action: Action::build(Arc::new(work), seed),
            }),
        };
        state.entries.insert(slot, entry.clone());
        drop(state);

        debug!(registry = %self.name, id = %entry.id(), seeded, "created cache entry");
        entry
    }

    /// `get_or_create`, then run the entry with `input`.
    pub fn run<W: Work<D, I>>(
        &self,
        work: W,
        options: EntryOptions,
        input: I,
        external: Option<&CancelToken>,
    ) -> ObservableFuture<D> {
        let entry = self.get_or_create(work, options);
        entry.run(input, external)
    }

    /// The entry for `key`, without creating it.
    pub fn get(&self, key: impl Into<CacheKey>) -> Option<CacheEntry<D, I>> {
        let slot = EntryId::Keyed(key.into().canonical_id());
        self.state().entries.get(&slot).cloned()
    }

    /// All entries: keyed ones ordered by id, then private ones.
    pub fn entries(&self) -> Vec<CacheEntry<D, I>> {
        self.state().entries.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// First entry, in [`entries`](Registry::entries) order, selected by `matcher`.
    pub fn find(&self, matcher: impl EntryMatcher<D, I>) -> Option<CacheEntry<D, I>> {
        self.entries()
            .into_iter()
            .find(|entry| matcher.matches(entry))
    }

    /// Every entry selected by `matcher`.
    pub fn filter(&self, matcher: impl EntryMatcher<D, I>) -> Vec<CacheEntry<D, I>> {
        self.entries()
            .into_iter()
            .filter(|entry| matcher.matches(entry))
            .collect()
    }

    /// Remove every entry selected by `matcher` and abort its running
    /// invocation with [`AbortReason::Removed`].
    ///
    /// Does not wait for the aborted work to stop.
    pub fn delete(&self, matcher: impl EntryMatcher<D, I>) -> Vec<CacheEntry<D, I>> {
        let selected = self.filter(matcher);

        let removed: Vec<_> = {
            let mut state = self.state();
            selected
                .into_iter()
                .filter(|entry| {
                    // The id may have been recreated since `filter` ran.
                    let still_current = state
                        .entries
                        .get(&entry.inner.slot)
                        .is_some_and(|current| current.ptr_eq(entry));
                    if still_current {
                        state.entries.remove(&entry.inner.slot);
                    }
                    still_current
                })
                .collect()
        };

        for entry in &removed {
            entry.abort(AbortReason::Removed);
        }
        debug!(registry = %self.name, removed = removed.len(), "deleted cache entries");
        removed
    }

    /// Remove and abort every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut self.state().entries);
        let count = entries.len();

        for entry in entries.values() {
            entry.abort(AbortReason::Removed);
        }
        debug!(registry = %self.name, removed = count, "cleared registry");
        count
    }

    /// Export the finished snapshot of every keyed entry, ordered by id.
    ///
    /// Entries that never finished and private entries are skipped.
    pub fn serialize(&self) -> SnapshotPairs<D, I> {
        self.entries()
            .into_iter()
            .filter(|entry| !entry.is_private())
            .filter_map(|entry| {
                let snapshot = entry.serialize()?;
                Some((entry.id().to_string(), snapshot))
            })
            .collect()
    }

    /// Merge exported pairs into the seed map.
    ///
    /// Seeds only apply to entries created after this call; existing entries
    /// are untouched. A later pair for the same id replaces an earlier one.
    pub fn restore(&self, pairs: impl IntoIterator<Item = (String, Snapshot<D, I>)>) {
        let mut state = self.state();
        let before = state.seeds.len();
        state.seeds.extend(pairs);
        let after = state.seeds.len();
        drop(state);

        debug!(registry = %self.name, seeds = after, added = after - before, "restored seeds");
    }

    /// Number of seeds not yet consumed.
    pub fn pending_seeds(&self) -> usize {
        self.state().seeds.len()
    }
}

impl<D: Payload, I: Payload> Default for Registry<D, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, I> fmt::Debug for Registry<D, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("entries", &state.entries.len())
            .field("seeds", &state.seeds.len())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Registry`].
///
/// ```ignore
/// let registry = Registry::builder()
///     .name("queries")
///     .seed(saved_pairs)
///     .build();
/// ```
pub struct RegistryBuilder<D, I> {
    name: String,
    seeds: HashMap<String, Snapshot<D, I>>,
}

impl<D: Payload, I: Payload> RegistryBuilder<D, I> {
    /// Create a builder with the default name and no seeds.
    pub fn new() -> Self {
        Self {
            name: "default".to_string(),
            seeds: HashMap::new(),
        }
    }

    /// Label attached to the registry's log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Initial seed pairs, as produced by [`Registry::serialize`].
    pub fn seed(mut self, pairs: impl IntoIterator<Item = (String, Snapshot<D, I>)>) -> Self {
        self.seeds.extend(pairs);
        self
    }

    /// Build the registry.
    pub fn build(self) -> Registry<D, I> {
        Registry {
            name: self.name,
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                seeds: self.seeds,
            }),
        }
    }
}

impl<D: Payload, I: Payload> Default for RegistryBuilder<D, I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::testing::{CallCounter, ManualWork};
    use crate::work::WorkContext;
    use serde_json::json;

    async fn greet(name: String, _ctx: WorkContext<String>) -> anyhow::Result<String> {
        Ok(format!("Hello {}!", name))
    }

    fn structured(value: serde_json::Value) -> CacheKey {
        CacheKey::structured(&value).unwrap()
    }

    // =========================================================================
    // Single-flight
    // =========================================================================

    #[tokio::test]
    async fn test_same_key_same_entry() {
        let registry: Registry<String, String> = Registry::new();

        let a = registry.get_or_create(greet, EntryOptions::keyed(structured(json!({ "id": 1, "lang": "en" }))));
        let b = registry.get_or_create(greet, EntryOptions::keyed(structured(json!({ "lang": "en", "id": 1 }))));
        let c = registry.get_or_create(greet, EntryOptions::keyed(structured(json!({ "id": 2, "lang": "en" }))));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_same_entry_after_settle() {
        let registry: Registry<String, String> = Registry::new();

        let fut = registry.run(greet, EntryOptions::keyed("greeting"), "Ada".into(), None);
        fut.await.unwrap();

        let again = registry.get_or_create(greet, EntryOptions::keyed("greeting"));
        assert_eq!(again.value().as_deref(), Some("Hello Ada!"));
        assert!(again.ptr_eq(&registry.get("greeting").unwrap()));
    }

    #[tokio::test]
    async fn test_private_entries_never_dedup() {
        let registry: Registry<String, String> = Registry::new();

        let a = registry.get_or_create(greet, EntryOptions::new());
        let b = registry.get_or_create(greet, EntryOptions::new());

        assert!(!a.ptr_eq(&b));
        assert!(a.is_private());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_private_id_is_not_a_key() {
        let registry: Registry<String, String> = Registry::new();
        let private = registry.get_or_create(greet, EntryOptions::new());

        assert!(registry.get(private.id().to_string()).is_none());

        let keyed = registry.get_or_create(greet, EntryOptions::keyed(private.id().to_string()));
        assert!(!keyed.ptr_eq(&private));
        assert!(!keyed.is_private());
        assert_eq!(keyed.id(), private.id());
        assert_eq!(registry.len(), 2);

        // Deleting the keyed twin leaves the private entry alone.
        let removed = registry.delete(Criteria::new().key(private.id().to_string()));
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ptr_eq(&keyed));
        assert_eq!(registry.len(), 1);
        assert!(registry.entries()[0].ptr_eq(&private));
    }

    #[tokio::test]
    async fn test_overlapping_runs_supersede() {
        let work = ManualWork::<String, u32>::new();
        let registry: Registry<String, u32> = Registry::new();

        let first = registry.run(work.clone(), EntryOptions::keyed("k"), 1, None);
        let second = registry.run(work.clone(), EntryOptions::keyed("k"), 2, None);

        let err = first.await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(&AbortReason::Superseded));

        let _ = work.next_call().await;
        let call = work.next_call().await;
        assert_eq!(call.input, 2);
        call.resolve("two".to_string());

        assert_eq!(second.await.unwrap(), "two");
        let entry = registry.find(Criteria::new().key("k")).unwrap();
        assert_eq!(entry.finished().unwrap().input(), Some(2));
        assert_eq!(work.calls(), 2);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    #[tokio::test]
    async fn test_find_and_filter() {
        let work = ManualWork::<String, u32>::new();
        let registry: Registry<String, u32> = Registry::new();

        registry.get_or_create(work.clone(), EntryOptions::keyed("a").tags(["user", "profile"]));
        registry.get_or_create(work.clone(), EntryOptions::keyed("b").tag("user"));
        registry.run(work.clone(), EntryOptions::keyed("c").tag("user"), 3, None);

        assert_eq!(registry.filter(Criteria::new().tag("user")).len(), 3);

        let both = registry.filter(Criteria::new().tag("user").tag("profile"));
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id(), "a");

        // "a" and "b" never ran: their initial invocation is pending too.
        let running = registry.filter(|entry: &CacheEntry<String, u32>| entry.is_running());
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id(), "c");

        work.resolve_next("three".to_string()).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let resolved = registry.filter(Criteria::new().status(Status::Resolved));
        assert_eq!(resolved.len(), 1);
        let either = registry.filter(
            Criteria::new()
                .status(Status::Resolved)
                .status(Status::Pending),
        );
        assert_eq!(either.len(), 3);

        assert!(registry.find(Criteria::new().key("missing")).is_none());
        assert_eq!(registry.find(Criteria::new().key("b")).unwrap().id(), "b");
    }

    #[tokio::test]
    async fn test_key_criteria_skips_private_entries() {
        let registry: Registry<String, String> = Registry::new();
        let private = registry.get_or_create(greet, EntryOptions::new());

        assert!(registry
            .find(Criteria::new().key(private.id().to_string()))
            .is_none());
    }

    // =========================================================================
    // Delete / Clear
    // =========================================================================

    #[tokio::test]
    async fn test_delete_aborts_running() {
        let work = ManualWork::<String, u32>::new();
        let registry: Registry<String, u32> = Registry::new();

        let fut = registry.run(work.clone(), EntryOptions::keyed("a").tag("user"), 1, None);
        registry.get_or_create(work.clone(), EntryOptions::keyed("b"));

        let removed = registry.delete(Criteria::new().tag("user"));

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), "a");
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert!(matches!(
            fut.error(),
            Some(ActionError::Aborted(AbortReason::Removed))
        ));

        // A later lookup creates a fresh entry.
        let fresh = registry.get_or_create(work, EntryOptions::keyed("a"));
        assert!(!fresh.ptr_eq(&removed[0]));
    }

    #[tokio::test]
    async fn test_clear_aborts_everything() {
        let work = ManualWork::<String, u32>::new();
        let registry: Registry<String, u32> = Registry::new();

        let a = registry.run(work.clone(), EntryOptions::keyed("a"), 1, None);
        let b = registry.run(work.clone(), EntryOptions::new(), 2, None);

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert!(a.error().unwrap().is_aborted());
        assert!(b.error().unwrap().is_aborted());
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[tokio::test]
    async fn test_seed_produces_settled_entry() {
        let counter = CallCounter::new();
        let registry: Registry<String, String> = Registry::builder()
            .name("seeded")
            .seed(vec![(
                "greeting".to_string(),
                Snapshot {
                    value: Some("X".to_string()),
                    error: None,
                    input: None,
                    time: Some(1_700_000_000_000),
                },
            )])
            .build();

        let entry = registry.get_or_create(counter.wrap(greet), EntryOptions::keyed("greeting"));

        assert_eq!(entry.status(), Status::Resolved);
        assert_eq!(entry.value().as_deref(), Some("X"));
        assert_eq!(
            entry.finished_at().map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(counter.count(), 0);
        assert_eq!(registry.pending_seeds(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_through_fresh_registry() {
        let counter = CallCounter::new();
        let registry: Registry<String, String> = Registry::new();
        let key = structured(json!({ "greet": "Ada" }));

        registry
            .run(counter.wrap(greet), EntryOptions::keyed(key.clone()), "Ada".into(), None)
            .await
            .unwrap();
        registry.get_or_create(counter.wrap(greet), EntryOptions::new());
        registry.get_or_create(counter.wrap(greet), EntryOptions::keyed("never-ran"));

        let exported = registry.serialize();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].0, key.canonical_id());

        // Through JSON, as a caller persisting the pairs would.
        let json = serde_json::to_string(&exported).unwrap();
        let imported: SnapshotPairs<String, String> = serde_json::from_str(&json).unwrap();

        let fresh: Registry<String, String> = Registry::new();
        fresh.restore(imported);
        let entry = fresh.get_or_create(counter.wrap(greet), EntryOptions::keyed(key));

        assert_eq!(entry.status(), Status::Resolved);
        assert_eq!(entry.value().as_deref(), Some("Hello Ada!"));
        assert_eq!(entry.input().as_deref(), Some("Ada"));
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn test_null_value_round_trips() {
        let counter = CallCounter::new();
        let lookup = |_: u32, _ctx: WorkContext<Option<u32>>| async move { Ok::<_, anyhow::Error>(None) };
        let registry: Registry<Option<u32>, u32> = Registry::new();

        let found = registry
            .run(counter.wrap(lookup), EntryOptions::keyed("k"), 1, None)
            .await
            .unwrap();
        assert_eq!(found, None);

        let json = serde_json::to_string(&registry.serialize()).unwrap();
        let fresh: Registry<Option<u32>, u32> = Registry::new();
        fresh.restore(serde_json::from_str::<SnapshotPairs<Option<u32>, u32>>(&json).unwrap());
        let entry = fresh.get_or_create(counter.wrap(lookup), EntryOptions::keyed("k"));

        assert_eq!(entry.status(), Status::Resolved);
        assert_eq!(entry.value(), Some(None));
        assert_eq!(entry.input(), Some(1));
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn test_restore_is_not_retroactive() {
        let registry: Registry<String, String> = Registry::new();
        let existing = registry.get_or_create(greet, EntryOptions::keyed("k"));

        registry.restore(vec![(
            "k".to_string(),
            Snapshot::resolved("seeded".to_string(), None, None),
        )]);

        assert_eq!(existing.status(), Status::Pending);
        assert!(registry.get("k").unwrap().value().is_none());

        // Consumed once the id is created again.
        registry.delete(Criteria::new().key("k"));
        let recreated = registry.get_or_create(greet, EntryOptions::keyed("k"));
        assert_eq!(recreated.value().as_deref(), Some("seeded"));
        assert_eq!(registry.pending_seeds(), 0);
    }

    #[tokio::test]
    async fn test_rejected_entries_round_trip() {
        let registry: Registry<String, ()> = Registry::new();
        let failing = |_: (), _ctx: WorkContext<String>| async move {
            Err::<String, _>(anyhow::anyhow!("quota exceeded"))
        };

        let _ = registry.run(failing, EntryOptions::keyed("q"), (), None).await;

        let fresh: Registry<String, ()> = Registry::builder().seed(registry.serialize()).build();
        let entry = fresh.get_or_create(failing, EntryOptions::keyed("q"));

        assert_eq!(entry.status(), Status::Rejected);
        assert_eq!(entry.error().unwrap().to_string(), "quota exceeded");
    }

    #[test]
    fn test_empty_seed_is_ignored() {
        let registry: Registry<String, String> = Registry::builder()
            .seed(vec![(
                "k".to_string(),
                Snapshot {
                    value: None,
                    error: None,
                    input: None,
                    time: None,
                },
            )])
            .build();

        let entry = registry.get_or_create(greet, EntryOptions::keyed("k"));
        assert_eq!(entry.status(), Status::Pending);
        assert!(!entry.initial().is_started());
    }
}
