//! The TTL-driven operation cache.
//!
//! Every cacheable capability call is routed through [`OpCache`], keyed by
//! `(action, canonical path)`. The cache provides:
//!
//! - **Single-flight**: requests arriving while a fetch is pending join it;
//!   exactly one underlying call is issued per key.
//! - **TTL expiry**: completed values live until `created + ttl`, compared
//!   against monotonic time so wall-clock changes never evict early.
//! - **Failure policy**: failed fetches are not cached; the next request
//!   retries.
//! - **Hierarchical invalidation**: clearing a path drops every key at or
//!   beneath it, and mutating actions drop the parent's list plus the
//!   entry's own cacheable keys.
//!
//! Joining a pending fetch does not share cancellation: each waiter selects
//! against its own [`Context`], and the fetch itself is bounded only by the
//! initiating caller's deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ctx::Context;
use crate::entry::EntryRef;
use wash_types::{Action, EntryPath, MetadataMap, WashError, WashResult};

/// Per-entry TTLs for the cacheable actions.
///
/// Frozen at decode time; children that do not specify their own TTLs
/// inherit their parent's configuration. A zero TTL means uncached (the
/// fetch is still single-flighted while in progress, but its value is
/// dropped on completion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    list: Duration,
    read: Duration,
    metadata: Duration,
}

impl CacheConfig {
    /// Default TTL applied to all cacheable actions.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

    /// All cacheable actions at [`Self::DEFAULT_TTL`].
    pub fn new() -> Self {
        Self {
            list: Self::DEFAULT_TTL,
            read: Self::DEFAULT_TTL,
            metadata: Self::DEFAULT_TTL,
        }
    }

    /// All-zero TTLs: nothing retained.
    pub fn uncached() -> Self {
        Self {
            list: Duration::ZERO,
            read: Duration::ZERO,
            metadata: Duration::ZERO,
        }
    }

    /// The TTL for an action; zero for anything non-cacheable.
    pub fn ttl_of(&self, action: Action) -> Duration {
        match action {
            Action::List => self.list,
            Action::Read => self.read,
            Action::Metadata => self.metadata,
            _ => Duration::ZERO,
        }
    }

    /// Override one action's TTL. Non-cacheable actions are ignored.
    pub fn set_ttl(&mut self, action: Action, ttl: Duration) {
        match action {
            Action::List => self.list = ttl,
            Action::Read => self.read = ttl,
            Action::Metadata => self.metadata = ttl,
            _ => {}
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A value the cache can hold.
#[derive(Clone)]
pub enum CachedValue {
    Entries(Arc<Vec<EntryRef>>),
    Bytes(Bytes),
    Metadata(Arc<MetadataMap>),
}

impl CachedValue {
    pub fn into_entries(self) -> WashResult<Arc<Vec<EntryRef>>> {
        match self {
            CachedValue::Entries(e) => Ok(e),
            _ => Err(WashError::Transient("cache slot holds wrong value kind".into())),
        }
    }

    pub fn into_bytes(self) -> WashResult<Bytes> {
        match self {
            CachedValue::Bytes(b) => Ok(b),
            _ => Err(WashError::Transient("cache slot holds wrong value kind".into())),
        }
    }

    pub fn into_metadata(self) -> WashResult<Arc<MetadataMap>> {
        match self {
            CachedValue::Metadata(m) => Ok(m),
            _ => Err(WashError::Transient("cache slot holds wrong value kind".into())),
        }
    }
}

impl std::fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachedValue::Entries(e) => write!(f, "Entries({})", e.len()),
            CachedValue::Bytes(b) => write!(f, "Bytes({})", b.len()),
            CachedValue::Metadata(m) => write!(f, "Metadata({})", m.len()),
        }
    }
}

type Key = (Action, EntryPath);
type FetchOutcome = WashResult<CachedValue>;

enum Slot {
    /// A fetch is in flight; joiners subscribe to the channel.
    Pending {
        rx: watch::Receiver<Option<FetchOutcome>>,
        fetch_id: u64,
    },
    /// A completed value, valid until `expires`.
    Resolved {
        value: CachedValue,
        expires: Instant,
    },
}

/// The operation cache. One per registry, shared by every front-end.
pub struct OpCache {
    slots: Mutex<HashMap<Key, Slot>>,
    next_fetch: AtomicU64,
}

impl OpCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_fetch: AtomicU64::new(1),
        }
    }

    /// Route a capability call through the cache.
    ///
    /// `fetch` is called at most once per in-flight key, with a context that
    /// carries the initiating caller's deadline but a fresh cancellation
    /// token. The calling context only governs how long *this* caller
    /// waits.
    pub async fn fetch<F, Fut>(
        self: &Arc<Self>,
        ctx: &Context,
        action: Action,
        path: &EntryPath,
        ttl: Duration,
        fetch: F,
    ) -> FetchOutcome
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        if ctx.bypasses_cache() {
            return ctx.run(fetch(ctx.clone())).await;
        }

        let key: Key = (action, path.clone());
        let rx = {
            let mut slots = self.slots.lock().expect("cache lock poisoned");

            let expired = matches!(
                slots.get(&key),
                Some(Slot::Resolved { expires, .. }) if Instant::now() >= *expires
            );
            if expired {
                slots.remove(&key);
            }
            if let Some(Slot::Resolved { value, .. }) = slots.get(&key) {
                tracing::trace!(%path, %action, "cache hit");
                return Ok(value.clone());
            }

            if let Some(Slot::Pending { rx, .. }) = slots.get(&key) {
                tracing::trace!(%path, %action, "joining pending fetch");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                let fetch_id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
                slots.insert(
                    key.clone(),
                    Slot::Pending {
                        rx: rx.clone(),
                        fetch_id,
                    },
                );
                self.spawn_fetch(key, fetch_id, ttl, ctx, tx, fetch);
                rx
            }
        };

        Self::await_outcome(ctx, rx).await
    }

    fn spawn_fetch<F, Fut>(
        self: &Arc<Self>,
        key: Key,
        fetch_id: u64,
        ttl: Duration,
        ctx: &Context,
        tx: watch::Sender<Option<FetchOutcome>>,
        fetch: F,
    ) where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        // Fresh token: joiner cancellation must not abort the shared fetch.
        // The initiating deadline still bounds it.
        let mut fetch_ctx = Context::background();
        if let Some(deadline) = ctx.deadline() {
            fetch_ctx = fetch_ctx.with_deadline(deadline);
        }
        let fut = fetch(fetch_ctx.clone());

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let result = fetch_ctx.run(fut).await;

            {
                let mut slots = cache.slots.lock().expect("cache lock poisoned");
                // Only touch the slot if it is still ours: a slot removed by
                // an invalidation must not be resurrected with a value
                // fetched before the invalidation.
                let ours = matches!(
                    slots.get(&key),
                    Some(Slot::Pending { fetch_id: id, .. }) if *id == fetch_id
                );
                if ours {
                    match (&result, ttl > Duration::ZERO) {
                        (Ok(value), true) => {
                            slots.insert(
                                key,
                                Slot::Resolved {
                                    value: value.clone(),
                                    expires: Instant::now() + ttl,
                                },
                            );
                        }
                        _ => {
                            slots.remove(&key);
                        }
                    }
                }
            }

            // Waiters may all be gone; that's fine.
            let _ = tx.send(Some(result));
        });
    }

    async fn await_outcome(
        ctx: &Context,
        mut rx: watch::Receiver<Option<FetchOutcome>>,
    ) -> FetchOutcome {
        loop {
            if let Some(outcome) = rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(WashError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WashError::Transient("cache fetch abandoned".into()));
                    }
                }
            }
        }
    }

    /// Remove every key whose path equals `path` or lies beneath it.
    ///
    /// Returns how many slots were dropped. Pending fetches whose slot is
    /// cleared complete normally for their current waiters but do not
    /// populate the cache.
    pub fn clear(&self, path: &EntryPath) -> usize {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        let before = slots.len();
        slots.retain(|(_, p), _| !p.is_within(path));
        let dropped = before - slots.len();
        if dropped > 0 {
            tracing::debug!(%path, dropped, "cache cleared");
        }
        dropped
    }

    /// Invalidation applied after a mutating action on `path`: the parent's
    /// list and every cacheable key at the entry's own path.
    pub fn invalidate_entry(&self, path: &EntryPath) {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        if let Some(parent) = path.parent() {
            slots.remove(&(Action::List, parent));
        }
        for action in [Action::List, Action::Read, Action::Metadata] {
            slots.remove(&(action, path.clone()));
        }
    }

    /// Number of occupied slots (pending or resolved).
    pub fn len(&self) -> usize {
        self.slots.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpCache {
    fn default() -> Self {
        Self::new()
    }
}
