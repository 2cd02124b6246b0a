//! The entry registry: mounted plugin roots, path resolution, and
//! capability dispatch through the cache and journal.
//!
//! Plugins are mounted as synthetic top-level directories under the root.
//! Path resolution walks from the root, invoking `list` on each intermediate
//! entry (through the cache) and matching segments by name; resolution never
//! creates entries. Every capability invocation made through the registry is
//! recorded in the originating request's journal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::time::Instant;

use crate::cache::{CachedValue, OpCache};
use crate::ctx::Context;
use crate::entry::{Entry, EntryRef, StreamHandle, SyntheticDir};
use crate::journal::{Journal, JournalRecord};
use wash_types::{
    Action, EntryPath, ExecCommand, ExecOutcome, MetadataMap, WashError, WashResult,
};

/// The tree of mounted plugins and the shared machinery behind it.
pub struct Registry {
    mounts: BTreeMap<String, EntryRef>,
    cache: Arc<OpCache>,
    journal: Arc<Journal>,
}

impl Registry {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            mounts: BTreeMap::new(),
            cache: Arc::new(OpCache::new()),
            journal,
        }
    }

    /// Mount a plugin root. The entry's name becomes the top-level
    /// directory; mounting over an existing name replaces it.
    pub fn mount(&mut self, root: EntryRef) {
        self.mounts.insert(root.name().to_string(), root);
    }

    pub fn mount_names(&self) -> Vec<String> {
        self.mounts.keys().cloned().collect()
    }

    pub fn cache(&self) -> &Arc<OpCache> {
        &self.cache
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The synthetic root listing the mounted plugins.
    pub fn root_entry(&self) -> EntryRef {
        Arc::new(SyntheticDir::new(
            EntryPath::root(),
            self.mounts.values().cloned().collect(),
        ))
    }

    /// Walk `path` from the root, resolving one segment at a time.
    ///
    /// A segment that does not match a child of the current entry fails with
    /// `NotFound` without descending further; an intermediate entry that is
    /// not a container resolves the same way.
    pub async fn resolve(&self, ctx: &Context, path: &EntryPath) -> WashResult<EntryRef> {
        let mut current = self.root_entry();
        for segment in path.segments() {
            let children = match self.list(ctx, &current).await {
                Ok(children) => children,
                Err(WashError::CapabilityUnsupported { .. }) => {
                    return Err(WashError::NotFound(path.clone()))
                }
                Err(e) => return Err(e),
            };
            match children.iter().find(|c| c.name() == segment) {
                Some(child) => current = child.clone(),
                None => return Err(WashError::NotFound(path.clone())),
            }
        }
        Ok(current)
    }

    /// `list` through the cache; the registry-level contract checks
    /// (capability membership, duplicate sibling names) apply to core and
    /// external entries alike.
    pub async fn list(&self, ctx: &Context, entry: &EntryRef) -> WashResult<Arc<Vec<EntryRef>>> {
        self.invoke(ctx, entry, Action::List, |ctx, entry| async move {
            let children = entry.list(&ctx).await?;
            check_duplicate_names(&children)?;
            Ok(CachedValue::Entries(Arc::new(children)))
        })
        .await?
        .into_entries()
    }

    /// Alias for [`list`](Self::list), matching the registry vocabulary.
    pub async fn children(&self, ctx: &Context, entry: &EntryRef) -> WashResult<Arc<Vec<EntryRef>>> {
        self.list(ctx, entry).await
    }

    /// `read` through the cache.
    pub async fn read(&self, ctx: &Context, entry: &EntryRef) -> WashResult<Bytes> {
        self.invoke(ctx, entry, Action::Read, |ctx, entry| async move {
            entry.read(&ctx).await.map(CachedValue::Bytes)
        })
        .await?
        .into_bytes()
    }

    /// `metadata` through the cache: the plugin-supplied mapping unioned
    /// over the entry's inline partial metadata (plugin keys win).
    pub async fn metadata(&self, ctx: &Context, entry: &EntryRef) -> WashResult<Arc<MetadataMap>> {
        self.invoke(ctx, entry, Action::Metadata, |ctx, entry| async move {
            let supplied = entry.metadata(&ctx).await?;
            let mut merged = entry.partial_metadata().cloned().unwrap_or_default();
            for (key, value) in supplied {
                merged.insert(key, value);
            }
            Ok(CachedValue::Metadata(Arc::new(merged)))
        })
        .await?
        .into_metadata()
    }

    /// `stream` is never cached: the caller owns the live handle.
    pub async fn stream(&self, ctx: &Context, entry: &EntryRef) -> WashResult<StreamHandle> {
        self.journaled(ctx, entry.path(), Action::Stream, async {
            self.require(entry, Action::Stream)?;
            ctx.run(entry.stream(ctx)).await
        })
        .await
    }

    /// `exec` is never cached.
    pub async fn exec(
        &self,
        ctx: &Context,
        entry: &EntryRef,
        cmd: ExecCommand,
    ) -> WashResult<ExecOutcome> {
        self.journaled(ctx, entry.path(), Action::Exec, async {
            self.require(entry, Action::Exec)?;
            ctx.run(entry.exec(ctx, cmd)).await
        })
        .await
    }

    pub async fn write(&self, ctx: &Context, entry: &EntryRef, data: Bytes) -> WashResult<()> {
        self.mutate(ctx, entry, Action::Write, entry.write(ctx, data)).await
    }

    pub async fn delete(&self, ctx: &Context, entry: &EntryRef) -> WashResult<()> {
        self.mutate(ctx, entry, Action::Delete, entry.delete(ctx)).await
    }

    pub async fn signal(&self, ctx: &Context, entry: &EntryRef, signal: &str) -> WashResult<()> {
        self.mutate(ctx, entry, Action::Signal, entry.signal(ctx, signal)).await
    }

    /// Drop every cached key at or beneath `path`.
    pub fn clear(&self, path: &EntryPath) -> usize {
        self.cache.clear(path)
    }

    fn require(&self, entry: &EntryRef, action: Action) -> WashResult<()> {
        if entry.supported_actions().contains(action) {
            Ok(())
        } else {
            Err(WashError::CapabilityUnsupported {
                path: entry.path().clone(),
                action,
            })
        }
    }

    /// Route a cacheable action through the cache, journaled.
    async fn invoke<F, Fut>(
        &self,
        ctx: &Context,
        entry: &EntryRef,
        action: Action,
        fetch: F,
    ) -> WashResult<CachedValue>
    where
        F: FnOnce(Context, EntryRef) -> Fut,
        Fut: std::future::Future<Output = WashResult<CachedValue>> + Send + 'static,
    {
        self.journaled(ctx, entry.path(), action, async {
            self.require(entry, action)?;
            let ttl = entry.cache_config().ttl_of(action);
            let path = entry.path().clone();
            let entry = entry.clone();
            self.cache
                .fetch(ctx, action, &path, ttl, move |fctx| fetch(fctx, entry))
                .await
        })
        .await
    }

    /// Run a mutating action and apply its invalidations before returning.
    async fn mutate(
        &self,
        ctx: &Context,
        entry: &EntryRef,
        action: Action,
        fut: impl std::future::Future<Output = WashResult<()>>,
    ) -> WashResult<()> {
        self.journaled(ctx, entry.path(), action, async {
            self.require(entry, action)?;
            let result = ctx.run(fut).await;
            // Even a failed mutation may have partially applied remotely.
            self.cache.invalidate_entry(entry.path());
            result
        })
        .await
    }

    /// Record the invocation in the originating request's journal.
    async fn journaled<T>(
        &self,
        ctx: &Context,
        path: &EntryPath,
        action: Action,
        fut: impl std::future::Future<Output = WashResult<T>>,
    ) -> WashResult<T> {
        let at = SystemTime::now();
        let started = Instant::now();
        let result = fut.await;
        if let Some(id) = ctx.journal() {
            let outcome = result.as_ref().map(|_| ());
            self.journal.append(
                id,
                &JournalRecord::new(at, action, path.clone(), started.elapsed(), outcome),
            );
        }
        result
    }
}

fn check_duplicate_names(children: &[EntryRef]) -> WashResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(children.len());
    for child in children {
        if !seen.insert(child.name()) {
            return Err(WashError::decode(format!(
                "list returned duplicate entry name {:?}",
                child.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wash_types::ActionSet;

    /// In-memory test entry with counted invocations.
    struct MemEntry {
        path: EntryPath,
        actions: ActionSet,
        children: Vec<EntryRef>,
        content: Bytes,
        config: CacheConfig,
        list_calls: Arc<AtomicUsize>,
        read_calls: Arc<AtomicUsize>,
    }

    impl MemEntry {
        fn dir(path: &str, children: Vec<EntryRef>) -> Arc<Self> {
            Arc::new(Self {
                path: EntryPath::parse(path),
                actions: ActionSet::new(&[Action::List]),
                children,
                content: Bytes::new(),
                config: CacheConfig::new(),
                list_calls: Arc::new(AtomicUsize::new(0)),
                read_calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn file(path: &str, content: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                path: EntryPath::parse(path),
                actions: ActionSet::new(&[Action::Read, Action::Write, Action::Metadata]),
                children: Vec::new(),
                content: Bytes::from_static(content),
                config: CacheConfig::new(),
                list_calls: Arc::new(AtomicUsize::new(0)),
                read_calls: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl Entry for MemEntry {
        fn name(&self) -> &str {
            self.path.name().unwrap_or("")
        }
        fn path(&self) -> &EntryPath {
            &self.path
        }
        fn supported_actions(&self) -> ActionSet {
            self.actions
        }
        fn cache_config(&self) -> &CacheConfig {
            &self.config
        }
        async fn list(&self, _ctx: &Context) -> WashResult<Vec<EntryRef>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.children.clone())
        }
        async fn read(&self, _ctx: &Context) -> WashResult<Bytes> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.content.clone())
        }
        async fn metadata(&self, _ctx: &Context) -> WashResult<MetadataMap> {
            Ok(MetadataMap::new())
        }
        async fn write(&self, _ctx: &Context, _data: Bytes) -> WashResult<()> {
            Ok(())
        }
    }

    fn test_registry(mounts: Vec<EntryRef>) -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Journal::open(dir.path()).unwrap());
        let mut registry = Registry::new(journal);
        for mount in mounts {
            registry.mount(mount);
        }
        (registry, dir)
    }

    #[tokio::test]
    async fn test_resolve_walks_segments() {
        let file = MemEntry::file("/top/sub/file", b"data");
        let sub = MemEntry::dir("/top/sub", vec![file]);
        let top = MemEntry::dir("/top", vec![sub]);
        let (registry, _dir) = test_registry(vec![top]);

        let ctx = Context::background();
        let entry = registry
            .resolve(&ctx, &EntryPath::parse("/top/sub/file"))
            .await
            .unwrap();
        assert_eq!(entry.path().as_str(), "/top/sub/file");

        let data = registry.read(&ctx, &entry).await.unwrap();
        assert_eq!(&data[..], b"data");
    }

    #[tokio::test]
    async fn test_resolve_root_lists_mounts() {
        let (registry, _dir) = test_registry(vec![
            MemEntry::dir("/alpha", vec![]),
            MemEntry::dir("/beta", vec![]),
        ]);
        let ctx = Context::background();

        let root = registry.resolve(&ctx, &EntryPath::root()).await.unwrap();
        let children = registry.list(&ctx, &root).await.unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_resolve_missing_segment_stops_early() {
        let sub = MemEntry::dir("/top/sub", vec![]);
        let sub_calls = sub.list_calls.clone();
        let top = MemEntry::dir("/top", vec![sub]);
        let (registry, _dir) = test_registry(vec![top]);
        let ctx = Context::background();

        let err = registry
            .resolve(&ctx, &EntryPath::parse("/top/nope/deeper"))
            .await
            .unwrap_err();
        assert!(matches!(err, WashError::NotFound(p) if p.as_str() == "/top/nope/deeper"));
        // Resolution stopped at the unmatched segment: /top/sub never listed.
        assert_eq!(sub_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_through_leaf_is_not_found() {
        let file = MemEntry::file("/top/file", b"");
        let top = MemEntry::dir("/top", vec![file]);
        let (registry, _dir) = test_registry(vec![top]);
        let ctx = Context::background();

        let err = registry
            .resolve(&ctx, &EntryPath::parse("/top/file/child"))
            .await
            .unwrap_err();
        assert!(matches!(err, WashError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsupported_action_records_no_cache_entry() {
        let top = MemEntry::dir("/top", vec![]);
        let (registry, _dir) = test_registry(vec![top.clone()]);
        let ctx = Context::background();

        let entry: EntryRef = top;
        let err = registry.read(&ctx, &entry).await.unwrap_err();
        assert!(matches!(
            err,
            WashError::CapabilityUnsupported {
                action: Action::Read,
                ..
            }
        ));
        assert_eq!(registry.cache().len(), 0);
    }

    #[tokio::test]
    async fn test_list_is_cached_within_ttl() {
        let top = MemEntry::dir("/top", vec![]);
        let calls = top.list_calls.clone();
        let (registry, _dir) = test_registry(vec![top.clone()]);
        let ctx = Context::background();

        let entry: EntryRef = top;
        registry.list(&ctx, &entry).await.unwrap();
        registry.list(&ctx, &entry).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_invalidates_parent_list_and_own_keys() {
        let file = MemEntry::file("/top/file", b"old");
        let read_calls = file.read_calls.clone();
        let top = MemEntry::dir("/top", vec![file.clone()]);
        let list_calls = top.list_calls.clone();
        let (registry, _dir) = test_registry(vec![top.clone()]);
        let ctx = Context::background();

        let dir_entry: EntryRef = top;
        let file_entry: EntryRef = file;

        registry.list(&ctx, &dir_entry).await.unwrap();
        registry.read(&ctx, &file_entry).await.unwrap();
        assert_eq!(list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);

        registry
            .write(&ctx, &file_entry, Bytes::from_static(b"new"))
            .await
            .unwrap();

        // Both the parent's list and the entry's own read refetch.
        registry.list(&ctx, &dir_entry).await.unwrap();
        registry.read(&ctx, &file_entry).await.unwrap();
        assert_eq!(list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(read_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_children_are_a_decode_error() {
        let a = MemEntry::file("/top/same", b"1");
        let b = MemEntry::file("/top/same", b"2");
        let top = MemEntry::dir("/top", vec![a, b]);
        let (registry, _dir) = test_registry(vec![top.clone()]);

        let entry: EntryRef = top;
        let err = registry
            .list(&Context::background(), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, WashError::Decode(msg) if msg.contains("same")));
    }

    #[tokio::test]
    async fn test_invocations_are_journaled() {
        let top = MemEntry::dir("/top", vec![]);
        let (registry, _dir) = test_registry(vec![top.clone()]);

        let id = crate::journal::JournalId::new("55-ls");
        let ctx = Context::background().with_journal(id.clone());
        let entry: EntryRef = top;
        registry.list(&ctx, &entry).await.unwrap();

        let content = registry.journal().read(&id).unwrap();
        assert!(content.contains("\"list\""));
        assert!(content.contains("/top"));
    }
}
