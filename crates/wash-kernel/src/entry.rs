//! The entry model: polymorphic nodes of the virtual filesystem.
//!
//! An [`Entry`] is a node in the tree wash projects: a cloud instance, a
//! container, a log file, a bucket. Entries declare which of the fixed
//! capability vocabulary they support; invoking anything else fails with
//! `CapabilityUnsupported` rather than falling back.
//!
//! Entries are either *core* (implemented in-process, like [`SyntheticDir`])
//! or *external* (backed by a plugin subprocess, see [`crate::external`]).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::cache::CacheConfig;
use crate::ctx::Context;
use wash_types::{
    Action, ActionSet, Attributes, EntryPath, ExecCommand, ExecOutcome, MetadataMap, WashError,
    WashResult,
};

/// Shared handle to an entry.
///
/// Entries are materialized lazily by their parent's `list` and survive only
/// while referenced by an in-flight request or a cache slot. Identity across
/// reconstructions is the canonical path, never the allocation.
pub type EntryRef = Arc<dyn Entry>;

impl std::fmt::Debug for dyn Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").field("path", &self.path()).finish()
    }
}

/// A node in the virtual filesystem.
///
/// The accessor methods are cheap and constant for the entry's lifetime;
/// the action methods may suspend on I/O. Implementations only override the
/// actions they declare in `supported_actions`: the defaults fail with
/// `CapabilityUnsupported`, and dispatch checks the set before calling, so
/// an override that is not declared is unreachable.
#[async_trait]
pub trait Entry: Send + Sync {
    /// Name, unique among siblings.
    fn name(&self) -> &str;

    /// Canonical path: slash-joined names from the root.
    fn path(&self) -> &EntryPath;

    /// The actions this entry supports. Fixed for the entry's lifetime.
    fn supported_actions(&self) -> ActionSet;

    /// File-like attributes, if the provider reports any.
    fn attributes(&self) -> Attributes {
        Attributes::default()
    }

    /// Per-action TTLs for the operation cache.
    fn cache_config(&self) -> &CacheConfig;

    /// Inline metadata merged beneath the `metadata` action's result.
    fn partial_metadata(&self) -> Option<&MetadataMap> {
        None
    }

    /// Enumerate children. Ordering is provider-defined but stable within a
    /// TTL window; duplicate names are an error.
    async fn list(&self, ctx: &Context) -> WashResult<Vec<EntryRef>> {
        let _ = ctx;
        Err(self.unsupported(Action::List))
    }

    /// Fetch the entry's full content.
    async fn read(&self, ctx: &Context) -> WashResult<Bytes> {
        let _ = ctx;
        Err(self.unsupported(Action::Read))
    }

    /// Open a lazy byte stream. Never cached.
    async fn stream(&self, ctx: &Context) -> WashResult<StreamHandle> {
        let _ = ctx;
        Err(self.unsupported(Action::Stream))
    }

    /// Fetch provider metadata for this entry.
    async fn metadata(&self, ctx: &Context) -> WashResult<MetadataMap> {
        let _ = ctx;
        Err(self.unsupported(Action::Metadata))
    }

    /// Run a command on the resource this entry represents.
    async fn exec(&self, ctx: &Context, cmd: ExecCommand) -> WashResult<ExecOutcome> {
        let _ = (ctx, cmd);
        Err(self.unsupported(Action::Exec))
    }

    /// Replace the entry's content.
    async fn write(&self, ctx: &Context, data: Bytes) -> WashResult<()> {
        let _ = (ctx, data);
        Err(self.unsupported(Action::Write))
    }

    /// Remove the entry from its provider.
    async fn delete(&self, ctx: &Context) -> WashResult<()> {
        let _ = ctx;
        Err(self.unsupported(Action::Delete))
    }

    /// Deliver a named signal to the resource.
    async fn signal(&self, ctx: &Context, signal: &str) -> WashResult<()> {
        let _ = (ctx, signal);
        Err(self.unsupported(Action::Signal))
    }
}

impl dyn Entry {
    /// True if this entry is a directory in the VFS sense.
    pub fn is_container(&self) -> bool {
        self.supported_actions().contains(Action::List)
    }
}

trait UnsupportedExt {
    fn unsupported(&self, action: Action) -> WashError;
}

impl<T: Entry + ?Sized> UnsupportedExt for T {
    fn unsupported(&self, action: Action) -> WashError {
        WashError::CapabilityUnsupported {
            path: self.path().clone(),
            action,
        }
    }
}

/// A live byte stream plus its cancel handle.
///
/// Handles are Live on construction and Closed after [`close`](Self::close)
/// (or drop); Closed is terminal and releases whatever backs the stream,
/// which for external plugins is the subprocess.
pub struct StreamHandle {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StreamHandle {
    /// Wrap a reader with a close hook invoked exactly once.
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        closer: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            reader,
            closer: Some(closer),
        }
    }

    /// The live byte sequence.
    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Sync + Unpin) {
        &mut self.reader
    }

    pub fn is_live(&self) -> bool {
        self.closer.is_some()
    }

    /// Transition Live → Closed, releasing the backing resource.
    pub fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("live", &self.is_live())
            .finish()
    }
}

/// A core in-process directory with a fixed child set.
///
/// Used for the registry root and the synthetic per-plugin top-level
/// directories. Listing is instantaneous, so its cache config is all-zero
/// (uncached).
pub struct SyntheticDir {
    name: String,
    path: EntryPath,
    children: Vec<EntryRef>,
    cache_config: CacheConfig,
}

impl SyntheticDir {
    pub fn new(path: EntryPath, children: Vec<EntryRef>) -> Self {
        let name = path.name().unwrap_or("").to_string();
        Self {
            name,
            path,
            children,
            cache_config: CacheConfig::uncached(),
        }
    }
}

#[async_trait]
impl Entry for SyntheticDir {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &EntryPath {
        &self.path
    }

    fn supported_actions(&self) -> ActionSet {
        ActionSet::new(&[Action::List])
    }

    fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    async fn list(&self, _ctx: &Context) -> WashResult<Vec<EntryRef>> {
        Ok(self.children.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf {
        path: EntryPath,
        config: CacheConfig,
    }

    #[async_trait]
    impl Entry for Leaf {
        fn name(&self) -> &str {
            self.path.name().unwrap_or("")
        }
        fn path(&self) -> &EntryPath {
            &self.path
        }
        fn supported_actions(&self) -> ActionSet {
            ActionSet::new(&[Action::Read])
        }
        fn cache_config(&self) -> &CacheConfig {
            &self.config
        }
        async fn read(&self, _ctx: &Context) -> WashResult<Bytes> {
            Ok(Bytes::from_static(b"leaf"))
        }
    }

    fn leaf(path: &str) -> EntryRef {
        Arc::new(Leaf {
            path: EntryPath::parse(path),
            config: CacheConfig::uncached(),
        })
    }

    #[tokio::test]
    async fn test_default_actions_are_unsupported() {
        let entry = leaf("/a");
        let ctx = Context::background();

        let err = entry.list(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            WashError::CapabilityUnsupported {
                action: Action::List,
                ..
            }
        ));

        let err = entry.delete(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            WashError::CapabilityUnsupported {
                action: Action::Delete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_supported_action_dispatches() {
        let entry = leaf("/a");
        let data = entry.read(&Context::background()).await.unwrap();
        assert_eq!(&data[..], b"leaf");
    }

    #[tokio::test]
    async fn test_synthetic_dir_lists_children() {
        let dir = SyntheticDir::new(EntryPath::root(), vec![leaf("/a"), leaf("/b")]);
        let children = dir.list(&Context::background()).await.unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!((&dir as &dyn Entry).is_container());
    }

    #[test]
    fn test_stream_handle_close_is_terminal() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = closed.clone();
        let handle = StreamHandle::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        assert!(handle.is_live());
        handle.close();
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_stream_handle_drop_closes() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = closed.clone();
        drop(StreamHandle::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        ));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
