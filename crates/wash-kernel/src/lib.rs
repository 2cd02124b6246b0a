//! wash-kernel: the engine behind the wide-area shell.
//!
//! This crate provides:
//!
//! - **Entry**: the polymorphic entry trait and the capability vocabulary
//! - **Registry**: mounted plugin roots, path resolution, journaled dispatch
//! - **Cache**: the TTL-driven operation cache with single-flight coalescing
//! - **External**: the subprocess calling convention for external plugins
//! - **Journal**: per-actor activity logs under the user cache directory
//! - **Paths/Config**: XDG locations and the TOML configuration file
//!
//! # Design
//!
//! Entries form a downward-owning tree: parents list children, children never
//! point back. Identity is the canonical path, which is also the cache key,
//! so an entry reconstructed by a later `list` is "the same" entry as far as
//! caching and invalidation are concerned. Every capability call takes an
//! explicit [`Context`] carrying cancellation, an optional deadline, the
//! originating journal id, and the cache-bypass flag.

pub mod cache;
pub mod config;
pub mod ctx;
pub mod entry;
pub mod external;
pub mod journal;
pub mod paths;
pub mod registry;

pub use cache::{CacheConfig, CachedValue, OpCache};
pub use config::WashConfig;
pub use ctx::Context;
pub use entry::{Entry, EntryRef, StreamHandle, SyntheticDir};
pub use external::{ExternalEntry, PluginExecutable, PluginScript, SpawnLimits};
pub use journal::{Journal, JournalId, JournalRecord};
pub use registry::Registry;

// The shared vocabulary lives in wash-types.
pub use wash_types::{
    Action, ActionSet, Attributes, EntryPath, ExecCommand, ExecOutcome, MetadataMap, WashError,
    WashResult,
};
