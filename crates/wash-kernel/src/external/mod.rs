//! The external-plugin runtime.
//!
//! An external plugin is a single executable. The runtime invokes it as
//!
//! ```text
//! <plugin-exe> <action> <canonical-path> <state> [action-args...]
//! ```
//!
//! with the environment untouched. Stdout carries the result in an
//! action-specific format, stderr is the error channel, and a non-zero exit
//! signals failure. The opaque `state` token is whatever the plugin emitted
//! for the entry in an earlier `list`; the runtime passes it back verbatim.
//!
//! Cancellation reaches the subprocess as SIGTERM, escalated to SIGKILL
//! after a grace period. Concurrent invocations across all plugins are
//! bounded by a shared semaphore to prevent fork storms.

mod decode;
mod entry;
mod exec;
mod script;
pub mod testing;

pub use decode::{DecodedAttributes, DecodedCacheTtls, DecodedEntry};
pub use entry::ExternalEntry;
pub use script::{PluginExecutable, PluginProcess, PluginScript, SpawnLimits};
