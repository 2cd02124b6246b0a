//! wash-types: data types shared across the wash workspace.
//!
//! This crate holds the plain data vocabulary of the engine:
//!
//! - **Action**: the fixed capability vocabulary entries may support
//! - **Attributes**: file-like attributes carried by entries
//! - **EntryPath**: canonical slash-joined paths (the stable entry identity)
//! - **WashError**: the error taxonomy surfaced to FUSE and HTTP
//! - **Exec types**: command descriptions and outcomes for the exec action
//!
//! Nothing here performs I/O; the kernel crate builds the engine on top.

pub mod action;
pub mod attributes;
pub mod error;
pub mod exec;
pub mod path;

pub use action::{Action, ActionSet};
pub use attributes::{parse_mode, unix_seconds_to_system_time, Attributes};
pub use error::{WashError, WashResult};
pub use exec::{ExecCommand, ExecOutcome};
pub use path::EntryPath;

/// Metadata returned by the `metadata` action: arbitrary JSON-shaped keys.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;
