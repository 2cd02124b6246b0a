//! Canonical entry paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The canonical path of an entry: slash-joined names from the root.
///
/// This is the stable identity of an entry. Entries are materialized lazily
/// and may be reconstructed many times; two entries are "the same" iff their
/// canonical paths are equal, and the operation cache keys on exactly this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryPath(String);

impl EntryPath {
    /// The root of the whole tree.
    pub fn root() -> Self {
        EntryPath("/".to_string())
    }

    /// Parse a user-supplied path, normalizing a missing leading slash and
    /// collapsing empty segments.
    pub fn parse(s: &str) -> Self {
        let mut path = EntryPath::root();
        for segment in s.split('/').filter(|s| !s.is_empty()) {
            path = path.join(segment);
        }
        path
    }

    /// Append a child name.
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            EntryPath(format!("/{}", name))
        } else {
            EntryPath(format!("{}/{}", self.0, name))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The final path segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<EntryPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(EntryPath::root()),
            Some(idx) => Some(EntryPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Path segments from the root, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// True if `self` equals `other` or lies beneath it.
    ///
    /// This is the relation hierarchical cache invalidation uses.
    pub fn is_within(&self, other: &EntryPath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryPath {
    fn from(s: &str) -> Self {
        EntryPath::parse(s)
    }
}
