//! Inode allocation bound to canonical paths.
//!
//! FUSE speaks inode numbers; the registry speaks canonical paths. The
//! table keeps the two in sync for as long as the kernel may reference an
//! inode: `lookup` replies increment a per-inode reference count and
//! `forget` decrements it, evicting the binding at zero. Because numbers
//! are allocated from a monotonic counter and never reused while
//! referenced, TTL-driven re-enumeration cannot collide.

use std::collections::HashMap;

use parking_lot::Mutex;

use wash_types::EntryPath;

pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

struct InodeEntry {
    path: EntryPath,
    nlookup: u64,
}

struct Tables {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<EntryPath, u64>,
    next: u64,
}

/// Path ↔ inode mapping with kernel reference counting.
pub struct InodeTable {
    inner: Mutex<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        // The root is always present and never forgotten.
        by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: EntryPath::root(),
                nlookup: 1,
            },
        );
        by_path.insert(EntryPath::root(), ROOT_INO);
        Self {
            inner: Mutex::new(Tables {
                by_ino,
                by_path,
                next: ROOT_INO + 1,
            }),
        }
    }

    /// The path bound to `ino`, if the kernel still references it.
    pub fn path_of(&self, ino: u64) -> Option<EntryPath> {
        self.inner.lock().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Bind (or find) the inode for `path`.
    ///
    /// `remember` is set for replies the kernel reference-counts (`lookup`)
    /// and unset for enumeration (`readdir`).
    pub fn assign(&self, path: &EntryPath, remember: bool) -> u64 {
        let mut tables = self.inner.lock();
        let ino = match tables.by_path.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = tables.next;
                tables.next += 1;
                tables.by_ino.insert(
                    ino,
                    InodeEntry {
                        path: path.clone(),
                        nlookup: 0,
                    },
                );
                tables.by_path.insert(path.clone(), ino);
                ino
            }
        };
        if remember {
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                entry.nlookup += 1;
            }
        }
        ino
    }

    /// Drop `nlookup` kernel references; evict the binding at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO || nlookup == 0 {
            return;
        }
        let mut tables = self.inner.lock();
        let evict = match tables.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            }
            None => false,
        };
        if evict {
            if let Some(entry) = tables.by_ino.remove(&ino) {
                tables.by_path.remove(&entry.path);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().by_ino.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
