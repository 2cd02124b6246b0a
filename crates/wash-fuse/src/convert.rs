//! Conversions between wash types and FUSE replies.

use std::time::{Duration, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

use wash_types::{Action, ActionSet, Attributes, WashError};

/// Map a core error onto the errno FUSE reports.
pub fn error_to_errno(err: &WashError) -> libc::c_int {
    match err {
        WashError::NotFound(_) => libc::ENOENT,
        WashError::CapabilityUnsupported { .. } => libc::ENOTSUP,
        WashError::Decode(_) => libc::EIO,
        WashError::Plugin(_) => libc::EIO,
        WashError::Cancelled => libc::EINTR,
        WashError::Transient(_) => libc::EIO,
    }
}

/// File type is derived from capabilities: listable entries are
/// directories, everything else is a regular file.
pub fn file_type(actions: ActionSet) -> FileType {
    if actions.contains(Action::List) {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

/// Build the kernel attribute block for an entry.
pub fn file_attr(
    ino: u64,
    actions: ActionSet,
    attr: &Attributes,
    uid: u32,
    gid: u32,
) -> FileAttr {
    let kind = file_type(actions);
    let perm = match attr.mode {
        Some(mode) => (mode & 0o7777) as u16,
        None => default_perm(kind, actions),
    };
    let mtime = attr.mtime.unwrap_or(UNIX_EPOCH);
    FileAttr {
        ino,
        size: attr.size.unwrap_or(0),
        blocks: attr.size.unwrap_or(0).div_ceil(512),
        atime: attr.atime.unwrap_or(mtime),
        mtime,
        ctime: attr.ctime.unwrap_or(mtime),
        crtime: attr.ctime.unwrap_or(UNIX_EPOCH),
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn default_perm(kind: FileType, actions: ActionSet) -> u16 {
    let writable = actions.contains(Action::Write);
    match (kind, writable) {
        (FileType::Directory, _) => 0o555,
        (_, true) => 0o644,
        (_, false) => 0o444,
    }
}

/// How long the kernel may trust an attribute reply.
pub fn attr_validity(attr: &Attributes, fallback: Duration) -> Duration {
    attr.valid.unwrap_or(fallback)
}

/// Derive a journal-friendly executable name for a pid from procfs.
pub fn executable_name(pid: u32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    let name = comm.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Clamp `(offset, size)` into a window over `data` for read replies.
pub fn slice_window(data: &[u8], offset: i64, size: u32) -> &[u8] {
    let start = (offset.max(0) as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wash_types::EntryPath;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            error_to_errno(&WashError::NotFound(EntryPath::root())),
            libc::ENOENT
        );
        assert_eq!(
            error_to_errno(&WashError::CapabilityUnsupported {
                path: EntryPath::root(),
                action: Action::Write,
            }),
            libc::ENOTSUP
        );
        assert_eq!(error_to_errno(&WashError::Cancelled), libc::EINTR);
        assert_eq!(error_to_errno(&WashError::Plugin("x".into())), libc::EIO);
    }

    #[test]
    fn test_listable_entries_are_directories() {
        assert_eq!(
            file_type(ActionSet::new(&[Action::List, Action::Metadata])),
            FileType::Directory
        );
        assert_eq!(
            file_type(ActionSet::new(&[Action::Read])),
            FileType::RegularFile
        );
    }

    #[test]
    fn test_mode_attribute_wins_over_defaults() {
        let attr = Attributes {
            mode: Some(0o640),
            ..Default::default()
        };
        let fa = file_attr(5, ActionSet::new(&[Action::Read]), &attr, 1000, 1000);
        assert_eq!(fa.perm, 0o640);
        assert_eq!(fa.ino, 5);
    }

    #[test]
    fn test_default_permissions_track_write_capability() {
        let attr = Attributes::default();
        let ro = file_attr(2, ActionSet::new(&[Action::Read]), &attr, 0, 0);
        assert_eq!(ro.perm, 0o444);
        let rw = file_attr(
            3,
            ActionSet::new(&[Action::Read, Action::Write]),
            &attr,
            0,
            0,
        );
        assert_eq!(rw.perm, 0o644);
    }

    #[test]
    fn test_size_flows_into_attr() {
        let attr = Attributes {
            size: Some(1024),
            mtime: Some(UNIX_EPOCH + Duration::from_secs(100)),
            ..Default::default()
        };
        let fa = file_attr(4, ActionSet::new(&[Action::Read]), &attr, 0, 0);
        assert_eq!(fa.size, 1024);
        assert_eq!(fa.blocks, 2);
        assert_eq!(fa.mtime, UNIX_EPOCH + Duration::from_secs(100));
        // Unset atime falls back to mtime.
        assert_eq!(fa.atime, fa.mtime);
    }

    #[test]
    fn test_slice_window() {
        let data = b"hello world";
        assert_eq!(slice_window(data, 0, 5), b"hello");
        assert_eq!(slice_window(data, 6, 100), b"world");
        assert_eq!(slice_window(data, 100, 5), b"");
        assert_eq!(slice_window(data, -1, 5), b"hello");
    }

    #[test]
    fn test_attr_validity_prefers_entry_value() {
        let fallback = Duration::from_secs(1);
        assert_eq!(attr_validity(&Attributes::default(), fallback), fallback);
        let attr = Attributes {
            valid: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(attr_validity(&attr, fallback), Duration::from_secs(30));
    }
}
