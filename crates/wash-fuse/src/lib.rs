//! FUSE adapter for wash.
//!
//! Projects the registry's entry tree onto the kernel VFS: `lookup`,
//! `getattr`, and `readdir` ride the cached `list`; file reads use `read`
//! when the size is known and a buffered `stream` otherwise; `write` and
//! `unlink` map to the mutating capabilities. Every kernel request is
//! tagged with a journal id derived from the calling pid and executable so
//! one user command yields one journal.

mod convert;
mod fs;
mod inode;

pub use fs::{WashFs, WashFsOptions};

use std::path::Path;
use std::sync::Arc;

use fuser::MountOption;

use wash_kernel::Registry;

/// Mount the registry at `mountpoint` and serve until unmounted.
///
/// Blocks the calling thread for the life of the mount. An error return
/// means the session could not be attached (missing kernel support,
/// insufficient privileges, bad mountpoint); the host binary reports this
/// case with exit code 255.
pub fn mount(
    registry: Arc<Registry>,
    rt: tokio::runtime::Handle,
    mountpoint: &Path,
    options: WashFsOptions,
) -> std::io::Result<()> {
    let fs = WashFs::new(registry, rt, options);
    let mount_options = [
        MountOption::FSName("wash".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(fs, mountpoint, &mount_options)
}
