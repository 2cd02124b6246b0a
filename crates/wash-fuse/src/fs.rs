//! The fuser filesystem bridging VFS callbacks into the registry.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fuser::{
    FileType, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyWrite, Request,
};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::convert::{
    attr_validity, error_to_errno, executable_name, file_attr, file_type, slice_window,
};
use crate::inode::{InodeTable, ROOT_INO};
use wash_kernel::{Context, Entry, EntryRef, JournalId, Registry, StreamHandle};
use wash_types::{Action, EntryPath, WashError, WashResult};

/// Tunables for the adapter.
#[derive(Debug, Clone)]
pub struct WashFsOptions {
    /// Validity reported to the kernel when an entry carries no `valid`
    /// attribute.
    pub attr_ttl: Duration,
    /// Deadline applied to each VFS-originated capability call.
    pub call_deadline: Duration,
}

impl Default for WashFsOptions {
    fn default() -> Self {
        Self {
            attr_ttl: Duration::from_secs(1),
            call_deadline: Duration::from_secs(30),
        }
    }
}

enum HandleKind {
    /// Reads go through the cached `read` capability.
    Direct,
    /// Size-unknown file served by a buffered `stream`.
    Stream {
        stream: StreamHandle,
        buffer: Vec<u8>,
        eof: bool,
    },
    /// Writable handle accumulating content, flushed via `write`.
    Write { buffer: Vec<u8>, dirty: bool },
}

struct FileHandle {
    path: EntryPath,
    kind: HandleKind,
}

/// The FUSE-facing filesystem.
pub struct WashFs {
    registry: Arc<Registry>,
    rt: tokio::runtime::Handle,
    options: WashFsOptions,
    inodes: InodeTable,
    // Lock per handle: a stalled stream must not serialize unrelated I/O.
    handles: Mutex<HashMap<u64, Arc<Mutex<FileHandle>>>>,
    next_fh: AtomicU64,
    comm_cache: Mutex<HashMap<u32, String>>,
    uid: u32,
    gid: u32,
}

impl WashFs {
    pub fn new(
        registry: Arc<Registry>,
        rt: tokio::runtime::Handle,
        options: WashFsOptions,
    ) -> Self {
        Self {
            registry,
            rt,
            options,
            inodes: InodeTable::new(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            comm_cache: Mutex::new(HashMap::new()),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    /// Per-request context: deadline plus a journal id derived from the
    /// calling process, so one user command maps to one journal.
    fn ctx_for(&self, req: &Request<'_>) -> Context {
        Context::background()
            .with_timeout(self.options.call_deadline)
            .with_journal(self.journal_id(req.pid()))
    }

    fn journal_id(&self, pid: u32) -> JournalId {
        if pid == 0 {
            return JournalId::new("kernel");
        }
        let mut cache = self.comm_cache.lock();
        if cache.len() > 4096 {
            cache.clear();
        }
        let name = cache
            .entry(pid)
            .or_insert_with(|| executable_name(pid).unwrap_or_else(|| "unknown".to_string()));
        JournalId::for_process(pid, name)
    }

    fn resolve_ino(&self, ctx: &Context, ino: u64) -> Result<EntryRef, libc::c_int> {
        let path = self.inodes.path_of(ino).ok_or(libc::ESTALE)?;
        self.rt
            .block_on(self.registry.resolve(ctx, &path))
            .map_err(|e| error_to_errno(&e))
    }

    fn lookup_child(
        &self,
        ctx: &Context,
        parent_ino: u64,
        name: &str,
    ) -> Result<EntryRef, libc::c_int> {
        let parent_path = self.inodes.path_of(parent_ino).ok_or(libc::ESTALE)?;
        let found: WashResult<EntryRef> = self.rt.block_on(async {
            let parent = self.registry.resolve(ctx, &parent_path).await?;
            let children = self.registry.list(ctx, &parent).await?;
            children
                .iter()
                .find(|c| c.name() == name)
                .cloned()
                .ok_or_else(|| WashError::NotFound(parent_path.join(name)))
        });
        found.map_err(|e| error_to_errno(&e))
    }

    fn alloc_fh(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .insert(fh, Arc::new(Mutex::new(handle)));
        fh
    }

    fn handle_for(&self, fh: u64) -> Option<Arc<Mutex<FileHandle>>> {
        self.handles.lock().get(&fh).cloned()
    }

    fn flush_handle(&self, ctx: &Context, handle: &mut FileHandle) -> Result<(), libc::c_int> {
        let HandleKind::Write { buffer, dirty } = &mut handle.kind else {
            return Ok(());
        };
        if !*dirty {
            return Ok(());
        }
        let path = handle.path.clone();
        let data = Bytes::from(buffer.clone());
        let result: WashResult<()> = self.rt.block_on(async {
            let entry = self.registry.resolve(ctx, &path).await?;
            self.registry.write(ctx, &entry, data).await
        });
        match result {
            Ok(()) => {
                *dirty = false;
                Ok(())
            }
            Err(e) => Err(error_to_errno(&e)),
        }
    }
}

/// Decide how an opened file is served.
///
/// Size-known readable entries ride the cached `read`; size-unknown ones
/// prefer a buffered `stream` when available. Writes require the `write`
/// capability.
fn open_strategy(
    actions: wash_types::ActionSet,
    size_known: bool,
    write_requested: bool,
) -> Result<OpenKind, libc::c_int> {
    if write_requested {
        if actions.contains(Action::Write) {
            return Ok(OpenKind::Write);
        }
        return Err(libc::EROFS);
    }
    if size_known && actions.contains(Action::Read) {
        return Ok(OpenKind::Direct);
    }
    if actions.contains(Action::Stream) {
        return Ok(OpenKind::Stream);
    }
    if actions.contains(Action::Read) {
        return Ok(OpenKind::Direct);
    }
    Err(libc::ENOTSUP)
}

#[derive(Debug, PartialEq, Eq)]
enum OpenKind {
    Direct,
    Stream,
    Write,
}

/// Copy `data` into `buffer` at `offset`, zero-filling any gap.
fn write_at(buffer: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    buffer[offset..end].copy_from_slice(data);
}

impl fuser::Filesystem for WashFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let ctx = self.ctx_for(req);
        match self.lookup_child(&ctx, parent, name) {
            Ok(child) => {
                let ino = self.inodes.assign(child.path(), true);
                let attrs = child.attributes();
                let ttl = attr_validity(&attrs, self.options.attr_ttl);
                let attr = file_attr(ino, child.supported_actions(), &attrs, self.uid, self.gid);
                reply.entry(&ttl, &attr, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ctx = self.ctx_for(req);
        match self.resolve_ino(&ctx, ino) {
            Ok(entry) => {
                let attrs = entry.attributes();
                let ttl = attr_validity(&attrs, self.options.attr_ttl);
                let attr = file_attr(ino, entry.supported_actions(), &attrs, self.uid, self.gid);
                reply.attr(&ttl, &attr);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = self.ctx_for(req);
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        let listed: WashResult<Arc<Vec<EntryRef>>> = self.rt.block_on(async {
            let entry = self.registry.resolve(&ctx, &path).await?;
            self.registry.list(&ctx, &entry).await
        });
        let children = match listed {
            Ok(children) => children,
            Err(e) => {
                reply.error(error_to_errno(&e));
                return;
            }
        };

        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.assign(&parent, false),
            None => ROOT_INO,
        };
        let mut rows: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children.iter() {
            rows.push((
                self.inodes.assign(child.path(), false),
                file_type(child.supported_actions()),
                child.name().to_string(),
            ));
        }

        for (i, (row_ino, kind, name)) in rows.into_iter().enumerate().skip(offset as usize) {
            if reply.add(row_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = self.ctx_for(req);
        let entry = match self.resolve_ino(&ctx, ino) {
            Ok(entry) => entry,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let attrs = entry.attributes();
        let accmode = flags & libc::O_ACCMODE;
        let write_requested = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
        let strategy = match open_strategy(
            entry.supported_actions(),
            attrs.size.is_some(),
            write_requested,
        ) {
            Ok(strategy) => strategy,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let kind = match strategy {
            OpenKind::Direct => HandleKind::Direct,
            OpenKind::Stream => {
                let opened = self.rt.block_on(self.registry.stream(&ctx, &entry));
                match opened {
                    Ok(stream) => HandleKind::Stream {
                        stream,
                        buffer: Vec::new(),
                        eof: false,
                    },
                    Err(e) => {
                        reply.error(error_to_errno(&e));
                        return;
                    }
                }
            }
            OpenKind::Write => {
                let truncate = flags & libc::O_TRUNC != 0;
                let buffer = if truncate || !entry.supported_actions().contains(Action::Read) {
                    Vec::new()
                } else {
                    match self.rt.block_on(self.registry.read(&ctx, &entry)) {
                        Ok(bytes) => bytes.to_vec(),
                        Err(e) => {
                            reply.error(error_to_errno(&e));
                            return;
                        }
                    }
                };
                HandleKind::Write {
                    buffer,
                    dirty: false,
                }
            }
        };

        // Size-unknown and writable handles bypass the page cache so the
        // kernel does not clamp reads to a stale size attribute.
        let direct_io = attrs.size.is_none() || matches!(kind, HandleKind::Write { .. });
        let fh = self.alloc_fh(FileHandle {
            path: self.inodes.path_of(ino).unwrap_or_else(EntryPath::root),
            kind,
        });
        let open_flags = if direct_io {
            fuser::consts::FOPEN_DIRECT_IO
        } else {
            0
        };
        reply.opened(fh, open_flags);
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ctx = self.ctx_for(req);
        let Some(cell) = self.handle_for(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = cell.lock();

        match &mut handle.kind {
            HandleKind::Direct => {
                let path = handle.path.clone();
                let fetched: WashResult<Bytes> = self.rt.block_on(async {
                    let entry = self.registry.resolve(&ctx, &path).await?;
                    self.registry.read(&ctx, &entry).await
                });
                match fetched {
                    Ok(bytes) => reply.data(slice_window(&bytes, offset, size)),
                    Err(e) => reply.error(error_to_errno(&e)),
                }
            }
            HandleKind::Stream {
                stream,
                buffer,
                eof,
            } => {
                let wanted = offset.max(0) as usize + size as usize;
                while buffer.len() < wanted && !*eof {
                    let mut chunk = [0u8; 16 * 1024];
                    let read = self
                        .rt
                        .block_on(ctx.run(async {
                            stream.reader().read(&mut chunk).await.map_err(|e| {
                                WashError::Transient(format!("stream read failed: {}", e))
                            })
                        }));
                    match read {
                        Ok(0) => *eof = true,
                        Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            reply.error(error_to_errno(&e));
                            return;
                        }
                    }
                }
                reply.data(slice_window(buffer, offset, size));
            }
            HandleKind::Write { buffer, .. } => {
                reply.data(slice_window(buffer, offset, size));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(cell) = self.handle_for(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = cell.lock();
        match &mut handle.kind {
            HandleKind::Write { buffer, dirty } => {
                write_at(buffer, offset.max(0) as usize, data);
                *dirty = true;
                reply.written(data.len() as u32);
            }
            _ => reply.error(libc::EBADF),
        }
    }

    fn flush(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let ctx = self.ctx_for(req);
        let Some(cell) = self.handle_for(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = cell.lock();
        match self.flush_handle(&ctx, &mut handle) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = self.ctx_for(req);
        if let Some(cell) = self.handles.lock().remove(&fh) {
            let mut handle = cell.lock();
            // Dirty writes flush best-effort; stream handles release their
            // subprocess.
            if let Err(errno) = self.flush_handle(&ctx, &mut handle) {
                warn!(path = %handle.path, errno, "flush on release failed");
            }
            if let HandleKind::Stream { stream, .. } =
                std::mem::replace(&mut handle.kind, HandleKind::Direct)
            {
                debug!(path = %handle.path, "closing stream handle");
                stream.close();
            }
        }
        reply.ok();
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let ctx = self.ctx_for(req);
        match self.lookup_child(&ctx, parent, name) {
            Ok(child) => {
                let deleted = self.rt.block_on(self.registry.delete(&ctx, &child));
                match deleted {
                    Ok(()) => reply.ok(),
                    Err(e) => reply.error(error_to_errno(&e)),
                }
            }
            Err(errno) => reply.error(errno),
        }
    }
}
