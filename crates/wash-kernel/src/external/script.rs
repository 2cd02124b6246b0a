//! Plugin subprocess invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::ctx::Context;
use wash_types::{WashError, WashResult};

/// How a plugin executable is driven.
///
/// The runtime talks to plugins exclusively through this trait so tests can
/// substitute [`testing::FakeScript`](super::testing::FakeScript) for the
/// real executable.
#[async_trait]
pub trait PluginScript: Send + Sync {
    /// Path of the plugin executable (for diagnostics).
    fn path(&self) -> &Path;

    /// Run to completion with no stdin; return stdout.
    ///
    /// A non-zero exit is a `PluginError` carrying the subprocess stderr.
    async fn invoke_and_wait(&self, ctx: &Context, args: &[String]) -> WashResult<Vec<u8>>;

    /// Run to completion feeding `input` on stdin; return stdout.
    async fn invoke_with_input(
        &self,
        ctx: &Context,
        args: &[String],
        input: Bytes,
    ) -> WashResult<Vec<u8>>;

    /// Start the subprocess and hand the caller its live pipes.
    ///
    /// Used by the streaming protocols (`stream`, `exec`) that consume
    /// stdout incrementally.
    async fn spawn(&self, ctx: &Context, args: &[String], want_stdin: bool)
        -> WashResult<PluginProcess>;
}

/// Shared limits on plugin subprocesses.
///
/// The semaphore bounds concurrent invocations across every plugin; an
/// acquirer waiting for a permit honors its context's cancellation. The
/// grace period is the gap between SIGTERM and SIGKILL when a subprocess
/// must be terminated.
pub struct SpawnLimits {
    semaphore: Arc<Semaphore>,
    grace: Duration,
}

impl SpawnLimits {
    pub fn new(max_concurrent: usize, grace: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    async fn acquire(&self, ctx: &Context) -> WashResult<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(WashError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                Ok(permit.expect("spawn semaphore closed"))
            }
        }
    }
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self::new(32, Duration::from_secs(3))
    }
}

/// SIGTERM the child, then SIGKILL once the grace period passes.
async fn terminate(mut child: Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(grace) => {
            debug!(pid, "plugin ignored SIGTERM, escalating to SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// The real [`PluginScript`]: a single executable on disk.
pub struct PluginExecutable {
    path: PathBuf,
    limits: Arc<SpawnLimits>,
}

impl PluginExecutable {
    pub fn new(path: impl Into<PathBuf>, limits: Arc<SpawnLimits>) -> Self {
        Self {
            path: path.into(),
            limits,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        ctx: &Context,
        args: &[String],
        input: Option<Bytes>,
    ) -> WashResult<Vec<u8>> {
        let _permit = self.limits.acquire(ctx).await?;

        let mut cmd = self.command(args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        debug!(exe = %self.path.display(), ?args, "invoking plugin");
        let mut child = cmd.spawn().map_err(|e| {
            WashError::Transient(format!("failed to spawn {}: {}", self.path.display(), e))
        })?;

        if let Some(data) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // Concurrent write so a chatty child cannot deadlock us.
                tokio::spawn(async move {
                    let _ = stdin.write_all(&data).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_to_end(stdout_pipe));
        let stderr_task = tokio::spawn(read_to_end(stderr_pipe));

        let waited = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let status = match waited {
            None => {
                terminate(child, self.limits.grace()).await;
                return Err(WashError::Cancelled);
            }
            Some(status) => status.map_err(|e| {
                WashError::Transient(format!("failed to wait for plugin: {}", e))
            })?,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            Err(plugin_failure(&status, &stderr))
        }
    }
}

async fn read_to_end(pipe: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn plugin_failure(status: &std::process::ExitStatus, stderr: &[u8]) -> WashError {
    let message = String::from_utf8_lossy(stderr).trim().to_string();
    if message.is_empty() {
        WashError::Plugin(format!("plugin exited with {}", status))
    } else {
        WashError::Plugin(message)
    }
}

#[async_trait]
impl PluginScript for PluginExecutable {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn invoke_and_wait(&self, ctx: &Context, args: &[String]) -> WashResult<Vec<u8>> {
        self.run(ctx, args, None).await
    }

    async fn invoke_with_input(
        &self,
        ctx: &Context,
        args: &[String],
        input: Bytes,
    ) -> WashResult<Vec<u8>> {
        self.run(ctx, args, Some(input)).await
    }

    async fn spawn(
        &self,
        ctx: &Context,
        args: &[String],
        want_stdin: bool,
    ) -> WashResult<PluginProcess> {
        let permit = self.limits.acquire(ctx).await?;

        let mut cmd = self.command(args);
        cmd.stdin(if want_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        debug!(exe = %self.path.display(), ?args, "spawning plugin");
        let mut child = cmd.spawn().map_err(|e| {
            WashError::Transient(format!("failed to spawn {}: {}", self.path.display(), e))
        })?;

        let stdout: Box<dyn AsyncRead + Send + Sync + Unpin> = Box::new(
            child
                .stdout
                .take()
                .ok_or_else(|| WashError::Transient("plugin stdout not captured".into()))?,
        );
        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Sync + Unpin>);
        let stderr = child.stderr.take();

        Ok(PluginProcess {
            stdout: Some(stdout),
            stdin,
            backend: ProcBackend::Child {
                child: Some(child),
                stderr,
                grace: self.limits.grace(),
                _permit: permit,
            },
        })
    }
}

/// A spawned plugin subprocess with live pipes.
///
/// Backed either by a real child process or, in tests, by in-memory pipes.
pub struct PluginProcess {
    stdout: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    stdin: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    backend: ProcBackend,
}

enum ProcBackend {
    Child {
        /// `None` once moved into a background termination task.
        child: Option<Child>,
        stderr: Option<ChildStderr>,
        grace: Duration,
        _permit: OwnedSemaphorePermit,
    },
    Fake {
        exit_code: i32,
        stderr: Vec<u8>,
    },
}

impl PluginProcess {
    /// An in-memory process for tests: canned stdout, exit code, stderr.
    pub fn fake(stdout: Vec<u8>, exit_code: i32, stderr: Vec<u8>) -> Self {
        Self {
            stdout: Some(Box::new(std::io::Cursor::new(stdout))),
            stdin: None,
            backend: ProcBackend::Fake { exit_code, stderr },
        }
    }

    /// Attach a stdin sink to a fake process.
    pub fn fake_with_stdin(mut self) -> Self {
        self.stdin = Some(Box::new(tokio::io::sink()));
        self
    }

    /// Take the stdout pipe. Panics if taken twice.
    pub fn take_stdout(&mut self) -> Box<dyn AsyncRead + Send + Sync + Unpin> {
        self.stdout.take().expect("stdout already taken")
    }

    pub fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Sync + Unpin>> {
        self.stdin.take()
    }

    /// Wait for exit; returns the exit code and collected stderr.
    ///
    /// Honors the context: cancellation terminates the subprocess and
    /// returns `Cancelled`.
    pub async fn wait(&mut self, ctx: &Context) -> WashResult<(i32, Vec<u8>)> {
        match &mut self.backend {
            ProcBackend::Fake { exit_code, stderr } => Ok((*exit_code, std::mem::take(stderr))),
            ProcBackend::Child {
                child: child_slot,
                stderr,
                grace,
                ..
            } => {
                let grace = *grace;
                let Some(child) = child_slot.as_mut() else {
                    return Err(WashError::Transient("plugin process already released".into()));
                };
                let stderr_task = tokio::spawn(read_to_end(stderr.take()));
                let waited = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => None,
                    status = child.wait() => Some(status),
                };
                let status = match waited {
                    None => {
                        if let Some(child) = child_slot.take() {
                            terminate(child, grace).await;
                        }
                        return Err(WashError::Cancelled);
                    }
                    Some(status) => status.map_err(|e| {
                        WashError::Transient(format!("failed to wait for plugin: {}", e))
                    })?,
                };
                let stderr = stderr_task.await.unwrap_or_default();
                Ok((status.code().unwrap_or(-1), stderr))
            }
        }
    }

    /// Begin SIGTERM → SIGKILL escalation without waiting for it.
    ///
    /// Used by stream close hooks, which are synchronous.
    pub fn terminate_now(&mut self) {
        if let ProcBackend::Child { child, grace, .. } = &mut self.backend {
            let Some(mut child) = child.take() else {
                return;
            };
            let Some(pid) = child.id() else {
                return;
            };
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let grace = *grace;
            // Escalation needs a runtime to sleep on; without one, kill
            // immediately (kill_on_drop still reaps).
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        tokio::select! {
                            _ = child.wait() => {}
                            _ = tokio::time::sleep(grace) => {
                                debug!(pid, "stream plugin ignored SIGTERM, sending SIGKILL");
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                            }
                        }
                    });
                }
                Err(_) => {
                    let _ = child.start_kill();
                }
            }
        }
    }
}
