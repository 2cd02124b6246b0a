//! Entries backed by an external plugin executable.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::decode::{decode_entry_list, DecodedEntry};
use super::exec::decode_exec_chunks;
use super::script::PluginScript;
use crate::cache::CacheConfig;
use crate::ctx::Context;
use crate::entry::{Entry, EntryRef, StreamHandle};
use wash_types::{
    Action, ActionSet, Attributes, EntryPath, ExecCommand, ExecOutcome, MetadataMap, WashError,
    WashResult,
};

/// An entry served by a plugin subprocess.
///
/// Everything about the entry (name, supported actions, attributes, cache
/// TTLs, the opaque state token) came from its parent's `list` output. The
/// runtime passes the state token back unmodified on every invocation so
/// plugins can avoid re-deriving context.
pub struct ExternalEntry {
    name: String,
    path: EntryPath,
    actions: ActionSet,
    state: String,
    attr: Attributes,
    cache_config: CacheConfig,
    partial_metadata: Option<MetadataMap>,
    script: Arc<dyn PluginScript>,
}

impl std::fmt::Debug for ExternalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalEntry")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("actions", &self.actions)
            .field("state", &self.state)
            .field("attr", &self.attr)
            .field("cache_config", &self.cache_config)
            .field("partial_metadata", &self.partial_metadata)
            .finish()
    }
}

impl ExternalEntry {
    /// The root entry for a mounted plugin: a listable directory named after
    /// the mount, with no state yet.
    pub fn plugin_root(name: &str, script: Arc<dyn PluginScript>) -> Self {
        Self {
            name: name.to_string(),
            path: EntryPath::root().join(name),
            actions: ActionSet::new(&[Action::List]),
            state: String::new(),
            attr: Attributes::default(),
            cache_config: CacheConfig::new(),
            partial_metadata: None,
            script,
        }
    }

    /// Validate a decoded descriptor into an entry.
    ///
    /// Cache TTLs the descriptor leaves unspecified inherit the parent's;
    /// specified TTLs override. The state token defaults to empty.
    pub fn from_decoded(
        decoded: DecodedEntry,
        parent_path: &EntryPath,
        parent_config: &CacheConfig,
        script: Arc<dyn PluginScript>,
    ) -> WashResult<Self> {
        let name = decoded
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| WashError::decode("entry descriptor is missing the name field"))?;

        let action_names = decoded.supported_actions.unwrap_or_default();
        if action_names.is_empty() {
            return Err(WashError::decode(format!(
                "entry {:?} declares no supported actions",
                name
            )));
        }
        let actions = ActionSet::from_names(&action_names)
            .map_err(|e| WashError::decode(format!("entry {:?}: {}", name, e)))?;

        let attr = decoded
            .attributes
            .as_ref()
            .map(|a| a.to_attributes())
            .transpose()?
            .unwrap_or_default();
        if attr.size.is_some_and(|s| s > 0) && !actions.contains(Action::Read) {
            return Err(WashError::decode(format!(
                "entry {:?} reports a size but does not support read",
                name
            )));
        }

        let cache_config = decoded
            .cache_ttls
            .map(|ttls| ttls.to_cache_config(parent_config))
            .unwrap_or_else(|| parent_config.clone());

        Ok(Self {
            path: parent_path.join(&name),
            name,
            actions,
            state: decoded.state.unwrap_or_default(),
            attr,
            cache_config,
            partial_metadata: decoded.partial_metadata,
            script,
        })
    }

    /// The opaque token carried between invocations.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Standard argument vector: `<action> <path> <state> [extra...]`.
    fn args(&self, action: &str, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            action.to_string(),
            self.path.to_string(),
            self.state.clone(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }
}

fn plugin_failure(exit_code: i32, stderr: &[u8]) -> WashError {
    let message = String::from_utf8_lossy(stderr).trim().to_string();
    if message.is_empty() {
        WashError::Plugin(format!("plugin exited with code {}", exit_code))
    } else {
        WashError::Plugin(message)
    }
}

#[async_trait]
impl Entry for ExternalEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &EntryPath {
        &self.path
    }

    fn supported_actions(&self) -> ActionSet {
        self.actions
    }

    fn attributes(&self) -> Attributes {
        self.attr.clone()
    }

    fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    fn partial_metadata(&self) -> Option<&MetadataMap> {
        self.partial_metadata.as_ref()
    }

    async fn list(&self, ctx: &Context) -> WashResult<Vec<EntryRef>> {
        let stdout = self
            .script
            .invoke_and_wait(ctx, &self.args("list", &[]))
            .await?;
        let decoded = decode_entry_list(&stdout)?;
        decoded
            .into_iter()
            .map(|d| {
                Self::from_decoded(d, &self.path, &self.cache_config, self.script.clone())
                    .map(|entry| Arc::new(entry) as EntryRef)
            })
            .collect()
    }

    async fn read(&self, ctx: &Context) -> WashResult<Bytes> {
        let stdout = self
            .script
            .invoke_and_wait(ctx, &self.args("read", &[]))
            .await?;
        let bytes = Bytes::from(stdout);

        // The size attribute is authoritative when present: longer output is
        // truncated to it, shorter output is a decode failure.
        match self.attr.size {
            Some(size) if (bytes.len() as u64) < size => Err(WashError::decode(format!(
                "read returned {} bytes but the size attribute says {}",
                bytes.len(),
                size
            ))),
            Some(size) if (bytes.len() as u64) > size => Ok(bytes.slice(0..size as usize)),
            _ => Ok(bytes),
        }
    }

    async fn metadata(&self, ctx: &Context) -> WashResult<MetadataMap> {
        let stdout = self
            .script
            .invoke_and_wait(ctx, &self.args("metadata", &[]))
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            WashError::decode(format!("plugin stdout is not a JSON object: {}", e))
        })
    }

    async fn stream(&self, ctx: &Context) -> WashResult<StreamHandle> {
        let mut proc = self
            .script
            .spawn(ctx, &self.args("stream", &[]), false)
            .await?;
        let mut reader = BufReader::new(proc.take_stdout());

        // The plugin signals a successfully established stream with a
        // `200\n` header; anything before that is a setup failure.
        let mut header = String::new();
        let read = ctx
            .run(async {
                reader.read_line(&mut header).await.map_err(|e| {
                    WashError::Transient(format!("failed to read stream header: {}", e))
                })
            })
            .await;
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                proc.terminate_now();
                return Err(e);
            }
        };

        if n == 0 {
            let (exit_code, stderr) = proc.wait(ctx).await?;
            return Err(if exit_code != 0 {
                plugin_failure(exit_code, &stderr)
            } else {
                WashError::decode("plugin stdout closed before the stream header")
            });
        }
        let status = header.trim();
        if status != "200" {
            proc.terminate_now();
            return Err(WashError::decode(format!(
                "unexpected stream header {:?}",
                status
            )));
        }

        Ok(StreamHandle::new(
            Box::new(reader),
            Box::new(move || {
                let mut proc = proc;
                proc.terminate_now();
            }),
        ))
    }

    async fn exec(&self, ctx: &Context, cmd: ExecCommand) -> WashResult<ExecOutcome> {
        let argv = serde_json::to_string(&cmd.args)
            .map_err(|e| WashError::Transient(format!("failed to encode argv: {}", e)))?;
        let opts = serde_json::json!({ "tty": cmd.tty }).to_string();
        let args = self.args("exec", &[&cmd.command, &argv, &opts]);

        let mut proc = self.script.spawn(ctx, &args, cmd.stdin.is_some()).await?;
        if let Some(data) = cmd.stdin {
            if let Some(mut stdin) = proc.take_stdin() {
                // Concurrent write so a chatty remote command cannot
                // deadlock against our chunk reads.
                tokio::spawn(async move {
                    let _ = stdin.write_all(&data).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let mut reader = BufReader::new(proc.take_stdout());
        let chunks = match ctx.run(decode_exec_chunks(&mut reader)).await {
            Ok(chunks) => chunks,
            Err(e) => {
                proc.terminate_now();
                return Err(e);
            }
        };

        let (plugin_exit, stderr) = proc.wait(ctx).await?;
        if plugin_exit != 0 {
            return Err(plugin_failure(plugin_exit, &stderr));
        }
        match chunks.exit_code {
            Some(exit_code) => Ok(ExecOutcome {
                stdout: chunks.stdout,
                stderr: chunks.stderr,
                exit_code,
            }),
            None => Err(WashError::decode(
                "plugin stdout ended without an exit_code chunk",
            )),
        }
    }

    async fn write(&self, ctx: &Context, data: Bytes) -> WashResult<()> {
        self.script
            .invoke_with_input(ctx, &self.args("write", &[]), data)
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context) -> WashResult<()> {
        self.script
            .invoke_and_wait(ctx, &self.args("delete", &[]))
            .await?;
        Ok(())
    }

    async fn signal(&self, ctx: &Context, signal: &str) -> WashResult<()> {
        self.script
            .invoke_and_wait(ctx, &self.args("signal", &[signal]))
            .await?;
        Ok(())
    }
}
