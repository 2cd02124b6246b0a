//! Multiplexed stream following, `tail -f` style.
//!
//! Subscribes to `stream` for each requested entry and interleaves their
//! output on one writer, printing a `==> path <==` banner whenever the
//! source changes.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use wash_kernel::{Context, Registry};
use wash_types::{EntryPath, WashError, WashResult};

/// Follow `paths` until every stream ends or the context is cancelled.
pub async fn tail<W>(
    ctx: &Context,
    registry: &Registry,
    paths: &[EntryPath],
    out: &mut W,
) -> WashResult<()>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<(EntryPath, String)>(64);

    for path in paths {
        let entry = registry.resolve(ctx, path).await?;
        let handle = registry.stream(ctx, &entry).await?;
        let tx = tx.clone();
        let path = path.clone();
        let task_ctx = ctx.child();
        tokio::spawn(async move {
            let mut handle = handle;
            let mut reader = BufReader::new(handle.reader());
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    biased;
                    _ = task_ctx.cancelled() => break,
                    read = reader.read_line(&mut line) => read,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send((path.clone(), line.clone())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    // Only the per-stream tasks hold senders now; rx ends when they do.
    drop(tx);

    let banners = paths.len() > 1;
    let mut current: Option<EntryPath> = None;
    loop {
        let received = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(WashError::Cancelled),
            received = rx.recv() => received,
        };
        let Some((path, line)) = received else {
            return Ok(());
        };
        if banners && current.as_ref() != Some(&path) {
            let banner = format!("\n==> {} <==\n", path);
            out.write_all(banner.as_bytes())
                .await
                .map_err(|e| WashError::Transient(format!("tail write failed: {}", e)))?;
            current = Some(path);
        }
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| WashError::Transient(format!("tail write failed: {}", e)))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wash_kernel::external::testing::FakeScript;
    use wash_kernel::{ExternalEntry, Journal};

    fn registry_with(script: Arc<FakeScript>, mount: &str) -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Journal::open(dir.path()).unwrap());
        let mut registry = Registry::new(journal);
        registry.mount(Arc::new(ExternalEntry::plugin_root(mount, script)));
        (registry, dir)
    }

    #[tokio::test]
    async fn test_tail_single_stream_has_no_banner() {
        let script = Arc::new(FakeScript::new());
        script.expect(
            &["list", "/logs", ""],
            Ok(br#"[{"name":"app","supported_actions":["stream"]}]"#.to_vec()),
        );
        script.expect_spawn(&["stream", "/logs/app", ""], b"200\none\ntwo\n", 0, b"");
        let (registry, _dir) = registry_with(script, "logs");

        let mut out = Vec::new();
        tail(
            &Context::background(),
            &registry,
            &[EntryPath::parse("/logs/app")],
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(String::from_utf8_lossy(&out), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_tail_multiple_streams_print_banners() {
        let script = Arc::new(FakeScript::new());
        script.expect(
            &["list", "/logs", ""],
            Ok(
                br#"[{"name":"a","supported_actions":["stream"]},{"name":"b","supported_actions":["stream"]}]"#
                    .to_vec(),
            ),
        );
        script.expect_spawn(&["stream", "/logs/a", ""], b"200\nfrom a\n", 0, b"");
        script.expect_spawn(&["stream", "/logs/b", ""], b"200\nfrom b\n", 0, b"");
        let (registry, _dir) = registry_with(script, "logs");

        let mut out = Vec::new();
        tail(
            &Context::background(),
            &registry,
            &[EntryPath::parse("/logs/a"), EntryPath::parse("/logs/b")],
            &mut out,
        )
        .await
        .unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("==> /logs/a <=="));
        assert!(text.contains("from a"));
        assert!(text.contains("==> /logs/b <=="));
        assert!(text.contains("from b"));
    }

    #[tokio::test]
    async fn test_tail_missing_entry_fails_up_front() {
        let script = Arc::new(FakeScript::new());
        script.expect(&["list", "/logs", ""], Ok(b"[]".to_vec()));
        let (registry, _dir) = registry_with(script, "logs");

        let err = tail(
            &Context::background(),
            &registry,
            &[EntryPath::parse("/logs/missing")],
            &mut Vec::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WashError::NotFound(_)));
    }
}
