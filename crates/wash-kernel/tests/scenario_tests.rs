//! End-to-end scenarios through the registry, cache, and plugin runtime.
//!
//! These tests drive the full dispatch path (registry, cache, external
//! entry, fake plugin script) and verify the coherence contracts:
//! single-flight coalescing, TTL expiry, mutation invalidation, and
//! resolution stopping at the first unmatched segment.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use wash_kernel::external::testing::FakeScript;
use wash_kernel::external::{DecodedCacheTtls, DecodedEntry};
use wash_kernel::{
    Action, CacheConfig, Context, Entry, EntryPath, ExecCommand, ExternalEntry, Journal,
    Registry, WashError,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn registry_with_plugin(script: Arc<FakeScript>, mount: &str) -> (Registry, TempDir) {
    let dir = TempDir::new().unwrap();
    let journal = Arc::new(Journal::open(dir.path()).unwrap());
    let mut registry = Registry::new(journal);
    registry.mount(Arc::new(ExternalEntry::plugin_root(mount, script)));
    (registry, dir)
}

/// Build an external entry under `parent` with explicit actions and TTLs.
fn child_entry(
    script: Arc<FakeScript>,
    parent: &str,
    name: &str,
    actions: &[&str],
    ttls: DecodedCacheTtls,
) -> wash_kernel::EntryRef {
    let decoded = DecodedEntry {
        name: Some(name.to_string()),
        supported_actions: Some(actions.iter().map(|s| s.to_string()).collect()),
        cache_ttls: Some(ttls),
        ..Default::default()
    };
    Arc::new(
        ExternalEntry::from_decoded(
            decoded,
            &EntryPath::parse(parent),
            &CacheConfig::new(),
            script,
        )
        .unwrap(),
    )
}

// ============================================================================
// Listing and inheritance
// ============================================================================

#[tokio::test]
async fn test_list_yields_child_with_inherited_ttls() {
    let script = Arc::new(FakeScript::new());
    script.expect(
        &["list", "/foo", ""],
        Ok(br#"[{"name":"bar","supported_actions":["list"]}]"#.to_vec()),
    );
    let (registry, _dir) = registry_with_plugin(script, "foo");
    let ctx = Context::background();

    let foo = registry
        .resolve(&ctx, &EntryPath::parse("/foo"))
        .await
        .unwrap();
    let children = registry.list(&ctx, &foo).await.unwrap();

    assert_eq!(children.len(), 1);
    let bar = &children[0];
    assert_eq!(bar.path().as_str(), "/foo/bar");
    assert_eq!(
        bar.cache_config(),
        foo.cache_config(),
        "unspecified TTLs inherit the parent's configuration"
    );
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_invocation_until_expiry() {
    let script = Arc::new(FakeScript::new());
    let entry = child_entry(
        script.clone(),
        "/foo",
        "log",
        &["read"],
        DecodedCacheTtls {
            read: Some(5),
            ..Default::default()
        },
    );
    let (registry, _dir) = registry_with_plugin(script.clone(), "foo");
    let registry = Arc::new(registry);

    script.expect(&["read", "/foo/log", ""], Ok(b"contents".to_vec()));

    // Two concurrent reads: one plugin call, identical bytes.
    let a = {
        let registry = registry.clone();
        let entry = entry.clone();
        tokio::spawn(async move { registry.read(&Context::background(), &entry).await })
    };
    let b = {
        let registry = registry.clone();
        let entry = entry.clone();
        tokio::spawn(async move { registry.read(&Context::background(), &entry).await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
    assert_eq!(a, b);
    assert_eq!(a, Bytes::from_static(b"contents"));
    assert_eq!(script.calls().len(), 1);

    // Past the TTL the plugin is invoked again.
    tokio::time::advance(Duration::from_secs(6)).await;
    script.expect(&["read", "/foo/log", ""], Ok(b"contents".to_vec()));
    registry.read(&Context::background(), &entry).await.unwrap();
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test]
async fn test_write_invalidates_parent_list_and_own_metadata() {
    let script = Arc::new(FakeScript::new());
    let (registry, _dir) = registry_with_plugin(script.clone(), "foo");
    let ctx = Context::background();

    let bar = child_entry(
        script.clone(),
        "/foo",
        "bar",
        &["read", "write", "metadata"],
        DecodedCacheTtls::default(),
    );
    let foo = registry
        .resolve(&ctx, &EntryPath::parse("/foo"))
        .await
        .unwrap();

    // Prime both caches.
    script.expect(
        &["list", "/foo", ""],
        Ok(br#"[{"name":"bar","supported_actions":["read","write","metadata"]}]"#.to_vec()),
    );
    script.expect(&["metadata", "/foo/bar", ""], Ok(b"{}".to_vec()));
    registry.list(&ctx, &foo).await.unwrap();
    registry.metadata(&ctx, &bar).await.unwrap();
    assert_eq!(script.calls().len(), 2);

    // Cached: no further invocations.
    registry.list(&ctx, &foo).await.unwrap();
    registry.metadata(&ctx, &bar).await.unwrap();
    assert_eq!(script.calls().len(), 2);

    // A write invalidates both.
    script.expect(&["write", "/foo/bar", ""], Ok(Vec::new()));
    registry
        .write(&ctx, &bar, Bytes::from_static(b"data"))
        .await
        .unwrap();

    script.expect(
        &["list", "/foo", ""],
        Ok(br#"[{"name":"bar","supported_actions":["read","write","metadata"]}]"#.to_vec()),
    );
    script.expect(&["metadata", "/foo/bar", ""], Ok(b"{}".to_vec()));
    registry.list(&ctx, &foo).await.unwrap();
    registry.metadata(&ctx, &bar).await.unwrap();
    assert_eq!(script.calls().len(), 5);
}

// ============================================================================
// Exec failures
// ============================================================================

#[tokio::test]
async fn test_exec_failure_surfaces_stderr_and_caches_nothing() {
    let script = Arc::new(FakeScript::new());
    let (registry, _dir) = registry_with_plugin(script.clone(), "foo");

    let vm = child_entry(
        script.clone(),
        "/foo",
        "vm",
        &["exec"],
        DecodedCacheTtls::default(),
    );
    script.expect_spawn(
        &["exec", "/foo/vm", "", "reboot", "[]", "{\"tty\":false}"],
        b"",
        2,
        b"boom",
    );

    let err = registry
        .exec(
            &Context::background(),
            &vm,
            ExecCommand::new("reboot", vec![]),
        )
        .await
        .unwrap_err();
    assert!(matches!(&err, WashError::Plugin(msg) if msg == "boom"));
    assert_eq!(registry.cache().len(), 0);
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_resolution_stops_at_first_unmatched_segment() {
    let script = Arc::new(FakeScript::new());
    script.expect(
        &["list", "/a", ""],
        Ok(br#"[{"name":"x","supported_actions":["list"]}]"#.to_vec()),
    );
    let (registry, _dir) = registry_with_plugin(script.clone(), "a");

    let err = registry
        .resolve(&Context::background(), &EntryPath::parse("/a/b/c"))
        .await
        .unwrap_err();
    assert!(matches!(err, WashError::NotFound(p) if p.as_str() == "/a/b/c"));

    // Only /a was listed; nothing was invoked at /a/b.
    assert_eq!(script.calls(), vec![vec![
        "list".to_string(),
        "/a".to_string(),
        String::new()
    ]]);
}

// ============================================================================
// Capability gating
// ============================================================================

#[tokio::test]
async fn test_unsupported_action_never_reaches_the_plugin() {
    let script = Arc::new(FakeScript::new());
    let (registry, _dir) = registry_with_plugin(script.clone(), "foo");

    let listing_only = child_entry(
        script.clone(),
        "/foo",
        "dir",
        &["list"],
        DecodedCacheTtls::default(),
    );
    let err = registry
        .read(&Context::background(), &listing_only)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WashError::CapabilityUnsupported {
            action: Action::Read,
            ..
        }
    ));
    assert!(script.calls().is_empty());
    assert_eq!(registry.cache().len(), 0);
}

// ============================================================================
// Journaling
// ============================================================================

#[tokio::test]
async fn test_journal_ties_request_to_invocations() {
    let script = Arc::new(FakeScript::new());
    script.expect(
        &["list", "/foo", ""],
        Ok(br#"[{"name":"bar","supported_actions":["read"]}]"#.to_vec()),
    );
    let (registry, _dir) = registry_with_plugin(script.clone(), "foo");

    let id = wash_kernel::JournalId::for_process(1234, "ls");
    let ctx = Context::background().with_journal(id.clone());

    let foo = registry
        .resolve(&ctx, &EntryPath::parse("/foo"))
        .await
        .unwrap();
    registry.list(&ctx, &foo).await.unwrap();

    let content = registry.journal().read(&id).unwrap();
    assert!(content.contains("/foo"));
    assert!(content.contains("\"list\""));

    let listed = registry.journal().list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.as_str(), "1234-ls");
}
