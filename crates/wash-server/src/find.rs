//! Depth-first traversal with predicates.
//!
//! `find` walks the entry tree through the registry (so every `list` rides
//! the cache) and filters by name and metadata. Metadata is pulled lazily:
//! only entries that pass the cheap predicates and only when a metadata
//! predicate is present.

use std::sync::Arc;

use regex::Regex;

use wash_kernel::{Context, Entry, EntryRef, Registry};
use wash_types::{Action, EntryPath, WashError, WashResult};

/// One `key=value` test against an entry's metadata.
///
/// The key addresses a top-level metadata field; the value is compared
/// against the field's JSON rendering (strings compare without quotes).
#[derive(Debug, Clone)]
pub struct MetaPredicate {
    pub key: String,
    pub value: String,
}

impl MetaPredicate {
    fn matches(&self, metadata: &wash_types::MetadataMap) -> bool {
        match metadata.get(&self.key) {
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

/// Options for one traversal.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum depth below the start entry; `None` is unbounded.
    pub maxdepth: Option<usize>,
    /// Entry-name filter.
    pub name: Option<Regex>,
    /// Metadata predicates; all must hold.
    pub meta: Vec<MetaPredicate>,
}

/// Walk depth-first from `start`, returning matches in traversal order.
pub async fn find(
    ctx: &Context,
    registry: &Registry,
    start: &EntryPath,
    options: &FindOptions,
) -> WashResult<Vec<EntryRef>> {
    let root = registry.resolve(ctx, start).await?;
    let mut matches = Vec::new();
    // Depth-first: children are pushed in reverse so the stack pops them
    // in provider order.
    let mut stack: Vec<(EntryRef, usize)> = vec![(root, 0)];

    while let Some((entry, depth)) = stack.pop() {
        if matches_entry(ctx, registry, &entry, options).await? {
            matches.push(entry.clone());
        }

        let descend = options.maxdepth.map_or(true, |max| depth < max);
        if descend && entry.supported_actions().contains(Action::List) {
            let children = registry.list(ctx, &entry).await?;
            for child in children.iter().rev() {
                stack.push((child.clone(), depth + 1));
            }
        }
    }
    Ok(matches)
}

async fn matches_entry(
    ctx: &Context,
    registry: &Registry,
    entry: &EntryRef,
    options: &FindOptions,
) -> WashResult<bool> {
    if let Some(name) = &options.name {
        if !name.is_match(entry.name()) {
            return Ok(false);
        }
    }
    if options.meta.is_empty() {
        return Ok(true);
    }
    if !entry.supported_actions().contains(Action::Metadata) {
        return Ok(false);
    }
    let metadata: Arc<wash_types::MetadataMap> = match registry.metadata(ctx, entry).await {
        Ok(metadata) => metadata,
        // An entry that cannot produce metadata simply does not match;
        // the traversal continues.
        Err(WashError::Plugin(_)) | Err(WashError::Decode(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(options.meta.iter().all(|p| p.matches(&metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_predicate_string_comparison() {
        let mut metadata = wash_types::MetadataMap::new();
        metadata.insert("state".into(), serde_json::json!("running"));
        metadata.insert("replicas".into(), serde_json::json!(3));

        let p = MetaPredicate {
            key: "state".into(),
            value: "running".into(),
        };
        assert!(p.matches(&metadata));

        let p = MetaPredicate {
            key: "replicas".into(),
            value: "3".into(),
        };
        assert!(p.matches(&metadata), "non-string values compare by JSON rendering");

        let p = MetaPredicate {
            key: "state".into(),
            value: "stopped".into(),
        };
        assert!(!p.matches(&metadata));

        let p = MetaPredicate {
            key: "missing".into(),
            value: "".into(),
        };
        assert!(!p.matches(&metadata));
    }
}
