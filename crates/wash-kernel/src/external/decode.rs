//! Decoding of plugin `list` output.
//!
//! Each element of the JSON array a plugin prints for `list` is decoded
//! into [`DecodedEntry`] and validated into an
//! [`ExternalEntry`](super::ExternalEntry). Unrecognized fields are
//! ignored; missing required fields fail with a `DecodeError` naming the
//! field.

use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use wash_types::{
    parse_mode, unix_seconds_to_system_time, Action, Attributes, MetadataMap, WashError,
    WashResult,
};

/// Wire form of an entry's attributes.
///
/// Times are Unix seconds; `mode` is a stringly-encoded C integer literal
/// in any base strtoul accepts; `valid` is in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecodedAttributes {
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
    pub size: Option<u64>,
    pub mode: Option<String>,
    pub valid: Option<u64>,
}

impl DecodedAttributes {
    pub fn to_attributes(&self) -> WashResult<Attributes> {
        let mode = match &self.mode {
            Some(raw) => Some(
                parse_mode(raw)
                    .map_err(|e| WashError::decode(format!("attributes.mode: {}", e)))?,
            ),
            None => None,
        };
        Ok(Attributes {
            atime: self.atime.map(unix_seconds_to_system_time),
            mtime: self.mtime.map(unix_seconds_to_system_time),
            ctime: self.ctime.map(unix_seconds_to_system_time),
            size: self.size,
            mode,
            valid: self.valid.map(Duration::from_secs),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.atime.is_none()
            && self.mtime.is_none()
            && self.ctime.is_none()
            && self.size.is_none()
            && self.mode.is_none()
            && self.valid.is_none()
    }
}

/// Wire form of per-action cache TTLs, in seconds.
///
/// `open` is the legacy name for `read`; an explicit `read` wins when both
/// are present. Actions left unspecified inherit the parent's TTL.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct DecodedCacheTtls {
    pub list: Option<u64>,
    pub read: Option<u64>,
    pub metadata: Option<u64>,
    pub open: Option<u64>,
}

impl DecodedCacheTtls {
    pub fn to_cache_config(&self, inherited: &CacheConfig) -> CacheConfig {
        let mut config = inherited.clone();
        if let Some(secs) = self.list {
            config.set_ttl(Action::List, Duration::from_secs(secs));
        }
        if let Some(secs) = self.read.or(self.open) {
            config.set_ttl(Action::Read, Duration::from_secs(secs));
        }
        if let Some(secs) = self.metadata {
            config.set_ttl(Action::Metadata, Duration::from_secs(secs));
        }
        config
    }
}

/// Wire form of one entry descriptor, as printed by a plugin's `list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecodedEntry {
    pub name: Option<String>,
    pub supported_actions: Option<Vec<String>>,
    pub state: Option<String>,
    pub attributes: Option<DecodedAttributes>,
    pub cache_ttls: Option<DecodedCacheTtls>,
    pub partial_metadata: Option<MetadataMap>,
}

/// Parse a plugin's `list` stdout into descriptors.
///
/// The error message mentions `stdout` so a failure is attributable to the
/// plugin's output rather than the runtime.
pub fn decode_entry_list(stdout: &[u8]) -> WashResult<Vec<DecodedEntry>> {
    serde_json::from_slice(stdout)
        .map_err(|e| WashError::decode(format!("plugin stdout is not a JSON array of entries: {}", e)))
}
