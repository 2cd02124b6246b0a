//! XDG Base Directory paths for wash.
//!
//! | Purpose | XDG Variable | Default | wash Path |
//! |---------|--------------|---------|-----------|
//! | Config | `$XDG_CONFIG_HOME` | `~/.config` | `$XDG_CONFIG_HOME/wash/wash.toml` |
//! | Cache | `$XDG_CACHE_HOME` | `~/.cache` | `$XDG_CACHE_HOME/wash/` |
//! | Data | `$XDG_DATA_HOME` | `~/.local/share` | `$XDG_DATA_HOME/wash/` |

use std::path::PathBuf;

use directories::BaseDirs;

/// Get the config directory.
///
/// Uses `$XDG_CONFIG_HOME/wash` or falls back to `~/.config/wash`.
pub fn config_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| dirs_fallback().join(".config"))
        .join("wash")
}

/// Get the cache directory.
///
/// Uses `$XDG_CACHE_HOME/wash` or falls back to `~/.cache/wash`.
pub fn cache_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.cache_dir().to_path_buf())
        .unwrap_or_else(|| dirs_fallback().join(".cache"))
        .join("wash")
}

/// Get the data directory for persistent state.
///
/// Uses `$XDG_DATA_HOME/wash` or falls back to `~/.local/share/wash`.
pub fn data_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| dirs_fallback().join(".local").join("share"))
        .join("wash")
}

/// Where activity journals live.
pub fn activity_dir() -> PathBuf {
    cache_dir().join("activity")
}

/// Fallback home directory when BaseDirs fails.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_under_wash() {
        assert!(config_dir().ends_with("wash"));
        assert!(cache_dir().ends_with("wash"));
        assert!(data_dir().ends_with("wash"));
    }

    #[test]
    fn activity_dir_is_under_cache() {
        let activity = activity_dir();
        assert!(activity.starts_with(cache_dir()));
        assert!(activity.ends_with("activity"));
    }
}
