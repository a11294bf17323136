//! Exclude filter: source prefixes that replication must not touch.
//!
//! Both sides of a run consult the same filter in the same namespace:
//!
//! - a source pair is **excluded from write** when its observed path has
//!   any exclude as a string prefix;
//! - a destination key is **excluded from delete** when, rewritten back to
//!   the source namespace, it has any exclude as a prefix.
//!
//! Matching on the source side for both checks keeps write and delete in
//! agreement about what "excluded" means, so a pre-existing destination
//! key under an excluded subtree is never deleted and never overwritten.

use crate::config::{ExcludeConfig, PrefixConfig};

/// Set of source-prefix strings excluded from replication.
///
/// An empty filter (the default) excludes nothing.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    sources: Vec<String>,
}

impl ExcludeFilter {
    /// Build a filter from the configured excludes.
    pub fn new(excludes: &[ExcludeConfig]) -> Self {
        Self {
            sources: excludes.iter().map(|e| e.source.clone()).collect(),
        }
    }

    /// Whether the filter excludes anything at all.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of configured excludes.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// The exclude matching an observed source path, if any.
    pub fn matches_source(&self, path: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|source| path.starts_with(source.as_str()))
            .map(String::as_str)
    }

    /// The exclude matching a destination key, if any, after rewriting the
    /// key back into the prefix's source namespace.
    pub fn matches_destination(&self, key: &str, prefix: &PrefixConfig) -> Option<&str> {
        if self.sources.is_empty() {
            return None;
        }
        let source_key = prefix.source_key(key);
        self.sources
            .iter()
            .find(|source| source_key.starts_with(source.as_str()))
            .map(String::as_str)
    }
}
