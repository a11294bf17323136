//! Configuration for the replication core.
//!
//! These types are the finalized product the daemon hands to
//! [`Runner::new()`](crate::runner::Runner::new) after flag parsing and
//! config-file merging (both of which live outside the core). They can be
//! constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use consul_replicate::config::{ReplicationConfig, PrefixConfig};
//!
//! let config = ReplicationConfig {
//!     prefixes: vec![PrefixConfig::parse("global@dc1:backup").unwrap()],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── consul: ConsulConfig         # address, token, poll retry policy
//! ├── prefixes: Vec<PrefixConfig>  # what to replicate (at least one)
//! ├── excludes: Vec<ExcludeConfig> # source prefixes to skip
//! ├── status_dir: String           # where checkpoints live in the destination KV
//! ├── max_stale: Option<String>    # permit stale source reads up to this age
//! └── wait: WaitConfig             # quiescence timers (min/max)
//! ```
//!
//! # Prefix syntax
//!
//! A prefix is written `source@datacenter[:destination]`:
//!
//! ```text
//! global@dc1            replicate dc1's global/ into local global/
//! global@dc1:backup     replicate dc1's global/ into local backup/
//! /global@dc1           leading slash is tolerated and stripped
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default path in the destination KV under which status records are kept.
pub const DEFAULT_STATUS_DIR: &str = "service/consul-replicate/statuses";

/// Default quiescence minimum: runs fire no sooner than this after the
/// last data event.
pub const DEFAULT_WAIT_MIN: Duration = Duration::from_millis(150);

/// Default quiescence maximum: runs fire no later than this after the
/// first data event.
pub const DEFAULT_WAIT_MAX: Duration = Duration::from_millis(400);

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Runner::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Connection and retry settings for the KV store.
    #[serde(default)]
    pub consul: ConsulConfig,

    /// The prefixes to replicate. At least one is required.
    #[serde(default)]
    pub prefixes: Vec<PrefixConfig>,

    /// Source prefixes excluded from both writes and deletes.
    #[serde(default)]
    pub excludes: Vec<ExcludeConfig>,

    /// Destination KV path for status records. A trailing slash is
    /// tolerated and normalized away.
    #[serde(default = "default_status_dir")]
    pub status_dir: String,

    /// Maximum staleness tolerated on source reads, as a humantime string
    /// (e.g. "10s"). `None` forces consistent reads from the leader.
    #[serde(default)]
    pub max_stale: Option<String>,

    /// Quiescence timers coalescing bursts into a single run.
    #[serde(default)]
    pub wait: WaitConfig,
}

fn default_status_dir() -> String {
    DEFAULT_STATUS_DIR.to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            prefixes: Vec::new(),
            excludes: Vec::new(),
            status_dir: default_status_dir(),
            max_stale: None,
            wait: WaitConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: one prefix, quiescence
    /// disabled so runs fire immediately.
    pub fn for_testing(prefix: &str) -> Self {
        Self {
            prefixes: vec![PrefixConfig::parse(prefix).expect("valid test prefix")],
            wait: WaitConfig::disabled(),
            consul: ConsulConfig {
                retry: RetryConfig::testing(),
                ..ConsulConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate and fill in derived fields.
    ///
    /// Must be called (the runner does) before the config is used:
    /// defaults each prefix's destination, rejects empty prefix lists,
    /// empty excludes, and unparseable durations.
    pub fn finalize(&mut self) -> Result<()> {
        if self.prefixes.is_empty() {
            return Err(ReplicationError::Config(
                "at least one prefix is required".to_string(),
            ));
        }
        for prefix in &mut self.prefixes {
            prefix.finalize()?;
        }
        for exclude in &self.excludes {
            if exclude.source.trim().is_empty() {
                return Err(ReplicationError::Config("missing exclude".to_string()));
            }
        }
        self.wait.validate()?;
        if let Some(ref s) = self.max_stale {
            humantime::parse_duration(s).map_err(|e| {
                ReplicationError::Config(format!("invalid max_stale {:?}: {}", s, e))
            })?;
        }
        Ok(())
    }

    /// Parsed `max_stale`, if configured and valid.
    pub fn max_stale_duration(&self) -> Option<Duration> {
        self.max_stale
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsulConfig: KV store connection settings
// ═══════════════════════════════════════════════════════════════════════════════

/// KV store connection settings.
///
/// The concrete HTTP client is built by the daemon; the core only consults
/// the retry policy. Address and token ride along so one object describes
/// the whole store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Store address (IP or FQDN, with port).
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// API token. Defaults from the `CONSUL_TOKEN` environment variable.
    #[serde(default = "default_consul_token")]
    pub token: Option<String>,

    /// Retry policy for source polling.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_consul_address() -> String {
    "127.0.0.1:8500".to_string()
}

fn default_consul_token() -> Option<String> {
    std::env::var("CONSUL_TOKEN").ok().filter(|t| !t.is_empty())
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: default_consul_token(),
            retry: RetryConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WaitConfig: quiescence timers
// ═══════════════════════════════════════════════════════════════════════════════

/// Quiescence timer configuration, as humantime strings.
///
/// Setting either bound to zero disables the gate: runs fire immediately
/// after any data event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Minimum idle interval after the last data event before a run.
    #[serde(default = "default_wait_min")]
    pub min: String,

    /// Upper bound from the first data event to the run.
    #[serde(default = "default_wait_max")]
    pub max: String,
}

fn default_wait_min() -> String {
    "150ms".to_string()
}

fn default_wait_max() -> String {
    "400ms".to_string()
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            min: default_wait_min(),
            max: default_wait_max(),
        }
    }
}

impl WaitConfig {
    /// A disabled gate: runs fire immediately on data.
    pub fn disabled() -> Self {
        Self {
            min: "0s".to_string(),
            max: "0s".to_string(),
        }
    }

    /// Parsed minimum, falling back to the default on a malformed string.
    pub fn min_duration(&self) -> Duration {
        humantime::parse_duration(&self.min).unwrap_or(DEFAULT_WAIT_MIN)
    }

    /// Parsed maximum, falling back to the default on a malformed string.
    pub fn max_duration(&self) -> Duration {
        humantime::parse_duration(&self.max).unwrap_or(DEFAULT_WAIT_MAX)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [("wait.min", &self.min), ("wait.max", &self.max)] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("invalid {} {:?}: {}", name, value, e))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PrefixConfig: one entry per replicated subtree
// ═══════════════════════════════════════════════════════════════════════════════

/// A replicated key-prefix subtree: where it comes from and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixConfig {
    /// Source prefix in the remote datacenter.
    pub source: String,

    /// Datacenter to replicate from. Must not be the local datacenter
    /// (enforced when the replicator runs).
    pub datacenter: String,

    /// Local prefix the subtree is rewritten to. Defaults to `source`.
    #[serde(default)]
    pub destination: String,
}

impl PrefixConfig {
    /// Parse a prefix of the form `source@dc[:destination]`.
    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(ReplicationError::Config(
                "cannot specify empty prefix declaration".to_string(),
            ));
        }

        let (source_part, destination) = match s.split_once(':') {
            Some((source, destination)) => (source, Some(destination)),
            None => (s, None),
        };

        let (prefix, dc) = source_part.split_once('@').ok_or_else(|| {
            ReplicationError::Config(format!("invalid format: {:?}", s))
        })?;

        let mut config = PrefixConfig {
            source: prefix.to_string(),
            datacenter: dc.to_string(),
            destination: destination.unwrap_or_default().to_string(),
        };
        config.finalize()?;
        Ok(config)
    }

    /// Validate the stanza form and fill in the destination default.
    ///
    /// The same invariants as [`parse()`](Self::parse) apply: non-empty
    /// source free of `:` and `@`, non-empty datacenter.
    pub fn finalize(&mut self) -> Result<()> {
        // Legacy syntax tolerates one leading slash on the source.
        if let Some(stripped) = self.source.strip_prefix('/') {
            self.source = stripped.to_string();
        }
        if self.source.trim().is_empty() {
            return Err(ReplicationError::Config("missing prefix".to_string()));
        }
        if self.source.contains('@') || self.source.contains(':') {
            return Err(ReplicationError::Config(format!(
                "invalid source format: {:?}",
                self.source
            )));
        }
        if self.datacenter.trim().is_empty() {
            return Err(ReplicationError::Config("missing datacenter".to_string()));
        }
        if !self
            .datacenter
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(ReplicationError::Config(format!(
                "invalid datacenter: {:?}",
                self.datacenter
            )));
        }
        if self.destination.is_empty() {
            self.destination = self.source.clone();
        }
        Ok(())
    }

    /// Identifier of the watch dependency backing this prefix.
    pub fn dependency_id(&self) -> String {
        format!("kv.list({}@{})", self.source, self.datacenter)
    }

    /// Map an observed source path to its destination key.
    pub fn destination_key(&self, path: &str) -> String {
        let suffix = path.strip_prefix(&self.source).unwrap_or(path);
        format!("{}{}", self.destination, suffix)
    }

    /// Map a destination key back into the source namespace, for the
    /// exclude check on the delete side.
    pub fn source_key(&self, key: &str) -> String {
        key.replace(&self.destination, &self.source)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ExcludeConfig: source prefixes that must not be replicated
// ═══════════════════════════════════════════════════════════════════════════════

/// A source key-path prefix excluded from replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeConfig {
    /// Source-side prefix; matched with `starts_with` against observed
    /// paths.
    pub source: String,
}

impl ExcludeConfig {
    /// Parse an exclude flag value.
    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(ReplicationError::Config("missing exclude".to_string()));
        }
        Ok(Self {
            source: s.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
