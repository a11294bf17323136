// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable replication checkpoints.
//!
//! One status record per `(source, destination)` pair, stored in the
//! destination KV under a deterministic path so progress survives daemon
//! restarts:
//!
//! ```text
//! <status_dir>/<hex(md5("<source>-<destination>"))>
//! ```
//!
//! The document is pretty-printed JSON so operators can inspect it in the
//! store's UI. A missing document reads as fresh state (index 0), and so
//! does an undecodable one - a corrupt checkpoint costs a full resync, not
//! an outage. Renaming a prefix's source or destination changes the hash,
//! which likewise starts a fresh resync under the new path.
//!
//! ## Checkpoint Semantics
//!
//! The record stores the last store index a run fully applied. On the next
//! run, pairs with `modify_index` at or below it are skipped.
//!
//! ```text
//! observe index 1234 → put/delete at destination → persist 1234
//!                      (crash here = re-apply from 1200s, idempotent)
//! ```

use crate::config::PrefixConfig;
use crate::error::{ReplicationError, Result};
use crate::kv::{KeyUpdate, KvClient};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A persisted replication checkpoint.
///
/// Field names are part of the on-disk contract; unknown fields in stored
/// documents are ignored on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The last store index fully replicated for this prefix.
    #[serde(rename = "LastReplicated", default)]
    pub last_replicated: u64,

    /// Source prefix the record belongs to.
    #[serde(rename = "Source", default)]
    pub source: String,

    /// Destination prefix the record belongs to.
    #[serde(rename = "Destination", default)]
    pub destination: String,
}

/// Reads and writes status records through the KV facade.
#[derive(Clone)]
pub struct StatusStore {
    client: Arc<dyn KvClient>,
    status_dir: String,
}

impl StatusStore {
    /// Create a store rooted at `status_dir` in the destination KV.
    ///
    /// A trailing slash on the directory is normalized away.
    pub fn new(client: Arc<dyn KvClient>, status_dir: &str) -> Self {
        Self {
            client,
            status_dir: status_dir.trim_end_matches('/').to_string(),
        }
    }

    /// The normalized status directory.
    pub fn status_dir(&self) -> &str {
        &self.status_dir
    }

    /// The checkpoint path for a prefix.
    pub fn path(&self, prefix: &PrefixConfig) -> String {
        let plain = format!("{}-{}", prefix.source, prefix.destination);
        let digest = Md5::digest(plain.as_bytes());
        format!("{}/{}", self.status_dir, hex::encode(digest))
    }

    /// Read the checkpoint for a prefix.
    ///
    /// A missing document yields the zero status. An undecodable document
    /// is logged and treated the same way: the next run performs a full
    /// resync rather than failing.
    pub async fn read(&self, prefix: &PrefixConfig) -> Result<Status> {
        let path = self.path(prefix);
        let pair = self
            .client
            .get(&path)
            .await
            .map_err(|e| ReplicationError::transport("kv.get", e.to_string()))?;

        let Some(pair) = pair else {
            debug!(path = %path, "no status record, starting fresh");
            return Ok(Status::default());
        };

        match serde_json::from_slice::<Status>(&pair.value) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(
                    path = %path,
                    error = %e,
                    "undecodable status record, treating as fresh state"
                );
                Ok(Status::default())
            }
        }
    }

    /// Persist the checkpoint for a prefix.
    ///
    /// The JSON is pretty-printed so operators can read it in the store's
    /// UI.
    pub async fn write(&self, prefix: &PrefixConfig, status: &Status) -> Result<()> {
        let path = self.path(prefix);
        let body = serde_json::to_vec_pretty(status)
            .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;

        self.client
            .put(KeyUpdate {
                key: path.clone(),
                value: body,
                flags: 0,
            })
            .await
            .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;

        debug!(
            path = %path,
            last_replicated = status.last_replicated,
            "status record written"
        );
        Ok(())
    }
}
