// src/core/credentials.rs

//! The tenant credential store.
//!
//! Every session consults the store exactly once, right after the upstream accepts
//! its `AUTH`, to find out which logical database the tenant is pinned to. The store
//! holds one immutable snapshot behind an `Arc`. Reloads build a complete new
//! snapshot and swap the pointer, so a reader always sees one whole mapping.

use anyhow::{Context, Result, anyhow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Routing metadata for a single tenant secret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    /// The logical database index the tenant's upstream connection is pinned to.
    #[serde(rename = "dbIndex")]
    pub db_index: String,
}

/// One complete, immutable version of the credential mapping.
pub type CredentialSnapshot = HashMap<String, CredentialEntry>;

/// Process-wide holder of the active credential snapshot.
#[derive(Debug, Default)]
pub struct CredentialStore {
    snapshot: RwLock<Arc<CredentialSnapshot>>,
}

impl CredentialStore {
    pub fn new(initial: CredentialSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    /// Resolves a client secret to the database index of its tenant.
    ///
    /// Secrets that are not valid UTF-8 can never be configured and are reported as
    /// unknown.
    pub fn lookup(&self, secret: &[u8]) -> Option<String> {
        let secret = std::str::from_utf8(secret).ok()?;
        self.current()
            .get(secret)
            .map(|entry| entry.db_index.clone())
    }

    /// Returns the active snapshot. The lock is held only long enough to clone the `Arc`.
    pub fn current(&self) -> Arc<CredentialSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Publishes `next` as the active snapshot, replacing the previous one whole.
    pub fn replace(&self, next: CredentialSnapshot) {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.snapshot.write(), next);
        // Dropped outside the write guard.
        drop(previous);
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }
}

/// Parses a credentials document of the form
/// `{"<secret>": {"dbIndex": "<n>"}, ...}` and validates every entry.
pub fn parse_credentials(contents: &str) -> Result<CredentialSnapshot> {
    let snapshot: CredentialSnapshot =
        serde_json::from_str(contents).context("Failed to parse credentials JSON")?;

    for (secret, entry) in &snapshot {
        if secret.is_empty() {
            return Err(anyhow!("credentials contain an empty secret"));
        }
        if entry.db_index.is_empty() || !entry.db_index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(anyhow!(
                "invalid dbIndex '{}': must be a non-negative integer",
                entry.db_index
            ));
        }
    }
    Ok(snapshot)
}

/// Reads and validates a credentials file.
pub async fn load_credentials_file(path: &str) -> Result<CredentialSnapshot> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read credentials file at '{path}'"))?;
    parse_credentials(&contents).with_context(|| format!("Invalid credentials file '{path}'"))
}
