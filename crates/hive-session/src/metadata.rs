//! Session metadata records and their cluster-wide store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::ConsistencyMode;
use crate::error::{Error, Result};
use crate::store::ClusterMap;

/// Metadata for one logical session, stored under its cluster id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// When the session was created. Never changes.
    pub created_at: DateTime<Utc>,

    /// Last access. Baseline for idle eviction.
    pub last_accessed_at: DateTime<Utc>,

    /// Idle window in milliseconds. Zero or negative disables eviction.
    pub max_idle_ms: i64,

    /// Set once the id was renewed and not yet acknowledged by the host.
    pub id_changed: bool,

    /// Suppresses idle eviction regardless of `max_idle_ms`.
    pub keep_alive: bool,

    /// Names of every attribute stored for this session.
    ///
    /// Must equal the set of `id#name` keys present in the attribute store.
    pub attribute_names: BTreeSet<String>,

    /// Bumped on every update; used by versioned updates.
    pub version: u64,
}

impl SessionMetadata {
    /// Metadata for a session created at `created_at`.
    pub fn new(created_at: DateTime<Utc>, max_idle_ms: i64) -> Self {
        Self {
            created_at,
            last_accessed_at: created_at,
            max_idle_ms,
            id_changed: false,
            keep_alive: false,
            attribute_names: BTreeSet::new(),
            version: 0,
        }
    }

    /// Milliseconds since the last access.
    pub fn idle_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_accessed_at).num_milliseconds()
    }

    /// Whether an idle sweep at `now` should evict this session.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        !self.keep_alive && self.max_idle_ms > 0 && self.idle_ms(now) >= self.max_idle_ms
    }
}

/// Accessor over the cluster-wide map of session metadata.
#[derive(Clone)]
pub struct MetadataStore {
    map: Arc<dyn ClusterMap<SessionMetadata>>,
    mode: ConsistencyMode,
}

impl MetadataStore {
    /// Wrap a cluster map.
    pub fn new(map: Arc<dyn ClusterMap<SessionMetadata>>, mode: ConsistencyMode) -> Self {
        Self { map, mode }
    }

    /// The update policy in use.
    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    /// Fetch the record for `id`.
    pub fn get(&self, id: &str) -> Result<Option<SessionMetadata>> {
        self.map.get(id)
    }

    /// Store `metadata` under `id`, replacing any previous record.
    pub fn put(&self, id: &str, metadata: SessionMetadata) -> Result<()> {
        self.map.put(id, metadata)
    }

    /// Remove the record for `id`, returning it.
    pub fn remove(&self, id: &str) -> Result<Option<SessionMetadata>> {
        self.map.remove(id)
    }

    /// Check whether a record exists for `id`.
    pub fn contains(&self, id: &str) -> Result<bool> {
        self.map.contains_key(id)
    }

    /// Snapshot of every record in the cluster.
    pub fn entries(&self) -> Result<Vec<(String, SessionMetadata)>> {
        self.map.entries()
    }

    /// Snapshot of every session id with a record.
    pub fn ids(&self) -> Result<Vec<String>> {
        self.map.keys()
    }

    /// Read-modify-write the record under `id`.
    ///
    /// Returns `Ok(None)` without calling `f` when the record is missing.
    /// With [`ConsistencyMode::Versioned`] the closure may run more than
    /// once, each time against a freshly read record.
    pub fn update<F, R>(&self, id: &str, mut f: F) -> Result<Option<R>>
    where
        F: FnMut(&mut SessionMetadata) -> R,
    {
        match self.mode {
            ConsistencyMode::LastWriterWins => {
                let Some(mut metadata) = self.map.get(id)? else {
                    return Ok(None);
                };
                let out = f(&mut metadata);
                metadata.version = metadata.version.wrapping_add(1);
                self.map.put(id, metadata)?;
                Ok(Some(out))
            }
            ConsistencyMode::Versioned { max_retries } => {
                for attempt in 0..=max_retries {
                    let Some(current) = self.map.get(id)? else {
                        return Ok(None);
                    };
                    let mut next = current.clone();
                    let out = f(&mut next);
                    next.version = current.version.wrapping_add(1);
                    if self.map.replace(id, &current, next)? {
                        return Ok(Some(out));
                    }
                    trace!(session_id = %id, attempt, "Metadata update conflicted, retrying");
                }
                Err(Error::ConcurrentModification(id.to_string()))
            }
        }
    }
}
