//! Cluster store capabilities consumed by the session layer.
//!
//! The distributed key-value engine itself is an external collaborator.
//! This module defines the narrow map and set capabilities the session
//! layer needs from it, plus an in-process implementation used for tests
//! and single-node deployments.
//!
//! # Architecture
//!
//! ```text
//! ClusterMap<V> (trait)        - keyed records (metadata, attribute values)
//!     └── InMemoryMap<V>       - RwLock<HashMap> implementation
//!
//! ClusterSet (trait)           - session-id registry membership
//!     └── InMemorySet          - RwLock<HashSet> implementation
//!
//! ClusterStore                 - the three named structures one cluster shares
//! ```
//!
//! Serialization of values on the wire is the client's concern; any
//! context it needs to deserialize values must be handled inside the
//! client implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::metadata::SessionMetadata;

/// Cluster-wide map from string keys to values.
///
/// Absence is reported as `Ok(None)`. Errors mean the store could not
/// answer and are passed through to the caller unchanged.
pub trait ClusterMap<V>: Send + Sync {
    /// Fetch the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<V>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: V) -> Result<()>;

    /// Remove `key`, returning the value it held.
    fn remove(&self, key: &str) -> Result<Option<V>>;

    /// Check whether `key` is present.
    fn contains_key(&self, key: &str) -> Result<bool>;

    /// Snapshot of every entry in the map.
    fn entries(&self) -> Result<Vec<(String, V)>>;

    /// Snapshot of every key in the map.
    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Replace the value under `key` only if it currently equals `expected`.
    ///
    /// Returns `Ok(false)` when the stored value differs or is missing.
    /// Stores without compare-and-replace support keep the default.
    fn replace(&self, _key: &str, _expected: &V, _value: V) -> Result<bool> {
        Err(Error::Unsupported("compare-and-replace".to_string()))
    }
}

/// Cluster-wide set of strings.
pub trait ClusterSet: Send + Sync {
    /// Add a member. Returns `true` if it was not already present.
    fn add(&self, member: &str) -> Result<bool>;

    /// Remove a member. Returns `true` if it was present.
    fn remove(&self, member: &str) -> Result<bool>;

    /// Check membership.
    fn contains(&self, member: &str) -> Result<bool>;

    /// Snapshot of every member.
    fn members(&self) -> Result<Vec<String>>;
}

/// Handles to the shared structures backing one session cluster.
///
/// Every node and every manager on a node must be built from handles that
/// point at the same underlying cluster structures.
#[derive(Clone)]
pub struct ClusterStore {
    /// Session id to metadata record.
    pub metadata: Arc<dyn ClusterMap<SessionMetadata>>,

    /// `id#name` to attribute value.
    pub attributes: Arc<dyn ClusterMap<Value>>,

    /// Session ids currently in use.
    pub session_ids: Arc<dyn ClusterSet>,
}

impl ClusterStore {
    /// Assemble a store from client handles.
    pub fn new(
        metadata: Arc<dyn ClusterMap<SessionMetadata>>,
        attributes: Arc<dyn ClusterMap<Value>>,
        session_ids: Arc<dyn ClusterSet>,
    ) -> Self {
        Self {
            metadata,
            attributes,
            session_ids,
        }
    }

    /// A fresh in-process cluster. Clone it to share between simulated nodes.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryMap::<SessionMetadata>::new()),
            Arc::new(InMemoryMap::<Value>::new()),
            Arc::new(InMemorySet::new()),
        )
    }
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore").finish_non_exhaustive()
    }
}

/// In-process [`ClusterMap`].
#[derive(Debug)]
pub struct InMemoryMap<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> InMemoryMap<V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V> Default for InMemoryMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ClusterMap<V> for InMemoryMap<V>
where
    V: Clone + PartialEq + Send + Sync,
{
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.write().remove(key))
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn entries(&self) -> Result<Vec<(String, V)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn replace(&self, key: &str, expected: &V, value: V) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if current == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-process [`ClusterSet`].
#[derive(Debug, Default)]
pub struct InMemorySet {
    members: RwLock<HashSet<String>>,
}

impl InMemorySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterSet for InMemorySet {
    fn add(&self, member: &str) -> Result<bool> {
        Ok(self.members.write().insert(member.to_string()))
    }

    fn remove(&self, member: &str) -> Result<bool> {
        Ok(self.members.write().remove(member))
    }

    fn contains(&self, member: &str) -> Result<bool> {
        Ok(self.members.read().contains(member))
    }

    fn members(&self) -> Result<Vec<String>> {
        Ok(self.members.read().iter().cloned().collect())
    }
}
