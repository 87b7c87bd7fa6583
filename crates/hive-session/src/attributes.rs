//! Attribute values keyed by `session_id#name`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::store::ClusterMap;

/// Separator between session id and attribute name in storage keys.
pub const KEY_SEPARATOR: char = '#';

/// Compose the storage key for one attribute.
pub fn attribute_key(session_id: &str, name: &str) -> String {
    format!("{session_id}{KEY_SEPARATOR}{name}")
}

/// Accessor over the cluster-wide attribute map.
#[derive(Clone)]
pub struct AttributeStore {
    map: Arc<dyn ClusterMap<Value>>,
}

impl AttributeStore {
    /// Wrap a cluster map.
    pub fn new(map: Arc<dyn ClusterMap<Value>>) -> Self {
        Self { map }
    }

    /// Fetch attribute `name` of session `session_id`.
    pub fn get(&self, session_id: &str, name: &str) -> Result<Option<Value>> {
        self.map.get(&attribute_key(session_id, name))
    }

    /// Store attribute `name`, replacing any previous value.
    pub fn put(&self, session_id: &str, name: &str, value: Value) -> Result<()> {
        self.map.put(&attribute_key(session_id, name), value)
    }

    /// Remove attribute `name`, returning its value.
    pub fn remove(&self, session_id: &str, name: &str) -> Result<Option<Value>> {
        self.map.remove(&attribute_key(session_id, name))
    }

    /// Check whether attribute `name` is stored.
    pub fn contains(&self, session_id: &str, name: &str) -> Result<bool> {
        self.map.contains_key(&attribute_key(session_id, name))
    }
}
