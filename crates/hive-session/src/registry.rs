//! Cluster-wide registry of session ids in use, and the node-id scheme.
//!
//! A session has a cluster id (the storage key, shared by every node) and a
//! node id of the form `cluster_id.worker` that load balancers use for sticky
//! routing. The worker suffix is informational and is stripped before any
//! storage access.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::ClusterSet;

/// Separator between cluster id and worker name in a node id.
pub const NODE_SEPARATOR: char = '.';

/// Registry of session ids currently in use anywhere in the cluster.
///
/// Adds and removes are idempotent.
#[derive(Clone)]
pub struct SessionIdRegistry {
    set: Arc<dyn ClusterSet>,
}

impl SessionIdRegistry {
    /// Wrap a cluster set.
    pub fn new(set: Arc<dyn ClusterSet>) -> Self {
        Self { set }
    }

    /// Check whether `cluster_id` is in use.
    pub fn contains(&self, cluster_id: &str) -> Result<bool> {
        self.set.contains(cluster_id)
    }

    /// Mark `cluster_id` as in use.
    pub fn add(&self, cluster_id: &str) -> Result<()> {
        if !self.set.add(cluster_id)? {
            debug!(session_id = %cluster_id, "Session id already registered");
        }
        Ok(())
    }

    /// Release `cluster_id`.
    pub fn remove(&self, cluster_id: &str) -> Result<()> {
        self.set.remove(cluster_id)?;
        Ok(())
    }

    /// Every registered id.
    pub fn ids(&self) -> Result<Vec<String>> {
        self.set.members()
    }

    /// Draw a random cluster id that is not currently registered.
    ///
    /// The id is not reserved; callers register it once the session exists.
    pub fn allocate(&self) -> Result<String> {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            if !self.set.contains(&id)? {
                return Ok(id);
            }
        }
    }
}

/// Work out this node's worker name.
///
/// Falls back to the host name when nothing is configured, read from the
/// `HOSTNAME` environment variable or the Linux hostname files. Services
/// rarely export `HOSTNAME` and other platforms lack those files, so hosts
/// outside Linux should configure a worker name. Dots are replaced with `-`
/// so the worker suffix never contains the node separator.
pub fn resolve_worker_name(configured: Option<&str>) -> Result<String> {
    let name = match configured {
        Some(name) => name.to_string(),
        None => local_hostname()?,
    };
    Ok(name.replace(NODE_SEPARATOR, "-"))
}

fn local_hostname() -> Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }

    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let name = contents.trim();
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
    }

    Err(Error::HostnameResolution(
        "no HOSTNAME set and no readable hostname file; configure a worker name".to_string(),
    ))
}

/// Node id for `cluster_id` served by `worker`.
pub fn node_id(cluster_id: &str, worker: &str) -> String {
    format!("{cluster_id}{NODE_SEPARATOR}{worker}")
}

/// Strip the worker suffix from a node id.
///
/// Ids without a separator, or whose only separator is the first
/// character, are returned unchanged.
pub fn cluster_id(node_id: &str) -> &str {
    match node_id.rfind(NODE_SEPARATOR) {
        Some(dot) if dot > 0 => &node_id[..dot],
        _ => node_id,
    }
}
