//! Node-wide session id coordination: allocation, renewal and invalidation
//! broadcast across every session manager attached to this node.
//!
//! # Renewal
//!
//! ```text
//! lock ─► read old metadata ─► copy attributes ─► put new metadata
//!      ─► register new id ─► remove old attributes ─► remove old metadata
//!      ─► unregister old id ─► re-key handles on every local manager ─► unlock
//! ```
//!
//! The new id resolves before the old one stops resolving, so no lookup
//! sees a window where the session is reachable under neither id. If the
//! copy fails, whatever reached the new id is removed again and the old id
//! is untouched. Once the new id is registered it is authoritative; a
//! failure retiring the old id is logged, and any leftovers stay indexed by
//! the old metadata record for the idle sweep to collect.
//!
//! # Invalidation
//!
//! The id leaves the registry first, then every local manager force-expires
//! whatever it holds for it. Other nodes do nothing; their next lookup
//! finds the id gone.

use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::attributes::AttributeStore;
use crate::config::ConsistencyMode;
use crate::error::Result;
use crate::events::RemovalReason;
use crate::manager::ManagerShared;
use crate::metadata::{MetadataStore, SessionMetadata};
use crate::registry::{self, SessionIdRegistry};
use crate::store::ClusterStore;

/// Outcome of a successful id renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedId {
    /// The retired cluster id.
    pub old_cluster_id: String,
    /// The new cluster id.
    pub cluster_id: String,
    /// The new node id on this node.
    pub node_id: String,
}

/// Coordinates session ids for every manager on one node.
pub struct SessionIdCoordinator {
    worker_name: String,
    store: ClusterStore,
    registry: SessionIdRegistry,
    // Renewal only moves records, so the update policy does not matter here.
    metadata: MetadataStore,
    attributes: AttributeStore,
    /// Reentrant so listener callbacks may invalidate from inside a broadcast.
    renewal_lock: ReentrantMutex<()>,
    managers: RwLock<Vec<Weak<ManagerShared>>>,
}

impl SessionIdCoordinator {
    /// Create the coordinator for this node.
    ///
    /// With no `worker_name` the host name is used; failing to determine it
    /// is fatal. The host-name lookup only works on Linux (see
    /// [`resolve_worker_name`](crate::resolve_worker_name)), so other hosts
    /// must pass a worker name.
    pub fn new(store: ClusterStore, worker_name: Option<&str>) -> Result<Arc<Self>> {
        let worker_name = registry::resolve_worker_name(worker_name)?;
        info!(worker = %worker_name, "Session id coordinator worker name");

        Ok(Arc::new(Self {
            registry: SessionIdRegistry::new(store.session_ids.clone()),
            metadata: MetadataStore::new(store.metadata.clone(), ConsistencyMode::LastWriterWins),
            attributes: AttributeStore::new(store.attributes.clone()),
            store,
            worker_name,
            renewal_lock: ReentrantMutex::new(()),
            managers: RwLock::new(Vec::new()),
        }))
    }

    /// This node's worker name.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// The cluster store shared by every manager on this node.
    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    /// The session id registry.
    pub fn registry(&self) -> &SessionIdRegistry {
        &self.registry
    }

    /// Node id for `cluster_id` on this node.
    pub fn node_id(&self, cluster_id: &str) -> String {
        registry::node_id(cluster_id, &self.worker_name)
    }

    /// Check whether an id (cluster or node form) is registered.
    pub fn id_in_use(&self, id: &str) -> Result<bool> {
        self.registry.contains(registry::cluster_id(id))
    }

    /// Allocate a cluster id not currently in use.
    pub fn new_session_id(&self) -> Result<String> {
        self.registry.allocate()
    }

    /// Number of live managers attached.
    pub fn manager_count(&self) -> usize {
        self.managers
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn attach(&self, manager: &Arc<ManagerShared>) {
        let mut managers = self.managers.write();
        managers.retain(|weak| weak.strong_count() > 0);
        if !managers
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(manager)))
        {
            managers.push(Arc::downgrade(manager));
        }
    }

    pub(crate) fn detach(&self, manager: &Arc<ManagerShared>) {
        self.managers.write().retain(|weak| {
            weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(manager))
        });
    }

    /// Wait out any renewal or invalidation in progress on this node.
    ///
    /// While the guard is held, handles are not re-keyed underneath the caller.
    pub(crate) fn renewal_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.renewal_lock.lock()
    }

    fn local_managers(&self) -> Vec<Arc<ManagerShared>> {
        self.managers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Move a session to a freshly allocated id.
    ///
    /// Accepts the cluster id or the node id. Returns `Ok(None)` when no
    /// metadata exists under the old id, which happens when another node
    /// already removed or renamed the session.
    pub fn renew_session_id(&self, id: &str) -> Result<Option<RenewedId>> {
        let old_cluster_id = registry::cluster_id(id);
        let _guard = self.renewal_lock.lock();

        let Some(metadata) = self.metadata.get(old_cluster_id)? else {
            debug!(session_id = %old_cluster_id, "Nothing to renew");
            return Ok(None);
        };

        let cluster_id = self.registry.allocate()?;
        self.copy_session(old_cluster_id, &cluster_id, &metadata)?;

        if let Err(e) = self.retire(old_cluster_id, &metadata) {
            warn!(
                old_session_id = %old_cluster_id,
                session_id = %cluster_id,
                error = %e,
                "Failed to retire renewed session id"
            );
        }

        let renewed = RenewedId {
            old_cluster_id: old_cluster_id.to_string(),
            node_id: self.node_id(&cluster_id),
            cluster_id,
        };
        for manager in self.local_managers() {
            manager.rekey(&renewed);
        }

        debug!(
            old_session_id = %renewed.old_cluster_id,
            session_id = %renewed.cluster_id,
            "Renewed session id"
        );
        Ok(Some(renewed))
    }

    /// Establish a copy of the session under `cluster_id`.
    ///
    /// On failure the partial copy is removed before the error is returned.
    fn copy_session(
        &self,
        old_cluster_id: &str,
        cluster_id: &str,
        metadata: &SessionMetadata,
    ) -> Result<()> {
        let mut copied = Vec::new();
        let result = self.try_copy_session(old_cluster_id, cluster_id, metadata, &mut copied);
        if result.is_err() {
            for name in &copied {
                if let Err(e) = self.attributes.remove(cluster_id, name) {
                    warn!(
                        session_id = %cluster_id,
                        attribute = %name,
                        error = %e,
                        "Failed to roll back copied attribute"
                    );
                }
            }
            if let Err(e) = self.metadata.remove(cluster_id) {
                warn!(session_id = %cluster_id, error = %e, "Failed to roll back copied metadata");
            }
        }
        result
    }

    fn try_copy_session(
        &self,
        old_cluster_id: &str,
        cluster_id: &str,
        metadata: &SessionMetadata,
        copied: &mut Vec<String>,
    ) -> Result<()> {
        for name in &metadata.attribute_names {
            if let Some(value) = self.attributes.get(old_cluster_id, name)? {
                self.attributes.put(cluster_id, name, value)?;
                copied.push(name.clone());
            }
        }
        self.metadata.put(cluster_id, metadata.clone())?;
        self.registry.add(cluster_id)
    }

    /// Remove the old id's attributes, then its metadata, then its registry entry.
    fn retire(&self, old_cluster_id: &str, metadata: &SessionMetadata) -> Result<()> {
        for name in &metadata.attribute_names {
            self.attributes.remove(old_cluster_id, name)?;
        }
        self.metadata.remove(old_cluster_id)?;
        self.registry.remove(old_cluster_id)
    }

    /// Invalidate a session on every manager of this node.
    ///
    /// Invalidating an unknown id does nothing. Failures on one manager are
    /// logged and do not stop the broadcast.
    pub fn invalidate_all(&self, id: &str) -> Result<()> {
        let cluster_id = registry::cluster_id(id);
        let _guard = self.renewal_lock.lock();

        debug!(session_id = %cluster_id, "Invalidating session");
        self.registry.remove(cluster_id)?;

        for manager in self.local_managers() {
            if let Err(e) = manager.remove_session(cluster_id, RemovalReason::Invalidated) {
                warn!(session_id = %cluster_id, error = %e, "Failed to invalidate session on manager");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionIdCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdCoordinator")
            .field("worker_name", &self.worker_name)
            .field("managers", &self.manager_count())
            .finish()
    }
}
