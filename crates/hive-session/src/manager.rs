//! Per-context session manager.
//!
//! A host runs one [`SessionManager`] per application context. Every manager
//! on a node shares one [`SessionIdCoordinator`], and every node shares the
//! same cluster store. Managers hold no attribute or metadata state of their
//! own; they only track which session handles they have handed out so that
//! renewals and invalidations can reach them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::attributes::AttributeStore;
use crate::config::SessionConfig;
use crate::coordinator::{RenewedId, SessionIdCoordinator};
use crate::error::{Error, Result};
use crate::events::{NoopListener, RemovalReason, SessionListener};
use crate::facade::SessionFacade;
use crate::metadata::{MetadataStore, SessionMetadata};
use crate::reaper::{self, IdleSessionReaper, SweepReport};
use crate::registry::{self, SessionIdRegistry};

/// Lifecycle of a session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, never started.
    New,
    /// Started; the idle reaper is scheduled.
    Running,
    /// Stop in progress.
    Stopping,
    /// Stopped. May be started again.
    Stopped,
}

/// State shared between a manager, its session handles and its reaper.
pub(crate) struct ManagerShared {
    pub(crate) config: SessionConfig,
    pub(crate) coordinator: Arc<SessionIdCoordinator>,
    pub(crate) metadata: MetadataStore,
    pub(crate) attributes: AttributeStore,
    pub(crate) registry: SessionIdRegistry,
    pub(crate) listener: Arc<dyn SessionListener>,
    state: RwLock<LifecycleState>,
    /// Handles given out by this manager, by cluster id.
    held: RwLock<HashMap<String, Weak<SessionFacade>>>,
    reaper: Mutex<Option<IdleSessionReaper>>,
}

impl ManagerShared {
    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Remove a session's attributes, metadata and registry entry.
    pub(crate) fn remove_session(&self, cluster_id: &str, reason: RemovalReason) -> Result<bool> {
        let metadata = self.metadata.get(cluster_id)?;
        self.purge(cluster_id, metadata, reason)
    }

    /// Remove a session given the metadata already read for it.
    ///
    /// Attributes go first so a concurrent reader never finds metadata that
    /// names an attribute whose value was removed before it.
    pub(crate) fn purge(
        &self,
        cluster_id: &str,
        metadata: Option<SessionMetadata>,
        reason: RemovalReason,
    ) -> Result<bool> {
        let removed = match metadata {
            Some(metadata) => {
                for name in &metadata.attribute_names {
                    self.attributes.remove(cluster_id, name)?;
                }
                self.metadata.remove(cluster_id)?;
                true
            }
            None => false,
        };
        self.registry.remove(cluster_id)?;

        let released = self.release(cluster_id);
        if removed || released {
            debug!(session_id = %cluster_id, %reason, "Removed session");
            self.listener.session_removed(cluster_id, reason);
        }
        Ok(removed || released)
    }

    /// Drop and invalidate the handle held for `cluster_id`, if any.
    fn release(&self, cluster_id: &str) -> bool {
        let handle = self.held.write().remove(cluster_id);
        match handle.and_then(|weak| weak.upgrade()) {
            Some(session) => {
                session.mark_invalid();
                true
            }
            None => false,
        }
    }

    /// Move the handle held under the old id to the new one.
    pub(crate) fn rekey(&self, renewed: &RenewedId) {
        let mut held = self.held.write();
        if let Some(session) = held
            .remove(&renewed.old_cluster_id)
            .and_then(|weak| weak.upgrade())
        {
            session.rekey(renewed);
            held.insert(renewed.cluster_id.clone(), Arc::downgrade(&session));
            debug!(
                old_session_id = %renewed.old_cluster_id,
                session_id = %renewed.cluster_id,
                "Re-keyed held session"
            );
        }
        drop(held);
        self.listener
            .session_renewed(&renewed.old_cluster_id, &renewed.cluster_id);
    }

    fn hold(&self, session: &Arc<SessionFacade>) {
        let mut held = self.held.write();
        held.retain(|_, weak| weak.strong_count() > 0);
        held.insert(session.cluster_id(), Arc::downgrade(session));
    }

    fn held(&self, cluster_id: &str) -> Option<Arc<SessionFacade>> {
        self.held
            .read()
            .get(cluster_id)
            .and_then(|weak| weak.upgrade())
            .filter(|session| session.is_valid())
    }
}

/// Cluster-backed session manager for one host context.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    /// Create a manager with no host listener.
    pub fn new(coordinator: Arc<SessionIdCoordinator>, config: SessionConfig) -> Self {
        Self::with_listener(coordinator, config, Arc::new(NoopListener))
    }

    /// Create a manager that reports session events to `listener`.
    pub fn with_listener(
        coordinator: Arc<SessionIdCoordinator>,
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let store = coordinator.store();
        let shared = ManagerShared {
            metadata: MetadataStore::new(store.metadata.clone(), config.consistency),
            attributes: AttributeStore::new(store.attributes.clone()),
            registry: coordinator.registry().clone(),
            config,
            coordinator,
            listener,
            state: RwLock::new(LifecycleState::New),
            held: RwLock::new(HashMap::new()),
            reaper: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The coordinator this manager is attached to.
    pub fn coordinator(&self) -> &Arc<SessionIdCoordinator> {
        &self.shared.coordinator
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Check if the manager is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Start the manager and schedule its idle reaper.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`Error::Config`] if the sweep interval is zero. Starting a running
    /// manager does nothing.
    pub fn start(&self) -> Result<()> {
        self.shared.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        {
            let mut state = self.shared.state.write();
            if *state == LifecycleState::Running {
                return Ok(());
            }
            *state = LifecycleState::Running;
        }

        self.shared.coordinator.attach(&self.shared);

        let reaper = IdleSessionReaper::spawn(
            &runtime,
            Arc::downgrade(&self.shared),
            self.shared.config.sweep_interval(),
        );
        if let Some(previous) = self.shared.reaper.lock().replace(reaper) {
            previous.shutdown();
        }

        info!(
            worker = %self.shared.coordinator.worker_name(),
            sweep_interval_ms = self.shared.config.sweep_interval_ms,
            "Session manager started"
        );
        Ok(())
    }

    /// Stop the manager.
    ///
    /// Cancels the reaper; a sweep already in flight finishes. Sessions are
    /// left in the cluster for other nodes unless invalidate-on-redeploy is
    /// set, in which case every session is removed.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if *state != LifecycleState::Running {
                return Ok(());
            }
            *state = LifecycleState::Stopping;
        }

        if let Some(reaper) = self.shared.reaper.lock().take() {
            reaper.shutdown();
        }

        let result = if self.shared.config.invalidate_on_redeploy {
            self.remove_all()
        } else {
            Ok(())
        };

        self.shared.coordinator.detach(&self.shared);
        *self.shared.state.write() = LifecycleState::Stopped;
        info!("Session manager stopped");
        result
    }

    fn remove_all(&self) -> Result<()> {
        info!("Removing all sessions");
        for cluster_id in self.shared.metadata.ids()? {
            if let Err(e) = self
                .shared
                .remove_session(&cluster_id, RemovalReason::Redeploy)
            {
                warn!(session_id = %cluster_id, error = %e, "Failed to remove session on redeploy");
            }
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Create a session with the configured idle window.
    pub fn create_session(&self) -> Result<Arc<SessionFacade>> {
        self.create_session_at(Utc::now(), self.shared.config.default_max_idle_ms())
    }

    /// Create a session with an explicit creation time and idle window.
    pub fn create_session_at(
        &self,
        created_at: DateTime<Utc>,
        max_idle_ms: i64,
    ) -> Result<Arc<SessionFacade>> {
        self.ensure_running()?;

        let cluster_id = self.shared.coordinator.new_session_id()?;
        let metadata = SessionMetadata::new(created_at, max_idle_ms);
        self.shared.metadata.put(&cluster_id, metadata.clone())?;
        self.shared.registry.add(&cluster_id)?;

        let session = Arc::new(SessionFacade::new(
            Arc::clone(&self.shared),
            cluster_id.clone(),
            &metadata,
        ));
        self.shared.hold(&session);

        debug!(session_id = %cluster_id, max_idle_ms, "Created session");
        self.shared.listener.session_created(&cluster_id);
        Ok(session)
    }

    /// Look up a session by cluster id or node id.
    ///
    /// Returns `Ok(None)` when no metadata exists for the id.
    pub fn get_session(&self, id: &str) -> Result<Option<Arc<SessionFacade>>> {
        self.ensure_running()?;

        let cluster_id = registry::cluster_id(id);
        let Some(metadata) = self.shared.metadata.get(cluster_id)? else {
            self.shared.release(cluster_id);
            return Ok(None);
        };

        if let Some(session) = self.shared.held(cluster_id) {
            return Ok(Some(session));
        }

        let session = Arc::new(SessionFacade::new(
            Arc::clone(&self.shared),
            cluster_id.to_string(),
            &metadata,
        ));
        self.shared.hold(&session);
        Ok(Some(session))
    }

    /// Handles for every session in the cluster.
    pub fn sessions(&self) -> Result<Vec<Arc<SessionFacade>>> {
        self.ensure_running()?;

        let mut sessions = Vec::new();
        for (cluster_id, metadata) in self.shared.metadata.entries()? {
            let session = match self.shared.held(&cluster_id) {
                Some(session) => session,
                None => {
                    let session = Arc::new(SessionFacade::new(
                        Arc::clone(&self.shared),
                        cluster_id,
                        &metadata,
                    ));
                    self.shared.hold(&session);
                    session
                }
            };
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// Remove a session from the cluster.
    ///
    /// Returns `false` if nothing was known about the id.
    pub fn remove_session(&self, id: &str) -> Result<bool> {
        self.shared
            .remove_session(registry::cluster_id(id), RemovalReason::Invalidated)
    }

    /// Give a session a fresh id. See [`SessionIdCoordinator::renew_session_id`].
    pub fn renew_session_id(&self, id: &str) -> Result<Option<RenewedId>> {
        self.shared.coordinator.renew_session_id(id)
    }

    /// Invalidate a session on every manager of this node.
    pub fn invalidate(&self, id: &str) -> Result<()> {
        self.shared.coordinator.invalidate_all(id)
    }

    /// Run one idle sweep now.
    pub fn sweep_idle(&self) -> SweepReport {
        reaper::sweep(&self.shared, Utc::now())
    }

    /// Run one idle sweep as of `now`.
    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> SweepReport {
        reaper::sweep(&self.shared, now)
    }

    /// Node id for a cluster id on this node.
    pub fn node_id(&self, cluster_id: &str) -> String {
        self.shared.coordinator.node_id(cluster_id)
    }

    /// Check if the reaper task is alive.
    pub fn reaper_running(&self) -> bool {
        self.shared
            .reaper
            .lock()
            .as_ref()
            .is_some_and(|reaper| reaper.is_running())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}
