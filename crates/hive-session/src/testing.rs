//! Shared helpers for unit tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::coordinator::SessionIdCoordinator;
use crate::events::{RemovalReason, SessionListener};
use crate::manager::SessionManager;
use crate::store::ClusterStore;

/// Listener that records every event it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    created: Mutex<Vec<String>>,
    removed: Mutex<Vec<(String, RemovalReason)>>,
    renewed: Mutex<Vec<(String, String)>>,
}

impl RecordingListener {
    pub(crate) fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub(crate) fn removed(&self) -> Vec<(String, RemovalReason)> {
        self.removed.lock().clone()
    }

    pub(crate) fn renewed(&self) -> Vec<(String, String)> {
        self.renewed.lock().clone()
    }
}

impl SessionListener for RecordingListener {
    fn session_created(&self, cluster_id: &str) {
        self.created.lock().push(cluster_id.to_string());
    }

    fn session_removed(&self, cluster_id: &str, reason: RemovalReason) {
        self.removed.lock().push((cluster_id.to_string(), reason));
    }

    fn session_renewed(&self, old_cluster_id: &str, new_cluster_id: &str) {
        self.renewed
            .lock()
            .push((old_cluster_id.to_string(), new_cluster_id.to_string()));
    }
}

/// A started manager on worker `node-1` over a fresh in-memory cluster.
///
/// Must be called inside a tokio runtime.
pub(crate) fn started_manager(
    config: SessionConfig,
) -> (
    Arc<SessionIdCoordinator>,
    SessionManager,
    Arc<RecordingListener>,
) {
    let coordinator = SessionIdCoordinator::new(ClusterStore::in_memory(), Some("node-1")).unwrap();
    let listener = Arc::new(RecordingListener::default());
    let manager = SessionManager::with_listener(coordinator.clone(), config, listener.clone());
    manager.start().unwrap();
    (coordinator, manager, listener)
}
