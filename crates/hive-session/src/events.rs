//! Host notification hooks.

/// Why a session left the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicitly invalidated, on this node or through a broadcast.
    Invalidated,
    /// Evicted by the idle sweep.
    Idle,
    /// Removed on manager stop with invalidate-on-redeploy enabled.
    Redeploy,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Invalidated => write!(f, "invalidated"),
            RemovalReason::Idle => write!(f, "idle"),
            RemovalReason::Redeploy => write!(f, "redeploy"),
        }
    }
}

/// Callbacks a host adapter implements to keep its request-bound session
/// objects in step with the cluster.
///
/// All methods default to doing nothing. Callbacks may run on the reaper
/// worker or while the coordinator holds its renewal lock, so they should
/// return quickly.
pub trait SessionListener: Send + Sync {
    /// A session was created by this manager.
    fn session_created(&self, _cluster_id: &str) {}

    /// A session this manager knew about was removed.
    fn session_removed(&self, _cluster_id: &str, _reason: RemovalReason) {}

    /// A session id was renewed.
    fn session_renewed(&self, _old_cluster_id: &str, _new_cluster_id: &str) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Default)]
pub struct NoopListener;

impl SessionListener for NoopListener {}
