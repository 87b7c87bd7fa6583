//! Idle session eviction.
//!
//! Each started manager owns one reaper task. The task sleeps for the sweep
//! interval, runs a sweep on the blocking pool, and repeats; the next delay
//! starts only once the previous sweep finished. Stopping the manager
//! cancels the task between sweeps. A sweep already running completes.

use std::sync::Weak;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::RemovalReason;
use crate::manager::ManagerShared;

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Whether the sweep was skipped because the manager was not running.
    pub skipped: bool,
    /// Number of metadata records examined.
    pub sessions_checked: usize,
    /// Number of sessions evicted.
    pub sessions_evicted: usize,
    /// Ids of evicted sessions.
    pub evicted_ids: Vec<String>,
    /// Sessions whose eviction failed, with the error message.
    pub failures: Vec<(String, String)>,
}

/// Scan every metadata record and evict idle sessions.
///
/// Keep-alive sessions and sessions with a non-positive idle window are
/// never evicted. A store failure on one session is logged and the sweep
/// moves on to the next.
pub(crate) fn sweep(manager: &ManagerShared, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    if !manager.is_running() {
        debug!(state = ?manager.state(), "Manager not running, skipping idle sweep");
        report.skipped = true;
        return report;
    }

    let entries = match manager.metadata.entries() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Failed to list sessions for idle sweep");
            report.failures.push((String::new(), e.to_string()));
            return report;
        }
    };

    for (cluster_id, snapshot) in entries {
        report.sessions_checked += 1;
        if !snapshot.is_idle(now) {
            continue;
        }

        match evict(manager, &cluster_id, now) {
            Ok(true) => {
                debug!(session_id = %cluster_id, idle_ms = snapshot.idle_ms(now), "Evicted idle session");
                report.sessions_evicted += 1;
                report.evicted_ids.push(cluster_id);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(session_id = %cluster_id, error = %e, "Failed to evict idle session");
                report.failures.push((cluster_id, e.to_string()));
            }
        }
    }

    if report.sessions_evicted > 0 || !report.failures.is_empty() {
        info!(
            sessions_checked = report.sessions_checked,
            sessions_evicted = report.sessions_evicted,
            failures = report.failures.len(),
            "Idle sweep completed"
        );
    }
    report
}

/// Re-read the record and evict it if it is still idle.
fn evict(manager: &ManagerShared, cluster_id: &str, now: DateTime<Utc>) -> Result<bool> {
    match manager.metadata.get(cluster_id)? {
        Some(current) if current.is_idle(now) => {
            manager.purge(cluster_id, Some(current), RemovalReason::Idle)
        }
        _ => Ok(false),
    }
}

/// Background worker running periodic idle sweeps for one manager.
#[derive(Debug)]
pub struct IdleSessionReaper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IdleSessionReaper {
    /// Schedule sweeps every `delay` on `runtime`.
    ///
    /// The task exits on cancellation or once the manager is dropped.
    pub(crate) fn spawn(runtime: &Handle, manager: Weak<ManagerShared>, delay: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let result =
                    tokio::task::spawn_blocking(move || sweep(&manager, Utc::now())).await;
                if let Err(e) = result {
                    warn!(error = %e, "Idle sweep task failed");
                }
            }
            debug!("Idle session reaper stopped");
        });

        Self { cancel, task }
    }

    /// Check if the worker task is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel future sweeps. Does not wait for a sweep in progress.
    pub fn shutdown(self) {
        self.cancel.cancel();
    }
}
