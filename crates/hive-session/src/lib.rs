//! Cluster-replicated session state.
//!
//! Session metadata and attribute values live in a shared cluster store so
//! that a session survives node failover and load-balancer re-routing.
//! This crate provides:
//! - Read-through/write-through session handles that keep each session's
//!   attribute-name index in step with its stored attributes
//! - A periodic idle reaper with a keep-alive override
//! - Session-id renewal and invalidation broadcast across every manager on
//!   a node
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_session::{ClusterStore, HttpSession, SessionConfig, SessionIdCoordinator, SessionManager};
//!
//! let coordinator = SessionIdCoordinator::new(ClusterStore::in_memory(), Some("web-1"))?;
//! let manager = SessionManager::new(coordinator, SessionConfig::default());
//! manager.start()?;
//!
//! let session = manager.create_session()?;
//! session.set_attribute("cart", serde_json::json!(["item1"]))?;
//! ```

mod attributes;
mod config;
mod coordinator;
mod error;
mod events;
mod facade;
mod manager;
mod metadata;
mod reaper;
mod registry;
mod store;
#[cfg(test)]
mod testing;

pub use attributes::{AttributeStore, KEY_SEPARATOR, attribute_key};
pub use config::{
    ConsistencyMode, DEFAULT_MAX_IDLE_SECS, DEFAULT_MAX_RETRIES, DEFAULT_STICKY_SESSION_KEY,
    DEFAULT_SWEEP_INTERVAL_SECS, SessionConfig,
};
pub use coordinator::{RenewedId, SessionIdCoordinator};
pub use error::{Error, Result};
pub use events::{NoopListener, RemovalReason, SessionListener};
pub use facade::{HttpSession, SessionFacade};
pub use manager::{LifecycleState, SessionManager};
pub use metadata::{MetadataStore, SessionMetadata};
pub use reaper::{IdleSessionReaper, SweepReport};
pub use registry::{NODE_SEPARATOR, SessionIdRegistry, cluster_id, node_id, resolve_worker_name};
pub use store::{ClusterMap, ClusterSet, ClusterStore, InMemoryMap, InMemorySet};
