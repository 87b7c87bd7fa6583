//! Integration tests: two nodes sharing one cluster store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use hive_session::{
    ClusterStore, HttpSession, SessionConfig, SessionIdCoordinator, SessionManager,
};
use serde_json::json;

struct Node {
    coordinator: Arc<SessionIdCoordinator>,
    manager: SessionManager,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("hive_session=debug")
        .try_init();
}

/// Start a node on `store` with the given worker name.
fn start_node(store: &ClusterStore, worker: &str) -> Node {
    let coordinator = SessionIdCoordinator::new(store.clone(), Some(worker)).expect("coordinator");
    let manager = SessionManager::new(coordinator.clone(), SessionConfig::default());
    manager.start().expect("start");
    Node {
        coordinator,
        manager,
    }
}

#[tokio::test]
async fn test_session_visible_on_other_node() {
    init_tracing();
    let store = ClusterStore::in_memory();
    let a = start_node(&store, "node-a");
    let b = start_node(&store, "node-b");

    let session = a.manager.create_session().unwrap();
    session.set_attribute("user", json!("ann")).unwrap();

    // The load balancer routes the next request to node b with a's node id.
    let routed = session.node_id();
    assert!(routed.ends_with(".node-a"));
    let on_b = b.manager.get_session(&routed).unwrap().unwrap();

    assert_eq!(on_b.cluster_id(), session.cluster_id());
    assert_eq!(on_b.node_id(), b.manager.node_id(&session.cluster_id()));
    assert_eq!(on_b.get_attribute("user").unwrap(), Some(json!("ann")));

    // Writes on b are read through on a.
    on_b.set_attribute("theme", json!("dark")).unwrap();
    let mut names = session.attribute_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["theme".to_string(), "user".to_string()]);
    assert_eq!(session.get_attribute("theme").unwrap(), Some(json!("dark")));
}

#[tokio::test]
async fn test_renewal_on_one_node_is_seen_by_the_other() {
    init_tracing();
    let store = ClusterStore::in_memory();
    let a = start_node(&store, "node-a");
    let b = start_node(&store, "node-b");

    let session = a.manager.create_session().unwrap();
    session.set_attribute("cart", json!(["item1"])).unwrap();
    let old_id = session.cluster_id();

    let renewed = b.coordinator.renew_session_id(&old_id).unwrap().unwrap();

    assert!(!a.coordinator.id_in_use(&old_id).unwrap());
    assert!(a.coordinator.id_in_use(&renewed.cluster_id).unwrap());
    assert!(a.manager.get_session(&old_id).unwrap().is_none());

    let moved = a.manager.get_session(&renewed.cluster_id).unwrap().unwrap();
    assert_eq!(moved.get_attribute("cart").unwrap(), Some(json!(["item1"])));
    assert_eq!(moved.creation_time(), session.creation_time());
}

#[tokio::test]
async fn test_invalidation_reaches_other_node_lazily() {
    init_tracing();
    let store = ClusterStore::in_memory();
    let a = start_node(&store, "node-a");
    let b = start_node(&store, "node-b");

    let session = a.manager.create_session().unwrap();
    session.set_attribute("user", json!("ann")).unwrap();
    let id = session.cluster_id();
    let on_b = b.manager.get_session(&id).unwrap().unwrap();

    // Logout handled by node b.
    on_b.invalidate().unwrap();

    assert!(!on_b.is_valid());
    assert!(!a.coordinator.id_in_use(&id).unwrap());
    assert!(a.manager.get_session(&id).unwrap().is_none());
    assert!(!session.is_valid());

    // Invalidating again is a no-op.
    b.coordinator.invalidate_all(&id).unwrap();
}

#[tokio::test]
async fn test_any_node_evicts_idle_sessions() {
    init_tracing();
    let store = ClusterStore::in_memory();
    let a = start_node(&store, "node-a");
    let b = start_node(&store, "node-b");

    let stale = Utc::now() - Duration::milliseconds(2000);
    let idle = a.manager.create_session_at(stale, 1000).unwrap();
    idle.set_attribute("cart", json!(["item1"])).unwrap();
    let pinned = a.manager.create_session_at(stale, 1000).unwrap();
    pinned
        .set_attribute(&a.manager.config().sticky_session_key, json!(true))
        .unwrap();

    let report = b.manager.sweep_idle();

    assert_eq!(report.sessions_checked, 2);
    assert_eq!(report.evicted_ids, vec![idle.cluster_id()]);
    assert!(!a.coordinator.id_in_use(&idle.cluster_id()).unwrap());
    assert!(a.manager.get_session(&idle.cluster_id()).unwrap().is_none());
    assert!(a.manager.get_session(&pinned.cluster_id()).unwrap().is_some());
}

#[tokio::test]
async fn test_stopping_one_node_keeps_sessions_for_others() {
    init_tracing();
    let store = ClusterStore::in_memory();
    let a = start_node(&store, "node-a");
    let b = start_node(&store, "node-b");

    let session = a.manager.create_session().unwrap();
    session.set_attribute("user", json!("ann")).unwrap();
    a.manager.stop().unwrap();

    let on_b = b.manager.get_session(&session.node_id()).unwrap().unwrap();
    assert_eq!(on_b.get_attribute("user").unwrap(), Some(json!("ann")));
}
