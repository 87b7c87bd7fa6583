//! Request-facing view of one cluster session.
//!
//! A [`SessionFacade`] caches nothing but its own ids, creation time and the
//! last idle window it saw. Every attribute and metadata operation goes
//! straight to the cluster store, so any node always sees the latest values
//! the store can offer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::coordinator::RenewedId;
use crate::error::{Error, Result};
use crate::manager::ManagerShared;
use crate::metadata::SessionMetadata;

/// Session operations a host adapter binds to its request objects.
pub trait HttpSession: Send + Sync {
    /// Cluster id of the session.
    fn id(&self) -> String;

    /// When the session was created.
    fn creation_time(&self) -> DateTime<Utc>;

    /// Fetch an attribute. Never consults metadata.
    fn get_attribute(&self, name: &str) -> Result<Option<Value>>;

    /// Store an attribute. Setting `Value::Null` does nothing.
    fn set_attribute(&self, name: &str, value: Value) -> Result<()>;

    /// Remove an attribute. Does nothing if it was never set.
    fn remove_attribute(&self, name: &str) -> Result<()>;

    /// Names of all attributes currently set.
    fn attribute_names(&self) -> Result<Vec<String>>;

    /// Idle window in seconds.
    fn max_inactive_interval(&self) -> Result<i64>;

    /// Set the idle window in seconds. Zero or negative disables eviction.
    fn set_max_inactive_interval(&self, secs: i64) -> Result<()>;

    /// Record whether the id changed since the host last looked.
    fn set_id_changed(&self, changed: bool) -> Result<()>;

    /// Terminate the session on every manager of this node.
    fn invalidate(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct SessionIds {
    cluster_id: String,
    node_id: String,
}

/// Handle to one cluster session.
pub struct SessionFacade {
    manager: Arc<ManagerShared>,
    ids: RwLock<SessionIds>,
    created_at: DateTime<Utc>,
    max_idle_ms: AtomicI64,
    id_changed: AtomicBool,
    valid: AtomicBool,
}

impl SessionFacade {
    pub(crate) fn new(
        manager: Arc<ManagerShared>,
        cluster_id: String,
        metadata: &SessionMetadata,
    ) -> Self {
        let node_id = manager.coordinator.node_id(&cluster_id);
        Self {
            manager,
            ids: RwLock::new(SessionIds {
                cluster_id,
                node_id,
            }),
            created_at: metadata.created_at,
            max_idle_ms: AtomicI64::new(metadata.max_idle_ms),
            id_changed: AtomicBool::new(metadata.id_changed),
            valid: AtomicBool::new(true),
        }
    }

    /// Storage key of the session.
    pub fn cluster_id(&self) -> String {
        self.ids.read().cluster_id.clone()
    }

    /// Routing id of the session on this node.
    pub fn node_id(&self) -> String {
        self.ids.read().node_id.clone()
    }

    /// Whether the session is still usable.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Whether the id changed since the host last acknowledged it.
    pub fn is_id_changed(&self) -> bool {
        self.id_changed.load(Ordering::Acquire)
    }

    /// Record an access, restarting the idle clock.
    pub fn access(&self) -> Result<()> {
        self.access_at(Utc::now())
    }

    /// Record an access at `now`.
    pub fn access_at(&self, now: DateTime<Utc>) -> Result<()> {
        let updated = self.on_current_id(|id| {
            self.manager
                .metadata
                .update(id, |m| m.last_accessed_at = now)
        })?;
        match updated {
            Some(()) => Ok(()),
            None => Err(self.gone(self.cluster_id())),
        }
    }

    /// Fetch an attribute and deserialize it.
    pub fn get_attribute_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let value = self.get_attribute(name)?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Serialize and store an attribute.
    pub fn set_attribute_as<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.set_attribute(name, serde_json::to_value(value)?)
    }

    pub(crate) fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn rekey(&self, renewed: &RenewedId) {
        let mut ids = self.ids.write();
        ids.cluster_id = renewed.cluster_id.clone();
        ids.node_id = renewed.node_id.clone();
        self.id_changed.store(true, Ordering::Release);
    }

    fn ensure_valid(&self) -> Result<String> {
        let id = self.cluster_id();
        if self.is_valid() {
            Ok(id)
        } else {
            Err(Error::SessionInvalidated(id))
        }
    }

    /// Run `op` against the session's current id.
    ///
    /// `op` returns `Ok(None)` when nothing is stored under the id it was
    /// given. If a renewal re-keyed this handle in the meantime, `op` runs
    /// again under the new id; otherwise the miss is passed back.
    fn on_current_id<R>(
        &self,
        mut op: impl FnMut(&str) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        loop {
            let id = self.ensure_valid()?;
            if let Some(out) = op(&id)? {
                return Ok(Some(out));
            }

            // Renewal drops the old record before re-keying handles, so the
            // miss only counts once no renewal is half done.
            let _settled = self.manager.coordinator.renewal_guard();
            if self.cluster_id() == id {
                return Ok(None);
            }
            trace!(
                old_session_id = %id,
                session_id = %self.cluster_id(),
                "Session renewed mid-operation, retrying"
            );
        }
    }

    /// The metadata record disappeared underneath this handle.
    fn gone(&self, id: String) -> Error {
        self.mark_invalid();
        Error::SessionInvalidated(id)
    }

    fn is_sticky_key(&self, name: &str) -> bool {
        name == self.manager.config.sticky_session_key
    }
}

impl HttpSession for SessionFacade {
    fn id(&self) -> String {
        self.cluster_id()
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn get_attribute(&self, name: &str) -> Result<Option<Value>> {
        self.on_current_id(|id| self.manager.attributes.get(id, name))
    }

    fn set_attribute(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_valid()?;
        if value.is_null() {
            return Ok(());
        }

        let sticky = self.is_sticky_key(name);
        let keep_alive = matches!(value, Value::Bool(true));

        let updated = self.on_current_id(|id| {
            self.manager.attributes.put(id, name, value.clone())?;
            let updated = self.manager.metadata.update(id, |m| {
                m.attribute_names.insert(name.to_string());
                if sticky {
                    m.keep_alive = keep_alive;
                }
            })?;
            if updated.is_none() {
                // No record names the value; don't leave it orphaned.
                self.manager.attributes.remove(id, name)?;
            }
            Ok(updated)
        })?;

        match updated {
            Some(()) => Ok(()),
            None => Err(self.gone(self.cluster_id())),
        }
    }

    fn remove_attribute(&self, name: &str) -> Result<()> {
        let sticky = self.is_sticky_key(name);
        self.on_current_id(|id| {
            let Some(metadata) = self.manager.metadata.get(id)? else {
                return Ok(None);
            };
            if !metadata.attribute_names.contains(name) {
                return Ok(Some(()));
            }

            self.manager.attributes.remove(id, name)?;
            self.manager.metadata.update(id, |m| {
                m.attribute_names.remove(name);
                if sticky {
                    m.keep_alive = false;
                }
            })
        })?;
        Ok(())
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        let names = self.on_current_id(|id| {
            Ok(self
                .manager
                .metadata
                .get(id)?
                .map(|m| m.attribute_names.into_iter().collect::<Vec<_>>()))
        })?;
        Ok(names.unwrap_or_default())
    }

    fn max_inactive_interval(&self) -> Result<i64> {
        let stored =
            self.on_current_id(|id| Ok(self.manager.metadata.get(id)?.map(|m| m.max_idle_ms)))?;
        if let Some(stored) = stored {
            let cached = self.max_idle_ms.swap(stored, Ordering::AcqRel);
            if cached != stored {
                trace!(
                    session_id = %self.cluster_id(),
                    cached,
                    stored,
                    "Idle window changed on another node"
                );
            }
        }
        Ok(self.max_idle_ms.load(Ordering::Acquire) / 1000)
    }

    fn set_max_inactive_interval(&self, secs: i64) -> Result<()> {
        let max_idle_ms = secs.saturating_mul(1000);
        self.on_current_id(|id| {
            self.manager
                .metadata
                .update(id, |m| m.max_idle_ms = max_idle_ms)
        })?;
        self.max_idle_ms.store(max_idle_ms, Ordering::Release);
        Ok(())
    }

    fn set_id_changed(&self, changed: bool) -> Result<()> {
        self.on_current_id(|id| self.manager.metadata.update(id, |m| m.id_changed = changed))?;
        self.id_changed.store(changed, Ordering::Release);
        Ok(())
    }

    fn invalidate(&self) -> Result<()> {
        let id = self.ensure_valid()?;
        self.manager.coordinator.invalidate_all(&id)
    }
}

impl std::fmt::Debug for SessionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = self.ids.read();
        f.debug_struct("SessionFacade")
            .field("cluster_id", &ids.cluster_id)
            .field("node_id", &ids.node_id)
            .field("created_at", &self.created_at)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::attribute_key;
    use crate::config::{ConsistencyMode, DEFAULT_STICKY_SESSION_KEY, SessionConfig};
    use crate::coordinator::SessionIdCoordinator;
    use crate::manager::SessionManager;
    use crate::store::{ClusterMap, ClusterStore, InMemoryMap, InMemorySet};
    use crate::testing::started_manager;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Weak;

    fn stored_names(session: &SessionFacade) -> Vec<String> {
        session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap()
            .map(|m| m.attribute_names.into_iter().collect())
            .unwrap_or_default()
    }

    fn keep_alive(session: &SessionFacade) -> bool {
        session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap()
            .unwrap()
            .keep_alive
    }

    #[tokio::test]
    async fn test_cart_scenario() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session_at(Utc::now(), 60_000).unwrap();
        let id = session.cluster_id();

        session.set_attribute("cart", json!(["item1"])).unwrap();
        assert_eq!(session.attribute_names().unwrap(), vec!["cart".to_string()]);
        assert_eq!(session.get_attribute("cart").unwrap(), Some(json!(["item1"])));

        session.remove_attribute("cart").unwrap();
        assert!(session.attribute_names().unwrap().is_empty());
        assert!(!session.manager.attributes.contains(&id, "cart").unwrap());
        assert_eq!(session.get_attribute("cart").unwrap(), None);
    }

    #[tokio::test]
    async fn test_null_value_is_noop() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();

        session.set_attribute("a", Value::Null).unwrap();
        assert!(session.attribute_names().unwrap().is_empty());
        assert_eq!(session.get_attribute("a").unwrap(), None);

        // Null does not remove an existing value either.
        session.set_attribute("a", json!(1)).unwrap();
        session.set_attribute("a", Value::Null).unwrap();
        assert_eq!(session.get_attribute("a").unwrap(), Some(json!(1)));
        assert_eq!(session.attribute_names().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_missing_attribute_is_noop() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();
        session.set_attribute("keep", json!("x")).unwrap();
        let before = session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap();

        session.remove_attribute("never-set").unwrap();

        let after = session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_sticky_key_toggles_keep_alive() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();

        session
            .set_attribute(DEFAULT_STICKY_SESSION_KEY, json!(true))
            .unwrap();
        assert!(keep_alive(&session));

        session
            .set_attribute(DEFAULT_STICKY_SESSION_KEY, json!(false))
            .unwrap();
        assert!(!keep_alive(&session));

        session
            .set_attribute(DEFAULT_STICKY_SESSION_KEY, json!(true))
            .unwrap();
        session.remove_attribute(DEFAULT_STICKY_SESSION_KEY).unwrap();
        assert!(!keep_alive(&session));
    }

    #[tokio::test]
    async fn test_custom_sticky_key() {
        let config = SessionConfig::default().with_sticky_session_key("pin");
        let (_, manager, _) = started_manager(config);
        let session = manager.create_session().unwrap();

        session
            .set_attribute(DEFAULT_STICKY_SESSION_KEY, json!(true))
            .unwrap();
        assert!(!keep_alive(&session));

        session.set_attribute("pin", json!(true)).unwrap();
        assert!(keep_alive(&session));

        // Non-boolean values are not truthy.
        session.set_attribute("pin", json!("yes")).unwrap();
        assert!(!keep_alive(&session));
    }

    #[tokio::test]
    async fn test_max_idle_round_trip() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();

        session.set_max_inactive_interval(300).unwrap();
        assert_eq!(session.max_inactive_interval().unwrap(), 300);
        let stored = session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap()
            .unwrap();
        assert_eq!(stored.max_idle_ms, 300_000);
    }

    #[tokio::test]
    async fn test_max_idle_resyncs_from_store() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();
        let id = session.cluster_id();

        // Another node changes the idle window directly in the store.
        session
            .manager
            .metadata
            .update(&id, |m| m.max_idle_ms = 42_000)
            .unwrap();

        assert_eq!(session.max_inactive_interval().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_set_id_changed() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();

        session.set_id_changed(true).unwrap();
        assert!(session.is_id_changed());
        let stored = session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap()
            .unwrap();
        assert!(stored.id_changed);
    }

    #[tokio::test]
    async fn test_access_moves_idle_clock() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let created = Utc::now() - chrono::Duration::seconds(10);
        let session = manager.create_session_at(created, 1000).unwrap();

        let now = Utc::now();
        session.access_at(now).unwrap();
        let stored = session
            .manager
            .metadata
            .get(&session.cluster_id())
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_accessed_at, now);
        assert_eq!(stored.created_at, created);
    }

    #[tokio::test]
    async fn test_typed_attributes() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Cart {
            items: Vec<String>,
        }

        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();
        let cart = Cart {
            items: vec!["item1".to_string()],
        };

        session.set_attribute_as("cart", &cart).unwrap();
        assert_eq!(session.get_attribute_as::<Cart>("cart").unwrap(), Some(cart));
        assert_eq!(session.get_attribute_as::<Cart>("missing").unwrap(), None);
        assert!(matches!(
            session.get_attribute_as::<u32>("cart"),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_set_after_external_removal() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();
        let id = session.cluster_id();

        // Another node evicts the session.
        session.manager.metadata.remove(&id).unwrap();

        let result = session.set_attribute("late", json!(1));
        assert!(matches!(result, Err(Error::SessionInvalidated(_))));
        assert!(!session.manager.attributes.contains(&id, "late").unwrap());
        assert!(!session.is_valid());
    }

    /// Attribute map that renews the owning session just before storing
    /// the armed key, as a renewal on another request thread would.
    struct RenewingAttributes {
        inner: InMemoryMap<Value>,
        coordinator: Mutex<Weak<SessionIdCoordinator>>,
        armed: Mutex<Option<String>>,
    }

    impl ClusterMap<Value> for RenewingAttributes {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: Value) -> Result<()> {
            let fire = {
                let mut armed = self.armed.lock();
                if armed.as_deref() == Some(key) {
                    armed.take()
                } else {
                    None
                }
            };
            if let Some(key) = fire {
                let session_id = key.split('#').next().unwrap_or_default().to_string();
                if let Some(coordinator) = self.coordinator.lock().upgrade() {
                    coordinator.renew_session_id(&session_id)?;
                }
            }
            self.inner.put(key, value)
        }
        fn remove(&self, key: &str) -> Result<Option<Value>> {
            self.inner.remove(key)
        }
        fn contains_key(&self, key: &str) -> Result<bool> {
            self.inner.contains_key(key)
        }
        fn entries(&self) -> Result<Vec<(String, Value)>> {
            self.inner.entries()
        }
    }

    #[tokio::test]
    async fn test_set_attribute_follows_concurrent_renewal() {
        let attributes = Arc::new(RenewingAttributes {
            inner: InMemoryMap::new(),
            coordinator: Mutex::new(Weak::new()),
            armed: Mutex::new(None),
        });
        let store = ClusterStore::new(
            Arc::new(InMemoryMap::<SessionMetadata>::new()),
            attributes.clone(),
            Arc::new(InMemorySet::new()),
        );
        let coordinator = SessionIdCoordinator::new(store, Some("node-1")).unwrap();
        *attributes.coordinator.lock() = Arc::downgrade(&coordinator);
        let manager = SessionManager::new(coordinator.clone(), SessionConfig::default());
        manager.start().unwrap();

        let session = manager.create_session().unwrap();
        session.set_attribute("cart", json!(["item1"])).unwrap();
        let old_id = session.cluster_id();
        *attributes.armed.lock() = Some(attribute_key(&old_id, "late"));

        session.set_attribute("late", json!(1)).unwrap();

        let new_id = session.cluster_id();
        assert_ne!(new_id, old_id);
        assert!(session.is_valid());
        assert!(session.is_id_changed());
        assert_eq!(session.get_attribute("late").unwrap(), Some(json!(1)));
        assert_eq!(session.get_attribute("cart").unwrap(), Some(json!(["item1"])));
        assert_eq!(
            stored_names(&session),
            vec!["cart".to_string(), "late".to_string()]
        );

        // Nothing is left behind under the retired id.
        assert!(
            attributes
                .inner
                .keys()
                .unwrap()
                .iter()
                .all(|key| key.starts_with(&new_id))
        );
        assert!(!coordinator.id_in_use(&old_id).unwrap());

        let found = manager.get_session(&new_id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &session));
    }

    #[tokio::test]
    async fn test_names_empty_when_metadata_missing() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();
        session
            .manager
            .metadata
            .remove(&session.cluster_id())
            .unwrap();
        assert!(session.attribute_names().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidated_handle_rejects_operations() {
        let (_, manager, _) = started_manager(SessionConfig::default());
        let session = manager.create_session().unwrap();

        session.invalidate().unwrap();
        assert!(!session.is_valid());
        assert!(matches!(
            session.get_attribute("a"),
            Err(Error::SessionInvalidated(_))
        ));
        assert!(matches!(
            session.set_attribute("a", json!(1)),
            Err(Error::SessionInvalidated(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, i64),
        SetNull(String),
        Remove(String),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let name = prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")].prop_map(String::from);
        prop_oneof![
            (name.clone(), any::<i64>()).prop_map(|(n, v)| Op::Set(n, v)),
            name.clone().prop_map(Op::SetNull),
            name.prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Property: attribute names always mirror the attribute store.
        #[test]
        fn attribute_names_mirror_store(
            ops in prop::collection::vec(op_strategy(), 0..40),
            versioned in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let _guard = runtime.enter();

            let mode = if versioned {
                ConsistencyMode::Versioned { max_retries: 3 }
            } else {
                ConsistencyMode::LastWriterWins
            };
            let (_, manager, _) = started_manager(SessionConfig::default().with_consistency(mode));
            let session = manager.create_session().unwrap();
            let id = session.cluster_id();

            for op in ops {
                match op {
                    Op::Set(name, value) => session.set_attribute(&name, json!(value)).unwrap(),
                    Op::SetNull(name) => session.set_attribute(&name, Value::Null).unwrap(),
                    Op::Remove(name) => session.remove_attribute(&name).unwrap(),
                }
            }

            let names = stored_names(&session);
            for candidate in ["a", "b", "c", "d"] {
                let present = session.manager.attributes.contains(&id, candidate).unwrap();
                prop_assert_eq!(present, names.iter().any(|n| n == candidate));
            }
            manager.stop().unwrap();
        }
    }
}
