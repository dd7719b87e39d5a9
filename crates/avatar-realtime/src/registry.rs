use crate::{
    connection::Connection,
    session::{SessionId, SessionInfo},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Maps session identifiers to their single live connection.
///
/// Cheap to clone; clones share the same map. Each registry is independent,
/// so tests can build their own.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Connection>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates an identifier no live session uses, builds the connection for
    /// it and registers it, all under one write lock.
    pub(crate) async fn insert_new<T>(
        &self,
        build: impl FnOnce(SessionId) -> (Arc<Connection>, T),
    ) -> T {
        let mut sessions = self.sessions.write().await;
        let mut session_id = SessionId::generate();
        while sessions.contains_key(&session_id) {
            session_id = SessionId::generate();
        }
        let (connection, extra) = build(session_id.clone());
        sessions.insert(session_id, connection);
        extra
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn remove(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Removes the entry only if it still points at `connection`.
    pub(crate) async fn remove_if_same(
        &self,
        session_id: &SessionId,
        connection: &Arc<Connection>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every live connection.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|c| c.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregator::FragmentAggregator, config::AvatarConfig};

    fn config() -> Arc<AvatarConfig> {
        Arc::new(AvatarConfig::new(
            "ws://127.0.0.1:9/v1/interact",
            "app",
            "k",
            "s",
            "avatar",
            "vcn",
        ))
    }

    async fn register(registry: &SessionRegistry) -> Arc<Connection> {
        let aggregator = Arc::new(FragmentAggregator::new());
        registry
            .insert_new(|id| {
                let (conn, _io, _ready) = Connection::new(id, config(), aggregator);
                (conn.clone(), conn)
            })
            .await
    }

    #[tokio::test]
    async fn test_registered_sessions_resolve() {
        let registry = SessionRegistry::new();
        let a = register(&registry).await;
        let b = register(&registry).await;

        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(registry.len().await, 2);
        assert!(Arc::ptr_eq(
            &registry.get(a.session_id()).await.unwrap(),
            &a
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_isolated() {
        let registry = SessionRegistry::new();
        let a = register(&registry).await;
        let b = register(&registry).await;

        assert!(registry.remove(a.session_id()).await.is_some());
        assert!(registry.remove(a.session_id()).await.is_none());
        assert!(registry.contains(b.session_id()).await);
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_other_instances() {
        let registry = SessionRegistry::new();
        let a = register(&registry).await;
        let other = register(&SessionRegistry::new()).await;

        assert!(!registry.remove_if_same(a.session_id(), &other).await);
        assert!(registry.contains(a.session_id()).await);
        assert!(registry.remove_if_same(a.session_id(), &a).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registries_do_not_share_state() {
        let first = SessionRegistry::new();
        let second = SessionRegistry::new();
        register(&first).await;

        assert_eq!(first.len().await, 1);
        assert!(second.is_empty().await);
        assert_eq!(first.clone().len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_and_list() {
        let registry = SessionRegistry::new();
        register(&registry).await;
        register(&registry).await;

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.stream_url.is_none()));

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.is_empty().await);
    }
}
