use std::collections::HashMap;

use {
    relay_protocol::{Identity, PresenceUser},
    tokio::sync::RwLock,
};

use crate::state::ConnectionHandle;

/// An online participant and the connection that currently represents it.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub identity: Identity,
    pub handle: ConnectionHandle,
}

impl PresenceEntry {
    pub fn user(&self) -> PresenceUser {
        PresenceUser::from(&self.identity)
    }
}

#[derive(Default)]
struct Entries {
    /// identity id → entry
    by_id: HashMap<String, PresenceEntry>,
    /// identity ids in first-registration order
    order: Vec<String>,
}

/// Registry of online identities. At most one entry per identity id; the
/// most recent registration wins.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<Entries>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `identity.id`. Returns the replaced
    /// entry; its handle is left open and simply stops receiving pushes.
    pub async fn register(
        &self,
        identity: Identity,
        handle: ConnectionHandle,
    ) -> Option<PresenceEntry> {
        let mut entries = self.entries.write().await;
        let id = identity.id.clone();
        let entry = PresenceEntry { identity, handle };
        let previous = entries.by_id.insert(id.clone(), entry);
        if previous.is_none() {
            entries.order.push(id);
        }
        previous
    }

    /// Remove the entry for `identity_id`. No-op if absent.
    pub async fn unregister(&self, identity_id: &str) -> Option<PresenceEntry> {
        let mut entries = self.entries.write().await;
        Self::remove_locked(&mut entries, identity_id)
    }

    /// Remove the entry only while it still belongs to `conn_id`, so a
    /// superseded connection closing does not evict its replacement.
    pub async fn unregister_if_current(
        &self,
        identity_id: &str,
        conn_id: &str,
    ) -> Option<PresenceEntry> {
        let mut entries = self.entries.write().await;
        let current = entries
            .by_id
            .get(identity_id)
            .is_some_and(|e| e.handle.conn_id == conn_id);
        if !current {
            return None;
        }
        Self::remove_locked(&mut entries, identity_id)
    }

    fn remove_locked(entries: &mut Entries, identity_id: &str) -> Option<PresenceEntry> {
        let removed = entries.by_id.remove(identity_id)?;
        entries.order.retain(|id| id != identity_id);
        Some(removed)
    }

    pub async fn lookup(&self, identity_id: &str) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .await
            .by_id
            .get(identity_id)
            .map(|e| e.handle.clone())
    }

    /// Consistent copy of all entries in registration order.
    pub async fn snapshot(&self) -> Vec<PresenceEntry> {
        let entries = self.entries.read().await;
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    pub async fn users(&self) -> Vec<PresenceUser> {
        self.snapshot().await.iter().map(PresenceEntry::user).collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, tokio::sync::mpsc};

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.into(),
            name: format!("user {id}"),
            email: format!("{id}@example.com"),
        }
    }

    fn handle(conn_id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        ConnectionHandle::channel(conn_id)
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let reg = PresenceRegistry::new();
        let (h, _rx) = handle("c1");
        assert!(reg.register(identity("1"), h).await.is_none());

        assert_eq!(reg.lookup("1").await.unwrap().conn_id, "c1");
        assert!(reg.lookup("2").await.is_none());

        assert!(reg.unregister("1").await.is_some());
        assert!(reg.lookup("1").await.is_none());
        assert!(reg.unregister("1").await.is_none());
    }

    #[tokio::test]
    async fn second_registration_replaces_first() {
        let reg = PresenceRegistry::new();
        let (h1, _rx1) = handle("c1");
        let (h2, _rx2) = handle("c2");
        reg.register(identity("1"), h1).await;
        let replaced = reg.register(identity("1"), h2).await.unwrap();

        assert_eq!(replaced.handle.conn_id, "c1");
        assert_eq!(reg.count().await, 1);
        assert_eq!(reg.lookup("1").await.unwrap().conn_id, "c2");
    }

    #[tokio::test]
    async fn snapshot_keeps_first_registration_order() {
        let reg = PresenceRegistry::new();
        for (id, conn) in [("a", "c1"), ("b", "c2"), ("c", "c3")] {
            let (h, _rx) = handle(conn);
            reg.register(identity(id), h).await;
        }
        let (h, _rx) = handle("c4");
        reg.register(identity("a"), h).await;
        reg.unregister("b").await;

        let ids: Vec<_> = reg.users().await.into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn stale_connection_cannot_evict_replacement() {
        let reg = PresenceRegistry::new();
        let (h1, _rx1) = handle("c1");
        let (h2, _rx2) = handle("c2");
        reg.register(identity("1"), h1).await;
        reg.register(identity("1"), h2).await;

        assert!(reg.unregister_if_current("1", "c1").await.is_none());
        assert_eq!(reg.lookup("1").await.unwrap().conn_id, "c2");
        assert!(reg.unregister_if_current("1", "c2").await.is_some());
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_registrations_leave_one_entry_per_identity() {
        let reg = Arc::new(PresenceRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let reg = Arc::clone(&reg);
            tasks.push(tokio::spawn(async move {
                let (h, _rx) = ConnectionHandle::channel(&format!("c{i}"));
                reg.register(identity(&(i % 4).to_string()), h).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(reg.count().await, 4);
        assert_eq!(reg.snapshot().await.len(), 4);
    }
}
