//! Presence registry.
//!
//! Maps a username to the live connection it is authenticated on. Volatile:
//! the registry starts empty on every process start and anyone connected
//! before a restart must reconnect to reappear.
//!
//! One entry per username. Registering again for the same username replaces
//! the previous handle (last writer wins); there is no multi-device fan-out.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{PresenceSummary, ServerMessage};

/// Outbound channel of a connected client.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// A live connection: its outbound channel plus an id that tells two
/// connections of the same user apart.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: ClientSender,
}

impl ConnectionHandle {
    pub fn new(sender: ClientSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message on this connection. Returns false if it has closed.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub username: String,
    pub handle: ConnectionHandle,
    pub display_name: String,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<DashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username` on `handle`, replacing any previous entry.
    ///
    /// Returns the replaced handle when it belonged to a different connection.
    pub fn register(
        &self,
        username: &str,
        handle: ConnectionHandle,
        display_name: &str,
    ) -> Option<ConnectionHandle> {
        let new_id = handle.id();
        let previous = self.entries.insert(
            username.to_string(),
            PresenceEntry {
                username: username.to_string(),
                handle,
                display_name: display_name.to_string(),
            },
        );

        tracing::info!(username = username, "User online");

        previous
            .map(|entry| entry.handle)
            .filter(|old| old.id() != new_id)
    }

    /// Remove `username` regardless of which connection holds it.
    pub fn unregister(&self, username: &str) -> bool {
        self.entries.remove(username).is_some()
    }

    /// Remove `username` only if it is still bound to `connection_id`.
    ///
    /// A connection that was evicted by a newer login must not take the newer
    /// entry down with it when it closes.
    pub fn unregister_connection(&self, username: &str, connection_id: Uuid) -> bool {
        let removed = self
            .entries
            .remove_if(username, |_, entry| entry.handle.id() == connection_id)
            .is_some();
        if removed {
            tracing::info!(username = username, "User offline");
        }
        removed
    }

    pub fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.entries.get(username).map(|entry| entry.handle.clone())
    }

    pub fn is_present(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Update the display name snapshot kept for presence broadcasts.
    pub fn set_display_name(&self, username: &str, display_name: &str) {
        if let Some(mut entry) = self.entries.get_mut(username) {
            entry.display_name = display_name.to_string();
        }
    }

    /// Everyone currently present, sorted by username.
    pub fn list_all(&self) -> Vec<PresenceSummary> {
        let mut users: Vec<PresenceSummary> = self
            .entries
            .iter()
            .map(|entry| PresenceSummary {
                username: entry.username.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Send to a present user. Returns false if absent or the channel closed.
    pub fn send_to(&self, username: &str, message: ServerMessage) -> bool {
        match self.lookup(username) {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    /// Send the current presence list to every present connection.
    pub fn broadcast_presence(&self) {
        let users = self.list_all();
        let handles: Vec<ConnectionHandle> = self
            .entries
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();

        tracing::debug!(online = users.len(), "Broadcasting presence list");

        for handle in handles {
            handle.send(ServerMessage::PresenceListUpdated {
                users: users.clone(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PresenceRegistry::new();
        let (h, _rx) = handle();
        let id = h.id();

        assert!(registry.register("alice", h, "Alice").is_none());
        assert!(registry.is_present("alice"));
        assert_eq!(registry.lookup("alice").unwrap().id(), id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_second_login_overwrites_and_reports_eviction() {
        let registry = PresenceRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let first_id = first.id();
        let second_id = second.id();

        registry.register("alice", first, "Alice");
        let evicted = registry.register("alice", second, "Alice").unwrap();

        assert_eq!(evicted.id(), first_id);
        assert_eq!(registry.lookup("alice").unwrap().id(), second_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = PresenceRegistry::new();
        assert!(!registry.unregister("nobody"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_connection_cannot_unregister_newer_login() {
        let registry = PresenceRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let first_id = first.id();
        let second_id = second.id();

        registry.register("alice", first, "Alice");
        registry.register("alice", second, "Alice");

        assert!(!registry.unregister_connection("alice", first_id));
        assert!(registry.is_present("alice"));

        assert!(registry.unregister_connection("alice", second_id));
        assert!(!registry.is_present("alice"));
    }

    #[test]
    fn test_send_to_present_and_absent() {
        let registry = PresenceRegistry::new();
        let (h, mut rx) = handle();
        registry.register("alice", h, "Alice");

        assert!(registry.send_to("alice", ServerMessage::Pong));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));
        assert!(!registry.send_to("bob", ServerMessage::Pong));
    }

    #[test]
    fn test_send_to_closed_channel_fails() {
        let registry = PresenceRegistry::new();
        let (h, rx) = handle();
        registry.register("alice", h, "Alice");
        drop(rx);

        assert!(!registry.send_to("alice", ServerMessage::Pong));
    }

    #[test]
    fn test_broadcast_reaches_everyone_with_full_list() {
        let registry = PresenceRegistry::new();
        let mut receivers = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (h, rx) = handle();
            registry.register(name, h, &name.to_uppercase());
            receivers.push(rx);
        }

        registry.broadcast_presence();

        for rx in receivers.iter_mut() {
            match rx.try_recv().unwrap() {
                ServerMessage::PresenceListUpdated { users } => {
                    let mut names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
                    names.sort();
                    assert_eq!(names, vec!["alice", "bob", "carol"]);
                }
                other => panic!("Expected presence list, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_set_display_name_updates_list() {
        let registry = PresenceRegistry::new();
        let (h, _rx) = handle();
        registry.register("alice", h, "Alice");
        registry.set_display_name("alice", "Queen Alice");

        let users = registry.list_all();
        assert_eq!(users[0].display_name, "Queen Alice");
    }
}
