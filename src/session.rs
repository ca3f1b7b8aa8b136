//! Per-connection session binding.
//!
//! A connection starts `Anonymous`, becomes `Authenticated` after a
//! successful login and ends `Closed`. Authentication registers the
//! connection in the presence registry, drains pending messages and
//! broadcasts the new presence list; closing undoes the registration unless a
//! newer login already took it over.

use chrono::Utc;

use crate::accounts::normalize_username;
use crate::error::{AuthFailure, RelayError, Result};
use crate::presence::ConnectionHandle;
use crate::protocol::{FriendSummary, ServerMessage};
use crate::router;
use crate::state::RelayState;
use crate::store::{Identity, Profile};

/// Sent to a connection that lost its presence entry to a newer login.
pub const EVICTED_MESSAGE: &str = "Signed in from another connection";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated(AuthenticatedUser),
    Closed,
}

pub struct Session {
    relay: RelayState,
    handle: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(relay: RelayState, handle: ConnectionHandle) -> Self {
        Self {
            relay,
            handle,
            state: SessionState::Anonymous,
        }
    }

    pub fn relay(&self) -> &RelayState {
        &self.relay
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user(&self) -> Option<&AuthenticatedUser> {
        match &self.state {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    /// The logged-in user, as long as this connection still owns the user's
    /// presence entry.
    ///
    /// A connection replaced by a newer login is moved to `Closed` here and
    /// may no longer act as that user.
    pub fn active_user(&mut self) -> Option<AuthenticatedUser> {
        let user = match &self.state {
            SessionState::Authenticated(user) => user.clone(),
            _ => return None,
        };

        let owns_entry = self
            .relay
            .presence
            .lookup(&user.username)
            .is_some_and(|current| current.id() == self.handle.id());
        if owns_entry {
            return Some(user);
        }

        tracing::info!(
            username = user.username.as_str(),
            "Replaced connection is no longer bound to its user"
        );
        self.state = SessionState::Closed;
        None
    }

    /// Queue a message on this session's own connection.
    pub fn reply(&self, message: ServerMessage) {
        self.handle.send(message);
    }

    /// Log in as `username`.
    ///
    /// On success `auth_ok` has been sent, the connection is in the presence
    /// registry, pending messages have been replayed and everyone online got
    /// the new presence list.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        match self.state {
            SessionState::Anonymous => {}
            SessionState::Authenticated(_) => {
                return Err(RelayError::Validation("Already authenticated".to_string()))
            }
            SessionState::Closed => {
                return Err(RelayError::Validation("Connection is closed".to_string()))
            }
        }

        let username = normalize_username(username);
        let identity = verify_credentials(&self.relay, &username, password).await?;
        let friends = self.friend_summaries(&identity)?;

        // auth_ok goes out before registration so no live message can
        // overtake it on this connection.
        self.reply(ServerMessage::AuthOk {
            username: identity.username.clone(),
            display_name: identity.display_name.clone(),
            friends,
        });

        if let Some(evicted) = self.relay.presence.register(
            &identity.username,
            self.handle.clone(),
            &identity.display_name,
        ) {
            tracing::info!(
                username = identity.username.as_str(),
                "Replacing existing connection"
            );
            evicted.send(ServerMessage::Error {
                message: EVICTED_MESSAGE.to_string(),
            });
        }

        self.state = SessionState::Authenticated(AuthenticatedUser {
            username: identity.username.clone(),
            display_name: identity.display_name,
        });

        if let Err(e) = router::drain_pending(&self.relay, &identity.username, &self.handle) {
            // Entries stay queued for the next login.
            tracing::warn!(
                username = identity.username.as_str(),
                error = %e,
                "Failed to read pending messages"
            );
        }

        self.relay.presence.broadcast_presence();
        Ok(())
    }

    fn friend_summaries(&self, identity: &Identity) -> Result<Vec<FriendSummary>> {
        let friends = self.relay.identities.friends_of(&identity.username)?;
        Ok(friends
            .into_iter()
            .map(|profile| friend_summary(&self.relay, profile))
            .collect())
    }

    /// Change the display name for this session, the store and presence.
    pub fn set_display_name(&mut self, display_name: &str) -> Result<()> {
        let SessionState::Authenticated(user) = &mut self.state else {
            return Err(RelayError::Validation("Not authenticated".to_string()));
        };

        self.relay
            .identities
            .update_display_name(&user.username, display_name)?;
        self.relay
            .presence
            .set_display_name(&user.username, display_name);
        user.display_name = display_name.to_string();
        Ok(())
    }

    /// Tear the session down. Safe to call more than once.
    pub fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        let SessionState::Authenticated(user) = previous else {
            return;
        };

        if !self
            .relay
            .presence
            .unregister_connection(&user.username, self.handle.id())
        {
            tracing::debug!(
                username = user.username.as_str(),
                "Closed connection had already been replaced"
            );
            return;
        }

        if let Err(e) = self
            .relay
            .identities
            .touch_last_seen(&user.username, Utc::now())
        {
            tracing::warn!(
                username = user.username.as_str(),
                error = %e,
                "Failed to record last seen"
            );
        }

        self.relay.presence.broadcast_presence();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Profile plus current presence, as clients see a friend.
pub fn friend_summary(relay: &RelayState, profile: Profile) -> FriendSummary {
    let online = relay.presence.is_present(&profile.username);
    FriendSummary {
        username: profile.username,
        display_name: profile.display_name,
        last_seen: profile.last_seen,
        online,
    }
}

/// Check a login attempt against the lockout guard and the stored hash.
async fn verify_credentials(relay: &RelayState, username: &str, password: &str) -> Result<Identity> {
    relay.login_guard.check(username).map_err(RelayError::Auth)?;

    let identity = relay
        .identities
        .find_by_username(username)?
        .ok_or(RelayError::Auth(AuthFailure::NotFound))?;

    let hash = identity.password_hash.clone();
    let candidate = password.to_string();
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash))
        .await
        .map_err(|e| RelayError::StoreUnavailable(format!("password check task failed: {}", e)))??;

    if !matches {
        relay.login_guard.record_failure(username);
        tracing::info!(username = username, "Rejected login: wrong password");
        return Err(RelayError::Auth(AuthFailure::InvalidCredentials));
    }

    relay.login_guard.record_success(username);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::notify::NoopNotifier;
    use crate::protocol::{ChatMessage, MessageContent};
    use crate::state::RelayConfig;
    use crate::store::{IdentityStore, MessageStore, SqliteStore};

    type Rx = mpsc::UnboundedReceiver<ServerMessage>;

    fn test_state() -> RelayState {
        let store = SqliteStore::open_in_memory().unwrap();
        for (name, pw) in [("alice", "alice-pw"), ("bob", "bob-pw")] {
            let hash = bcrypt::hash(pw, 4).unwrap();
            store.create(name, &hash, &name.to_uppercase()).unwrap();
        }
        RelayState::with_sqlite(RelayConfig::default(), store, Arc::new(NoopNotifier))
    }

    fn session(state: &RelayState) -> (Session, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(state.clone(), ConnectionHandle::new(tx)), rx)
    }

    fn drain_rx(rx: &mut Rx) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_successful_login_binds_and_broadcasts() {
        let state = test_state();
        let (mut alice, mut rx) = session(&state);

        alice.authenticate("Alice", "alice-pw").await.unwrap();

        assert_eq!(alice.user().unwrap().username, "alice");
        assert!(state.presence.is_present("alice"));

        let events = drain_rx(&mut rx);
        assert!(matches!(&events[0], ServerMessage::AuthOk { username, .. } if username == "alice"));
        assert!(matches!(&events[1], ServerMessage::PresenceListUpdated { users } if users.len() == 1));
    }

    #[tokio::test]
    async fn test_login_broadcast_reaches_everyone_present() {
        let state = test_state();
        state
            .identities
            .create("carol", &bcrypt::hash("carol-pw", 4).unwrap(), "CAROL")
            .unwrap();

        let (mut bob, mut bob_rx) = session(&state);
        bob.authenticate("bob", "bob-pw").await.unwrap();
        let (mut carol, mut carol_rx) = session(&state);
        carol.authenticate("carol", "carol-pw").await.unwrap();
        drain_rx(&mut bob_rx);
        drain_rx(&mut carol_rx);

        let (mut alice, mut alice_rx) = session(&state);
        alice.authenticate("alice", "alice-pw").await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
            let lists: Vec<Vec<String>> = drain_rx(rx)
                .into_iter()
                .filter_map(|e| match e {
                    ServerMessage::PresenceListUpdated { users } => {
                        let mut names: Vec<String> =
                            users.into_iter().map(|u| u.username).collect();
                        names.sort();
                        Some(names)
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(lists, vec![vec!["alice", "bob", "carol"]]);
        }
    }

    #[tokio::test]
    async fn test_failure_reasons() {
        let state = test_state();
        let (mut s, _rx) = session(&state);

        let err = s.authenticate("nobody", "x").await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthFailure::NotFound)));

        let err = s.authenticate("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthFailure::InvalidCredentials)));

        assert_eq!(s.state(), &SessionState::Anonymous);
        assert!(state.presence.is_empty());
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let state = test_state();
        let (mut s, _rx) = session(&state);

        for _ in 0..5 {
            let err = s.authenticate("alice", "wrong").await.unwrap_err();
            assert!(matches!(err, RelayError::Auth(AuthFailure::InvalidCredentials)));
        }

        // Correct password is refused while locked.
        let err = s.authenticate("alice", "alice-pw").await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthFailure::Locked { .. })));

        // Once the lock runs out the counter resets.
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(state.login_guard.check_at("alice", later).is_ok());
        assert_eq!(state.login_guard.failures("alice"), 0);
    }

    #[tokio::test]
    async fn test_correct_password_succeeds_once_lock_expires() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create("alice", &bcrypt::hash("alice-pw", 4).unwrap(), "ALICE")
            .unwrap();
        let state = RelayState::with_sqlite(
            RelayConfig {
                lockout_secs: 1,
                ..RelayConfig::default()
            },
            store,
            Arc::new(NoopNotifier),
        );
        let (mut s, _rx) = session(&state);

        for _ in 0..5 {
            assert!(s.authenticate("alice", "wrong").await.is_err());
        }
        let err = s.authenticate("alice", "alice-pw").await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(AuthFailure::Locked { .. })));

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        s.authenticate("alice", "alice-pw").await.unwrap();
        assert_eq!(s.user().unwrap().username, "alice");
        assert_eq!(state.login_guard.failures("alice"), 0);
    }

    #[tokio::test]
    async fn test_second_authenticate_is_rejected() {
        let state = test_state();
        let (mut s, _rx) = session(&state);
        s.authenticate("alice", "alice-pw").await.unwrap();

        let err = s.authenticate("bob", "bob-pw").await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(msg) if msg == "Already authenticated"));
        assert_eq!(s.user().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_login_drains_pending_after_auth_ok() {
        let state = test_state();
        let message = ChatMessage {
            id: "m-1".to_string(),
            from: "bob".to_string(),
            from_display_name: "BOB".to_string(),
            to: "alice".to_string(),
            content: MessageContent::Text {
                body: "while you were out".to_string(),
            },
            reply_to: None,
            sent_at: "08:00".to_string(),
            created_at: Utc::now(),
        };
        state.messages.enqueue_pending(&message).unwrap();

        let (mut alice, mut rx) = session(&state);
        alice.authenticate("alice", "alice-pw").await.unwrap();

        let events = drain_rx(&mut rx);
        assert!(matches!(events[0], ServerMessage::AuthOk { .. }));
        assert!(matches!(&events[1], ServerMessage::MessageIncoming { message } if message.id == "m-1"));
        assert_eq!(state.offline_queue_size(), 0);
    }

    #[tokio::test]
    async fn test_auth_ok_reports_friend_presence() {
        let state = test_state();
        state.identities.add_friend("alice", "bob").unwrap();

        let (mut bob, _bob_rx) = session(&state);
        bob.authenticate("bob", "bob-pw").await.unwrap();

        let (mut alice, mut rx) = session(&state);
        alice.authenticate("alice", "alice-pw").await.unwrap();

        match drain_rx(&mut rx).into_iter().next() {
            Some(ServerMessage::AuthOk { friends, .. }) => {
                assert_eq!(friends.len(), 1);
                assert_eq!(friends[0].username, "bob");
                assert!(friends[0].online);
            }
            other => panic!("Expected auth_ok, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_newer_login_evicts_older_connection() {
        let state = test_state();
        let (mut first, mut first_rx) = session(&state);
        let (mut second, _second_rx) = session(&state);

        first.authenticate("alice", "alice-pw").await.unwrap();
        drain_rx(&mut first_rx);
        second.authenticate("alice", "alice-pw").await.unwrap();

        let events = drain_rx(&mut first_rx);
        assert!(events.iter().any(
            |e| matches!(e, ServerMessage::Error { message } if message == EVICTED_MESSAGE)
        ));

        // Closing the evicted connection leaves the newer one registered.
        first.close();
        assert_eq!(
            state.presence.lookup("alice").unwrap().id(),
            second.handle().id()
        );
        assert!(state
            .identities
            .find_by_username("alice")
            .unwrap()
            .unwrap()
            .last_seen
            .is_none());
    }

    #[tokio::test]
    async fn test_replaced_session_loses_its_user() {
        let state = test_state();
        let (mut first, _first_rx) = session(&state);
        let (mut second, _second_rx) = session(&state);

        first.authenticate("alice", "alice-pw").await.unwrap();
        assert_eq!(first.active_user().unwrap().username, "alice");

        second.authenticate("alice", "alice-pw").await.unwrap();

        assert!(first.active_user().is_none());
        assert_eq!(first.state(), &SessionState::Closed);
        assert_eq!(second.active_user().unwrap().username, "alice");

        // No way back from Closed.
        let err = first.authenticate("alice", "alice-pw").await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(
            state.presence.lookup("alice").unwrap().id(),
            second.handle().id()
        );
    }

    #[tokio::test]
    async fn test_close_unregisters_and_stamps_last_seen() {
        let state = test_state();
        let (mut bob, mut bob_rx) = session(&state);
        bob.authenticate("bob", "bob-pw").await.unwrap();
        let (mut alice, _rx) = session(&state);
        alice.authenticate("alice", "alice-pw").await.unwrap();
        drain_rx(&mut bob_rx);

        alice.close();
        alice.close();

        assert!(!state.presence.is_present("alice"));
        assert_eq!(alice.state(), &SessionState::Closed);
        let stored = state.identities.find_by_username("alice").unwrap().unwrap();
        assert!(stored.last_seen.is_some());

        let events = drain_rx(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerMessage::PresenceListUpdated { users } if users.len() == 1));
    }

    #[tokio::test]
    async fn test_set_display_name_updates_everywhere() {
        let state = test_state();
        let (mut alice, _rx) = session(&state);
        alice.authenticate("alice", "alice-pw").await.unwrap();

        alice.set_display_name("Alice Liddell").unwrap();

        assert_eq!(alice.user().unwrap().display_name, "Alice Liddell");
        assert_eq!(state.presence.list_all()[0].display_name, "Alice Liddell");
        let stored = state.identities.find_by_username("alice").unwrap().unwrap();
        assert_eq!(stored.display_name, "Alice Liddell");
    }

    #[tokio::test]
    async fn test_dropping_session_closes_it() {
        let state = test_state();
        {
            let (mut alice, _rx) = session(&state);
            alice.authenticate("alice", "alice-pw").await.unwrap();
            assert!(state.presence.is_present("alice"));
        }
        assert!(!state.presence.is_present("alice"));
    }
}
