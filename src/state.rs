//! Server state management.
//!
//! One `RelayState` is built at startup and cloned into every connection
//! task. It owns the volatile pieces (presence registry, login lockout
//! counters) and shared handles to the persistent stores and the push
//! notifier. Nothing in here survives a restart except what the stores hold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::lockout::{LoginGuard, DEFAULT_LOCKOUT_SECS, DEFAULT_MAX_FAILED_ATTEMPTS};
use crate::notify::PushNotifier;
use crate::presence::PresenceRegistry;
use crate::store::{IdentityStore, MessageStore, SqliteStore};

/// Default pending-message TTL in seconds (7 days).
pub const DEFAULT_PENDING_TTL_SECS: i64 = 7 * 24 * 3600;

/// Default WebSocket message size limit (10 MiB), large enough for inline images.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite database file, or `:memory:`.
    pub database_path: String,
    /// How long an undelivered message stays in the pending queue.
    pub pending_ttl_secs: i64,
    /// Keep a permanent copy of every accepted message.
    pub archive_messages: bool,
    pub max_frame_bytes: usize,
    /// Failed logins before a username is locked.
    pub lockout_threshold: u32,
    pub lockout_secs: i64,
    /// bcrypt work factor for new password hashes.
    pub bcrypt_cost: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: "parley.db".to_string(),
            pending_ttl_secs: DEFAULT_PENDING_TTL_SECS,
            archive_messages: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            lockout_threshold: DEFAULT_MAX_FAILED_ATTEMPTS,
            lockout_secs: DEFAULT_LOCKOUT_SECS,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Username → live connection for authenticated clients.
    pub presence: PresenceRegistry,

    /// Failed-login counters and locks.
    pub login_guard: LoginGuard,

    pub identities: Arc<dyn IdentityStore>,

    pub messages: Arc<dyn MessageStore>,

    pub notifier: Arc<dyn PushNotifier>,

    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        identities: Arc<dyn IdentityStore>,
        messages: Arc<dyn MessageStore>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            login_guard: LoginGuard::new(config.lockout_threshold, config.lockout_secs),
            identities,
            messages,
            notifier,
            config,
        }
    }

    /// State backed by one SQLite store serving as both identity and message store.
    pub fn with_sqlite(
        config: RelayConfig,
        store: SqliteStore,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let store = Arc::new(store);
        Self::new(config, store.clone(), store, notifier)
    }

    /// Pending entries created before this instant have expired.
    ///
    /// A TTL too large to represent means nothing expires.
    pub fn pending_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_seconds(self.config.pending_ttl_secs)
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    /// Number of pending messages across all users (0 if the store is down).
    pub fn offline_queue_size(&self) -> usize {
        self.messages.pending_count().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not count pending messages");
            0
        })
    }

    /// Remove expired pending messages and stale lockout entries.
    /// Called periodically by the cleanup task.
    pub fn cleanup_expired(&self) {
        self.cleanup_expired_at(Utc::now());
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.pending_cutoff(now);
        let purged = match self.messages.purge_pending_before(cutoff) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Pending message sweep failed");
                0
            }
        };

        if purged > 0 {
            tracing::debug!(count = purged, "Cleaned up expired pending messages");
        }

        let unlocked = self.login_guard.purge_expired_at(now);
        if unlocked > 0 {
            tracing::debug!(count = unlocked, "Cleared expired login locks");
        }

        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use crate::protocol::{ChatMessage, MessageContent};

    fn test_state(config: RelayConfig) -> RelayState {
        RelayState::with_sqlite(
            config,
            SqliteStore::open_in_memory().unwrap(),
            Arc::new(NoopNotifier),
        )
    }

    fn pending(created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: "alice".to_string(),
            from_display_name: "Alice".to_string(),
            to: "bob".to_string(),
            content: MessageContent::Text {
                body: "hi".to_string(),
            },
            reply_to: None,
            sent_at: "10:00".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pending_ttl_secs, 604_800);
        assert!(config.archive_messages);
        assert_eq!(config.lockout_threshold, 5);
        assert_eq!(config.lockout_secs, 60);
    }

    #[test]
    fn test_state_creation() {
        let state = test_state(RelayConfig::default());
        assert_eq!(state.online_count(), 0);
        assert_eq!(state.offline_queue_size(), 0);
    }

    #[test]
    fn test_cleanup_purges_messages_past_ttl() {
        let state = test_state(RelayConfig::default());
        let now = Utc::now();
        state
            .messages
            .enqueue_pending(&pending(now - Duration::days(7) - Duration::seconds(1)))
            .unwrap();
        state
            .messages
            .enqueue_pending(&pending(now - Duration::days(6)))
            .unwrap();

        assert_eq!(state.cleanup_expired_at(now), 1);
        assert_eq!(state.offline_queue_size(), 1);
    }

    #[test]
    fn test_huge_ttl_keeps_everything() {
        let state = test_state(RelayConfig {
            pending_ttl_secs: i64::MAX,
            ..RelayConfig::default()
        });
        let now = Utc::now();
        assert_eq!(state.pending_cutoff(now), DateTime::<Utc>::MIN_UTC);

        state
            .messages
            .enqueue_pending(&pending(now - Duration::days(3650)))
            .unwrap();
        assert_eq!(state.cleanup_expired_at(now), 0);
        assert_eq!(state.offline_queue_size(), 1);
    }

    #[test]
    fn test_cleanup_with_short_ttl() {
        let state = test_state(RelayConfig {
            pending_ttl_secs: -1, // Expire immediately
            ..RelayConfig::default()
        });
        state.messages.enqueue_pending(&pending(Utc::now())).unwrap();

        state.cleanup_expired();
        assert_eq!(state.offline_queue_size(), 0);
    }
}
