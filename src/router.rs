//! Message delivery.
//!
//! Every accepted message is archived (best effort), echoed to its sender,
//! then either pushed to the recipient's live connection or written to the
//! pending queue. A recipient is never both: if the live push fails because
//! the connection went away mid-send, the message falls back to pending.
//!
//! On login the pending queue is drained oldest first. Each entry is deleted
//! only after it was handed to the connection, so a crash between push and
//! delete redelivers rather than loses (at-least-once).

use chrono::{DateTime, Local, Utc};
use uuid::Uuid;

use crate::accounts::normalize_username;
use crate::error::{RelayError, Result};
use crate::presence::ConnectionHandle;
use crate::protocol::{ChatMessage, MessageContent, SendRequest, ServerMessage};
use crate::state::RelayState;

/// The authenticated sender of a message.
#[derive(Debug, Clone, Copy)]
pub struct Sender<'a> {
    pub username: &'a str,
    pub display_name: &'a str,
    /// Connection the echo goes to.
    pub handle: &'a ConnectionHandle,
}

/// Where an accepted message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the recipient's live connection.
    Live,
    /// Written to the pending queue.
    Queued { pending_id: i64 },
}

/// Build the immutable message record.
pub fn compose(
    sender: &Sender<'_>,
    to: String,
    content: MessageContent,
    reply_to: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4().to_string(),
        from: sender.username.to_string(),
        from_display_name: sender.display_name.to_string(),
        to,
        content,
        reply_to,
        sent_at: now.with_timezone(&Local).format("%H:%M").to_string(),
        created_at: now,
    }
}

/// Accept a message from `sender` and route it.
///
/// Errors mean the message was not queued for the recipient. A validation or
/// unknown-recipient error leaves no trace anywhere; a pending-write error
/// happens after the sender's echo went out.
pub fn send_message(
    state: &RelayState,
    sender: &Sender<'_>,
    request: SendRequest,
) -> Result<SendOutcome> {
    let to = normalize_username(&request.to);
    if to.is_empty() {
        return Err(RelayError::Validation("recipient is required".to_string()));
    }

    let content = MessageContent::from_request(
        request.kind,
        request.body.as_deref(),
        request.image_payload.as_deref(),
    )?;

    if state.identities.find_by_username(&to)?.is_none() {
        return Err(RelayError::RecipientUnknown(to));
    }

    let message = compose(sender, to, content, request.reply_to, Utc::now());

    if state.config.archive_messages {
        if let Err(e) = state.messages.archive(&message) {
            tracing::warn!(
                id = message.id.as_str(),
                error = %e,
                "Failed to archive message, continuing delivery"
            );
        }
    }

    sender.handle.send(ServerMessage::MessageDelivered {
        message: message.as_self_echo(),
    });

    if let Some(handle) = state.presence.lookup(&message.to) {
        let id = message.id.clone();
        if handle.send(ServerMessage::MessageIncoming {
            message: message.clone(),
        }) {
            tracing::debug!(
                id = id.as_str(),
                from = sender.username,
                to = message.to.as_str(),
                "Message delivered live"
            );
            return Ok(SendOutcome::Live);
        }
        tracing::debug!(
            to = message.to.as_str(),
            "Recipient connection closed mid-send, queueing"
        );
    }

    let pending_id = state.messages.enqueue_pending(&message)?;
    notify_offline(state, &message);

    Ok(SendOutcome::Queued { pending_id })
}

/// Fire a push notification if the recipient subscribed one. Never fails.
fn notify_offline(state: &RelayState, message: &ChatMessage) {
    match state.identities.push_endpoint(&message.to) {
        Ok(Some(endpoint)) => {
            state.notifier.notify(
                &endpoint,
                &message.from_display_name,
                &message.content.preview(),
            );
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(
                to = message.to.as_str(),
                error = %e,
                "Could not look up push endpoint"
            );
        }
    }
}

/// Replay unexpired pending messages for `username` onto `handle`.
///
/// Returns how many were handed over. Stops at the first push failure and
/// leaves the remaining entries for the next login.
pub fn drain_pending(
    state: &RelayState,
    username: &str,
    handle: &ConnectionHandle,
) -> Result<usize> {
    let cutoff = state.pending_cutoff(Utc::now());
    let entries = state.messages.pending_for(username, cutoff)?;
    let mut delivered = 0;

    for entry in entries {
        if !handle.send(ServerMessage::MessageIncoming {
            message: entry.message,
        }) {
            tracing::warn!(
                username = username,
                delivered = delivered,
                "Connection closed during drain, keeping remaining messages"
            );
            break;
        }
        delivered += 1;

        if let Err(e) = state.messages.delete_pending(entry.id) {
            // Already handed over; the entry will be redelivered next login.
            tracing::error!(id = entry.id, error = %e, "Failed to delete drained message");
        }
    }

    if delivered > 0 {
        tracing::info!(
            username = username,
            count = delivered,
            "Delivered pending messages"
        );
    }

    Ok(delivered)
}

/// Forward a typing indicator to `to` if they are online. Dropped otherwise.
pub fn relay_typing(state: &RelayState, from: &str, to: &str, started: bool) {
    let to = normalize_username(to);
    let from = from.to_string();
    let event = if started {
        ServerMessage::PeerTyping { from }
    } else {
        ServerMessage::PeerTypingStopped { from }
    };
    state.presence.send_to(&to, event);
}
