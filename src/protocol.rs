//! Relay protocol message definitions.
//!
//! The relay speaks JSON over WebSocket. Every frame is an object tagged by
//! `"type"` in snake_case, mirroring the event names clients already use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Value written into `from` on the copy echoed back to the sender.
pub const SELF_SENTINEL: &str = "Me";

/// Placeholder preview used in push notifications for image messages.
pub const IMAGE_PREVIEW: &str = "📷 Sent a photo";

/// Maximum number of characters of a text body shown in a push preview.
pub const PREVIEW_MAX_CHARS: usize = 80;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to an account. Must succeed before anything else.
    Authenticate { username: String, password: String },

    /// Send a text or image message to another user.
    SendMessage(SendRequest),

    /// The sender started typing in a conversation with `to`.
    TypingStart { to: String },

    /// The sender stopped typing.
    TypingStop { to: String },

    /// Add a user to the friends list.
    AddFriend { username: String },

    /// Remove a user from the friends list.
    RemoveFriend { username: String },

    /// Change the display name shown to other users.
    UpdateDisplayName { display_name: String },

    /// Store an endpoint for out-of-band notifications while offline.
    SubscribePush { endpoint: String },

    /// Keepalive.
    Ping,
}

/// Kind of message a client claims to be sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
}

/// Raw `send_message` payload as it arrives on the wire.
///
/// Fields are loosely typed here; [`MessageContent::from_request`] turns them
/// into a validated variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub image_payload: Option<String>,
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Login accepted.
    AuthOk {
        username: String,
        display_name: String,
        friends: Vec<FriendSummary>,
    },

    /// Login refused (`not_found`, `invalid_credentials`, `locked`, `server_error`).
    AuthFailed { reason: String },

    /// Copy of an accepted message echoed to its sender, `from` set to [`SELF_SENTINEL`].
    MessageDelivered { message: ChatMessage },

    /// A message for this user, delivered live or replayed from the pending queue.
    MessageIncoming { message: ChatMessage },

    /// A send was rejected or could not be stored.
    SendFailed { to: String, reason: String },

    PeerTyping { from: String },

    PeerTypingStopped { from: String },

    /// Everyone currently online. Order is not meaningful.
    PresenceListUpdated { users: Vec<PresenceSummary> },

    FriendAdded { friend: FriendSummary },

    FriendRemoved { username: String },

    DisplayNameUpdated { display_name: String },

    PushSubscribed,

    Pong,

    /// Error response.
    Error { message: String },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Body of a chat message: exactly one of text or image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Image { image_payload: String },
}

impl MessageContent {
    /// Validate a raw request and build the content variant.
    ///
    /// A request is valid when it carries a non-blank body or an image
    /// payload. `kind` only picks the variant when both are present; when the
    /// named field is missing the variant follows the field that is there.
    /// Omitted `kind` prefers the image.
    pub fn from_request(
        kind: Option<MessageKind>,
        body: Option<&str>,
        image_payload: Option<&str>,
    ) -> Result<Self> {
        let body = body.filter(|b| !b.trim().is_empty());
        let image = image_payload.filter(|p| !p.is_empty());

        let wants_image = match kind {
            Some(kind) => kind == MessageKind::Image,
            None => image.is_some(),
        };

        let text = |body: &str| MessageContent::Text {
            body: body.to_string(),
        };
        let picture = |payload: &str| MessageContent::Image {
            image_payload: payload.to_string(),
        };

        match (body, image) {
            (None, None) => Err(RelayError::Validation(
                "message has neither a body nor an image".to_string(),
            )),
            (Some(body), None) => Ok(text(body)),
            (None, Some(payload)) => Ok(picture(payload)),
            (Some(_), Some(payload)) if wants_image => Ok(picture(payload)),
            (Some(body), Some(_)) => Ok(text(body)),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text { .. } => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
        }
    }

    /// Short text for a push notification.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body } => {
                let trimmed = body.trim();
                if trimmed.chars().count() > PREVIEW_MAX_CHARS {
                    let cut: String = trimmed.chars().take(PREVIEW_MAX_CHARS).collect();
                    format!("{}…", cut)
                } else {
                    trimmed.to_string()
                }
            }
            MessageContent::Image { .. } => IMAGE_PREVIEW.to_string(),
        }
    }
}

/// A composed, immutable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    /// Sender's display name at send time.
    pub from_display_name: String,
    pub to: String,
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<serde_json::Value>,
    /// Local wall-clock time of sending, `HH:MM`.
    pub sent_at: String,
    /// Creation instant, used for pending-queue retention.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// The copy shown to the sender: identical except `from`.
    pub fn as_self_echo(&self) -> ChatMessage {
        ChatMessage {
            from: SELF_SENTINEL.to_string(),
            ..self.clone()
        }
    }
}

/// A friend as shown in `auth_ok` and `friend_added`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub username: String,
    pub display_name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
}

/// One entry of the broadcast presence list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub username: String,
    pub display_name: String,
}
