//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! dispatching them against the session, and writing responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::accounts::{normalize_username, validate_display_name};
use crate::error::RelayError;
use crate::presence::ConnectionHandle;
use crate::protocol::{ClientMessage, SendRequest, ServerMessage};
use crate::router::{self, Sender};
use crate::session::{friend_summary, AuthenticatedUser, Session, SessionState, EVICTED_MESSAGE};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Spawns a sender task that serializes outbound messages onto the socket
/// 2. Processes incoming frames until the connection closes
/// 3. Closes the session, which updates presence if this connection still owns it
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let handle = ConnectionHandle::new(tx);
    let connection_id = handle.id();
    let mut session = Session::new(state, handle);

    tracing::debug!(connection = %connection_id, "WebSocket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Process Messages ──────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&mut session, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %connection_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    session.reply(ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    });
                }
            },
            Ok(Message::Close(_)) => {
                break;
            }
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "WebSocket error");
                break;
            }
            // Binary frames are not part of the protocol; ping/pong is
            // answered by axum.
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    let username = session.user().map(|u| u.username.clone());
    session.close();
    sender_task.abort();

    tracing::info!(
        connection = %connection_id,
        username = username.as_deref().unwrap_or("<anonymous>"),
        "WebSocket disconnected"
    );
}

/// Dispatch one parsed client message.
///
/// Only `authenticate` and `ping` are accepted before login.
pub async fn handle_client_message(session: &mut Session, msg: ClientMessage) {
    match msg {
        ClientMessage::Ping => session.reply(ServerMessage::Pong),

        ClientMessage::Authenticate { username, password } => {
            handle_authenticate(session, &username, &password).await;
        }

        other => match session.active_user() {
            Some(user) => handle_authenticated(session, &user, other),
            None => {
                let message = match session.state() {
                    SessionState::Closed => EVICTED_MESSAGE,
                    _ => "Must authenticate before sending other messages",
                };
                session.reply(ServerMessage::Error {
                    message: message.to_string(),
                });
            }
        },
    }
}

async fn handle_authenticate(session: &mut Session, username: &str, password: &str) {
    match session.authenticate(username, password).await {
        Ok(()) => {
            tracing::info!(username = username, "Authenticated");
        }
        Err(RelayError::Auth(failure)) => {
            tracing::info!(username = username, reason = failure.reason(), "Login refused");
            session.reply(ServerMessage::AuthFailed {
                reason: failure.reason().to_string(),
            });
        }
        Err(RelayError::Validation(message)) => {
            session.reply(ServerMessage::Error { message });
        }
        Err(e) => {
            tracing::error!(username = username, error = %e, "Login failed");
            session.reply(ServerMessage::AuthFailed {
                reason: "server_error".to_string(),
            });
        }
    }
}

fn handle_authenticated(session: &mut Session, user: &AuthenticatedUser, msg: ClientMessage) {
    match msg {
        ClientMessage::SendMessage(request) => handle_send(session, user, request),

        ClientMessage::TypingStart { to } => {
            router::relay_typing(session.relay(), &user.username, &to, true);
        }

        ClientMessage::TypingStop { to } => {
            router::relay_typing(session.relay(), &user.username, &to, false);
        }

        ClientMessage::AddFriend { username } => handle_add_friend(session, user, &username),

        ClientMessage::RemoveFriend { username } => {
            let friend = normalize_username(&username);
            match session.relay().identities.remove_friend(&user.username, &friend) {
                Ok(_) => session.reply(ServerMessage::FriendRemoved { username: friend }),
                Err(e) => reply_error(session, e),
            }
        }

        ClientMessage::UpdateDisplayName { display_name } => {
            handle_update_display_name(session, &display_name);
        }

        ClientMessage::SubscribePush { endpoint } => {
            handle_subscribe_push(session, user, &endpoint);
        }

        // Handled before authentication is checked.
        ClientMessage::Authenticate { .. } | ClientMessage::Ping => {}
    }
}

fn handle_send(session: &Session, user: &AuthenticatedUser, request: SendRequest) {
    let to = request.to.clone();
    let sender = Sender {
        username: &user.username,
        display_name: &user.display_name,
        handle: session.handle(),
    };

    if let Err(e) = router::send_message(session.relay(), &sender, request) {
        match &e {
            RelayError::StoreUnavailable(_) => {
                tracing::error!(from = user.username.as_str(), to = to.as_str(), error = %e, "Send failed");
            }
            _ => {
                tracing::debug!(from = user.username.as_str(), to = to.as_str(), error = %e, "Send rejected");
            }
        }
        session.reply(ServerMessage::SendFailed {
            to,
            reason: e.client_reason(),
        });
    }
}

fn handle_add_friend(session: &Session, user: &AuthenticatedUser, username: &str) {
    let friend = normalize_username(username);
    if friend == user.username {
        session.reply(ServerMessage::Error {
            message: "You cannot add yourself as a friend".to_string(),
        });
        return;
    }

    match session.relay().identities.add_friend(&user.username, &friend) {
        Ok(profile) => {
            let friend = friend_summary(session.relay(), profile);
            session.reply(ServerMessage::FriendAdded { friend });
        }
        Err(e) => reply_error(session, e),
    }
}

fn handle_update_display_name(session: &mut Session, raw: &str) {
    let result =
        validate_display_name(raw).and_then(|name| session.set_display_name(&name).map(|_| name));

    match result {
        Ok(display_name) => {
            session.reply(ServerMessage::DisplayNameUpdated { display_name });
            session.relay().presence.broadcast_presence();
        }
        Err(e) => reply_error(session, e),
    }
}

fn handle_subscribe_push(session: &Session, user: &AuthenticatedUser, endpoint: &str) {
    let endpoint = endpoint.trim();
    if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
        session.reply(ServerMessage::Error {
            message: "Push endpoint must be an http(s) URL".to_string(),
        });
        return;
    }

    match session
        .relay()
        .identities
        .set_push_endpoint(&user.username, endpoint)
    {
        Ok(()) => session.reply(ServerMessage::PushSubscribed),
        Err(e) => reply_error(session, e),
    }
}

fn reply_error(session: &Session, e: RelayError) {
    if let RelayError::StoreUnavailable(detail) = &e {
        tracing::error!(error = detail.as_str(), "Store error while handling request");
    }
    session.reply(ServerMessage::Error {
        message: e.client_reason(),
    });
}
