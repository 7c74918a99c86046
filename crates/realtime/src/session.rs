//! WebSocket session endpoint.
//!
//! A session authenticates at upgrade time, is subscribed to its user
//! channel and the presence topic for its whole lifetime, and joins and
//! leaves per-conversation channels on request. Message persistence
//! happens over the REST API; the frames handled here are fan-out and
//! receipts only.

#![allow(missing_docs)]

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use chatwire_common::events::{ClientEvent, PresencePayload, ServerEvent, TypingPayload, channels};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio_stream::{StreamMap, wrappers::BroadcastStream};
use tracing::{debug, info, warn};

use crate::auth::SessionIdentity;
use crate::middleware::AppState;

/// Session query parameters.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    /// Bearer token for authentication.
    pub token: Option<String>,
}

/// WebSocket handler for realtime sessions.
///
/// The token is checked before the upgrade; an invalid or expired token
/// never reaches the socket loop.
pub async fn session_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SessionQuery>,
    State(state): State<AppState>,
) -> Response {
    let token = query.token.unwrap_or_default();
    match state.authenticator.authenticate(&token).await {
        Ok(identity) => {
            info!(user_id = %identity.user_id, "Realtime session established");
            ws.on_upgrade(move |socket| handle_session(socket, identity, state))
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Realtime session rejected");
            e.into_response()
        }
    }
}

/// Drive one session until the client leaves, the socket dies or the
/// token expires.
async fn handle_session(socket: WebSocket, identity: SessionIdentity, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = identity.user_id.clone();

    // Lifetime subscriptions: own user channel plus the presence topic.
    let mut streams: StreamMap<String, BroadcastStream<ServerEvent>> = StreamMap::new();
    let user_channel = channels::user(&user_id);
    streams.insert(
        user_channel.clone(),
        BroadcastStream::new(state.hub.subscribe(&user_channel)),
    );
    streams.insert(
        channels::PRESENCE.to_string(),
        BroadcastStream::new(state.hub.subscribe(channels::PRESENCE)),
    );

    state.roster.session_opened(&user_id);

    // Replay the current roster so the new session starts with a complete
    // presence picture instead of waiting for the next transition.
    for online_id in state.roster.online_users() {
        let event = ServerEvent::PresenceOnline(PresencePayload { user_id: online_id });
        if send_event(&mut sender, &event).await.is_err() {
            close_session(&state, &user_id, &HashSet::new());
            return;
        }
    }

    // Conversation channels this session has joined.
    let mut joined: HashSet<String> = HashSet::new();

    let grace = Duration::from_millis(state.config.realtime.token_grace_ms);
    let expiry = session_expiry(&identity, grace);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                handle_client_event(event, &identity, &state, &mut streams, &mut joined)
                                    .await;
                            }
                            Err(e) => {
                                warn!(user_id = %user_id, error = %e, "Unparseable client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(user_id = %user_id, "Client closed session");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(user_id = %user_id, error = %e, "Session socket error");
                        break;
                    }
                }
            }

            Some((channel, event)) = streams.next() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(user_id = %user_id, channel = %channel, error = %e, "Session lagged behind channel");
                    }
                }
            }

            () = &mut expiry => {
                info!(user_id = %user_id, "Session token expired");
                let _ = send_event(&mut sender, &ServerEvent::TokenExpired).await;
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    close_session(&state, &user_id, &joined);
    info!(user_id = %user_id, "Realtime session closed");
}

/// Handle one frame from the client.
async fn handle_client_event(
    event: ClientEvent,
    identity: &SessionIdentity,
    state: &AppState,
    streams: &mut StreamMap<String, BroadcastStream<ServerEvent>>,
    joined: &mut HashSet<String>,
) {
    let user_id = &identity.user_id;
    match event {
        ClientEvent::JoinConversation(join) => {
            let conversation_id = join.conversation_id;
            match state
                .conversation_service
                .is_active_participant(user_id, &conversation_id)
                .await
            {
                Ok(true) => {
                    let channel = channels::conversation(&conversation_id);
                    streams.insert(
                        channel.clone(),
                        BroadcastStream::new(state.hub.subscribe(&channel)),
                    );
                    joined.insert(conversation_id.clone());
                    debug!(user_id = %user_id, conversation_id = %conversation_id, "Joined conversation channel");
                }
                Ok(false) => {
                    warn!(user_id = %user_id, conversation_id = %conversation_id, "Join refused, not a participant");
                }
                Err(e) => {
                    warn!(user_id = %user_id, conversation_id = %conversation_id, error = %e, "Join failed");
                }
            }
        }
        ClientEvent::LeaveConversation(leave) => {
            let conversation_id = leave.conversation_id;
            streams.remove(&channels::conversation(&conversation_id));
            joined.remove(&conversation_id);
            debug!(user_id = %user_id, conversation_id = %conversation_id, "Left conversation channel");
        }
        ClientEvent::SendMessage(relay) => {
            // Fan-out relay for an already-persisted message. The sender
            // identity must match the session; persistence already happened
            // over REST.
            if relay.message.sender_id != *user_id {
                warn!(user_id = %user_id, "Relay rejected, sender mismatch");
                return;
            }
            if relay.message.conversation_id != relay.conversation_id {
                warn!(user_id = %user_id, "Relay rejected, conversation mismatch");
                return;
            }
            match state
                .conversation_service
                .is_active_participant(user_id, &relay.conversation_id)
                .await
            {
                Ok(true) => {
                    state.hub.publish(
                        &channels::conversation(&relay.conversation_id),
                        ServerEvent::Message(relay.message),
                    );
                }
                Ok(false) | Err(_) => {
                    warn!(user_id = %user_id, conversation_id = %relay.conversation_id, "Relay refused");
                }
            }
        }
        ClientEvent::MarkRead(mark) => {
            if let Err(e) = state
                .conversation_service
                .mark_read(user_id, &mark.conversation_id, &mark.message_ids)
                .await
            {
                warn!(user_id = %user_id, conversation_id = %mark.conversation_id, error = %e, "Mark read failed");
            }
        }
        ClientEvent::TypingStart(typing) => {
            publish_typing(state, joined, &typing.conversation_id, user_id, true);
        }
        ClientEvent::TypingStop(typing) => {
            publish_typing(state, joined, &typing.conversation_id, user_id, false);
        }
    }
}

/// Relay a typing transition into a joined conversation channel.
fn publish_typing(
    state: &AppState,
    joined: &HashSet<String>,
    conversation_id: &str,
    user_id: &str,
    started: bool,
) {
    if !joined.contains(conversation_id) {
        debug!(user_id = %user_id, conversation_id = %conversation_id, "Typing outside joined conversation dropped");
        return;
    }
    let payload = TypingPayload {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
    };
    let event = if started {
        ServerEvent::TypingStart(payload)
    } else {
        ServerEvent::TypingStop(payload)
    };
    state
        .hub
        .publish(&channels::conversation(conversation_id), event);
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &ServerEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Tear-down shared by every exit path: stale typing indicators are
/// cleared and the roster entry released.
fn close_session(state: &AppState, user_id: &str, joined: &HashSet<String>) {
    for conversation_id in joined {
        state.hub.publish(
            &channels::conversation(conversation_id),
            ServerEvent::TypingStop(TypingPayload {
                conversation_id: conversation_id.clone(),
                user_id: user_id.to_string(),
            }),
        );
    }
    state.roster.session_closed(user_id);
}

/// Resolves when the session's token has been expired for longer than the
/// configured grace window. Pending forever for non-expiring tokens.
async fn session_expiry(identity: &SessionIdentity, grace: Duration) {
    let Some(expires_at) = identity.expires_at else {
        return std::future::pending().await;
    };
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    let wait = (expires_at + grace - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::time::sleep(wait).await;
}
