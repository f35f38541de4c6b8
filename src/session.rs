//! One WebSocket connection: lifecycle and receive loop.
//!
//! A session starts unregistered: the transport is open but no identity is
//! known, so nothing is routed to it beyond status broadcasts.  The first
//! `register` event binds an identity, publishes it in the presence registry,
//! and replays the backlog into this session's push queue before any further
//! inbound event is processed.  When the socket closes the session marks its
//! connection offline exactly once and never comes back; a new socket is a
//! new session.
//!
//! Inbound events are handled strictly in arrival order.  Pushes from other
//! sessions arrive on a private mpsc queue, status changes on the shared
//! broadcast channel; both are forwarded to the socket as they come in.

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{broadcast, mpsc};

use crate::logging;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::server::AppState;

pub async fn run_session(mut socket: WebSocket, state: AppState) {
    let conn = state.registry.allocate();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let mut status_rx = state.registry.subscribe();
    let mut identity: Option<String> = None;

    crate::hlog!("{conn} connected");

    loop {
        tokio::select! {
            event = push_rx.recv() => {
                match event {
                    Some(event) => {
                        if !forward(&mut socket, &event).await {
                            break;
                        }
                    }
                    // Unreachable while we hold push_tx, but select! needs it
                    None => break,
                }
            }
            result = status_rx.recv() => {
                match result {
                    Ok(event) => {
                        if !forward(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        crate::hlog!("{conn} lagged behind {n} status update(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Malformed frames are dropped without a reply
                        if let Some(event) = ClientEvent::parse(&text) {
                            handle_event(event, &state, conn, &push_tx, &mut identity).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.registry.mark_offline(conn);
    match identity {
        Some(identity) => crate::hlog!("{conn} disconnected ({})", logging::ident(&identity)),
        None => crate::hlog!("{conn} disconnected (never registered)"),
    }
}

async fn handle_event(
    event: ClientEvent,
    state: &AppState,
    conn: crate::presence::ConnectionId,
    push_tx: &crate::presence::PushSender,
    identity: &mut Option<String>,
) {
    match event {
        ClientEvent::Register { identity: who } => {
            if who.is_empty() {
                return;
            }
            state.registry.register(&who, conn, push_tx.clone());
            crate::hlog!("{} registered on {conn}", logging::ident(&who));
            // Replay promptly, before this session reads any further
            // inbound event, to keep the backlog ahead of live traffic.
            if let Err(e) = state.delivery.replay(&who, push_tx).await {
                crate::hlog!("replay for {} failed: {e}", logging::ident(&who));
            }
            *identity = Some(who);
        }
        ClientEvent::SendMessage { from, to, text } => {
            // The sender field is asserted, not verified against the
            // session's registered identity.
            if let Err(e) = state.delivery.send(&from, &to, &text).await {
                crate::hlog!(
                    "send {} -> {} not persisted: {e}",
                    logging::ident(&from),
                    logging::ident(&to)
                );
            }
        }
        ClientEvent::Typing { from, to } => {
            state.delivery.typing(&from, &to);
        }
    }
}

/// Serialize and write one event to the socket. Returns false when the
/// socket is no longer writable and the session should end.
async fn forward(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(_) => return true,
    };
    socket.send(Message::Text(text)).await.is_ok()
}
