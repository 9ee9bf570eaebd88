//! Signaling relay: a stateful WebSocket server that tracks room
//! membership and forwards handshake frames between members of one room.
//!
//! The room token arrives as the `token` query parameter and is the only
//! capability; an upgrade without it is closed with code 4001. Rooms exist
//! while at least one member is connected. Frames never cross rooms.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, ServerFrame, CLOSE_TOKEN_REQUIRED, CLOSE_TOKEN_REQUIRED_REASON};

type FrameSender = mpsc::UnboundedSender<Message>;
type RoomMap = HashMap<String, HashMap<String, FrameSender>>;

/// Shared relay state: room token -> peer id -> outbound frame sender.
#[derive(Clone, Default)]
pub struct RelayState {
    rooms: Arc<RwLock<RoomMap>>,
}

impl RelayState {
    pub async fn room_size(&self, token: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(token)
            .map_or(0, |room| room.len())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Builds the relay router. Any path upgrades, so clients may use
/// `ws://host/` or `ws://host/some/path`.
pub fn router() -> Router {
    router_with_state(RelayState::default())
}

pub fn router_with_state(state: RelayState) -> Router {
    Router::new()
        .route("/", any(ws_handler))
        .fallback(ws_handler)
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<RelayState>,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, token, state))
}

async fn handle_socket(mut socket: WebSocket, token: String, state: RelayState) {
    if token.is_empty() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TOKEN_REQUIRED,
                reason: CLOSE_TOKEN_REQUIRED_REASON.into(),
            })))
            .await;
        debug!("rejected upgrade without token");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Unauthenticated until the first join frame
    let mut joined: Option<String> = None;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("ignoring malformed frame: {e}");
                        continue;
                    }
                };
                handle_frame(&state, &token, &tx, &mut joined, frame).await;
            }
            Message::Close(_) => break,
            // pings are answered by the socket layer; binary is not part
            // of the protocol
            _ => {}
        }
    }

    if let Some(peer_id) = joined {
        leave_room(&state, &token, &peer_id).await;
    }
    writer.abort();
}

async fn handle_frame(
    state: &RelayState,
    token: &str,
    tx: &FrameSender,
    joined: &mut Option<String>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Join { peer_id } => {
            if joined.is_some() {
                debug!(peer_id, "duplicate join ignored");
                return;
            }
            let mut rooms = state.rooms.write().await;
            let room = rooms.entry(token.to_string()).or_default();

            // the joiner sees the membership before anyone sees the joiner
            let existing: Vec<String> = room.keys().cloned().collect();
            send_frame(tx, &ServerFrame::Peers { peer_ids: existing });
            let announce = ServerFrame::PeerJoin {
                peer_id: peer_id.clone(),
            };
            for member in room.values() {
                send_frame(member, &announce);
            }

            if room.insert(peer_id.clone(), tx.clone()).is_some() {
                warn!(peer_id, "peer id rejoined, replacing stale connection");
            }
            info!(peer_id, room = token, members = room.len(), "peer joined");
            *joined = Some(peer_id);
        }
        ClientFrame::Offer { to, sdp } => {
            let Some(from) = joined.clone() else { return };
            forward(state, token, &to, ServerFrame::Offer { from, sdp }).await;
        }
        ClientFrame::Answer { to, sdp } => {
            let Some(from) = joined.clone() else { return };
            forward(state, token, &to, ServerFrame::Answer { from, sdp }).await;
        }
        ClientFrame::Ice { to, candidate } => {
            let Some(from) = joined.clone() else { return };
            forward(state, token, &to, ServerFrame::Ice { from, candidate }).await;
        }
    }
}

/// Forwards a frame to one room member. Unknown targets are dropped
/// silently.
async fn forward(state: &RelayState, token: &str, to: &str, frame: ServerFrame) {
    let rooms = state.rooms.read().await;
    if let Some(target) = rooms.get(token).and_then(|room| room.get(to)) {
        send_frame(target, &frame);
    } else {
        debug!(to, room = token, "dropping frame for unknown target");
    }
}

async fn leave_room(state: &RelayState, token: &str, peer_id: &str) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(token) else {
        return;
    };
    room.remove(peer_id);
    let announce = ServerFrame::PeerLeave {
        peer_id: peer_id.to_string(),
    };
    for member in room.values() {
        send_frame(member, &announce);
    }
    info!(peer_id, room = token, members = room.len(), "peer left");
    if room.is_empty() {
        rooms.remove(token);
        debug!(room = token, "room deleted");
    }
}

fn send_frame(tx: &FrameSender, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        // a closed member connection is cleaned up by its own socket task
        let _ = tx.send(Message::Text(text.into()));
    }
}
