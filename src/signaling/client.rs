//! Signaling client: one WebSocket to the relay, with exponential-backoff
//! reconnection.
//!
//! The driver task owns the socket. Outgoing frames arrive over an mpsc
//! queue, incoming frames and connection-state changes are delivered to the
//! owner as [`SignalingEvent`]s. The initial connection failing is an error
//! to the caller; later drops reconnect with delays of
//! `min(base * 2^(attempt-1), max)` for up to `max_attempts` attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{SyncError, SyncResult};

use super::protocol::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the driver task reports to the owner.
#[derive(Debug)]
pub enum SignalingEvent {
    Frame(ServerFrame),
    /// Socket (re)established and `join` sent. `reconnect` is false for the
    /// initial connection.
    Connected { reconnect: bool },
    Reconnecting { attempt: u32 },
    /// Reconnection exhausted or user-initiated disconnect.
    Disconnected,
}

pub struct SignalingClient {
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to `url` (query `token` appended, URL-encoded) and starts
    /// the driver task. Fails fast when the first connection cannot be
    /// established.
    pub async fn connect(
        url: &str,
        token: &str,
        peer_id: String,
        reconnect: ReconnectConfig,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> SyncResult<Self> {
        let full_url = signaling_url(url, token);
        let (ws, _) = connect_async(full_url.as_str())
            .await
            .map_err(|e| SyncError::SignalingTransport(format!("connect {url}: {e}")))?;
        info!(url, peer_id, "signaling connected");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(
            ws,
            full_url,
            peer_id,
            reconnect,
            events,
            out_rx,
            closed.clone(),
        ));

        Ok(Self {
            out_tx,
            closed,
            driver,
        })
    }

    /// Queues a frame for the relay. Frames queued while reconnecting are
    /// sent once the socket is back.
    pub fn send(&self, frame: ClientFrame) {
        let _ = self.out_tx.send(frame);
    }

    /// Handle other components can use to queue frames.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientFrame> {
        self.out_tx.clone()
    }

    /// User-initiated disconnect: suppresses reconnection and closes the
    /// socket.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.driver.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn drive(
    mut ws: WsStream,
    url: String,
    peer_id: String,
    reconnect: ReconnectConfig,
    events: mpsc::UnboundedSender<SignalingEvent>,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    closed: Arc<AtomicBool>,
) {
    let mut first = true;
    loop {
        let _ = events.send(SignalingEvent::Connected { reconnect: !first });
        first = false;
        run_session(&mut ws, &peer_id, &events, &mut out_rx).await;

        if closed.load(Ordering::SeqCst) {
            break;
        }
        match reconnect_with_backoff(&url, &reconnect, &events, &closed).await {
            Some(next) => ws = next,
            None => break,
        }
    }
    let _ = events.send(SignalingEvent::Disconnected);
}

/// Pumps one established socket until it drops: sends `join`, forwards
/// queued outgoing frames, dispatches incoming ones.
async fn run_session(
    ws: &mut WsStream,
    peer_id: &str,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    out_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
) {
    let join = ClientFrame::Join {
        peer_id: peer_id.to_string(),
    };
    let join_text = serde_json::to_string(&join).expect("join frame serializes");
    if ws.send(Message::Text(join_text)).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = (&mut *ws).split();
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(frame) = outgoing else { return };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => dispatch(&text, events),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "signaling socket closed by server");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("signaling socket error: {e}");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

fn dispatch(text: &str, events: &mpsc::UnboundedSender<SignalingEvent>) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => {
            let _ = events.send(SignalingEvent::Frame(frame));
        }
        // protocol errors drop the frame, never the connection
        Err(e) => debug!("ignoring malformed signaling frame: {e}"),
    }
}

async fn reconnect_with_backoff(
    url: &str,
    reconnect: &ReconnectConfig,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    closed: &Arc<AtomicBool>,
) -> Option<WsStream> {
    for attempt in 1..=reconnect.max_attempts {
        let _ = events.send(SignalingEvent::Reconnecting { attempt });
        tokio::time::sleep(reconnect.delay_for(attempt)).await;
        if closed.load(Ordering::SeqCst) {
            return None;
        }
        match connect_async(url).await {
            Ok((ws, _)) => {
                info!(attempt, "signaling reconnected");
                return Some(ws);
            }
            Err(e) => warn!(attempt, "signaling reconnect failed: {e}"),
        }
    }
    warn!("signaling reconnect attempts exhausted");
    None
}

/// Appends the URL-encoded room token as the `token` query parameter.
fn signaling_url(url: &str, token: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}token={}", url_encode(token))
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
