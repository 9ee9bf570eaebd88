//! Peer manager: establishes and maintains one ordered reliable data
//! channel per peer, driven by the offer/answer/ICE handshake relayed
//! through signaling.
//!
//! Deterministic initiator rule: the node that receives the `peers` list
//! at join time initiates toward every listed member, and a newcomer
//! announced by `peer-join` initiates toward the existing members. For
//! any ordered pair exactly one side offers, so "both sides offer" races
//! cannot happen.
//!
//! Transport: every node binds one TCP channel listener at start. The
//! session description carried in an offer names the handshake session,
//! the channel label, and the initiator's reachable endpoint; further
//! endpoints trickle in as `ice` candidates. The responder dials
//! candidates in arrival order, the sides exchange a one-line hello, and
//! the connection becomes the channel: newline-delimited JSON frames,
//! delivered in order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DATA_CHANNEL_LABEL;
use crate::db::Shared;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::ops::Operation;
use crate::signaling::{ClientFrame, ServerFrame};
use crate::sync::{SyncFrame, SyncProtocol};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Session description exchanged as the `sdp` payload of offers/answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDescription {
    session: String,
    label: String,
    endpoint: String,
}

/// First line on a freshly dialed connection, and its ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelHello {
    session: String,
    label: String,
    peer_id: String,
}

/// Cheap per-channel handle used by the sync protocol: outbound frame
/// queue plus the delta-sync cursor for that peer.
#[derive(Clone)]
pub struct PeerHandle {
    pub peer_id: String,
    outbound: mpsc::UnboundedSender<String>,
    last_synced: Arc<StdMutex<Option<String>>>,
}

impl PeerHandle {
    #[cfg(test)]
    pub fn for_test(peer_id: &str, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            outbound,
            last_synced: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn send_frame(&self, frame: &SyncFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(line) => self.outbound.send(line).is_ok(),
            Err(e) => {
                warn!(peer_id = %self.peer_id, "dropping unserializable frame: {e}");
                false
            }
        }
    }

    pub fn last_synced(&self) -> Option<String> {
        self.last_synced.lock().expect("cursor lock").clone()
    }

    /// Advances the cursor; versions only move forward.
    pub fn record_synced(&self, version: &str) {
        let mut cursor = self.last_synced.lock().expect("cursor lock");
        if cursor.as_deref().map_or(true, |current| current < version) {
            *cursor = Some(version.to_string());
        }
    }
}

struct Peer {
    state: ChannelState,
    initiator: bool,
    session: String,
    candidates: Vec<String>,
    next_candidate: usize,
    dialing: bool,
    handle: Option<PeerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    fn connecting(initiator: bool, session: String, candidates: Vec<String>) -> Self {
        Self {
            state: ChannelState::Connecting,
            initiator,
            session,
            candidates,
            next_candidate: 0,
            dialing: false,
            handle: None,
            tasks: Vec::new(),
        }
    }
}

pub struct PeerManager {
    node_id: String,
    shared: Arc<Shared>,
    sync: SyncProtocol,
    peers: Mutex<HashMap<String, Peer>>,
    /// Delta-sync cursors that outlive individual channels, so a
    /// reconnecting peer gets a delta instead of the full log.
    cursors: StdMutex<HashMap<String, String>>,
    signal_tx: StdMutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    local_endpoint: String,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Binds the channel listener and starts accepting inbound channels.
    pub async fn start(node_id: String, shared: Arc<Shared>) -> SyncResult<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let local_endpoint = format!("127.0.0.1:{port}");

        let manager = Arc::new(Self {
            node_id,
            sync: SyncProtocol::new(shared.clone()),
            shared,
            peers: Mutex::new(HashMap::new()),
            cursors: StdMutex::new(HashMap::new()),
            signal_tx: StdMutex::new(None),
            local_endpoint: local_endpoint.clone(),
            accept_task: StdMutex::new(None),
        });

        let accept = tokio::spawn(accept_loop(manager.clone(), listener));
        *manager.accept_task.lock().expect("accept task lock") = Some(accept);
        info!(endpoint = %local_endpoint, "peer channel listener bound");
        Ok(manager)
    }

    pub fn set_signal_sender(&self, tx: mpsc::UnboundedSender<ClientFrame>) {
        *self.signal_tx.lock().expect("signal sender lock") = Some(tx);
    }

    fn signal(&self, frame: ClientFrame) {
        if let Some(tx) = &*self.signal_tx.lock().expect("signal sender lock") {
            let _ = tx.send(frame);
        }
    }

    /// Peers with an open data channel.
    pub async fn open_peers(&self) -> Vec<String> {
        let peers = self.peers.lock().await;
        let mut ids: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.state == ChannelState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub async fn initiator_of(&self, peer_id: &str) -> Option<bool> {
        self.peers.lock().await.get(peer_id).map(|p| p.initiator)
    }

    /// Dispatches one frame from the signaling client.
    pub async fn on_signaling_frame(self: &Arc<Self>, frame: ServerFrame) {
        match frame {
            ServerFrame::Peers { peer_ids } => {
                // we just joined (or re-joined): initiate toward everyone
                // we do not already have a channel with
                for peer_id in peer_ids {
                    if peer_id != self.node_id {
                        self.initiate(peer_id).await;
                    }
                }
            }
            ServerFrame::PeerJoin { peer_id } => {
                // the newcomer initiates; we answer its offer
                debug!(peer_id, "peer joined the room");
                self.shared.emit(SyncEvent::PeerJoin { peer_id });
            }
            ServerFrame::PeerLeave { peer_id } => {
                // a signaling flap on the other side also reports a leave;
                // an open channel has its own failure detection, so only
                // channels that never came up are torn down here
                let open = {
                    let peers = self.peers.lock().await;
                    peers
                        .get(&peer_id)
                        .map_or(false, |p| p.state == ChannelState::Open)
                };
                if open {
                    debug!(peer_id, "peer left signaling but its channel is up, keeping it");
                } else {
                    self.teardown(&peer_id, false).await;
                    self.shared.emit(SyncEvent::PeerLeave { peer_id });
                }
            }
            ServerFrame::Offer { from, sdp } => self.on_offer(from, sdp).await,
            ServerFrame::Answer { from, sdp } => {
                match serde_json::from_str::<SessionDescription>(&sdp) {
                    Ok(desc) => {
                        let known = self
                            .peers
                            .lock()
                            .await
                            .get(&from)
                            .map_or(false, |p| p.session == desc.session);
                        debug!(from, known, "answer received, awaiting inbound channel");
                    }
                    Err(e) => warn!(from, "unreadable answer description: {e}"),
                }
            }
            ServerFrame::Ice { from, candidate } => self.on_ice(from, candidate).await,
        }
    }

    async fn initiate(self: &Arc<Self>, peer_id: String) {
        {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&peer_id) {
                debug!(peer_id, "peer already known, not initiating again");
                return;
            }
            let session = Uuid::new_v4().to_string();
            peers.insert(peer_id.clone(), Peer::connecting(true, session.clone(), Vec::new()));
            drop(peers);

            let sdp = SessionDescription {
                session,
                label: DATA_CHANNEL_LABEL.to_string(),
                endpoint: self.local_endpoint.clone(),
            };
            info!(peer_id, "initiating data channel");
            self.signal(ClientFrame::Offer {
                to: peer_id.clone(),
                sdp: serde_json::to_string(&sdp).expect("description serializes"),
            });
            // candidates trickle after the offer
            self.signal(ClientFrame::Ice {
                to: peer_id.clone(),
                candidate: self.local_endpoint.clone(),
            });
        }
        self.arm_handshake_timeout(peer_id);
    }

    async fn on_offer(self: &Arc<Self>, from: String, sdp: String) {
        let desc: SessionDescription = match serde_json::from_str(&sdp) {
            Ok(desc) => desc,
            Err(e) => {
                warn!(from, "unreadable offer description: {e}");
                return;
            }
        };
        if desc.label != DATA_CHANNEL_LABEL {
            warn!(from, label = %desc.label, "offer for unexpected channel label");
            return;
        }
        {
            let mut peers = self.peers.lock().await;
            if peers
                .get(&from)
                .map_or(false, |p| p.state == ChannelState::Open)
            {
                debug!(from, "offer for an open channel ignored");
                return;
            }
            peers.insert(
                from.clone(),
                Peer::connecting(false, desc.session.clone(), vec![desc.endpoint.clone()]),
            );
        }

        let answer = SessionDescription {
            session: desc.session,
            label: DATA_CHANNEL_LABEL.to_string(),
            endpoint: self.local_endpoint.clone(),
        };
        self.signal(ClientFrame::Answer {
            to: from.clone(),
            sdp: serde_json::to_string(&answer).expect("description serializes"),
        });
        self.arm_handshake_timeout(from.clone());
        self.dial_pending(from).await;
    }

    async fn on_ice(self: &Arc<Self>, from: String, candidate: String) {
        let should_dial = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&from) {
                Some(peer) if peer.state == ChannelState::Connecting && !peer.initiator => {
                    if !peer.candidates.contains(&candidate) {
                        peer.candidates.push(candidate);
                    }
                    !peer.dialing
                }
                // the initiator side never dials; candidates are for the
                // responder
                _ => false,
            }
        };
        if should_dial {
            self.dial_pending(from).await;
        }
    }

    /// Claims the dial slot for a connecting responder and works through
    /// its candidate list.
    async fn dial_pending(self: &Arc<Self>, peer_id: String) {
        {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer_id) {
                Some(peer) if peer.state == ChannelState::Connecting && !peer.dialing => {
                    peer.dialing = true;
                }
                _ => return,
            }
        }
        let manager = self.clone();
        let id = peer_id.clone();
        let task = tokio::spawn(async move { manager.run_dialer(id).await });
        self.track_task(&peer_id, task).await;
    }

    async fn run_dialer(self: Arc<Self>, peer_id: String) {
        loop {
            let next = {
                let mut peers = self.peers.lock().await;
                let Some(peer) = peers.get_mut(&peer_id) else { return };
                if peer.state != ChannelState::Connecting {
                    peer.dialing = false;
                    return;
                }
                if peer.next_candidate < peer.candidates.len() {
                    let candidate = peer.candidates[peer.next_candidate].clone();
                    peer.next_candidate += 1;
                    Some((candidate, peer.session.clone()))
                } else {
                    // wait for more ice candidates or the timeout
                    peer.dialing = false;
                    None
                }
            };
            let Some((candidate, session)) = next else { return };
            match self.dial_candidate(&peer_id, &candidate, &session).await {
                Ok((reader, writer)) => {
                    self.complete_channel(peer_id.clone(), reader, writer).await;
                    return;
                }
                Err(e) => debug!(peer_id, candidate, "candidate failed: {e}"),
            }
        }
    }

    async fn dial_candidate(
        &self,
        peer_id: &str,
        candidate: &str,
        session: &str,
    ) -> SyncResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(candidate))
            .await
            .map_err(|_| handshake_err(peer_id, "dial timed out"))?
            .map_err(|e| handshake_err(peer_id, &format!("dial: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();

        let hello = ChannelHello {
            session: session.to_string(),
            label: DATA_CHANNEL_LABEL.to_string(),
            peer_id: self.node_id.clone(),
        };
        let mut line = serde_json::to_string(&hello).expect("hello serializes");
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| handshake_err(peer_id, &format!("hello: {e}")))?;

        let mut reader = BufReader::new(read_half);
        let mut ack_line = String::new();
        timeout(DIAL_TIMEOUT, reader.read_line(&mut ack_line))
            .await
            .map_err(|_| handshake_err(peer_id, "ack timed out"))?
            .map_err(|e| handshake_err(peer_id, &format!("ack: {e}")))?;
        let ack: ChannelHello = serde_json::from_str(ack_line.trim())
            .map_err(|e| handshake_err(peer_id, &format!("bad ack: {e}")))?;
        if ack.session != session {
            return Err(handshake_err(peer_id, "ack session mismatch"));
        }
        Ok((reader, write_half))
    }

    /// Inbound connection on the channel listener: the responder dialing
    /// back a session we offered.
    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        match timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            _ => {
                debug!("inbound channel hello never arrived");
                return;
            }
        }
        let hello: ChannelHello = match serde_json::from_str(line.trim()) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("bad channel hello: {e}");
                return;
            }
        };
        if hello.label != DATA_CHANNEL_LABEL {
            warn!(label = %hello.label, "unexpected channel label");
            return;
        }

        let expected = {
            let peers = self.peers.lock().await;
            peers.get(&hello.peer_id).map_or(false, |p| {
                p.initiator && p.state == ChannelState::Connecting && p.session == hello.session
            })
        };
        if !expected {
            debug!(peer_id = %hello.peer_id, "no pending handshake for inbound channel");
            return;
        }

        let ack = ChannelHello {
            session: hello.session.clone(),
            label: DATA_CHANNEL_LABEL.to_string(),
            peer_id: self.node_id.clone(),
        };
        let mut ack_line = serde_json::to_string(&ack).expect("hello serializes");
        ack_line.push('\n');
        if write_half.write_all(ack_line.as_bytes()).await.is_err() {
            return;
        }
        self.complete_channel(hello.peer_id, reader, write_half).await;
    }

    /// Promotes a handshaken connection to the peer's data channel and
    /// kicks off delta sync.
    async fn complete_channel(
        self: &Arc<Self>,
        peer_id: String,
        reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
    ) {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let seed = self
            .cursors
            .lock()
            .expect("cursor archive lock")
            .get(&peer_id)
            .cloned();
        let handle = PeerHandle {
            peer_id: peer_id.clone(),
            outbound: out_tx,
            last_synced: Arc::new(StdMutex::new(seed)),
        };

        let writer_task = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let mut framed = line.into_bytes();
                framed.push(b'\n');
                if write_half.write_all(&framed).await.is_err() {
                    break;
                }
            }
        });

        let manager = self.clone();
        let reader_peer = handle.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                manager.sync.handle_line(&reader_peer, &line).await;
            }
            debug!(peer_id = %reader_peer.peer_id, "data channel closed");
            manager.teardown(&reader_peer.peer_id, true).await;
        });

        let keepalive_peer = handle.clone();
        let keepalive_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !keepalive_peer.send_frame(&SyncFrame::Ping) {
                    break;
                }
            }
        });

        let ready = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer_id) {
                Some(peer) if peer.state == ChannelState::Connecting => {
                    peer.state = ChannelState::Open;
                    peer.dialing = false;
                    peer.handle = Some(handle.clone());
                    peer.tasks.push(writer_task);
                    peer.tasks.push(reader_task);
                    peer.tasks.push(keepalive_task);
                    true
                }
                _ => {
                    // lost a race against teardown or a duplicate handshake
                    writer_task.abort();
                    reader_task.abort();
                    keepalive_task.abort();
                    false
                }
            }
        };
        if ready {
            info!(peer_id, "data channel open");
            self.shared.emit(SyncEvent::PeerReady {
                peer_id: peer_id.clone(),
            });
            self.sync.on_channel_open(&handle);
        }
    }

    fn arm_handshake_timeout(self: &Arc<Self>, peer_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
            let stuck = {
                let peers = manager.peers.lock().await;
                peers
                    .get(&peer_id)
                    .map_or(false, |p| p.state == ChannelState::Connecting)
            };
            if stuck {
                warn!(peer_id, "handshake timed out, tearing peer down");
                manager.teardown(&peer_id, true).await;
            }
        });
    }

    async fn track_task(&self, peer_id: &str, task: JoinHandle<()>) {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(peer_id) {
            Some(peer) => peer.tasks.push(task),
            None => task.abort(),
        }
    }

    /// Sends one freshly produced local op to every open channel.
    pub async fn broadcast_op(&self, op: &Operation) {
        let version = op.version();
        let frame = SyncFrame::Op {
            payload: op.clone(),
            version: version.clone(),
        };
        let peers = self.peers.lock().await;
        for (peer_id, peer) in peers.iter() {
            if peer.state != ChannelState::Open {
                continue;
            }
            if let Some(handle) = &peer.handle {
                if handle.send_frame(&frame) {
                    handle.record_synced(&version);
                } else {
                    debug!(peer_id, "broadcast dropped, channel closing");
                }
            }
        }
    }

    /// Destroys the peer record and its channel. A `synthetic_leave`
    /// surfaces the loss to upper layers when the room membership has not
    /// told us yet.
    pub async fn teardown(&self, peer_id: &str, synthetic_leave: bool) {
        let removed = self.peers.lock().await.remove(peer_id);
        let Some(peer) = removed else { return };
        if let Some(handle) = &peer.handle {
            if let Some(version) = handle.last_synced() {
                self.cursors
                    .lock()
                    .expect("cursor archive lock")
                    .insert(peer_id.to_string(), version);
            }
        }
        for task in &peer.tasks {
            task.abort();
        }
        debug!(peer_id, state = ?peer.state, "peer torn down");
        if synthetic_leave {
            self.shared.emit(SyncEvent::PeerLeave {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Closes every peer connection and stops accepting new ones.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task lock").take() {
            task.abort();
        }
        let ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        for id in ids {
            self.teardown(&id, false).await;
        }
    }
}

async fn accept_loop(manager: Arc<PeerManager>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "inbound channel connection");
                let manager = manager.clone();
                tokio::spawn(async move { manager.handle_inbound(stream).await });
            }
            Err(e) => {
                warn!("channel listener accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn handshake_err(peer_id: &str, reason: &str) -> SyncError {
    SyncError::PeerHandshake {
        peer_id: peer_id.to_string(),
        reason: reason.to_string(),
    }
}
