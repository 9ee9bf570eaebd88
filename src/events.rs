use crate::ops::Operation;

/// Events emitted on the engine's broadcast bus.
///
/// Every subscriber receives its own copy of each emission; subscribing is
/// cheap and lagging subscribers only lose their own backlog, never affect
/// the engine or other listeners.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Operations from a peer were applied (live broadcast or sync response).
    Sync { count: usize, peer_id: String },
    PeerJoin { peer_id: String },
    /// A data channel to the peer is open and delta sync has started.
    PeerReady { peer_id: String },
    PeerLeave { peer_id: String },
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected,
    /// An operation entered the log, locally produced or remotely applied.
    Operation {
        op: Operation,
        from_peer: Option<String>,
    },
    Error { message: String },
}
