//! Sync protocol over peer data channels: version-cursor delta sync plus
//! live broadcast of fresh operations.
//!
//! On channel open each side asks for everything past its recorded cursor
//! for that peer. A cursor the responder's log does not contain is treated
//! as "send all": the requester's view cannot be trusted, and the full log
//! is the fallback that guarantees convergence at the cost of bandwidth.
//! Every op sent or received for a peer advances the cursor to that op's
//! version.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::Shared;
use crate::events::SyncEvent;
use crate::ops::Operation;
use crate::peer::PeerHandle;

/// Frames carried over a data channel, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncFrame {
    /// Live broadcast of one operation; `version` is its HLC string.
    Op { payload: Operation, version: String },
    /// Request ops with HLC string strictly greater than `fromVersion`
    /// (all of them when absent).
    SyncRequest {
        #[serde(
            rename = "fromVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        from_version: Option<String>,
    },
    /// Reply carrying the selected ops and the sender's latest version.
    SyncResponse {
        operations: Vec<Operation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Ping,
    Pong,
}

/// Drives the sync protocol for one node; shared by every peer channel.
pub struct SyncProtocol {
    shared: Arc<Shared>,
}

impl SyncProtocol {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Channel-open hook: ask the peer for everything we have not seen.
    pub fn on_channel_open(&self, peer: &PeerHandle) {
        let from_version = peer.last_synced();
        debug!(peer_id = %peer.peer_id, ?from_version, "requesting delta sync");
        peer.send_frame(&SyncFrame::SyncRequest { from_version });
    }

    /// Handles one incoming channel line.
    pub async fn handle_line(&self, peer: &PeerHandle, line: &str) {
        let frame = match serde_json::from_str::<SyncFrame>(line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer_id = %peer.peer_id, "ignoring malformed channel frame: {e}");
                return;
            }
        };
        match frame {
            SyncFrame::Op { payload, version } => self.handle_op(peer, payload, version).await,
            SyncFrame::SyncRequest { from_version } => {
                self.handle_request(peer, from_version).await
            }
            SyncFrame::SyncResponse { operations, .. } => {
                self.handle_response(peer, operations).await
            }
            SyncFrame::Ping => {
                peer.send_frame(&SyncFrame::Pong);
            }
            SyncFrame::Pong => {}
        }
    }

    async fn handle_op(&self, peer: &PeerHandle, op: Operation, version: String) {
        let outcome = {
            let mut core = self.shared.engine.lock().await;
            core.apply_remote(&op)
        };
        match outcome {
            Ok(fresh) => {
                peer.record_synced(&version);
                if fresh {
                    self.shared.emit(SyncEvent::Operation {
                        op,
                        from_peer: Some(peer.peer_id.clone()),
                    });
                    self.shared.emit(SyncEvent::Sync {
                        count: 1,
                        peer_id: peer.peer_id.clone(),
                    });
                    self.shared.schedule_snapshot();
                }
            }
            Err(e) => warn!(peer_id = %peer.peer_id, "live op rejected: {e}"),
        }
    }

    async fn handle_request(&self, peer: &PeerHandle, from_version: Option<String>) {
        let (operations, version) = {
            let core = self.shared.engine.lock().await;
            (core.ops_since(from_version.as_deref()), core.version())
        };
        debug!(
            peer_id = %peer.peer_id,
            ?from_version,
            count = operations.len(),
            "answering sync request"
        );
        let sent_up_to = operations.last().map(|op| op.version());
        peer.send_frame(&SyncFrame::SyncResponse {
            operations,
            version,
        });
        if let Some(v) = sent_up_to {
            peer.record_synced(&v);
        }
    }

    async fn handle_response(&self, peer: &PeerHandle, operations: Vec<Operation>) {
        if operations.is_empty() {
            self.shared.emit(SyncEvent::Sync {
                count: 0,
                peer_id: peer.peer_id.clone(),
            });
            return;
        }
        let mut fresh_ops = Vec::new();
        {
            // one lock for the whole batch: the response applies atomically
            // with respect to local execution
            let mut core = self.shared.engine.lock().await;
            for op in operations {
                let version = op.version();
                match core.apply_remote(&op) {
                    Ok(true) => {
                        peer.record_synced(&version);
                        fresh_ops.push(op);
                    }
                    Ok(false) => peer.record_synced(&version),
                    Err(e) => warn!(peer_id = %peer.peer_id, "op from sync response rejected: {e}"),
                }
            }
        }
        let count = fresh_ops.len();
        for op in fresh_ops {
            self.shared.emit(SyncEvent::Operation {
                op,
                from_peer: Some(peer.peer_id.clone()),
            });
        }
        debug!(peer_id = %peer.peer_id, count, "sync response applied");
        self.shared.emit(SyncEvent::Sync {
            count,
            peer_id: peer.peer_id.clone(),
        });
        if count > 0 {
            self.shared.schedule_snapshot();
        }
    }
}
