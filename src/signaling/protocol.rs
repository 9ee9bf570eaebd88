//! Signaling wire frames: UTF-8 JSON objects tagged by `type`.
//!
//! Clients send `join` once, then targeted handshake frames. The relay
//! answers a join with `peers` (always before anyone else learns about the
//! joiner), announces membership changes, and forwards handshake frames
//! with `from` substituted for `to`.

use serde::{Deserialize, Serialize};

/// Close code for an upgrade without a room token.
pub const CLOSE_TOKEN_REQUIRED: u16 = 4001;
pub const CLOSE_TOKEN_REQUIRED_REASON: &str = "Token required";

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        to: String,
        sdp: String,
    },
    Answer {
        to: String,
        sdp: String,
    },
    Ice {
        to: String,
        candidate: String,
    },
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Peers {
        #[serde(rename = "peerIds")]
        peer_ids: Vec<String>,
    },
    PeerJoin {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    PeerLeave {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Offer {
        from: String,
        sdp: String,
    },
    Answer {
        from: String,
        sdp: String,
    },
    Ice {
        from: String,
        candidate: String,
    },
}
