//! Signaling: the relay server, the client that talks to it, and the wire
//! frames they share.

pub mod client;
pub mod protocol;
pub mod relay;

pub use client::{SignalingClient, SignalingEvent};
pub use protocol::{ClientFrame, ServerFrame};
pub use relay::{router, RelayState};
