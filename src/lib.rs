//! battery-db: a peer-to-peer, eventually-consistent replicated SQLite
//! for small collaborative groups sharing a room token.
//!
//! Every node holds a full local store. Mutations on tables with primary
//! keys become row-scoped operations tagged by a hybrid logical clock,
//! spread over direct peer channels, and merged with last-write-wins, so
//! any two nodes that have seen the same operations hold the same data.

// Causal timestamps
pub mod hlc;

// Operation model and SQL mutation extractor
pub mod ops;

// Persistent op log and snapshot slot
pub mod oplog;

// SQLite collaborator adapter
pub mod sqlite;

// Replication engine
pub mod engine;

// Signaling relay, client, and wire frames
pub mod signaling;

// Peer channels and the handshake state machine
pub mod peer;

// Delta sync and live broadcast over peer channels
pub mod sync;

// Public node surface
pub mod db;

// Common utilities
pub mod config;
pub mod error;
pub mod events;

// Re-exports for convenience
pub use config::Config;
pub use db::BatteryDb;
pub use engine::EngineStats;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use hlc::{Hlc, Timestamp};
pub use ops::Operation;
pub use sqlite::{ExecResult, SqlValue};
