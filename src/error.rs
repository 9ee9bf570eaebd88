use thiserror::Error;

/// Error kinds surfaced by the replication engine and its network layers.
///
/// Local execution is never blocked by remote-sync failures: signaling and
/// peer errors are recovered or isolated per peer, extraction failures fall
/// back to plain local execution, and failed remote applies are logged and
/// skipped.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("engine not initialized, call init() first")]
    NotInitialized,

    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("signaling transport: {0}")]
    SignalingTransport(String),

    #[error("signaling protocol: {0}")]
    SignalingProtocol(String),

    #[error("handshake with peer {peer_id}: {reason}")]
    PeerHandshake { peer_id: String, reason: String },

    #[error("operation extraction: {0}")]
    OpExtract(String),

    #[error("applying remote operation: {0}")]
    OpApply(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
