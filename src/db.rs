//! Public engine surface: one [`BatteryDb`] per node, wiring the
//! replication engine, the signaling client, and the peer manager
//! together behind the event bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{EngineCore, EngineStats, SnapshotScheduler};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::oplog::OpLog;
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::peer::PeerManager;
use crate::sqlite::{ExecResult, SqlAdapter, SqlValue};

const EVENT_BUS_CAPACITY: usize = 256;

/// Pieces shared between the facade, the sync protocol, and the peer
/// manager.
pub struct Shared {
    pub engine: Arc<Mutex<EngineCore>>,
    pub events: broadcast::Sender<SyncEvent>,
    pub snapshot: Arc<SnapshotScheduler>,
}

impl Shared {
    pub fn build(node_id: String, config: &Config) -> SyncResult<Arc<Self>> {
        let sql = SqlAdapter::open_in_memory()?;
        let log = match &config.storage.dir {
            Some(dir) => OpLog::open(dir)?,
            None => OpLog::in_memory(),
        };
        let engine = Arc::new(Mutex::new(EngineCore::new(node_id, sql, log)));
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Ok(Arc::new(Self {
            engine,
            events,
            snapshot: Arc::new(SnapshotScheduler::new(Duration::from_millis(
                config.snapshot_debounce_ms,
            ))),
        }))
    }

    /// Emits on the bus; nobody listening is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn schedule_snapshot(&self) {
        self.snapshot
            .schedule(self.engine.clone(), self.events.clone());
    }
}

/// Active room connection: signaling client, peer manager, and the task
/// pumping signaling events between them.
struct RoomConnection {
    signaling: SignalingClient,
    peers: Arc<PeerManager>,
    pump: JoinHandle<()>,
}

/// A peer-to-peer replicated SQLite database node.
///
/// Construction is cheap; `init()` opens the persistent state and
/// `connect()` joins a room. All methods are safe to call from any task.
pub struct BatteryDb {
    node_id: String,
    config: Config,
    shared: Arc<Shared>,
    conn: Mutex<Option<RoomConnection>>,
}

impl BatteryDb {
    pub fn new(config: Config) -> SyncResult<Self> {
        let node_id = Uuid::new_v4().to_string();
        let shared = Shared::build(node_id.clone(), &config)?;
        Ok(Self {
            node_id,
            config,
            shared,
            conn: Mutex::new(None),
        })
    }

    /// Opens the persistent store, loads the snapshot, replays the op-log
    /// tail. Must be called before anything else.
    pub async fn init(&self) -> SyncResult<()> {
        self.shared.engine.lock().await.init()
    }

    /// Stable node identity; also the room peer id and HLC tiebreaker.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Joins a room: signaling first, then channels to every member.
    /// Idempotent while a connection exists.
    pub async fn connect(&self, url: &str, token: &str) -> SyncResult<()> {
        if url.is_empty() {
            return Err(SyncError::ConfigMissing("signaling url"));
        }
        if token.is_empty() {
            return Err(SyncError::ConfigMissing("room token"));
        }
        // the engine must be ready before any remote op can arrive
        if !self.shared.engine.lock().await.is_initialized() {
            return Err(SyncError::NotInitialized);
        }

        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            debug!("connect called while already connected");
            return Ok(());
        }

        let peers = PeerManager::start(self.node_id.clone(), self.shared.clone()).await?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let signaling = match SignalingClient::connect(
            url,
            token,
            self.node_id.clone(),
            self.config.signaling.reconnect.clone(),
            event_tx,
        )
        .await
        {
            Ok(signaling) => signaling,
            Err(e) => {
                peers.shutdown().await;
                return Err(e);
            }
        };
        peers.set_signal_sender(signaling.sender());

        let shared = self.shared.clone();
        let pump_peers = peers.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    SignalingEvent::Frame(frame) => pump_peers.on_signaling_frame(frame).await,
                    SignalingEvent::Connected { reconnect: false } => {
                        shared.emit(SyncEvent::Connected)
                    }
                    SignalingEvent::Connected { reconnect: true } => {
                        shared.emit(SyncEvent::Reconnected)
                    }
                    SignalingEvent::Reconnecting { attempt } => {
                        shared.emit(SyncEvent::Reconnecting { attempt })
                    }
                    SignalingEvent::Disconnected => {
                        shared.emit(SyncEvent::Disconnected);
                        break;
                    }
                }
            }
        });

        info!(node_id = %self.node_id, url, "connected to room");
        *conn = Some(RoomConnection {
            signaling,
            peers,
            pump,
        });
        Ok(())
    }

    /// Executes SQL; mutations on synced tables replicate to the room.
    pub async fn exec(&self, sql: &str, params: &[SqlValue]) -> SyncResult<ExecResult> {
        let (result, ops) = self.shared.engine.lock().await.exec(sql, params)?;
        if !ops.is_empty() {
            let conn = self.conn.lock().await;
            for op in &ops {
                if let Some(conn) = conn.as_ref() {
                    conn.peers.broadcast_op(op).await;
                }
                self.shared.emit(SyncEvent::Operation {
                    op: op.clone(),
                    from_peer: None,
                });
            }
            drop(conn);
            self.shared.schedule_snapshot();
        }
        Ok(result)
    }

    /// Executes SQL without ever replicating; reads and private local
    /// bookkeeping.
    pub async fn exec_local(&self, sql: &str, params: &[SqlValue]) -> SyncResult<ExecResult> {
        self.shared.engine.lock().await.exec_local(sql, params)
    }

    /// Marks a table as participating in replication (tables without a
    /// declared primary key stay local-only regardless).
    pub async fn enable_sync(&self, table: &str) -> SyncResult<()> {
        self.shared.engine.lock().await.enable_sync(table)
    }

    /// Latest HLC string in the op log.
    pub async fn version(&self) -> Option<String> {
        self.shared.engine.lock().await.version()
    }

    /// Number of operations in the log.
    pub async fn op_count(&self) -> u64 {
        self.shared.engine.lock().await.op_count()
    }

    /// Peers with an open data channel.
    pub async fn peers(&self) -> Vec<String> {
        match self.conn.lock().await.as_ref() {
            Some(conn) => conn.peers.open_peers().await,
            None => Vec::new(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Full binary snapshot of the SQL state.
    pub async fn export(&self) -> SyncResult<Vec<u8>> {
        self.shared.engine.lock().await.export()
    }

    /// Replaces the SQL state from an exported snapshot.
    pub async fn import(&self, bytes: &[u8]) -> SyncResult<()> {
        self.shared.engine.lock().await.import(bytes)?;
        self.shared.schedule_snapshot();
        Ok(())
    }

    /// Subscribes to the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events().subscribe()
    }

    pub fn events(&self) -> &broadcast::Sender<SyncEvent> {
        &self.shared.events
    }

    pub async fn stats(&self) -> EngineStats {
        self.shared.engine.lock().await.stats()
    }

    /// Leaves the room: closes every peer channel and the signaling
    /// socket, suppressing reconnection.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.signaling.disconnect();
            conn.peers.shutdown().await;
            conn.pump.abort();
            self.shared.emit(SyncEvent::Disconnected);
            info!(node_id = %self.node_id, "disconnected from room");
        }
    }

    /// Disconnects and flushes the pending snapshot.
    pub async fn close(&self) -> SyncResult<()> {
        self.disconnect().await;
        self.shared.snapshot.flush(&self.shared.engine).await
    }
}
