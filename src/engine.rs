//! Replication engine: the central mediator between caller SQL, the clock,
//! the op log, and remote operations.
//!
//! Convergence strategy: per-row guard with history replay. The engine
//! tracks the highest HLC applied per `(table, pk)`. Operations that arrive
//! in row order take the fast path (one SQL statement). An operation older
//! than the row's guard cannot simply be ignored: an `Update` can overtake
//! its `Insert` across different peer channels. Such a row is
//! re-materialized from its full op history, which is a pure function of
//! the observed op set. Either path yields the same row state, so nodes
//! with equal op sets converge regardless of delivery order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::hlc::{Hlc, Timestamp};
use crate::oplog::OpLog;
use crate::ops::{classify, extract_operations, MutationClass, Operation};
use crate::sqlite::{ExecResult, SqlAdapter, SqlValue};

/// Meta key recording the newest op covered by the stored SQL snapshot.
const SNAPSHOT_VERSION_KEY: &str = "snapshot_version";

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct EngineStats {
    /// Ops produced by local mutations.
    pub ops_emitted: u64,
    /// Remote ops applied on the fast path.
    pub ops_applied: u64,
    /// Remote ops that arrived out of row order and forced a replay.
    pub ops_reordered: u64,
    /// Duplicate deliveries dropped at the log.
    pub ops_duplicate: u64,
    pub snapshots_written: u64,
}

/// Engine state behind the single mutex. Nothing in here awaits, so HLC
/// generation, SQL execution, and log appends never interleave per node.
pub struct EngineCore {
    node_id: String,
    clock: Hlc,
    sql: SqlAdapter,
    log: OpLog,
    synced_tables: HashSet<String>,
    /// row key -> highest HLC applied to that row
    row_versions: HashMap<String, Timestamp>,
    /// row key -> op-log keys touching that row, in HLC order
    row_history: HashMap<String, BTreeSet<String>>,
    stats: EngineStats,
    initialized: bool,
}

impl EngineCore {
    pub fn new(node_id: String, sql: SqlAdapter, log: OpLog) -> Self {
        let clock = Hlc::new(node_id.clone());
        Self::with_clock(node_id, sql, log, clock)
    }

    pub fn with_clock(node_id: String, sql: SqlAdapter, log: OpLog, clock: Hlc) -> Self {
        Self {
            node_id,
            clock,
            sql,
            log,
            synced_tables: HashSet::new(),
            row_versions: HashMap::new(),
            row_history: HashMap::new(),
            stats: EngineStats::default(),
            initialized: false,
        }
    }

    /// Loads the snapshot (if any) into SQL, then replays the op log:
    /// ops already covered by the snapshot only rebuild the row metadata,
    /// later ops are applied.
    pub fn init(&mut self) -> SyncResult<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(bytes) = self.log.load_db()? {
            self.sql.load(&bytes)?;
            debug!(node_id = %self.node_id, "snapshot loaded into sql");
        }
        let snapshot_version = self
            .log
            .meta_get(SNAPSHOT_VERSION_KEY)
            .map(|v| v.to_string());
        self.initialized = true;

        let mut covered = Vec::new();
        let mut pending = Vec::new();
        for op in self.log.since(None) {
            let in_snapshot = snapshot_version
                .as_deref()
                .map_or(false, |snap| op.version().as_str() <= snap);
            if in_snapshot {
                covered.push(op.clone());
            } else {
                pending.push(op.clone());
            }
        }
        for op in &covered {
            self.index_row(op);
            self.raise_row_guard(op);
        }
        let replayed = pending.len();
        for op in &pending {
            self.index_row(op);
            if let Err(e) = self.apply_effective(op) {
                warn!(key = %op.version(), "replay of logged op failed: {e}");
            }
        }

        info!(
            node_id = %self.node_id,
            ops = self.log.count(),
            replayed,
            "engine initialized"
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> SyncResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn version(&self) -> Option<String> {
        self.log.latest_version()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn op_count(&self) -> u64 {
        self.log.count()
    }

    /// Operations with HLC string strictly greater than the cursor, cloned
    /// for the wire. A cursor the log does not contain, like an absent
    /// one, selects the full log.
    pub fn ops_since(&self, cursor: Option<&str>) -> Vec<Operation> {
        self.log.since(cursor).cloned().collect()
    }

    /// Executes without ever producing operations; for reads and private
    /// local bookkeeping.
    pub fn exec_local(&mut self, sql: &str, params: &[SqlValue]) -> SyncResult<ExecResult> {
        self.ensure_initialized()?;
        self.sql.execute(sql, params)
    }

    /// Executes a statement and, for mutations on synced tables, extracts,
    /// logs, and returns the operations for broadcast.
    pub fn exec(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> SyncResult<(ExecResult, Vec<Operation>)> {
        self.ensure_initialized()?;
        match classify(sql) {
            MutationClass::Insert | MutationClass::Update | MutationClass::Delete => {
                // affected rows are enumerated against pre-statement state
                let ops = extract_operations(&mut self.sql, sql, params, &mut self.clock)?;
                let result = self.sql.execute(sql, params)?;
                for op in &ops {
                    self.log.append(op)?;
                    self.index_row(op);
                    self.raise_row_guard(op);
                    self.stats.ops_emitted += 1;
                }
                Ok((result, ops))
            }
            _ => Ok((self.sql.execute(sql, params)?, Vec::new())),
        }
    }

    /// Applies one remote operation: advances the clock, appends to the
    /// log, and updates SQL. Returns `false` for duplicate deliveries.
    /// An apply failure is logged and swallowed; the op stays in the log
    /// and is never retried.
    pub fn apply_remote(&mut self, op: &Operation) -> SyncResult<bool> {
        self.ensure_initialized()?;
        self.clock.receive(op.hlc());
        if !self.log.append(op)? {
            self.stats.ops_duplicate += 1;
            return Ok(false);
        }
        self.index_row(op);
        if let Err(e) = self.apply_effective(op) {
            warn!(
                key = %op.version(),
                table = op.table(),
                "remote op failed to apply, continuing: {e}"
            );
        }
        Ok(true)
    }

    pub fn export(&mut self) -> SyncResult<Vec<u8>> {
        self.ensure_initialized()?;
        self.sql.snapshot()
    }

    pub fn import(&mut self, bytes: &[u8]) -> SyncResult<()> {
        self.ensure_initialized()?;
        self.sql.load(bytes)
    }

    /// Marks a table as participating in replication. Replication
    /// eligibility still requires a declared primary key; tables without
    /// one stay local-only.
    pub fn enable_sync(&mut self, table: &str) -> SyncResult<()> {
        self.ensure_initialized()?;
        self.sql.invalidate_schema();
        let schema = self
            .sql
            .table_schema(table)?
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
        if schema.pk_columns.is_empty() {
            warn!(
                table,
                "enable_sync on a table without a primary key; it will not replicate"
            );
        }
        self.synced_tables.insert(table.to_string());
        Ok(())
    }

    pub fn synced_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.synced_tables.iter().cloned().collect();
        tables.sort();
        tables
    }

    /// Snapshots SQL into the log's snapshot slot and records the covered
    /// version.
    pub fn write_snapshot(&mut self) -> SyncResult<()> {
        self.ensure_initialized()?;
        let bytes = self.sql.snapshot()?;
        self.log.snapshot_db(&bytes)?;
        if let Some(version) = self.log.latest_version() {
            self.log.meta_set(SNAPSHOT_VERSION_KEY, &version)?;
        }
        self.stats.snapshots_written += 1;
        debug!(bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Reflects an op into SQL. In row order: one statement, with the
    /// resurrection fallback for updates landing on an absent row. Out of
    /// row order: replay the row's whole history.
    fn apply_effective(&mut self, op: &Operation) -> SyncResult<()> {
        let key = Self::row_key(op);
        let in_order = self
            .row_versions
            .get(&key)
            .map_or(true, |current| op.hlc() > current);
        if in_order {
            match op {
                Operation::Update { table, pk, values, .. } => {
                    let changes = self.sql.apply(op)?;
                    if changes == 0 {
                        // update after delete re-materializes the row
                        let mut row = pk.clone();
                        row.extend(values.clone());
                        self.sql.upsert_row(table, &row)?;
                    }
                }
                _ => {
                    self.sql.apply(op)?;
                }
            }
            self.raise_row_guard(op);
            self.stats.ops_applied += 1;
        } else {
            self.rematerialize_row(&key, op)?;
            self.raise_row_guard(op);
            self.stats.ops_reordered += 1;
        }
        Ok(())
    }

    /// Recomputes one row as a pure function of its op history and writes
    /// the result. `arrived` is only used for logging.
    fn rematerialize_row(&mut self, row_key: &str, arrived: &Operation) -> SyncResult<()> {
        let history = match self.row_history.get(row_key) {
            Some(keys) => keys.clone(),
            None => return Ok(()),
        };
        let mut state: Option<BTreeMap<String, SqlValue>> = None;
        let mut table = arrived.table().to_string();
        let mut pk = arrived.pk().clone();
        for key in &history {
            let op = match self.log.get(key) {
                Some(op) => op.clone(),
                None => continue,
            };
            table = op.table().to_string();
            pk = op.pk().clone();
            match op {
                Operation::Insert { pk, values, .. } => {
                    let mut row = pk;
                    row.extend(values);
                    state = Some(row);
                }
                Operation::Update { pk, values, .. } => match &mut state {
                    Some(row) => row.extend(values),
                    None => {
                        let mut row = pk;
                        row.extend(values);
                        state = Some(row);
                    }
                },
                Operation::Delete { .. } => state = None,
            }
        }
        debug!(
            key = %arrived.version(),
            table = %table,
            history = history.len(),
            "op arrived out of row order, re-materializing row"
        );
        match state {
            Some(row) => {
                self.sql.upsert_row(&table, &row)?;
            }
            None => {
                let delete = Operation::Delete {
                    hlc: arrived.hlc().clone(),
                    table,
                    pk,
                };
                self.sql.apply(&delete)?;
            }
        }
        Ok(())
    }

    fn row_key(op: &Operation) -> String {
        let pk = serde_json::to_string(op.pk()).unwrap_or_default();
        format!("{}\u{1f}{}", op.table(), pk)
    }

    fn index_row(&mut self, op: &Operation) {
        self.row_history
            .entry(Self::row_key(op))
            .or_default()
            .insert(op.version());
    }

    fn raise_row_guard(&mut self, op: &Operation) {
        let key = Self::row_key(op);
        match self.row_versions.get(&key) {
            Some(current) if current >= op.hlc() => {}
            _ => {
                self.row_versions.insert(key, op.hlc().clone());
            }
        }
    }
}

/// Debounced snapshot writer: one pending timer, re-armed on every
/// schedule, firing `delay` after the most recent one.
pub struct SnapshotScheduler {
    delay: Duration,
    pending: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: std::sync::Mutex::new(None),
        }
    }

    pub fn schedule(&self, engine: Arc<Mutex<EngineCore>>, events: broadcast::Sender<SyncEvent>) {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut core = engine.lock().await;
            if let Err(e) = core.write_snapshot() {
                warn!("debounced snapshot failed: {e}");
                let _ = events.send(SyncEvent::Error {
                    message: format!("snapshot failed: {e}"),
                });
            }
        });
        let mut pending = self.pending.lock().expect("snapshot timer lock");
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Cancels the pending timer and snapshots immediately.
    pub async fn flush(&self, engine: &Arc<Mutex<EngineCore>>) -> SyncResult<()> {
        let handle = self.pending.lock().expect("snapshot timer lock").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        engine.lock().await.write_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::ClockSource;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TickingClock(AtomicU64);

    impl ClockSource for TickingClock {
        fn now_millis(&self) -> u64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
    }

    fn engine(node: &str) -> EngineCore {
        engine_at(node, 1_000_000)
    }

    fn engine_at(node: &str, start: u64) -> EngineCore {
        let sql = SqlAdapter::open_in_memory().unwrap();
        let clock = Hlc::with_clock(
            node.to_string(),
            Box::new(TickingClock(AtomicU64::new(start))),
        );
        let mut core = EngineCore::with_clock(node.to_string(), sql, OpLog::in_memory(), clock);
        core.init().unwrap();
        core.exec_local(
            "CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT, stars INTEGER)",
            &[],
        )
        .unwrap();
        core
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    fn full_row(core: &mut EngineCore, id: &str) -> Option<Vec<SqlValue>> {
        core.exec_local(
            "SELECT id, content, stars FROM notes WHERE id = ?",
            &[text(id)],
        )
        .unwrap()
        .rows
        .into_iter()
        .next()
    }

    #[test]
    fn methods_fail_before_init() {
        let sql = SqlAdapter::open_in_memory().unwrap();
        let mut core = EngineCore::new("n".to_string(), sql, OpLog::in_memory());
        assert!(matches!(
            core.exec("SELECT 1", &[]),
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(core.export(), Err(SyncError::NotInitialized)));
    }

    #[test]
    fn exec_mutation_emits_and_logs_ops() {
        let mut core = engine("a");
        let (result, ops) = core
            .exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("hello")],
            )
            .unwrap();
        assert_eq!(result.changes, 1);
        assert_eq!(ops.len(), 1);
        assert_eq!(core.op_count(), 1);
        assert_eq!(core.version(), Some(ops[0].version()));
        assert_eq!(core.stats().ops_emitted, 1);
    }

    #[test]
    fn exec_local_never_produces_ops() {
        let mut core = engine("a");
        core.exec_local(
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[text("n1"), text("private")],
        )
        .unwrap();
        assert_eq!(core.op_count(), 0);
    }

    #[test]
    fn duplicate_delivery_is_dropped() {
        let mut producer = engine_at("p", 2_000);
        let (_, ops) = producer
            .exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("v0")],
            )
            .unwrap();
        let op = ops[0].clone();

        let mut core = engine_at("a", 1_000);
        assert!(core.apply_remote(&op).unwrap());
        assert!(!core.apply_remote(&op).unwrap());
        assert_eq!(core.op_count(), 1);
        assert_eq!(core.stats().ops_duplicate, 1);
    }

    #[test]
    fn update_overtaking_insert_still_converges() {
        let mut producer = engine_at("p", 2_000);
        let (_, ins) = producer
            .exec(
                "INSERT INTO notes (id, content, stars) VALUES (?, ?, ?)",
                &[text("n1"), text("v0"), SqlValue::Integer(3)],
            )
            .unwrap();
        let (_, upd) = producer
            .exec(
                "UPDATE notes SET content = ? WHERE id = ?",
                &[text("v1"), text("n1")],
            )
            .unwrap();
        let (ins, upd) = (ins[0].clone(), upd[0].clone());

        let mut a = engine_at("a", 1_000);
        a.apply_remote(&ins).unwrap();
        a.apply_remote(&upd).unwrap();

        let mut b = engine_at("b", 1_000);
        b.apply_remote(&upd).unwrap();
        b.apply_remote(&ins).unwrap();
        assert_eq!(b.stats().ops_reordered, 1);

        let expected = Some(vec![text("n1"), text("v1"), SqlValue::Integer(3)]);
        assert_eq!(full_row(&mut a, "n1"), expected);
        assert_eq!(full_row(&mut b, "n1"), expected);
        assert_eq!(a.op_count(), b.op_count());
    }

    #[test]
    fn lww_delete_then_insert_resurrects() {
        let mut producer = engine_at("p", 5_000);
        producer
            .exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("v0")],
            )
            .unwrap();
        let (_, del) = producer
            .exec("DELETE FROM notes WHERE id = ?", &[text("n1")])
            .unwrap();
        let (_, ins2) = producer
            .exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("revived")],
            )
            .unwrap();
        let (del, ins2) = (del[0].clone(), ins2[0].clone());
        assert!(del.hlc() < ins2.hlc());

        // later insert beats earlier delete, in both delivery orders
        let mut x = engine_at("x", 1_000);
        x.apply_remote(&del).unwrap();
        x.apply_remote(&ins2).unwrap();
        assert!(full_row(&mut x, "n1").is_some());

        let mut y = engine_at("y", 1_000);
        y.apply_remote(&ins2).unwrap();
        y.apply_remote(&del).unwrap();
        assert!(full_row(&mut y, "n1").is_some());

        // reversed HLC order: delete wins
        let mut z = engine_at("z", 1_000);
        let late_delete = Operation::Delete {
            hlc: Timestamp {
                millis: ins2.hlc().millis + 1,
                counter: 0,
                node_id: "q".to_string(),
            },
            table: "notes".to_string(),
            pk: ins2.pk().clone(),
        };
        z.apply_remote(&ins2).unwrap();
        z.apply_remote(&late_delete).unwrap();
        assert!(full_row(&mut z, "n1").is_none());
    }

    #[test]
    fn update_after_delete_rematerializes_row() {
        let mut producer = engine_at("p", 5_000);
        producer
            .exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("v0")],
            )
            .unwrap();
        let (_, del) = producer
            .exec("DELETE FROM notes WHERE id = ?", &[text("n1")])
            .unwrap();
        let del = del[0].clone();
        let update = Operation::Update {
            hlc: Timestamp {
                millis: del.hlc().millis + 10,
                counter: 0,
                node_id: "q".to_string(),
            },
            table: "notes".to_string(),
            pk: del.pk().clone(),
            values: std::iter::once(("content".to_string(), text("back"))).collect(),
        };

        let mut core = engine_at("a", 1_000);
        core.apply_remote(&del).unwrap();
        core.apply_remote(&update).unwrap();
        assert_eq!(
            full_row(&mut core, "n1"),
            Some(vec![text("n1"), text("back"), SqlValue::Null])
        );
    }

    #[test]
    fn concurrent_updates_resolve_by_hlc() {
        let mut a = engine_at("a", 3_000);
        let mut b = engine_at("b", 3_000);
        for core in [&mut a, &mut b] {
            core.exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("v0")],
            )
            .unwrap();
        }

        let (_, from_a) = a
            .exec(
                "UPDATE notes SET content = ? WHERE id = ?",
                &[text("A"), text("n1")],
            )
            .unwrap();
        let (_, from_b) = b
            .exec(
                "UPDATE notes SET content = ? WHERE id = ?",
                &[text("B"), text("n1")],
            )
            .unwrap();
        let (from_a, from_b) = (from_a[0].clone(), from_b[0].clone());

        a.apply_remote(&from_b).unwrap();
        b.apply_remote(&from_a).unwrap();

        let winner = if from_a.hlc() > from_b.hlc() { "A" } else { "B" };
        assert_eq!(
            full_row(&mut a, "n1").unwrap()[1],
            text(winner)
        );
        assert_eq!(full_row(&mut a, "n1"), full_row(&mut b, "n1"));
    }

    #[test]
    fn apply_remote_failure_keeps_op_and_continues() {
        let mut core = engine("a");
        let pk: BTreeMap<String, SqlValue> =
            std::iter::once(("id".to_string(), text("x"))).collect();
        let bad = Operation::Insert {
            hlc: Timestamp {
                millis: 9_000_000,
                counter: 0,
                node_id: "remote".to_string(),
            },
            table: "missing_table".to_string(),
            pk: pk.clone(),
            values: pk,
        };
        assert!(core.apply_remote(&bad).unwrap());
        assert_eq!(core.op_count(), 1);
        assert_eq!(core.stats().ops_applied, 0);
    }

    #[test]
    fn init_restores_from_snapshot_and_log_tail() {
        let dir = tempfile::tempdir().unwrap();

        let tail_op;
        {
            let sql = SqlAdapter::open_in_memory().unwrap();
            let log = OpLog::open(dir.path()).unwrap();
            let mut core = EngineCore::new("a".to_string(), sql, log);
            core.init().unwrap();
            core.exec_local(
                "CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT, stars INTEGER)",
                &[],
            )
            .unwrap();
            core.exec(
                "INSERT INTO notes (id, content) VALUES (?, ?)",
                &[text("n1"), text("snapshotted")],
            )
            .unwrap();
            core.write_snapshot().unwrap();

            // one more op after the snapshot
            let (_, ops) = core
                .exec(
                    "INSERT INTO notes (id, content) VALUES (?, ?)",
                    &[text("n2"), text("tail")],
                )
                .unwrap();
            tail_op = ops[0].clone();
        }

        let sql = SqlAdapter::open_in_memory().unwrap();
        let log = OpLog::open(dir.path()).unwrap();
        let mut core = EngineCore::new("a".to_string(), sql, log);
        core.init().unwrap();
        assert_eq!(core.op_count(), 2);
        assert!(full_row(&mut core, "n1").is_some());
        assert!(full_row(&mut core, "n2").is_some());
        assert_eq!(core.version(), Some(tail_op.version()));
    }

    #[test]
    fn enable_sync_rejects_unknown_tables() {
        let mut core = engine("a");
        assert!(matches!(
            core.enable_sync("nope"),
            Err(SyncError::UnknownTable(_))
        ));
        core.enable_sync("notes").unwrap();
        assert_eq!(core.synced_tables(), vec!["notes".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_scheduler_debounces() {
        let sql = SqlAdapter::open_in_memory().unwrap();
        let mut core = EngineCore::new("a".to_string(), sql, OpLog::in_memory());
        core.init().unwrap();
        core.exec_local("CREATE TABLE notes (id TEXT PRIMARY KEY)", &[])
            .unwrap();
        let engine = Arc::new(Mutex::new(core));
        let (events, _) = broadcast::channel(16);

        let scheduler = SnapshotScheduler::new(Duration::from_millis(50));
        for _ in 0..5 {
            scheduler.schedule(engine.clone(), events.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        // only the final timer fired
        assert_eq!(engine.lock().await.stats().snapshots_written, 1);

        scheduler.flush(&engine).await.unwrap();
        assert_eq!(engine.lock().await.stats().snapshots_written, 2);
    }
}
