//! Row-scoped operation model and the SQL mutation extractor.
//!
//! Only the prefix forms `INSERT [OR …] INTO t (cols) VALUES (…)`,
//! `UPDATE t SET … [WHERE …]` and `DELETE FROM t [WHERE …]` are recognized.
//! Statements that fall outside these shapes (batches, `INSERT … SELECT`,
//! `WITH`, `RETURNING`, tables without a declared primary key) execute
//! locally but produce no operations.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncResult;
use crate::hlc::{Hlc, Timestamp};
use crate::sqlite::{first_keyword, SqlAdapter, SqlValue, TableSchema};

/// A replicated row-scoped mutation. `pk` always holds exactly the declared
/// primary-key columns of `table`; `values` holds the written columns
/// (for updates, only the SET columns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        hlc: Timestamp,
        table: String,
        pk: BTreeMap<String, SqlValue>,
        values: BTreeMap<String, SqlValue>,
    },
    Update {
        hlc: Timestamp,
        table: String,
        pk: BTreeMap<String, SqlValue>,
        values: BTreeMap<String, SqlValue>,
    },
    Delete {
        hlc: Timestamp,
        table: String,
        pk: BTreeMap<String, SqlValue>,
    },
}

impl Operation {
    pub fn hlc(&self) -> &Timestamp {
        match self {
            Operation::Insert { hlc, .. }
            | Operation::Update { hlc, .. }
            | Operation::Delete { hlc, .. } => hlc,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Operation::Insert { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => table,
        }
    }

    pub fn pk(&self) -> &BTreeMap<String, SqlValue> {
        match self {
            Operation::Insert { pk, .. }
            | Operation::Update { pk, .. }
            | Operation::Delete { pk, .. } => pk,
        }
    }

    /// Op-log key and wire cursor of this operation.
    pub fn version(&self) -> String {
        self.hlc().to_string()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// Statement class derived from the first keyword alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationClass {
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

pub fn classify(sql: &str) -> MutationClass {
    match first_keyword(sql).as_str() {
        "INSERT" => MutationClass::Insert,
        "UPDATE" => MutationClass::Update,
        "DELETE" => MutationClass::Delete,
        "CREATE" | "ALTER" | "DROP" => MutationClass::Ddl,
        _ => MutationClass::Other,
    }
}

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*INSERT\s+(?:OR\s+[A-Za-z]+\s+)?INTO\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s*\(([^)]+)\)\s*VALUES\s*\("#,
    )
    .expect("insert regex compiles")
});

static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^\s*UPDATE\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s+SET\s+(.+)$"#)
        .expect("update regex compiles")
});

static DELETE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^\s*DELETE\s+FROM\s+["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?(.*)$"#)
        .expect("delete regex compiles")
});

static WHERE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where regex compiles"));

static SET_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*["`]?([A-Za-z_][A-Za-z0-9_]*)["`]?\s*=\s*\?\s*$"#)
        .expect("set item regex compiles")
});

static RETURNING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b").expect("returning regex compiles"));

/// Extracts zero or more operations for a mutation statement, consuming
/// fresh clock ticks so every emitted operation gets a unique log key.
/// Must run *before* the statement executes: affected rows for
/// UPDATE/DELETE are enumerated against the pre-statement table state.
///
/// A statement this extractor cannot soundly map to row operations yields
/// an empty vector, never an error; the caller still executes the SQL.
pub fn extract_operations(
    sql_adapter: &mut SqlAdapter,
    sql: &str,
    params: &[SqlValue],
    clock: &mut Hlc,
) -> SyncResult<Vec<Operation>> {
    // multi-statement batches and RETURNING clauses are outside the
    // recognized prefix forms
    if sql.trim_end().trim_end_matches(';').contains(';') || RETURNING_RE.is_match(sql) {
        debug!("statement outside recognized prefix forms, skipping op extraction");
        return Ok(Vec::new());
    }
    match classify(sql) {
        MutationClass::Insert => extract_insert(sql_adapter, sql, params, clock),
        MutationClass::Update => extract_update(sql_adapter, sql, params, clock),
        MutationClass::Delete => extract_delete(sql_adapter, sql, params, clock),
        _ => Ok(Vec::new()),
    }
}

fn synced_schema(sql_adapter: &mut SqlAdapter, table: &str) -> SyncResult<Option<TableSchema>> {
    match sql_adapter.table_schema(table)? {
        Some(schema) if !schema.pk_columns.is_empty() => Ok(Some(schema)),
        Some(_) => {
            debug!(table, "table has no primary key, skipping op extraction");
            Ok(None)
        }
        None => {
            debug!(table, "unknown table, skipping op extraction");
            Ok(None)
        }
    }
}

fn extract_insert(
    sql_adapter: &mut SqlAdapter,
    sql: &str,
    params: &[SqlValue],
    clock: &mut Hlc,
) -> SyncResult<Vec<Operation>> {
    let caps = match INSERT_RE.captures(sql) {
        Some(caps) => caps,
        None => return Ok(Vec::new()),
    };
    let table = caps[1].to_string();
    let columns: Vec<String> = caps[2]
        .split(',')
        .map(|c| c.trim().trim_matches(&['"', '`'][..]).to_string())
        .collect();

    let schema = match synced_schema(sql_adapter, &table)? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    if columns.len() != params.len() {
        debug!(
            table,
            cols = columns.len(),
            params = params.len(),
            "insert column/parameter count mismatch, skipping op extraction"
        );
        return Ok(Vec::new());
    }

    let values: BTreeMap<String, SqlValue> = columns
        .iter()
        .cloned()
        .zip(params.iter().cloned())
        .collect();
    let mut pk = BTreeMap::new();
    for col in &schema.pk_columns {
        match values.get(col) {
            Some(v) => {
                pk.insert(col.clone(), v.clone());
            }
            // primary key not fully present in the column list
            None => return Ok(Vec::new()),
        }
    }

    Ok(vec![Operation::Insert {
        hlc: clock.now(),
        table,
        pk,
        values,
    }])
}

fn extract_update(
    sql_adapter: &mut SqlAdapter,
    sql: &str,
    params: &[SqlValue],
    clock: &mut Hlc,
) -> SyncResult<Vec<Operation>> {
    let caps = match UPDATE_RE.captures(sql) {
        Some(caps) => caps,
        None => return Ok(Vec::new()),
    };
    let table = caps[1].to_string();
    let (set_sql, where_sql) = split_where(&caps[2]);

    let mut set_columns = Vec::new();
    for item in set_sql.split(',') {
        match SET_ITEM_RE.captures(item) {
            Some(c) => set_columns.push(c[1].to_string()),
            None => {
                // only plain `col = ?` assignments slice soundly;
                // `col = col + ?` and friends would corrupt the values map
                debug!(table, item = item.trim(), "unsupported SET expression, skipping op extraction");
                return Ok(Vec::new());
            }
        }
    }

    let schema = match synced_schema(sql_adapter, &table)? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    if params.len() < set_columns.len() {
        return Ok(Vec::new());
    }
    let (set_params, where_params) = params.split_at(set_columns.len());
    let values: BTreeMap<String, SqlValue> = set_columns
        .iter()
        .cloned()
        .zip(set_params.iter().cloned())
        .collect();

    let mut ops = Vec::new();
    for pk in affected_rows(sql_adapter, &table, &schema, &where_sql, where_params)? {
        ops.push(Operation::Update {
            hlc: clock.now(),
            table: table.clone(),
            pk,
            values: values.clone(),
        });
    }
    Ok(ops)
}

fn extract_delete(
    sql_adapter: &mut SqlAdapter,
    sql: &str,
    params: &[SqlValue],
    clock: &mut Hlc,
) -> SyncResult<Vec<Operation>> {
    let caps = match DELETE_RE.captures(sql) {
        Some(caps) => caps,
        None => return Ok(Vec::new()),
    };
    let table = caps[1].to_string();
    let (_, where_sql) = split_where(&caps[2]);

    let schema = match synced_schema(sql_adapter, &table)? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };

    let mut ops = Vec::new();
    for pk in affected_rows(sql_adapter, &table, &schema, &where_sql, params)? {
        ops.push(Operation::Delete {
            hlc: clock.now(),
            table: table.clone(),
            pk,
        });
    }
    Ok(ops)
}

/// Splits a statement tail at the first top-level `WHERE`. Absent WHERE is
/// treated as `1=1`.
fn split_where(tail: &str) -> (String, String) {
    match WHERE_RE.find(tail) {
        Some(m) => (
            tail[..m.start()].trim().to_string(),
            tail[m.end()..].trim().trim_end_matches(';').to_string(),
        ),
        None => (
            tail.trim().trim_end_matches(';').to_string(),
            "1=1".to_string(),
        ),
    }
}

/// Enumerates the primary keys of the rows a WHERE clause selects.
fn affected_rows(
    sql_adapter: &mut SqlAdapter,
    table: &str,
    schema: &TableSchema,
    where_sql: &str,
    where_params: &[SqlValue],
) -> SyncResult<Vec<BTreeMap<String, SqlValue>>> {
    let select = format!(
        "SELECT {} FROM \"{}\" WHERE {}",
        schema
            .pk_columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", "),
        table,
        where_sql,
    );
    let rows = sql_adapter.query_rows(&select, where_params)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            schema
                .pk_columns
                .iter()
                .cloned()
                .zip(row.into_iter())
                .collect()
        })
        .collect())
}
