//! SQL collaborator adapter over a single rusqlite connection.
//!
//! The adapter executes caller SQL, introspects schemas for the operation
//! extractor, reflects remote operations deterministically, and
//! exports/imports full binary snapshots. It is single-threaded by contract
//! and lives inside the engine core mutex.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::ops::Operation;

/// JSON object key marking a blob payload. Keeping bytes distinguishable
/// from text is required for bit-identical convergence.
const BLOB_KEY: &str = "$base64";

/// One SQL-typed payload carried by operations and query results.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Bool(b) => serializer.serialize_bool(*b),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::Real(f) => serializer.serialize_f64(*f),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Blob(b) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BLOB_KEY, &BASE64.encode(b))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SqlValueVisitor;

        impl<'de> Visitor<'de> for SqlValueVisitor {
            type Value = SqlValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("null, bool, number, string, or {\"$base64\": …}")
            }

            fn visit_unit<E: de::Error>(self) -> Result<SqlValue, E> {
                Ok(SqlValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<SqlValue, E> {
                Ok(SqlValue::Null)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<SqlValue, E> {
                Ok(SqlValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SqlValue, E> {
                Ok(SqlValue::Integer(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SqlValue, E> {
                i64::try_from(v)
                    .map(SqlValue::Integer)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<SqlValue, E> {
                Ok(SqlValue::Real(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SqlValue, E> {
                Ok(SqlValue::Text(v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SqlValue, A::Error> {
                let key: Option<String> = map.next_key()?;
                match key.as_deref() {
                    Some(BLOB_KEY) => {
                        let encoded: String = map.next_value()?;
                        let bytes = BASE64
                            .decode(encoded.as_bytes())
                            .map_err(|e| de::Error::custom(format!("bad base64: {e}")))?;
                        Ok(SqlValue::Blob(bytes))
                    }
                    other => Err(de::Error::custom(format!(
                        "unexpected object key {other:?} in SQL value"
                    ))),
                }
            }
        }

        deserializer.deserialize_any(SqlValueVisitor)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// Result of one SQL execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub changes: usize,
}

/// Column layout of one table, as seen by the operation extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<String>,
    /// Declared primary-key columns in key order. Empty means the table is
    /// never replicated.
    pub pk_columns: Vec<String>,
}

/// Single-connection SQLite adapter with a lazily built schema cache.
pub struct SqlAdapter {
    conn: Connection,
    schema_cache: Option<HashMap<String, TableSchema>>,
}

impl SqlAdapter {
    pub fn open_in_memory() -> SyncResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            schema_cache: None,
        })
    }

    /// Executes any statement. Statements that return rows are collected
    /// eagerly; DDL invalidates the schema cache.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> SyncResult<ExecResult> {
        let result = {
            let mut stmt = self.conn.prepare(sql)?;
            if stmt.column_count() == 0 {
                let changes = stmt.execute(params_from_iter(params.iter()))?;
                ExecResult {
                    changes,
                    ..ExecResult::default()
                }
            } else {
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut rows = Vec::new();
                let mut raw = stmt.query(params_from_iter(params.iter()))?;
                while let Some(row) = raw.next()? {
                    let mut out = Vec::with_capacity(columns.len());
                    for i in 0..columns.len() {
                        out.push(SqlValue::from(row.get_ref(i)?));
                    }
                    rows.push(out);
                }
                ExecResult {
                    columns,
                    rows,
                    changes: 0,
                }
            }
        };
        if is_ddl(sql) {
            self.invalidate_schema();
        }
        Ok(result)
    }

    /// Row-by-row read used during UPDATE/DELETE op extraction.
    pub fn query_rows(&mut self, sql: &str, params: &[SqlValue]) -> SyncResult<Vec<Vec<SqlValue>>> {
        Ok(self.execute(sql, params)?.rows)
    }

    pub fn invalidate_schema(&mut self) {
        self.schema_cache = None;
    }

    /// Schema of one table, from the cache when warm.
    pub fn table_schema(&mut self, table: &str) -> SyncResult<Option<TableSchema>> {
        Ok(self.schema_map()?.get(table).cloned())
    }

    /// Per-table column/primary-key view, rebuilt after DDL.
    pub fn schema_map(&mut self) -> SyncResult<&HashMap<String, TableSchema>> {
        if self.schema_cache.is_none() {
            let mut map = HashMap::new();
            let names: Vec<String> = {
                let mut stmt = self.conn.prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };
            for name in names {
                let mut columns = Vec::new();
                // (pk ordinal, column name), ordinal > 0 marks key membership
                let mut pk: Vec<(i64, String)> = Vec::new();
                let mut stmt = self
                    .conn
                    .prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let col: String = row.get(1)?;
                    let pk_ord: i64 = row.get(5)?;
                    if pk_ord > 0 {
                        pk.push((pk_ord, col.clone()));
                    }
                    columns.push(col);
                }
                pk.sort();
                map.insert(
                    name,
                    TableSchema {
                        columns,
                        pk_columns: pk.into_iter().map(|(_, c)| c).collect(),
                    },
                );
            }
            self.schema_cache = Some(map);
        }
        Ok(self.schema_cache.as_ref().expect("cache was just built"))
    }

    /// Full binary snapshot via the SQLite backup API.
    pub fn snapshot(&self) -> SyncResult<Vec<u8>> {
        let path = scratch_path();
        let result: SyncResult<Vec<u8>> = (|| {
            let mut dst = Connection::open(&path)?;
            let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst)?;
            backup.run_to_completion(64, Duration::from_millis(0), None)?;
            drop(backup);
            drop(dst);
            Ok(std::fs::read(&path)?)
        })();
        let _ = std::fs::remove_file(&path);
        result
    }

    /// Replaces the database contents with a previously exported snapshot.
    pub fn load(&mut self, bytes: &[u8]) -> SyncResult<()> {
        let path = scratch_path();
        let result: SyncResult<()> = (|| {
            std::fs::write(&path, bytes)?;
            let src = Connection::open(&path)?;
            let backup = rusqlite::backup::Backup::new(&src, &mut self.conn)?;
            backup.run_to_completion(64, Duration::from_millis(0), None)?;
            Ok(())
        })();
        let _ = std::fs::remove_file(&path);
        self.invalidate_schema();
        result
    }

    /// Full-row write used for remote inserts and row re-materialization.
    pub fn upsert_row(
        &mut self,
        table: &str,
        row: &std::collections::BTreeMap<String, SqlValue>,
    ) -> SyncResult<usize> {
        let cols: Vec<&String> = row.keys().collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(table),
            cols.iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; cols.len()].join(", "),
        );
        let params: Vec<SqlValue> = row.values().cloned().collect();
        Ok(self.execute(&sql, &params)?.changes)
    }

    /// Deterministically reflects a remote operation as SQL.
    pub fn apply(&mut self, op: &Operation) -> SyncResult<usize> {
        match op {
            Operation::Insert {
                table, pk, values, ..
            } => {
                // pk columns are a subset of the insert column list, but
                // the merge tolerates payloads where they are not
                let mut merged = pk.clone();
                for (col, val) in values {
                    merged.insert(col.clone(), val.clone());
                }
                debug!(table = %table, "applying remote insert");
                self.upsert_row(table, &merged)
            }
            Operation::Update {
                table, pk, values, ..
            } => {
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(table),
                    values
                        .keys()
                        .map(|c| format!("{} = ?", quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(", "),
                    pk_predicate(pk),
                );
                let mut params: Vec<SqlValue> = values.values().cloned().collect();
                params.extend(pk.values().cloned());
                debug!(table = %table, "applying remote update");
                Ok(self.execute(&sql, &params)?.changes)
            }
            Operation::Delete { table, pk, .. } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(table),
                    pk_predicate(pk),
                );
                let params: Vec<SqlValue> = pk.values().cloned().collect();
                debug!(table = %table, "applying remote delete");
                Ok(self.execute(&sql, &params)?.changes)
            }
        }
    }
}

fn pk_predicate(pk: &std::collections::BTreeMap<String, SqlValue>) -> String {
    pk.keys()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_ddl(sql: &str) -> bool {
    matches!(
        first_keyword(sql).as_str(),
        "CREATE" | "ALTER" | "DROP"
    )
}

/// First keyword of a statement, uppercased. Determines the mutation class.
pub fn first_keyword(sql: &str) -> String {
    sql.trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn scratch_path() -> PathBuf {
    std::env::temp_dir().join(format!("battery-db-{}.snapshot", Uuid::new_v4()))
}
