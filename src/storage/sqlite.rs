//! SQLite helpers shared by both store backends: value conversion, direct
//! query/exec, and the table operations the sync core applies batches with.

use std::collections::HashSet;
use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};

use crate::diff::KeyedRow;
use crate::error::{Error, Result};
use crate::transport::{ColumnSpec, ShapeChange};
use crate::types::Row;

// ============================================================================
// Identifiers
// ============================================================================

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
    })
}

/// Table names come from callers and remote URLs; only plain identifiers are
/// accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// Value conversion
// ============================================================================

pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Blobs come back as standard base64 strings.
pub fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

// ============================================================================
// Direct access
// ============================================================================

/// Run a statement and collect its rows as JSON objects in column order.
pub fn query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), from_sql_ref(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}

/// Execute one or more statements. Returns the change count of the last one.
pub fn exec(conn: &Connection, sql: &str) -> Result<u64> {
    conn.execute_batch(sql)?;
    Ok(conn.changes())
}

// ============================================================================
// Table introspection
// ============================================================================

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names in declaration order.
pub fn columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    Ok(table_info(conn, table)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Primary-key columns in key order. Empty for tables without one.
pub fn primary_key(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut pk: Vec<(String, i64)> = table_info(conn, table)?
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .collect();
    pk.sort_by_key(|(_, idx)| *idx);
    Ok(pk.into_iter().map(|(name, _)| name).collect())
}

fn table_info(conn: &Connection, table: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Every row of `table`, keyed by primary key, in key order.
pub fn keyed_rows(conn: &Connection, table: &str) -> Result<Vec<KeyedRow>> {
    let pk = primary_key(conn, table)?;
    let order = if pk.is_empty() {
        "rowid".to_string()
    } else {
        pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    };
    let rows = query(
        conn,
        &format!("SELECT * FROM {} ORDER BY {order}", quote_ident(table)),
        &[],
    )?;
    Ok(rows
        .into_iter()
        .map(|row| KeyedRow::from_row(row, &pk))
        .collect())
}

// ============================================================================
// Writes
// ============================================================================

pub fn clear_table(conn: &Connection, table: &str) -> Result<u64> {
    let n = conn.execute(&format!("DELETE FROM {}", quote_ident(table)), [])?;
    Ok(n as u64)
}

/// Make `table` hold exactly `rows`, in one transaction.
pub fn replace_rows(conn: &Connection, table: &str, rows: &[Row]) -> Result<()> {
    let known: HashSet<String> = columns(conn, table)?.into_iter().collect();
    let tx = conn.unchecked_transaction()?;
    clear_table(&tx, table)?;
    for row in rows {
        insert_row(&tx, table, row, &known, &[], UpsertMode::Replace)?;
    }
    tx.commit()?;
    Ok(())
}

/// Apply explicit insert/update/delete operations, in one transaction.
///
/// Inserts and updates are upserts keyed by primary key; an update only
/// touches the columns it carries.
pub fn apply_changes(conn: &Connection, table: &str, changes: &[ShapeChange]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    write_changes(conn, table, changes, false)
}

/// Empty `table`, then apply `changes`, in one transaction.
pub fn replace_with_changes(conn: &Connection, table: &str, changes: &[ShapeChange]) -> Result<()> {
    write_changes(conn, table, changes, true)
}

fn write_changes(conn: &Connection, table: &str, changes: &[ShapeChange], clear: bool) -> Result<()> {
    let known: HashSet<String> = columns(conn, table)?.into_iter().collect();
    let pk = primary_key(conn, table)?;
    let tx = conn.unchecked_transaction()?;
    if clear {
        clear_table(&tx, table)?;
    }
    for change in changes {
        match change {
            ShapeChange::Insert(row) => {
                insert_row(&tx, table, row, &known, &pk, UpsertMode::Replace)?;
            }
            ShapeChange::Update(row) => {
                insert_row(&tx, table, row, &known, &pk, UpsertMode::Merge)?;
            }
            ShapeChange::Delete(row) => delete_row(&tx, table, row, &known, &pk)?,
        }
    }
    tx.commit()?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UpsertMode {
    /// The incoming row replaces the stored one.
    Replace,
    /// Only the incoming columns are overwritten.
    Merge,
}

fn insert_row(
    conn: &Connection,
    table: &str,
    row: &Row,
    known: &HashSet<String>,
    pk: &[String],
    mode: UpsertMode,
) -> Result<()> {
    let cols: Vec<&String> = row.keys().filter(|c| known.contains(*c)).collect();
    if cols.is_empty() {
        return Ok(());
    }
    let col_list = cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=cols.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = match mode {
        UpsertMode::Merge if !pk.is_empty() => {
            let updates: Vec<String> = cols
                .iter()
                .filter(|c| !pk.contains(c))
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            let target = pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            format!(
                "INSERT INTO {} ({col_list}) VALUES ({placeholders}) ON CONFLICT ({target}) {action}",
                quote_ident(table)
            )
        }
        _ => format!(
            "INSERT OR REPLACE INTO {} ({col_list}) VALUES ({placeholders})",
            quote_ident(table)
        ),
    };
    let values = cols.iter().map(|c| to_sql_value(&row[c.as_str()]));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn delete_row(
    conn: &Connection,
    table: &str,
    row: &Row,
    known: &HashSet<String>,
    pk: &[String],
) -> Result<()> {
    // Without a primary key, match on every column the message carries.
    let match_cols: Vec<&String> = if pk.is_empty() {
        row.keys().filter(|c| known.contains(*c)).collect()
    } else {
        pk.iter().collect()
    };
    if match_cols.is_empty() || match_cols.iter().any(|c| !row.contains_key(c.as_str())) {
        tracing::warn!(table, "delete message is missing key columns; ignored");
        return Ok(());
    }
    let predicate = match_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} IS ?{}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let values = match_cols.iter().map(|c| to_sql_value(&row[c.as_str()]));
    conn.execute(
        &format!("DELETE FROM {} WHERE {predicate}", quote_ident(table)),
        params_from_iter(values),
    )?;
    Ok(())
}

// ============================================================================
// DDL from a remote column schema
// ============================================================================

/// SQLite column type for a remote (Postgres-style) type name.
pub fn sqlite_type(remote: &str) -> &'static str {
    let base = remote
        .trim()
        .trim_start_matches('_')
        .split(|c: char| c == '(' || c == ' ')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match base.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "int" | "bigint" | "serial"
        | "bigserial" | "bool" | "boolean" => "INTEGER",
        "float4" | "float8" | "real" | "double" | "numeric" | "decimal" => "REAL",
        "bytea" => "BLOB",
        _ => "TEXT",
    }
}

pub fn create_table_ddl(table: &str, columns: &[ColumnSpec]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), sqlite_type(&c.remote_type));
            if c.not_null {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    let mut pk: Vec<&ColumnSpec> = columns.iter().filter(|c| c.pk_index.is_some()).collect();
    pk.sort_by_key(|c| c.pk_index);
    if !pk.is_empty() {
        defs.push(format!(
            "PRIMARY KEY ({})",
            pk.iter().map(|c| quote_ident(&c.name)).collect::<Vec<_>>().join(", ")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        defs.join(", ")
    )
}

pub fn create_table_from_schema(conn: &Connection, table: &str, columns: &[ColumnSpec]) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::TableMissing(table.to_string()));
    }
    conn.execute_batch(&create_table_ddl(table, columns))?;
    Ok(())
}
