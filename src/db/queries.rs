use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::schema::{IndexKind, TableSchema};
use super::{Database, DbError, Key};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One stored row: its primary key and the JSON body.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub key: Key,
    pub body: String,
}

/// Native row order for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOrder {
    PrimaryKey,
    Field(String),
}

// ---------------------------------------------------------------------------
// Table row queries
// ---------------------------------------------------------------------------

pub fn insert_row(
    conn: &Connection,
    table: &str,
    key: &Key,
    body: &str,
    replace: bool,
) -> Result<(), DbError> {
    // Replace resolves primary key conflicts only; a clash on a unique
    // index still fails instead of deleting the other row.
    let on_conflict = if replace {
        " ON CONFLICT (pk_kind, pk_value) DO UPDATE SET body = excluded.body"
    } else {
        ""
    };
    conn.execute(
        &format!(
            "INSERT INTO \"{table}\" (pk_kind, pk_value, body) VALUES (?1, ?2, ?3){on_conflict}"
        ),
        params![key.kind_code(), key.sql_value(), body],
    )?;
    Ok(())
}

pub fn get_row(conn: &Connection, table: &str, key: &Key) -> Result<Option<String>, DbError> {
    let body = conn
        .query_row(
            &format!("SELECT body FROM \"{table}\" WHERE pk_kind = ?1 AND pk_value = ?2"),
            params![key.kind_code(), key.sql_value()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(body)
}

/// Returns true when a row was actually deleted.
pub fn delete_row(conn: &Connection, table: &str, key: &Key) -> Result<bool, DbError> {
    let changed = conn.execute(
        &format!("DELETE FROM \"{table}\" WHERE pk_kind = ?1 AND pk_value = ?2"),
        params![key.kind_code(), key.sql_value()],
    )?;
    Ok(changed > 0)
}

pub fn clear_rows(conn: &Connection, table: &str) -> Result<usize, DbError> {
    Ok(conn.execute(&format!("DELETE FROM \"{table}\""), [])?)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<u64, DbError> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
        row.get(0)
    })?;
    Ok(n.max(0) as u64)
}

/// Next integer key for an auto-increment table.
pub fn next_auto_key(conn: &Connection, table: &str) -> Result<i64, DbError> {
    let next: i64 = conn.query_row(
        &format!("SELECT COALESCE(MAX(pk_value), 0) + 1 FROM \"{table}\" WHERE pk_kind = 0"),
        [],
        |row| row.get(0),
    )?;
    Ok(next)
}

/// Ordered, windowed select. `limit = None` means no limit.
pub fn select_rows(
    conn: &Connection,
    table: &str,
    order: &RowOrder,
    limit: Option<usize>,
    offset: usize,
) -> Result<Vec<StoredRow>, DbError> {
    let order_sql = order_clause(order);
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT pk_kind, pk_value, body FROM \"{table}\" ORDER BY {order_sql} LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt
        .query_map(params![limit, offset as i64], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rows whose indexed fields equal the given values, in primary key order.
pub fn select_matching(
    conn: &Connection,
    table: &TableSchema,
    criteria: &[(String, Value)],
    limit: Option<usize>,
) -> Result<Vec<StoredRow>, DbError> {
    let mut clauses = Vec::with_capacity(criteria.len());
    let mut values = Vec::with_capacity(criteria.len() + 1);
    for (i, (field, value)) in criteria.iter().enumerate() {
        let n = i + 1;
        let multi = matches!(table.index(field).map(|idx| idx.kind), Some(IndexKind::MultiEntry));
        if multi {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(body, '$.{field}') WHERE json_each.value IS ?{n})"
            ));
        } else {
            clauses.push(format!("json_extract(body, '$.{field}') IS ?{n}"));
        }
        values.push(json_to_sql(value));
    }
    let where_sql = if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    };
    values.push(SqlValue::Integer(limit.map(|l| l as i64).unwrap_or(-1)));

    let mut stmt = conn.prepare(&format!(
        "SELECT pk_kind, pk_value, body FROM \"{}\" WHERE {where_sql}
         ORDER BY pk_kind, pk_value LIMIT ?{}",
        table.name,
        values.len()
    ))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn order_clause(order: &RowOrder) -> String {
    match order {
        RowOrder::PrimaryKey => "pk_kind, pk_value".to_string(),
        RowOrder::Field(field) => {
            format!("json_extract(body, '$.{field}'), pk_kind, pk_value")
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let kind: i64 = row.get(0)?;
    let key = Key::from_sql(kind, row.get_ref(1)?)?;
    Ok(StoredRow {
        key,
        body: row.get(2)?,
    })
}

/// SQLite view of a JSON scalar, matching what `json_extract` returns.
fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Cache entry queries
// ---------------------------------------------------------------------------

pub fn get_cache_entry(db: &Database, namespace: &str, key: &str) -> Result<Option<String>, DbError> {
    db.with_conn(|conn| {
        let value = conn
            .query_row(
                "SELECT value_json FROM __cache WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    })
}

pub fn upsert_cache_entry(
    db: &Database,
    namespace: &str,
    key: &str,
    value_json: &str,
) -> Result<(), DbError> {
    let now = chrono::Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO __cache (namespace, key, value_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key)
             DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![namespace, key, value_json, now],
        )?;
        Ok(())
    })
}

/// Deletes the given keys and returns the ones that existed.
pub fn delete_cache_entries<S: AsRef<str>>(
    db: &Database,
    namespace: &str,
    keys: &[S],
) -> Result<Vec<String>, DbError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut removed = Vec::new();
        for key in keys {
            let key: &str = key.as_ref();
            let changed = tx.execute(
                "DELETE FROM __cache WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )?;
            if changed > 0 {
                removed.push(key.to_string());
            }
        }
        tx.commit()?;
        Ok(removed)
    })
}

/// Deletes every entry of the namespace and returns the keys that existed.
pub fn clear_cache_entries(db: &Database, namespace: &str) -> Result<Vec<String>, DbError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let keys = list_keys(&tx, namespace)?;
        tx.execute("DELETE FROM __cache WHERE namespace = ?1", params![namespace])?;
        tx.commit()?;
        Ok(keys)
    })
}

pub fn list_cache_keys(db: &Database, namespace: &str) -> Result<Vec<String>, DbError> {
    db.with_conn(|conn| list_keys(conn, namespace))
}

pub fn count_cache_entries(db: &Database, namespace: &str) -> Result<u64, DbError> {
    db.with_conn(|conn| {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM __cache WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    })
}

fn list_keys(conn: &Connection, namespace: &str) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare("SELECT key FROM __cache WHERE namespace = ?1 ORDER BY key")?;
    let keys = stmt
        .query_map(params![namespace], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}
