use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use super::schema::{DatabaseSchema, IndexKind, TableSchema};
use super::DbError;

const META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS __tables (
    name        TEXT PRIMARY KEY,
    spec        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS __cache (
    namespace   TEXT NOT NULL,
    key         TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);
"#;

/// Bring the on-disk layout in line with `schema`.
///
/// Returns the names of tables that were upgraded (changed or dropped under a
/// version bump). Freshly created tables are not upgrades. The whole pass runs
/// in one immediate transaction so concurrent openers of the same file see
/// either the old or the new layout.
pub(super) fn apply_schema(
    conn: &Connection,
    schema: &DatabaseSchema,
) -> Result<Vec<String>, DbError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute_batch(META_SQL)?;

    let stored: u32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if stored > schema.version {
        return Err(DbError::VersionDowngrade {
            stored,
            declared: schema.version,
        });
    }
    let bumped = stored < schema.version;

    let existing: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT name, spec FROM __tables ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut upgraded = Vec::new();

    for table in &schema.tables {
        match existing.iter().find(|(name, _)| name == &table.name) {
            None => {
                create_table(&tx, table)?;
                record_table(&tx, table)?;
            }
            Some((_, spec)) if spec == &table.spec => {}
            Some((_, spec)) => {
                if !bumped {
                    return Err(DbError::SchemaMismatch {
                        table: table.name.clone(),
                    });
                }
                let old = TableSchema::parse(&table.name, spec)
                    .map_err(|e| DbError::Migration(format!("stored layout unreadable: {e}")))?;
                if old.primary_key != table.primary_key {
                    // Rows keyed the old way cannot be carried over.
                    tracing::warn!(table = %table.name, "primary key changed; recreating table");
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", old.name))?;
                    create_table(&tx, table)?;
                } else {
                    drop_indexes(&tx, &old)?;
                    create_indexes(&tx, table)?;
                }
                record_table(&tx, table)?;
                upgraded.push(table.name.clone());
            }
        }
    }

    for (name, _) in &existing {
        if schema.get(name).is_some() {
            continue;
        }
        if !bumped {
            return Err(DbError::SchemaMismatch {
                table: name.clone(),
            });
        }
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))?;
        tx.execute("DELETE FROM __tables WHERE name = ?1", params![name])?;
        upgraded.push(name.clone());
    }

    if bumped {
        tracing::info!(
            db = %schema.name,
            "applying schema v{} (stored v{stored})",
            schema.version
        );
        tx.pragma_update(None, "user_version", schema.version)?;
    }

    tx.commit()?;
    Ok(upgraded)
}

fn create_table(conn: &Connection, table: &TableSchema) -> Result<(), DbError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (
            pk_kind   INTEGER NOT NULL,
            pk_value  NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (pk_kind, pk_value)
        );",
        table.name
    ))?;
    create_indexes(conn, table)
}

fn create_indexes(conn: &Connection, table: &TableSchema) -> Result<(), DbError> {
    for index in &table.indexes {
        let unique = match index.kind {
            IndexKind::Plain => "",
            IndexKind::Unique => "UNIQUE ",
            // Array membership goes through json_each; an expression index
            // over the whole array would not help those lookups.
            IndexKind::MultiEntry => continue,
        };
        conn.execute_batch(&format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{}\" ON \"{}\" (json_extract(body, '$.{}'));",
            table.index_name(&index.field),
            table.name,
            index.field
        ))?;
    }
    Ok(())
}

fn drop_indexes(conn: &Connection, table: &TableSchema) -> Result<(), DbError> {
    for index in &table.indexes {
        conn.execute_batch(&format!(
            "DROP INDEX IF EXISTS \"{}\";",
            table.index_name(&index.field)
        ))?;
    }
    Ok(())
}

fn record_table(conn: &Connection, table: &TableSchema) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO __tables (name, spec, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(name)
         DO UPDATE SET spec = excluded.spec, updated_at = excluded.updated_at",
        params![table.name, table.spec, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
