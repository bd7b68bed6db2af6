//! Declared database layout.
//!
//! Tables are declared with the compact index syntax:
//!
//! ```text
//! "++id,title,&email,*tags"
//!  │    │     │      └─ multi-entry index (matches any array element)
//!  │    │     └──────── unique index
//!  │    └────────────── plain index
//!  └─────────────────── primary key: `++` auto-increment, `id` / `&id` inbound,
//!                       `++` alone = auto-increment outbound, empty = outbound
//! ```

use super::DbError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    /// Field holding the key inside each row. `None` means keys live outside
    /// the row and are supplied by the caller (or generated).
    pub field: Option<String>,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Plain,
    Unique,
    MultiEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub kind: IndexKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    /// The raw declaration; stored on disk to detect layout changes.
    pub spec: String,
    pub primary_key: PrimaryKey,
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn parse(name: &str, spec: &str) -> Result<Self, DbError> {
        ensure_identifier(name, "table name")?;

        let mut parts = spec.split(',').map(str::trim);
        let primary = parts.next().unwrap_or_default();
        let primary_key = if let Some(field) = primary.strip_prefix("++") {
            PrimaryKey {
                field: optional_field(field)?,
                auto_increment: true,
            }
        } else {
            let field = primary.strip_prefix('&').unwrap_or(primary);
            PrimaryKey {
                field: optional_field(field)?,
                auto_increment: false,
            }
        };

        let mut indexes = Vec::new();
        for part in parts.filter(|p| !p.is_empty()) {
            let (kind, field) = if let Some(f) = part.strip_prefix('&') {
                (IndexKind::Unique, f)
            } else if let Some(f) = part.strip_prefix('*') {
                (IndexKind::MultiEntry, f)
            } else if part.starts_with('[') {
                return Err(DbError::InvalidSchema(format!(
                    "{name}: compound index `{part}` is not supported"
                )));
            } else {
                (IndexKind::Plain, part)
            };
            ensure_identifier(field, "index field")?;
            if indexes.iter().any(|i: &IndexSpec| i.field == field)
                || primary_key.field.as_deref() == Some(field)
            {
                return Err(DbError::InvalidSchema(format!(
                    "{name}: field `{field}` declared twice"
                )));
            }
            indexes.push(IndexSpec {
                field: field.to_string(),
                kind,
            });
        }

        Ok(Self {
            name: name.to_string(),
            spec: spec.to_string(),
            primary_key,
            indexes,
        })
    }

    pub fn index(&self, field: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.field == field)
    }

    pub fn is_primary_field(&self, field: &str) -> bool {
        self.primary_key.field.as_deref() == Some(field)
    }

    /// A field can be queried or ordered by if it is the primary key field or
    /// a declared index.
    pub fn is_queryable(&self, field: &str) -> bool {
        self.is_primary_field(field) || self.index(field).is_some()
    }

    pub(crate) fn index_name(&self, field: &str) -> String {
        format!("idx_{}_{}", self.name, field)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: u32,
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            tables: Vec::new(),
        }
    }

    /// Declare a table; fails on a malformed declaration or a duplicate name.
    pub fn table(mut self, name: &str, spec: &str) -> Result<Self, DbError> {
        if self.get(name).is_some() {
            return Err(DbError::InvalidSchema(format!("table `{name}` declared twice")));
        }
        self.tables.push(TableSchema::parse(name, spec)?);
        Ok(self)
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == table)
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.version == 0 {
            return Err(DbError::InvalidSchema("version must be at least 1".into()));
        }
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) || self.name == ".." {
            return Err(DbError::InvalidSchema(format!(
                "invalid database name: `{}`",
                self.name
            )));
        }
        Ok(())
    }
}

fn optional_field(field: &str) -> Result<Option<String>, DbError> {
    if field.is_empty() {
        return Ok(None);
    }
    ensure_identifier(field, "primary key field")?;
    Ok(Some(field.to_string()))
}

/// Names end up inside SQL text and JSON paths, so only plain identifiers
/// are accepted. Leading `__` is reserved for internal tables.
pub(crate) fn ensure_identifier(value: &str, what: &str) -> Result<(), DbError> {
    let mut chars = value.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        || value.starts_with("__")
    {
        return Err(DbError::InvalidSchema(format!("invalid {what}: `{value}`")));
    }
    Ok(())
}
