use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::queries::{self, RowOrder, StoredRow};
use super::{Database, DbError, Key, Keys, TableSchema};
use crate::bus::{DbEventData, DbEventType, Event, EventHandler};

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Query arguments
// ---------------------------------------------------------------------------

/// Arguments for [`Table::find`].
///
/// Rows are taken from the whole table, or from `keys` when set. Keyed rows
/// come back in the order the keys were given, repeats included and missing
/// keys skipped, unless `order_by` is set. The candidates are then ordered,
/// windowed by `offset` and `limit`, and only then passed through `filter`.
pub struct Query<T> {
    keys: Option<Vec<Key>>,
    limit: Option<usize>,
    offset: usize,
    order_by: Option<String>,
    filter: Option<Filter<T>>,
}

impl<T> Default for Query<T> {
    fn default() -> Self {
        Self {
            keys: None,
            limit: None,
            offset: 0,
            order_by: None,
            filter: None,
        }
    }
}

impl<T> Query<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(mut self, keys: impl Into<Keys>) -> Self {
        self.keys = Some(keys.into().into_vec());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("keys", &self.keys)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("order_by", &self.order_by)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Single-row lookup for [`Table::find_one`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Exact primary key.
    Key(Key),
    /// Every listed field (primary key field or declared index) must equal the
    /// given value. Multi-entry indexes match when any element equals it.
    Match(Vec<(String, Value)>),
}

impl Lookup {
    pub fn key(key: impl Into<Key>) -> Self {
        Lookup::Key(key.into())
    }

    pub fn matching<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Lookup::Match(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOptions {
    /// Keys for tables whose primary key lives outside the row.
    pub keys: Option<Keys>,
    /// Overwrite existing rows instead of failing on a duplicate key.
    pub replace: bool,
}

impl InsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(mut self, keys: impl Into<Keys>) -> Self {
        self.keys = Some(keys.into());
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Typed view of one declared table.
///
/// Every successful mutation broadcasts a DB event so that other contexts
/// sharing the store can refresh.
pub struct Table<T> {
    name: String,
    db: Arc<Database>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    _rows: PhantomData<fn() -> T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(name: &str, db: Arc<Database>) -> Result<Self, DbError> {
        db.table_schema(name)?;
        Ok(Self {
            name: name.to_string(),
            db,
            handler: Mutex::new(None),
            _rows: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn schema(&self) -> Result<&TableSchema, DbError> {
        self.db.table_schema(&self.name)
    }

    // -- reads ---------------------------------------------------------------

    pub fn find(&self, query: Query<T>) -> Result<Vec<T>, DbError> {
        let schema = self.schema()?;
        let order = match query.order_by.as_deref() {
            None => RowOrder::PrimaryKey,
            Some(field) if schema.is_primary_field(field) => RowOrder::PrimaryKey,
            Some(field) if schema.index(field).is_some() => RowOrder::Field(field.to_string()),
            Some(field) => {
                return Err(DbError::InvalidArgument(format!(
                    "cannot order `{}` by unindexed field `{field}`",
                    self.name
                )))
            }
        };

        let explicit_order = query.order_by.is_some();
        let rows = match query.keys {
            None => self.db.with_conn(|conn| {
                queries::select_rows(conn, &self.name, &order, query.limit, query.offset)
            })?,
            Some(keys) => {
                let mut rows = self.db.with_conn(|conn| {
                    let mut rows = Vec::with_capacity(keys.len());
                    for key in keys {
                        if let Some(body) = queries::get_row(conn, &self.name, &key)? {
                            rows.push(StoredRow { key, body });
                        }
                    }
                    Ok(rows)
                })?;
                match &order {
                    RowOrder::Field(field) => sort_by_field(&mut rows, field)?,
                    RowOrder::PrimaryKey if explicit_order => {
                        rows.sort_by(|a, b| a.key.cmp(&b.key));
                    }
                    RowOrder::PrimaryKey => {}
                }
                rows.into_iter()
                    .skip(query.offset)
                    .take(query.limit.unwrap_or(usize::MAX))
                    .collect()
            }
        };

        let mut items = decode_rows(rows)?;
        if let Some(filter) = query.filter {
            items.retain(|item| filter(item));
        }
        Ok(items)
    }

    pub fn find_one(&self, lookup: Lookup) -> Result<Option<T>, DbError> {
        match lookup {
            Lookup::Key(key) => {
                let body = self
                    .db
                    .with_conn(|conn| queries::get_row(conn, &self.name, &key))?;
                body.map(|b| serde_json::from_str(&b).map_err(DbError::from))
                    .transpose()
            }
            Lookup::Match(fields) => {
                let rows = self.select_matching(&fields, Some(1))?;
                Ok(decode_rows(rows)?.into_iter().next())
            }
        }
    }

    /// All rows matching every listed field, in primary key order.
    pub fn find_where<K: Into<String>>(
        &self,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Vec<T>, DbError> {
        let fields: Vec<(String, Value)> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let rows = self.select_matching(&fields, None)?;
        decode_rows(rows)
    }

    pub fn count(&self) -> Result<u64, DbError> {
        self.db.with_conn(|conn| queries::count_rows(conn, &self.name))
    }

    fn select_matching(
        &self,
        fields: &[(String, Value)],
        limit: Option<usize>,
    ) -> Result<Vec<StoredRow>, DbError> {
        let schema = self.schema()?;
        if fields.is_empty() {
            return Err(DbError::InvalidArgument("empty match criteria".into()));
        }
        if let Some((field, _)) = fields.iter().find(|(f, _)| !schema.is_queryable(f)) {
            return Err(DbError::InvalidArgument(format!(
                "`{field}` is not indexed on `{}`",
                self.name
            )));
        }
        self.db
            .with_conn(|conn| queries::select_matching(conn, schema, fields, limit))
    }

    // -- writes --------------------------------------------------------------

    /// Insert one row and return its key.
    pub fn insert(&self, item: &T, options: InsertOptions) -> Result<Key, DbError> {
        let keys = match options.keys {
            None => None,
            Some(Keys::One(key)) => Some(vec![key]),
            Some(Keys::Many(_)) => {
                return Err(DbError::InvalidArgument(
                    "single insert takes a single key".into(),
                ))
            }
        };
        let mut written = self.write(std::slice::from_ref(item), keys, options.replace)?;
        written
            .pop()
            .ok_or_else(|| DbError::MissingKey { table: self.name.clone() })
    }

    /// Insert all rows in one transaction and return their keys in order.
    pub fn insert_many(&self, items: &[T], options: InsertOptions) -> Result<Vec<Key>, DbError> {
        let keys = match options.keys {
            None => None,
            Some(Keys::One(_)) => {
                return Err(DbError::InvalidArgument(
                    "bulk insert takes a list of keys".into(),
                ))
            }
            Some(Keys::Many(keys)) if keys.len() != items.len() => {
                return Err(DbError::InvalidArgument(format!(
                    "{} keys given for {} rows",
                    keys.len(),
                    items.len()
                )))
            }
            Some(Keys::Many(keys)) => Some(keys),
        };
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.write(items, keys, options.replace)
    }

    fn write(
        &self,
        items: &[T],
        keys: Option<Vec<Key>>,
        replace: bool,
    ) -> Result<Vec<Key>, DbError> {
        let schema = self.schema()?;
        let inbound = schema.primary_key.field.clone();
        let auto = schema.primary_key.auto_increment;

        match (&inbound, &keys) {
            (Some(field), Some(_)) => {
                return Err(DbError::InvalidArgument(format!(
                    "`{}` keys rows by `{field}`; explicit keys are not allowed",
                    self.name
                )))
            }
            (None, None) if !auto => {
                return Err(DbError::InvalidArgument(format!(
                    "`{}` needs explicit keys",
                    self.name
                )))
            }
            _ => {}
        }

        let bodies = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let written = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut written = Vec::with_capacity(bodies.len());
            for (i, mut body) in bodies.into_iter().enumerate() {
                let key = match (&inbound, &keys) {
                    (Some(field), _) => self.inbound_key(&tx, field, auto, &mut body)?,
                    (None, Some(keys)) => keys[i].clone().normalized(),
                    (None, None) => Key::Int(queries::next_auto_key(&tx, &self.name)?),
                };
                queries::insert_row(&tx, &self.name, &key, &body.to_string(), replace)?;
                written.push(key);
            }
            tx.commit()?;
            Ok(written)
        })?;

        let kind = if replace {
            DbEventType::Update
        } else {
            DbEventType::Insert
        };
        tracing::debug!(table = %self.name, ?kind, rows = written.len(), "rows written");
        self.db.emit(DbEventData::for_table(
            kind,
            self.db.name(),
            &self.name,
            written.clone(),
        ))?;
        Ok(written)
    }

    /// Key stored inside the row; generated and written back for
    /// auto-increment tables when absent.
    fn inbound_key(
        &self,
        conn: &rusqlite::Connection,
        field: &str,
        auto: bool,
        body: &mut Value,
    ) -> Result<Key, DbError> {
        let Value::Object(map) = body else {
            return Err(DbError::MissingKey { table: self.name.clone() });
        };
        match map.get(field) {
            Some(value) if !value.is_null() => {
                Key::from_json(value).ok_or_else(|| DbError::MissingKey { table: self.name.clone() })
            }
            _ if auto => {
                let next = queries::next_auto_key(conn, &self.name)?;
                map.insert(field.to_string(), Value::from(next));
                Ok(Key::Int(next))
            }
            _ => Err(DbError::MissingKey { table: self.name.clone() }),
        }
    }

    /// Delete rows and return the keys that actually existed. Nothing is
    /// broadcast when no row was deleted.
    pub fn remove(&self, keys: impl Into<Keys>) -> Result<Vec<Key>, DbError> {
        let keys = keys.into().into_vec();
        let removed = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut removed = Vec::new();
            for key in keys {
                if queries::delete_row(&tx, &self.name, &key)? {
                    removed.push(key);
                }
            }
            tx.commit()?;
            Ok(removed)
        })?;

        if removed.is_empty() {
            tracing::debug!(table = %self.name, "remove matched no rows");
            return Ok(removed);
        }
        self.db.emit(DbEventData::for_table(
            DbEventType::Remove,
            self.db.name(),
            &self.name,
            removed.clone(),
        ))?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), DbError> {
        let deleted = self
            .db
            .with_conn(|conn| queries::clear_rows(conn, &self.name))?;
        tracing::debug!(table = %self.name, deleted, "table cleared");
        self.db.emit(DbEventData::for_table(
            DbEventType::Clean,
            self.db.name(),
            &self.name,
            Vec::new(),
        ))
    }

    // -- change notifications ------------------------------------------------

    /// Register `handler` for DB events about this table and for cache
    /// invalidations. Replaces any handler registered earlier.
    pub fn add_db_event_handler(&self, handler: impl Fn(&DbEventData) + Send + Sync + 'static) {
        let table = self.name.clone();
        let adapter: Arc<dyn EventHandler> = Arc::new(move |event: &Event| {
            let Some(data) = event.db_data() else {
                return;
            };
            if data.table.as_deref() == Some(table.as_str())
                || data.kind == DbEventType::CacheInvalidation
            {
                handler(&data);
            }
        });

        let previous = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(adapter.clone());
        if let Some(previous) = previous {
            self.db.bus().remove_db_event_handler(&previous);
        }
        self.db.bus().add_db_event_handler(adapter);
    }

    pub fn remove_db_event_handler(&self) {
        let previous = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            self.db.bus().remove_db_event_handler(&previous);
        }
    }
}

impl<T> Drop for Table<T> {
    fn drop(&mut self) {
        let slot = self
            .handler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = slot {
            self.db.bus().remove_db_event_handler(&handler);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_rows<T: DeserializeOwned>(rows: Vec<StoredRow>) -> Result<Vec<T>, DbError> {
    rows.into_iter()
        .map(|row| serde_json::from_str(&row.body).map_err(DbError::from))
        .collect()
}

/// Sort by a body field the same way SQLite orders `json_extract` results:
/// null, then numbers, then text. Ties keep key order.
fn sort_by_field(rows: &mut [StoredRow], field: &str) -> Result<(), DbError> {
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let body: Value = serde_json::from_str(&row.body)?;
        keyed.push(body.get(field).cloned().unwrap_or(Value::Null));
    }
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|a, b| compare_json(&keyed[*a], &keyed[*b]));
    let sorted: Vec<StoredRow> = order.iter().map(|i| rows[*i].clone()).collect();
    rows.clone_from_slice(&sorted);
    Ok(())
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) | Value::Number(_) => 1,
            Value::String(_) => 2,
            _ => 3,
        }
    }
    fn number(v: &Value) -> f64 {
        match v {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => n.as_f64().unwrap_or_default(),
            _ => 0.0,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if rank(a) == 1 => number(a).total_cmp(&number(b)),
        _ => a.to_string().cmp(&b.to_string()),
    })
}
