//! Three-tier key-value cache.
//!
//! - `Memory`: private to one `Cache` (one context).
//! - `Session`: shared by every context holding the same [`SessionStorage`].
//! - `Persistent`: stored next to the tables; writes broadcast
//!   `CACHE_INVALIDATION` so other contexts drop what they derived from it.


use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::DbEventData;
use crate::db::{queries, Database, DbError, Key};

pub const DEFAULT_NAMESPACE: &str = "tabsync-cache";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Session,
    #[default]
    Persistent,
}

/// Session-scoped storage shared by the contexts of one origin session.
#[derive(Clone, Default)]
pub struct SessionStorage {
    scopes: Arc<DashMap<String, BTreeMap<String, Value>>>,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.scopes.get(namespace)?.get(key).cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) {
        self.scopes
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn remove(&self, namespace: &str, key: &str) -> bool {
        self.scopes
            .get_mut(namespace)
            .map(|mut scope| scope.remove(key).is_some())
            .unwrap_or(false)
    }

    fn clear(&self, namespace: &str) -> Vec<String> {
        self.scopes
            .remove(namespace)
            .map(|(_, scope)| scope.into_keys().collect())
            .unwrap_or_default()
    }

    fn keys(&self, namespace: &str) -> Vec<String> {
        self.scopes
            .get(namespace)
            .map(|scope| scope.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct Cache {
    namespace: String,
    db: Arc<Database>,
    memory: Mutex<HashMap<String, Value>>,
    session: SessionStorage,
}

impl Cache {
    pub fn new(namespace: impl Into<String>, db: Arc<Database>, session: SessionStorage) -> Self {
        Self {
            namespace: namespace.into(),
            db,
            memory: Mutex::new(HashMap::new()),
            session,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<V: DeserializeOwned>(&self, tier: Tier, key: &str) -> Result<Option<V>, DbError> {
        let raw = match tier {
            Tier::Memory => self.memory().get(key).cloned(),
            Tier::Session => self.session.get(&self.namespace, key),
            Tier::Persistent => queries::get_cache_entry(&self.db, &self.namespace, key)?
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
        };
        Ok(raw.map(serde_json::from_value).transpose()?)
    }

    /// Insert or replace `key`.
    pub fn insert<V: Serialize + ?Sized>(
        &self,
        tier: Tier,
        key: &str,
        value: &V,
    ) -> Result<(), DbError> {
        let value = serde_json::to_value(value)?;
        match tier {
            Tier::Memory => {
                self.memory().insert(key.to_string(), value);
            }
            Tier::Session => self.session.set(&self.namespace, key, value),
            Tier::Persistent => {
                queries::upsert_cache_entry(&self.db, &self.namespace, key, &value.to_string())?;
                self.invalidate(vec![key.to_string()])?;
            }
        }
        Ok(())
    }

    /// Returns whether the key existed.
    pub fn remove(&self, tier: Tier, key: &str) -> Result<bool, DbError> {
        Ok(!self.remove_many(tier, &[key])?.is_empty())
    }

    /// Returns the keys that existed. On the persistent tier every call
    /// broadcasts the requested keys, whether or not they were present.
    pub fn remove_many<S: AsRef<str>>(&self, tier: Tier, keys: &[S]) -> Result<Vec<String>, DbError> {
        let keys: Vec<&str> = keys.iter().map(|k| k.as_ref()).collect();
        let removed = match tier {
            Tier::Memory => {
                let mut memory = self.memory();
                keys.iter()
                    .filter(|k| memory.remove(**k).is_some())
                    .map(|k| k.to_string())
                    .collect()
            }
            Tier::Session => keys
                .iter()
                .filter(|k| self.session.remove(&self.namespace, k))
                .map(|k| k.to_string())
                .collect(),
            Tier::Persistent => {
                let removed = queries::delete_cache_entries(&self.db, &self.namespace, &keys)?;
                self.invalidate(keys.iter().map(|k| k.to_string()).collect())?;
                removed
            }
        };
        Ok(removed)
    }

    /// Empty the tier and return the keys it held. The persistent tier always
    /// broadcasts, even when it was already empty.
    pub fn clear(&self, tier: Tier) -> Result<Vec<String>, DbError> {
        let cleared = match tier {
            Tier::Memory => {
                let mut keys: Vec<String> = self.memory().drain().map(|(k, _)| k).collect();
                keys.sort();
                keys
            }
            Tier::Session => self.session.clear(&self.namespace),
            Tier::Persistent => {
                let keys = queries::clear_cache_entries(&self.db, &self.namespace)?;
                self.invalidate(keys.clone())?;
                keys
            }
        };
        Ok(cleared)
    }

    pub fn count(&self, tier: Tier) -> Result<u64, DbError> {
        Ok(match tier {
            Tier::Memory => self.memory().len() as u64,
            Tier::Session => self.session.keys(&self.namespace).len() as u64,
            Tier::Persistent => queries::count_cache_entries(&self.db, &self.namespace)?,
        })
    }

    /// Keys of the tier in ascending order.
    pub fn keys(&self, tier: Tier) -> Result<Vec<String>, DbError> {
        Ok(match tier {
            Tier::Memory => {
                let mut keys: Vec<String> = self.memory().keys().cloned().collect();
                keys.sort();
                keys
            }
            Tier::Session => self.session.keys(&self.namespace),
            Tier::Persistent => queries::list_cache_keys(&self.db, &self.namespace)?,
        })
    }

    fn invalidate(&self, keys: Vec<String>) -> Result<(), DbError> {
        tracing::debug!(namespace = %self.namespace, keys = keys.len(), "cache invalidation");
        self.db.emit(DbEventData::cache_invalidation(
            keys.into_iter().map(Key::Text).collect(),
        ))
    }
}
