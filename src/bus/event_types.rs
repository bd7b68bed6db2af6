//! Event categories, the event envelope and the DB event payload.
//!
//! Single source of truth for the five channel names and for the shape of
//! the `data` map carried by DB-category events.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::Key;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Network requests.
    #[serde(rename = "api_event")]
    Api,
    /// Table and cache change notifications.
    #[serde(rename = "db_event")]
    Db,
    /// Inter-context (tab/window) communication.
    #[serde(rename = "ipc_event")]
    Ipc,
    /// User activity tracking.
    #[serde(rename = "tracking_event")]
    Tracking,
    /// UI-only updates.
    #[serde(rename = "ui_event")]
    Ui,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Api,
        EventCategory::Db,
        EventCategory::Ipc,
        EventCategory::Tracking,
        EventCategory::Ui,
    ];

    /// Channel name used on the hub for this category.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api_event",
            Self::Db => "db_event",
            Self::Ipc => "ipc_event",
            Self::Tracking => "tracking_event",
            Self::Ui => "ui_event",
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::Api => 0,
            Self::Db => 1,
            Self::Ipc => 2,
            Self::Tracking => 3,
            Self::Ui => 4,
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api_event" | "api" => Ok(Self::Api),
            "db_event" | "db" => Ok(Self::Db),
            "ipc_event" | "ipc" => Ok(Self::Ipc),
            "tracking_event" | "tracking" => Ok(Self::Tracking),
            "ui_event" | "ui" => Ok(Self::Ui),
            _ => Err(format!("unknown event category: {value}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The unit carried on every channel.
///
/// `kind` is redundant with the channel the event travels on; the bus
/// overwrites it when an event is broadcast through a category method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventCategory,
    /// Suppress delivery to the broadcasting context's own handlers.
    #[serde(default, rename = "noSelf")]
    pub no_self: bool,
    /// Only the elected leader of the receiving context reacts.
    #[serde(default, rename = "leaderOnly")]
    pub leader_only: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventCategory) -> Self {
        Self {
            kind,
            no_self: false,
            leader_only: false,
            data: Map::new(),
        }
    }

    #[inline]
    pub fn no_self(mut self) -> Self {
        self.no_self = true;
        self
    }

    #[inline]
    pub fn leader_only(mut self) -> Self {
        self.leader_only = true;
        self
    }

    #[inline]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    #[inline]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Decode the payload of a DB-category event.
    pub fn db_data(&self) -> Option<DbEventData> {
        if self.kind != EventCategory::Db {
            return None;
        }
        serde_json::from_value(Value::Object(self.data.clone())).ok()
    }
}

// ---------------------------------------------------------------------------
// DB event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DbEventType {
    Insert,
    Update,
    Remove,
    Clean,
    TableUpgrade,
    CacheInvalidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbEventData {
    #[serde(rename = "type")]
    pub kind: DbEventType,
    #[serde(default)]
    pub keys: Vec<Key>,
    /// Present for table events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl DbEventData {
    pub fn for_table(kind: DbEventType, db: &str, table: &str, keys: Vec<Key>) -> Self {
        Self {
            kind,
            keys,
            db: Some(db.to_string()),
            table: Some(table.to_string()),
        }
    }

    pub fn cache_invalidation(keys: Vec<Key>) -> Self {
        Self {
            kind: DbEventType::CacheInvalidation,
            keys,
            db: None,
            table: None,
        }
    }

    /// Wrap the payload into a DB-category event.
    pub fn into_event(self) -> Event {
        let data = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            // DbEventData always serializes to an object.
            _ => Map::new(),
        };
        Event::new(EventCategory::Db).with_data(data)
    }
}

impl From<DbEventData> for Event {
    fn from(value: DbEventData) -> Self {
        value.into_event()
    }
}
