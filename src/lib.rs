//! Cross-context synchronization library.
//!
//! Several execution contexts of one origin (tabs, windows, workers) share an
//! on-device store and stay in sync over a broadcast bus. It handles:
//! - Event distribution across contexts on five named channels
//! - Leader election per channel for "do once" work
//! - A schema-declared table store that announces its changes
//! - A three-tier key/value cache that announces invalidations
//! - A JSON REST client that reports its activity to the UI channel
//!
//! # Architecture
//!
//! - `bus`: hub, channels, leader election and the `EventBus`
//! - `db`: SQLite store, schema migrations and typed `Table` handles
//! - `cache`: memory, session and persistent tiers
//! - `api`: REST client
//! - `config`: environment-driven settings
//! - `runtime`: `Origin` and `Context` wiring

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod runtime;

pub use api::{ApiError, RequestOptions, RestApi};
pub use bus::{
    BusConfig, BusError, DbEventData, DbEventType, DbSelfDelivery, Event, EventBus,
    EventCategory, EventHandler, Hub,
};
pub use cache::{Cache, SessionStorage, Tier};
pub use config::{Config, ConfigError};
pub use db::{Database, DatabaseSchema, DbError, InsertOptions, Key, Keys, Lookup, Query, Table};
pub use runtime::{Context, Origin};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tabsync=debug,info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
