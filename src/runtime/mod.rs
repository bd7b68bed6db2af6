//! Origin and context wiring.
//!
//! An [`Origin`] is the environment shared by every context of one
//! application origin: the broadcast hub, the configuration, the declared
//! schema and the session storage scope. Each [`Context`] (one tab, window or
//! worker) gets its own `EventBus`, database handle and cache built from it.


use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::api::RestApi;
use crate::bus::{EventBus, Hub};
use crate::cache::{Cache, SessionStorage};
use crate::config::Config;
use crate::db::{Database, DatabaseSchema, DbError, Table};
use crate::AppError;

#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

struct OriginInner {
    hub: Hub,
    config: Config,
    schema: DatabaseSchema,
    session: SessionStorage,
}

impl Origin {
    pub fn new(config: Config, schema: DatabaseSchema) -> Result<Self, AppError> {
        config.validate()?;
        schema.validate()?;
        Ok(Self {
            inner: Arc::new(OriginInner {
                hub: Hub::new(config.channel_capacity),
                config,
                schema,
                session: SessionStorage::new(),
            }),
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.inner.schema
    }

    pub fn session(&self) -> &SessionStorage {
        &self.inner.session
    }

    /// Start a new context. Must be called inside a tokio runtime.
    pub fn open_context(&self) -> Result<Context, AppError> {
        let config = &self.inner.config;
        let bus = Arc::new(EventBus::new(&self.inner.hub, config.bus_config()));
        let db = Arc::new(Database::new(
            self.inner.schema.clone(),
            &config.data_dir,
            bus.clone(),
        )?);
        let cache = Arc::new(Cache::new(
            config.cache_namespace.clone(),
            db.clone(),
            self.inner.session.clone(),
        ));
        let context = Context {
            id: Uuid::new_v4(),
            origin: self.clone(),
            bus,
            db,
            cache,
        };
        tracing::info!(context = %context.id, db = %self.inner.schema.name, "context opened");
        Ok(context)
    }
}

/// One execution context. Dropping it resigns from every election.
pub struct Context {
    id: Uuid,
    origin: Origin,
    bus: Arc<EventBus>,
    db: Arc<Database>,
    cache: Arc<Cache>,
}

impl Context {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn table<T>(&self, name: &str) -> Result<Table<T>, DbError>
    where
        T: Serialize + DeserializeOwned,
    {
        Table::new(name, self.db.clone())
    }

    /// REST client for the configured API, with activity events and
    /// bearer authorization from this context's cache.
    pub fn rest_api(&self) -> Result<RestApi, AppError> {
        let config = self.origin.config();
        let Some(base_url) = config.api_base_url.as_deref() else {
            return Err(AppError::Other("no API base URL configured".into()));
        };
        let api = RestApi::new(
            base_url,
            config.api_key.as_deref(),
            self.bus.clone(),
            Some(self.cache.clone()),
        )?;
        Ok(api.with_activity_events())
    }

    pub fn close(&self) {
        if !self.bus.is_closed() {
            tracing::info!(context = %self.id, "context closed");
        }
        self.bus.close();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}
