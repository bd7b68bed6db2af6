use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::channel::{Channel, Deliver};
use super::election::{ElectionConfig, ElectionState};
use super::event_types::{Event, EventCategory};
use super::hub::Hub;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("channel `{0}` is closed")]
    ChannelClosed(String),
}

/// Receives events of the categories it is registered for.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Whether DB-category broadcasts reach the broadcaster's own handlers.
///
/// `Always` delivers DB events locally even when `no_self` is set, so a
/// context sees its own table and cache changes. `HonorNoSelf` treats DB like
/// every other category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbSelfDelivery {
    #[default]
    Always,
    HonorNoSelf,
}

impl std::str::FromStr for DbSelfDelivery {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "honor_no_self" | "honor-no-self" => Ok(Self::HonorNoSelf),
            other => Err(format!("unknown db self-delivery policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusConfig {
    pub election: ElectionConfig,
    pub db_self_delivery: DbSelfDelivery,
}

impl BusConfig {
    pub fn with_timing(mut self, heartbeat_interval: Duration, liveness_timeout: Duration) -> Self {
        self.election = ElectionConfig {
            heartbeat_interval,
            liveness_timeout,
        };
        self
    }

    pub fn with_db_self_delivery(mut self, policy: DbSelfDelivery) -> Self {
        self.db_self_delivery = policy;
        self
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Ordered handlers of one category. Registration order is delivery order.
struct HandlerRegistry {
    category: EventCategory,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    fn new(category: EventCategory) -> Self {
        Self {
            category,
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Removes the first registration of `handler`; absent handlers are ignored.
    fn remove(&self, handler: &Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = handlers.iter().position(|h| same_handler(h, handler)) {
            handlers.remove(idx);
        }
    }

    fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invoke every handler. A panicking handler is logged and skipped.
    fn dispatch(&self, event: &Event) {
        // Snapshot so handlers may (un)register while being called.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                let message = panic
                    .downcast_ref::<&'static str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(category = %self.category, "event handler panicked: {message}");
            }
        }
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Lane {
    channel: Channel,
    handlers: Arc<HandlerRegistry>,
}

/// Per-context hub of the five category channels.
///
/// Broadcasting posts the event to every other context on the origin and,
/// unless the event says `no_self`, runs this context's own handlers for the
/// category right away.
pub struct EventBus {
    lanes: Vec<Lane>,
    config: BusConfig,
}

impl EventBus {
    /// Join all five channels on `hub`. Must be called inside a tokio runtime.
    pub fn new(hub: &Hub, config: BusConfig) -> Self {
        let lanes = EventCategory::ALL
            .iter()
            .map(|&category| {
                let handlers = Arc::new(HandlerRegistry::new(category));
                let remote = handlers.clone();
                let deliver: Deliver = Arc::new(move |event: &Event| {
                    tracing::debug!(%category, handlers = remote.len(), "event received");
                    remote.dispatch(event);
                });
                Lane {
                    channel: Channel::open(hub, category, config.election, deliver),
                    handlers,
                }
            })
            .collect();
        Self { lanes, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn lane(&self, category: EventCategory) -> &Lane {
        &self.lanes[category.index()]
    }

    pub fn add_handler(&self, category: EventCategory, handler: Arc<dyn EventHandler>) {
        self.lane(category).handlers.add(handler);
    }

    pub fn remove_handler(&self, category: EventCategory, handler: &Arc<dyn EventHandler>) {
        self.lane(category).handlers.remove(handler);
    }

    pub fn handler_count(&self, category: EventCategory) -> usize {
        self.lane(category).handlers.len()
    }

    /// Post `event` on the channel named by `event.kind`, then self-deliver.
    pub fn broadcast(&self, event: Event) -> Result<(), BusError> {
        let category = event.kind;
        let lane = self.lane(category);
        lane.channel.broadcast(event.clone())?;

        let self_deliver = match category {
            EventCategory::Db if self.config.db_self_delivery == DbSelfDelivery::Always => true,
            _ => !event.no_self,
        };
        tracing::debug!(%category, no_self = event.no_self, self_deliver, "event broadcast");
        if self_deliver {
            lane.handlers.dispatch(&event);
        }
        Ok(())
    }

    pub fn is_leader(&self, category: EventCategory) -> bool {
        self.lane(category).channel.is_leader()
    }

    pub fn election_state(&self, category: EventCategory) -> ElectionState {
        self.lane(category).channel.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.iter().all(|lane| lane.channel.is_closed())
    }

    /// Resign from every election and stop all channels. Idempotent.
    pub fn close(&self) {
        for lane in &self.lanes {
            lane.channel.close();
        }
    }
}

macro_rules! category_methods {
    ($($category:ident => $add:ident, $remove:ident, $broadcast:ident, $leader:ident;)*) => {
        impl EventBus {
            $(
                pub fn $add(&self, handler: Arc<dyn EventHandler>) {
                    self.add_handler(EventCategory::$category, handler);
                }

                pub fn $remove(&self, handler: &Arc<dyn EventHandler>) {
                    self.remove_handler(EventCategory::$category, handler);
                }

                pub fn $broadcast(&self, mut event: Event) -> Result<(), BusError> {
                    event.kind = EventCategory::$category;
                    self.broadcast(event)
                }

                pub fn $leader(&self) -> bool {
                    self.is_leader(EventCategory::$category)
                }
            )*
        }
    };
}

category_methods! {
    Api => add_api_event_handler, remove_api_event_handler, broadcast_api_event, is_api_event_leader;
    Db => add_db_event_handler, remove_db_event_handler, broadcast_db_event, is_db_event_leader;
    Ipc => add_ipc_event_handler, remove_ipc_event_handler, broadcast_ipc_event, is_ipc_event_leader;
    Tracking => add_tracking_event_handler, remove_tracking_event_handler, broadcast_tracking_event, is_tracking_event_leader;
    Ui => add_ui_event_handler, remove_ui_event_handler, broadcast_ui_event, is_ui_event_leader;
}
