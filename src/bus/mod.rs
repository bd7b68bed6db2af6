//! Cross-context event system.
//!
//! Every context of an origin joins five named channels (one per
//! [`EventCategory`]) on a shared [`Hub`]. Each channel runs its own leader
//! election so that "do once" work can be left to a single context.
//!
//! # Architecture
//!
//! Events flow from a producer → `EventBus` → `Channel` → `Hub` → every other
//! context's `Channel` → its `EventBus` handlers:
//! - `Hub`: origin-wide named broadcast pipes
//! - `LeaderElector`: heartbeat election state machine per channel
//! - `Channel`: receive loop, leader-only filtering, resignation on close
//! - `EventBus`: per-category handler registries and self-delivery

mod channel;
mod election;
mod event_bus;
mod event_types;
mod hub;

#[cfg(test)]
mod tests;

pub use election::{
    ElectionConfig, ElectionMessage, ElectionState, LeaderElector, Rank,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LIVENESS_TIMEOUT,
};
pub use event_bus::{BusConfig, BusError, DbSelfDelivery, EventBus, EventHandler};
pub use event_types::{DbEventData, DbEventType, Event, EventCategory};
pub use hub::{Envelope, Hub, Port, Poster, Wire, DEFAULT_HUB_CAPACITY};
