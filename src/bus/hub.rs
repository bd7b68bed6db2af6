//! Origin-wide broadcast transport.
//!
//! A [`Hub`] is a set of named pipes shared by every context of one origin.
//! Each channel opens a [`Port`] on the pipe named after its category. Posts
//! reach every other port on the same pipe; a port never sees its own posts.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::election::ElectionMessage;
use super::event_types::Event;

pub const DEFAULT_HUB_CAPACITY: usize = 1024;

/// What travels on a pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Wire {
    Event(Event),
    Election(ElectionMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Port that posted the message.
    pub sender: Uuid,
    pub message: Wire,
}

#[derive(Clone)]
pub struct Hub {
    pipes: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            pipes: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Join the pipe `name`, creating it on first use.
    pub fn port(&self, name: &str) -> Port {
        let tx = self
            .pipes
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let rx = tx.subscribe();
        Port {
            id: Uuid::new_v4(),
            name: name.to_string(),
            tx,
            rx,
        }
    }

    /// Number of open ports on `name`.
    pub fn port_count(&self, name: &str) -> usize {
        self.pipes
            .get(name)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// One participant's end of a pipe.
pub struct Port {
    id: Uuid,
    name: String,
    tx: broadcast::Sender<Envelope>,
    rx: broadcast::Receiver<Envelope>,
}

impl Port {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle that can post on behalf of this port from elsewhere.
    pub fn poster(&self) -> Poster {
        Poster {
            id: self.id,
            tx: self.tx.clone(),
        }
    }

    /// Next message from another port. `None` once the pipe is gone.
    pub async fn recv(&mut self) -> Option<Wire> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(pipe = %self.name, skipped, "port lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Clone)]
pub struct Poster {
    id: Uuid,
    tx: broadcast::Sender<Envelope>,
}

impl Poster {
    pub fn post(&self, message: Wire) {
        let envelope = Envelope {
            sender: self.id,
            message,
        };
        // The poster's own receiver keeps the pipe alive, so this only fails
        // once every port is gone.
        if self.tx.send(envelope).is_err() {
            tracing::debug!("post on a pipe with no ports");
        }
    }
}
