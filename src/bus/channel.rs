use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::election::{ElectionConfig, ElectionState, LeaderElector};
use super::event_bus::BusError;
use super::event_types::{Event, EventCategory};
use super::hub::{Hub, Poster, Wire};

pub(crate) type Deliver = Arc<dyn Fn(&Event) + Send + Sync>;

/// One category's pipe plus its election.
///
/// A background task multiplexes heartbeat ticks and hub traffic; events from
/// other contexts go to `deliver`, leader-only events only while this
/// participant leads.
pub(crate) struct Channel {
    category: EventCategory,
    poster: Poster,
    elector: Arc<Mutex<LeaderElector>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Channel {
    /// Must be called inside a tokio runtime.
    pub(crate) fn open(
        hub: &Hub,
        category: EventCategory,
        config: ElectionConfig,
        deliver: Deliver,
    ) -> Self {
        let mut port = hub.port(category.as_str());
        let poster = port.poster();
        let elector = Arc::new(Mutex::new(LeaderElector::new(category.as_str(), config)));
        let cancel = CancellationToken::new();

        let task_elector = elector.clone();
        let task_poster = poster.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let heartbeat = {
                            let mut elector = lock(&task_elector);
                            elector.tick(Instant::now());
                            elector.heartbeat()
                        };
                        if let Some(message) = heartbeat {
                            task_poster.post(Wire::Election(message));
                        }
                    }
                    received = port.recv() => match received {
                        None => break,
                        Some(Wire::Election(message)) => {
                            lock(&task_elector).observe(message, Instant::now());
                        }
                        Some(Wire::Event(event)) => {
                            if event.leader_only && !lock(&task_elector).is_leader() {
                                tracing::debug!(channel = %category, "leader-only event skipped by follower");
                            } else {
                                deliver(&event);
                            }
                        }
                    },
                }
            }
            tracing::debug!(channel = %category, "channel loop stopped");
        });

        Self {
            category,
            poster,
            elector,
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn broadcast(&self, event: Event) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ChannelClosed(self.category.as_str().to_string()));
        }
        self.poster.post(Wire::Event(event));
        Ok(())
    }

    pub(crate) fn is_leader(&self) -> bool {
        lock(&self.elector).is_leader()
    }

    pub(crate) fn state(&self) -> ElectionState {
        lock(&self.elector).state()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resign, stop the loop and release the port. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let resignation = lock(&self.elector).resign();
        if let Some(message) = resignation {
            self.poster.post(Wire::Election(message));
        }
        self.cancel.cancel();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(elector: &Mutex<LeaderElector>) -> MutexGuard<'_, LeaderElector> {
    elector.lock().unwrap_or_else(PoisonError::into_inner)
}
