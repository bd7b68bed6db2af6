//! Heartbeat-based leader election among the ports of one pipe.
//!
//! Every participant announces itself with a [`Rank`] on each heartbeat and
//! tracks the ranks of the peers it hears from. The lowest live rank leads.
//! The elector is a plain state machine; the channel task feeds it ticks and
//! incoming messages and posts what it returns.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionConfig {
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are considered gone. Also the length
    /// of the initial candidacy.
    pub liveness_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

/// Election priority; lower wins. Older participants outrank newer ones,
/// the token breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank {
    pub joined_at_micros: i64,
    pub token: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElectionMessage {
    Heartbeat { token: Uuid, rank: Rank },
    Resign { token: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Candidate,
    Leader,
    Follower,
    Dead,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Follower => "follower",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

struct Peer {
    rank: Rank,
    last_seen: Instant,
}

pub struct LeaderElector {
    channel: String,
    rank: Rank,
    state: ElectionState,
    started: Instant,
    peers: HashMap<Uuid, Peer>,
    config: ElectionConfig,
}

impl LeaderElector {
    pub fn new(channel: &str, config: ElectionConfig) -> Self {
        Self::with_rank(
            channel,
            config,
            Rank {
                joined_at_micros: Utc::now().timestamp_micros(),
                token: Uuid::new_v4(),
            },
            Instant::now(),
        )
    }

    pub(crate) fn with_rank(
        channel: &str,
        config: ElectionConfig,
        rank: Rank,
        started: Instant,
    ) -> Self {
        tracing::debug!(channel, token = %rank.token, "joined election as candidate");
        Self {
            channel: channel.to_string(),
            rank,
            state: ElectionState::Candidate,
            started,
            peers: HashMap::new(),
            config,
        }
    }

    pub fn token(&self) -> Uuid {
        self.rank.token
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The announcement to post on every heartbeat tick.
    pub fn heartbeat(&self) -> Option<ElectionMessage> {
        (self.state != ElectionState::Dead).then_some(ElectionMessage::Heartbeat {
            token: self.rank.token,
            rank: self.rank,
        })
    }

    /// Expire silent peers and re-evaluate.
    pub fn tick(&mut self, now: Instant) {
        if self.state == ElectionState::Dead {
            return;
        }
        let timeout = self.config.liveness_timeout;
        let channel = &self.channel;
        self.peers.retain(|token, peer| {
            let alive = now.saturating_duration_since(peer.last_seen) <= timeout;
            if !alive {
                tracing::debug!(channel, peer = %token, "peer expired");
            }
            alive
        });
        self.evaluate(now);
    }

    pub fn observe(&mut self, message: ElectionMessage, now: Instant) {
        if self.state == ElectionState::Dead {
            return;
        }
        match message {
            ElectionMessage::Heartbeat { token, rank } => {
                if token == self.rank.token {
                    return;
                }
                self.peers.insert(
                    token,
                    Peer {
                        rank,
                        last_seen: now,
                    },
                );
            }
            ElectionMessage::Resign { token } => {
                if self.peers.remove(&token).is_some() {
                    tracing::debug!(channel = %self.channel, peer = %token, "peer resigned");
                }
            }
        }
        self.evaluate(now);
    }

    /// Leave the election. Returns the resignation to post, once.
    pub fn resign(&mut self) -> Option<ElectionMessage> {
        if self.state == ElectionState::Dead {
            return None;
        }
        self.transition(ElectionState::Dead);
        self.peers.clear();
        Some(ElectionMessage::Resign {
            token: self.rank.token,
        })
    }

    fn evaluate(&mut self, now: Instant) {
        if self.state == ElectionState::Candidate
            && now.saturating_duration_since(self.started) < self.config.liveness_timeout
        {
            return;
        }
        let lowest = self.peers.values().all(|peer| self.rank < peer.rank);
        let next = if lowest {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        };
        self.transition(next);
    }

    fn transition(&mut self, next: ElectionState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            channel = %self.channel,
            token = %self.rank.token,
            peers = self.peers.len(),
            "election: {} -> {next}",
            self.state
        );
        self.state = next;
    }
}
