//! Session notifications.
//!
//! The store never talks to clients. Handlers publish a [`SessionEvent`] through an
//! [`EventPublisher`] once their transaction has committed; delivery is fire-and-forget and a
//! failed or dropped notification never undoes the state change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::model::{Participant, RevealedVote};

/// Buffered events per session before slow subscribers start missing some.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ParticipantJoined {
        participant: Participant,
    },
    VotingStarted {
        round: i32,
    },
    VoteSubmitted {
        participant_id: i32,
        round: i32,
    },
    CardsRevealed {
        round: i32,
        votes: Vec<RevealedVote>,
    },
    NextRoundStarted {
        round: i32,
    },
    ParticipantLeft {
        participant_id: i32,
        participant_name: String,
        remaining_participants: Vec<Participant>,
    },
    ParticipantRemoved {
        participant_id: i32,
        participant_name: String,
        remaining_participants: Vec<Participant>,
        removed_by_host: bool,
    },
    SessionEnded {
        reason: String,
    },
}

impl SessionEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::VotingStarted { .. } => "voting_started",
            Self::VoteSubmitted { .. } => "vote_submitted",
            Self::CardsRevealed { .. } => "cards_revealed",
            Self::NextRoundStarted { .. } => "next_round_started",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::ParticipantRemoved { .. } => "participant_removed",
            Self::SessionEnded { .. } => "session_ended",
        }
    }
}

/// Publishes events to everybody watching a session, addressed by session code.
pub trait EventPublisher: Send + Sync {
    /// Must not block. Delivery failures are swallowed.
    fn publish(&self, code: &str, event: SessionEvent);

    /// Starts receiving a session's events. `None` when this publisher has no live transport.
    fn subscribe(&self, _code: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        None
    }

    /// Drops the session's channel after its final event.
    fn close(&self, _code: &str) {}
}

/// In-process fan-out: one broadcast channel per session code, created on first subscribe.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions that currently have a channel.
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<SessionEvent>>> {
        // A panic while holding the lock can't leave the map half-written.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventPublisher for BroadcastHub {
    fn publish(&self, code: &str, event: SessionEvent) {
        let mut channels = self.lock();
        let Some(tx) = channels.get(code) else {
            tracing::debug!(code, event = event.name(), "no subscribers, dropping event");
            return;
        };
        let name = event.name();
        match tx.send(event) {
            Ok(receivers) => tracing::debug!(code, event = name, receivers, "event published"),
            Err(_) => {
                // Every subscriber has gone away.
                channels.remove(code);
                tracing::debug!(code, event = name, "all subscribers gone, channel dropped");
            }
        }
    }

    fn subscribe(&self, code: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        let mut channels = self.lock();
        // Sessions whose watchers all disconnected may never publish again.
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let tx = channels
            .entry(code.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Some(tx.subscribe())
    }

    fn close(&self, code: &str) {
        if self.lock().remove(code).is_some() {
            tracing::debug!(code, "event channel closed");
        }
    }
}
