//! Change notification bus.
//!
//! Every mutation publishes one `ChangeBatch` carrying a deployment-wide,
//! strictly increasing sequence number. Delivery is at-least-once: a lagging
//! subscriber is refilled from the replay window, so it may see a batch twice.
//! `Subscription::next` drops anything at or below the last sequence it
//! returned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::emergency::EmergencyState;
use crate::model::{AccessGrant, AccessPointId, DoorState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    GrantChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<AccessGrant>,
        after: AccessGrant,
    },
    /// Published on every phase change so door dispatchers never poll.
    EmergencyTransition {
        from: EmergencyState,
        to: EmergencyState,
    },
    DoorStateChanged {
        access_point_id: AccessPointId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<DoorState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed_at: Option<DateTime<Utc>>,
        stale: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub deltas: Vec<Delta>,
}

struct BusState {
    next_sequence: u64,
    replay: VecDeque<ChangeBatch>,
}

struct BusShared {
    tx: broadcast::Sender<ChangeBatch>,
    state: Mutex<BusState>,
    replay_window: usize,
}

impl BusShared {
    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replay_after(&self, sequence: u64) -> VecDeque<ChangeBatch> {
        self.state()
            .replay
            .iter()
            .filter(|b| b.sequence > sequence)
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    shared: Arc<BusShared>,
}

impl ChangeBus {
    pub fn new(capacity: usize, replay_window: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(BusShared {
                tx,
                state: Mutex::new(BusState {
                    next_sequence: 0,
                    replay: VecDeque::with_capacity(replay_window),
                }),
                replay_window,
            }),
        }
    }

    /// Publish one ordered batch. Returns its sequence number.
    pub fn publish(&self, deltas: Vec<Delta>, correlation_id: Option<Uuid>) -> u64 {
        let mut state = self.shared.state();
        state.next_sequence += 1;
        let batch = ChangeBatch {
            sequence: state.next_sequence,
            published_at: Utc::now(),
            correlation_id,
            deltas,
        };
        if self.shared.replay_window > 0 {
            if state.replay.len() == self.shared.replay_window {
                state.replay.pop_front();
            }
            state.replay.push_back(batch.clone());
        }
        // Sent under the state lock so receivers observe sequence order.
        let _ = self.shared.tx.send(batch);
        tracing::trace!(sequence = state.next_sequence, "Published change batch");
        state.next_sequence
    }

    /// Sequence of the most recent batch, 0 before the first publish.
    pub fn current_sequence(&self) -> u64 {
        self.shared.state().next_sequence
    }

    /// Live batches published from now on.
    pub fn subscribe(&self) -> Subscription {
        let state = self.shared.state();
        Subscription {
            rx: self.shared.tx.subscribe(),
            backlog: VecDeque::new(),
            last_seen: state.next_sequence,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Buffered batches after `sequence`, then live ones.
    pub fn subscribe_from(&self, sequence: u64) -> Subscription {
        let state = self.shared.state();
        let backlog = state
            .replay
            .iter()
            .filter(|b| b.sequence > sequence)
            .cloned()
            .collect();
        Subscription {
            rx: self.shared.tx.subscribe(),
            backlog,
            last_seen: sequence,
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<ChangeBatch>,
    backlog: VecDeque<ChangeBatch>,
    last_seen: u64,
    shared: Arc<BusShared>,
}

impl Subscription {
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Next unseen batch in sequence order; `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        loop {
            if let Some(batch) = self.backlog.pop_front() {
                if let Some(batch) = self.accept(batch) {
                    return Some(batch);
                }
                continue;
            }
            match self.rx.recv().await {
                Ok(batch) => {
                    if let Some(batch) = self.accept(batch) {
                        return Some(batch);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.backlog = self.shared.replay_after(self.last_seen);
                    let resumes_at = self.backlog.front().map(|b| b.sequence);
                    if resumes_at.is_some_and(|s| s > self.last_seen + 1) {
                        tracing::warn!(
                            skipped,
                            last_seen = self.last_seen,
                            "Subscriber fell behind the replay window; batches lost"
                        );
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, batch: ChangeBatch) -> Option<ChangeBatch> {
        if batch.sequence <= self.last_seen {
            return None;
        }
        self.last_seen = batch.sequence;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn door_delta(id: &str) -> Delta {
        Delta::DoorStateChanged {
            access_point_id: AccessPointId::from(id),
            state: Some(DoorState::Locked),
            observed_at: None,
            stale: false,
        }
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_ordered() {
        let bus = ChangeBus::new(16, 16);
        let mut sub = bus.subscribe();
        let a = bus.publish(vec![door_delta("d1")], None);
        let b = bus.publish(vec![door_delta("d2"), door_delta("d3")], None);
        assert!(b > a);

        let first = sub.next().await.expect("first");
        let second = sub.next().await.expect("second");
        assert_eq!(first.sequence, a);
        assert_eq!(second.sequence, b);
        assert_eq!(second.deltas.len(), 2);
    }

    #[tokio::test]
    async fn subscribe_from_replays_and_deduplicates() {
        let bus = ChangeBus::new(16, 16);
        let first = bus.publish(vec![door_delta("d1")], None);
        bus.publish(vec![door_delta("d2")], None);

        let mut sub = bus.subscribe_from(first);
        // Duplicate of an already-replayed batch must be skipped.
        sub.backlog.push_back(sub.backlog[0].clone());
        let third = bus.publish(vec![door_delta("d3")], None);

        let seen: Vec<u64> = vec![
            sub.next().await.expect("replayed").sequence,
            sub.next().await.expect("live").sequence,
        ];
        assert_eq!(seen, vec![first + 1, third]);
        assert_eq!(sub.last_seen(), third);
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_from_replay_window() {
        let bus = ChangeBus::new(2, 32);
        let mut sub = bus.subscribe();
        for i in 0..6 {
            bus.publish(vec![door_delta(&format!("d{i}"))], None);
        }
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(sub.next().await.expect("batch").sequence);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }
}
