//! Door controller channel, door state registry and command dispatch.
//!
//! The hardware controller is an opaque command sink plus heartbeat source.
//! Door state is last-heartbeat-wins: an observation older than the one
//! already recorded is dropped. Commands to one door are delivered in order;
//! each attempt is bounded by a timeout and retried with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::bus::{ChangeBus, Delta};
use crate::errors::WardenError;
use crate::model::{AccessPointId, DoorCommand, DoorState};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DoorCommandError {
    #[error("controller rejected command: {0}")]
    Rejected(String),

    #[error("controller unreachable: {0}")]
    Unreachable(String),
}

/// Outbound side of the door controller channel.
#[async_trait]
pub trait DoorController: Send + Sync {
    /// Resolves once the controller acknowledges the command.
    async fn send_command(
        &self,
        access_point_id: &AccessPointId,
        command: DoorCommand,
    ) -> Result<(), DoorCommandError>;
}

/// Controller that acknowledges every command after logging it. Used when
/// the deployment has no hardware bridge attached.
#[derive(Debug, Default)]
pub struct LoggingDoorController;

#[async_trait]
impl DoorController for LoggingDoorController {
    async fn send_command(
        &self,
        access_point_id: &AccessPointId,
        command: DoorCommand,
    ) -> Result<(), DoorCommandError> {
        tracing::info!(access_point = %access_point_id, %command, "Door command acknowledged");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorRecord {
    pub access_point_id: AccessPointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DoorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    /// No confirmation within the window; last known state is unreliable.
    pub stale: bool,
}

impl DoorRecord {
    /// A door no heartbeat has been seen for.
    pub fn unknown(access_point_id: AccessPointId) -> Self {
        Self {
            access_point_id,
            state: None,
            observed_at: None,
            stale: true,
        }
    }

    fn delta(&self) -> Delta {
        Delta::DoorStateChanged {
            access_point_id: self.access_point_id.clone(),
            state: self.state,
            observed_at: self.observed_at,
            stale: self.stale,
        }
    }
}

pub struct DoorRegistry {
    doors: RwLock<HashMap<AccessPointId, DoorRecord>>,
    bus: ChangeBus,
    stale_after: chrono::Duration,
}

impl DoorRegistry {
    pub fn new(bus: ChangeBus, stale_after: Duration) -> Self {
        Self {
            doors: RwLock::new(HashMap::new()),
            bus,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    /// Apply a controller heartbeat. Returns false when it is older than the
    /// observation already held.
    pub fn record_heartbeat(
        &self,
        access_point_id: &AccessPointId,
        state: DoorState,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let changed = {
            let mut doors = self.doors.write().unwrap_or_else(PoisonError::into_inner);
            let record = doors
                .entry(access_point_id.clone())
                .or_insert_with(|| DoorRecord::unknown(access_point_id.clone()));
            if record.observed_at.is_some_and(|seen| observed_at < seen) {
                tracing::debug!(
                    access_point = %access_point_id,
                    %observed_at,
                    "Dropping out-of-order heartbeat"
                );
                return false;
            }
            let changed = record.state != Some(state) || record.stale;
            record.state = Some(state);
            record.observed_at = Some(observed_at);
            record.stale = false;
            changed.then(|| record.delta())
        };
        if let Some(delta) = changed {
            self.bus.publish(vec![delta], None);
        }
        true
    }

    /// A command acknowledgement counts as an observation taken now.
    pub fn record_ack(&self, access_point_id: &AccessPointId, command: DoorCommand) {
        self.record_heartbeat(access_point_id, command.resulting_state(), Utc::now());
    }

    pub fn mark_stale(&self, access_point_id: &AccessPointId) {
        let delta = {
            let mut doors = self.doors.write().unwrap_or_else(PoisonError::into_inner);
            let record = doors
                .entry(access_point_id.clone())
                .or_insert_with(|| DoorRecord::unknown(access_point_id.clone()));
            record.stale = true;
            record.delta()
        };
        self.bus.publish(vec![delta], None);
    }

    pub fn get(&self, access_point_id: &AccessPointId) -> Option<DoorRecord> {
        let doors = self.doors.read().unwrap_or_else(PoisonError::into_inner);
        doors.get(access_point_id).map(|r| self.with_age(r.clone()))
    }

    /// All tracked doors sorted by id.
    pub fn list(&self) -> Vec<DoorRecord> {
        let doors = self.doors.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<DoorRecord> =
            doors.values().map(|r| self.with_age(r.clone())).collect();
        records.sort_by(|a, b| a.access_point_id.cmp(&b.access_point_id));
        records
    }

    fn with_age(&self, mut record: DoorRecord) -> DoorRecord {
        if let Some(seen) = record.observed_at
            && Utc::now().signed_duration_since(seen) > self.stale_after
        {
            record.stale = true;
        }
        record
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Bound on a single attempt's acknowledgement wait.
    pub attempt_timeout: Duration,
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Commands in flight across all doors.
    pub max_in_flight: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(2_000),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2_000),
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Acked { attempts: u32 },
    Failed { attempts: u32, message: String },
    TimedOut { attempts: u32 },
    Cancelled,
}

impl CommandOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked { .. })
    }

    /// Error view of a command the door never confirmed. `None` when it was
    /// acknowledged or cancelled.
    pub fn to_error(
        &self,
        access_point_id: &AccessPointId,
        command: DoorCommand,
        attempt_timeout: Duration,
    ) -> Option<WardenError> {
        match self {
            Self::Acked { .. } | Self::Cancelled => None,
            Self::TimedOut { attempts } => Some(WardenError::CommandTimeout {
                access_point_id: access_point_id.to_string(),
                command: command.to_string(),
                timeout_ms: (attempt_timeout * *attempts).as_millis() as u64,
            }),
            Self::Failed { message, .. } => Some(WardenError::unavailable(format!(
                "{command} to door {access_point_id} failed: {message}"
            ))),
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Timeout,
    Controller(DoorCommandError),
}

pub struct CommandDispatcher {
    controller: Arc<dyn DoorController>,
    registry: Arc<DoorRegistry>,
    policy: CommandPolicy,
    in_flight: Semaphore,
    door_locks: Mutex<HashMap<AccessPointId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandDispatcher {
    pub fn new(
        controller: Arc<dyn DoorController>,
        registry: Arc<DoorRegistry>,
        policy: CommandPolicy,
    ) -> Self {
        let permits = policy.max_in_flight.max(1);
        Self {
            controller,
            registry,
            policy,
            in_flight: Semaphore::new(permits),
            door_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DoorRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    fn door_lock(&self, access_point_id: &AccessPointId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.door_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(access_point_id.clone()).or_default())
    }

    /// Deliver one command with retries. Never returns an error: the outcome
    /// is recorded and a door that did not confirm is marked stale.
    pub async fn dispatch(
        &self,
        access_point_id: &AccessPointId,
        command: DoorCommand,
        cancel: &CancellationToken,
    ) -> CommandOutcome {
        let door_lock = self.door_lock(access_point_id);
        let acquire = async {
            let ordered = door_lock.lock().await;
            let permit = self.in_flight.acquire().await;
            (ordered, permit)
        };
        let _guards = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CommandOutcome::Cancelled,
            guards = acquire => guards,
        };

        let attempts = AtomicU32::new(0);
        let controller = &self.controller;
        let attempts_ref = &attempts;
        let timeout = self.policy.attempt_timeout;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.policy.initial_backoff)
            .with_max_delay(self.policy.max_backoff)
            .with_max_times(self.policy.max_attempts.saturating_sub(1));

        let send = (|| async move {
            attempts_ref.fetch_add(1, Ordering::SeqCst);
            match tokio::time::timeout(timeout, controller.send_command(access_point_id, command))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AttemptError::Controller(e)),
                Err(_) => Err(AttemptError::Timeout),
            }
        })
        .retry(backoff)
        .notify(|err: &AttemptError, delay: Duration| {
            tracing::warn!(
                access_point = %access_point_id,
                %command,
                error = ?err,
                retry_in_ms = delay.as_millis() as u64,
                "Door command attempt failed"
            );
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CommandOutcome::Cancelled,
            result = send => result,
        };

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                self.registry.record_ack(access_point_id, command);
                CommandOutcome::Acked { attempts }
            }
            Err(AttemptError::Timeout) => {
                tracing::warn!(
                    access_point = %access_point_id,
                    %command,
                    attempts,
                    "Door command timed out; marking door stale"
                );
                self.registry.mark_stale(access_point_id);
                CommandOutcome::TimedOut { attempts }
            }
            Err(AttemptError::Controller(e)) => {
                tracing::warn!(
                    access_point = %access_point_id,
                    %command,
                    attempts,
                    error = %e,
                    "Door command failed; marking door stale"
                );
                self.registry.mark_stale(access_point_id);
                CommandOutcome::Failed {
                    attempts,
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    struct FlakyController {
        failures_before_ack: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DoorController for FlakyController {
        async fn send_command(
            &self,
            _access_point_id: &AccessPointId,
            _command: DoorCommand,
        ) -> Result<(), DoorCommandError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_ack {
                Err(DoorCommandError::Unreachable("bus fault".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct SilentController;

    #[async_trait]
    impl DoorController for SilentController {
        async fn send_command(
            &self,
            _access_point_id: &AccessPointId,
            _command: DoorCommand,
        ) -> Result<(), DoorCommandError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn fast_policy() -> CommandPolicy {
        CommandPolicy {
            attempt_timeout: Duration::from_millis(20),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_in_flight: 4,
        }
    }

    fn dispatcher(controller: Arc<dyn DoorController>) -> CommandDispatcher {
        let registry = Arc::new(DoorRegistry::new(
            ChangeBus::new(16, 16),
            Duration::from_secs(60),
        ));
        CommandDispatcher::new(controller, registry, fast_policy())
    }

    #[test]
    fn heartbeats_are_last_writer_wins() {
        let registry = DoorRegistry::new(ChangeBus::new(16, 16), Duration::from_secs(3600));
        let door = AccessPointId::from("d1");
        let now = Utc::now();
        assert!(registry.record_heartbeat(&door, DoorState::Locked, now));
        assert!(!registry.record_heartbeat(
            &door,
            DoorState::ForcedOpen,
            now - chrono::Duration::seconds(5)
        ));
        assert!(registry.record_heartbeat(
            &door,
            DoorState::HeldOpen,
            now + chrono::Duration::seconds(1)
        ));
        let record = registry.get(&door).expect("tracked");
        assert_eq!(record.state, Some(DoorState::HeldOpen));
        assert!(!record.stale);
    }

    #[test]
    fn old_observations_read_as_stale() {
        let registry = DoorRegistry::new(ChangeBus::new(16, 16), Duration::from_secs(30));
        let door = AccessPointId::from("d1");
        registry.record_heartbeat(
            &door,
            DoorState::Locked,
            Utc::now() - chrono::Duration::minutes(5),
        );
        assert!(registry.get(&door).expect("tracked").stale);
    }

    #[tokio::test]
    async fn retries_until_ack() {
        let controller = Arc::new(FlakyController {
            failures_before_ack: 2,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = dispatcher(controller);
        let door = AccessPointId::from("d1");
        let outcome = dispatcher
            .dispatch(&door, DoorCommand::Lock, &CancellationToken::new())
            .await;
        assert_eq!(outcome, CommandOutcome::Acked { attempts: 3 });
        let record = dispatcher.registry().get(&door).expect("tracked");
        assert_eq!(record.state, Some(DoorState::Locked));
    }

    #[tokio::test]
    async fn exhausted_retries_mark_door_stale() {
        let controller = Arc::new(FlakyController {
            failures_before_ack: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = dispatcher(controller);
        let door = AccessPointId::from("d1");
        let outcome = dispatcher
            .dispatch(&door, DoorCommand::Unlock, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, CommandOutcome::Failed { attempts: 3, .. }));
        assert!(dispatcher.registry().get(&door).expect("tracked").stale);
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        let dispatcher = dispatcher(Arc::new(SilentController));
        let door = AccessPointId::from("d1");
        let outcome = dispatcher
            .dispatch(&door, DoorCommand::Lock, &CancellationToken::new())
            .await;
        assert_eq!(outcome, CommandOutcome::TimedOut { attempts: 3 });

        let err = outcome
            .to_error(&door, DoorCommand::Lock, fast_policy().attempt_timeout)
            .expect("timed out");
        assert!(matches!(
            err,
            WardenError::CommandTimeout { timeout_ms: 60, .. }
        ));
        assert!(err.category().retryable());
        assert!(
            CommandOutcome::Acked { attempts: 1 }
                .to_error(&door, DoorCommand::Lock, Duration::ZERO)
                .is_none()
        );
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let dispatcher = dispatcher(Arc::new(SilentController));
        let token = CancellationToken::new();
        token.cancel();
        let outcome = dispatcher
            .dispatch(&AccessPointId::from("d1"), DoorCommand::Lock, &token)
            .await;
        assert_eq!(outcome, CommandOutcome::Cancelled);
    }
}
