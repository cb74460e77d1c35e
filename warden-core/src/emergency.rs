//! Emergency override controller.
//!
//! ```text
//! NORMAL --activate--> ACTIVATING --(all target doors commanded)--> ACTIVE
//! ACTIVE --deactivate--> DEACTIVATING --(all doors restored)--> NORMAL
//! ```
//!
//! Phase transitions are linearized by one controller-wide lock. Access
//! resolution never takes that lock: it reads the latest published
//! `EmergencyState` from a watch channel.
//!
//! Door command fan-out runs in spawned tasks tagged with the state
//! generation. `deactivate` bumps the generation and cancels the running
//! fan-out without waiting for it, so a lockdown still in progress can never
//! hold up the escape hatch. Results from a superseded generation are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditRecord;
use crate::bus::{ChangeBus, Delta};
use crate::directory::Directory;
use crate::doors::{CommandDispatcher, CommandOutcome};
use crate::errors::{ErrorCategory, Result, WardenError};
use crate::ledger::Ledger;
use crate::model::{AccessPoint, AccessPointId, Decision, DecisionOrigin, DoorCommand, ZoneId};

/// Actor recorded for transitions the controller makes on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyPhase {
    Normal,
    Activating,
    Active,
    Deactivating,
}

impl EmergencyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "activating" => Some(Self::Activating),
            "active" => Some(Self::Active),
            "deactivating" => Some(Self::Deactivating),
            _ => None,
        }
    }

    /// Phases in which the override supersedes normal resolution.
    pub fn overrides_access(&self) -> bool {
        matches!(self, Self::Activating | Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "zones", rename_all = "snake_case")]
pub enum EmergencyScope {
    All,
    Zones(BTreeSet<ZoneId>),
}

impl EmergencyScope {
    pub fn contains(&self, zone_id: &ZoneId) -> bool {
        match self {
            Self::All => true,
            Self::Zones(zones) => zones.contains(zone_id),
        }
    }

    /// Union of both scopes, or `None` when `other` adds nothing.
    pub fn widen(&self, other: &EmergencyScope) -> Option<EmergencyScope> {
        match (self, other) {
            (Self::All, _) => None,
            (Self::Zones(_), Self::All) => Some(Self::All),
            (Self::Zones(current), Self::Zones(extra)) => {
                if extra.is_subset(current) {
                    None
                } else {
                    Some(Self::Zones(current.union(extra).cloned().collect()))
                }
            }
        }
    }
}

/// Deployment-wide emergency singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub phase: EmergencyPhase,
    pub scope: EmergencyScope,
    pub evacuation_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_by: Option<String>,
    /// Bumped by every lockdown start and every deactivation.
    pub generation: u64,
    pub changed_at: DateTime<Utc>,
}

impl EmergencyState {
    pub fn normal() -> Self {
        Self {
            phase: EmergencyPhase::Normal,
            scope: EmergencyScope::Zones(BTreeSet::new()),
            evacuation_mode: false,
            activated_at: None,
            activated_by: None,
            generation: 0,
            changed_at: Utc::now(),
        }
    }

    /// The forced decision for `access_point`, if the override covers it.
    pub fn override_for(&self, access_point: &AccessPoint) -> Option<Decision> {
        if !self.phase.overrides_access() || !self.scope.contains(&access_point.zone_id) {
            return None;
        }
        if self.evacuation_mode && access_point.is_exit_route {
            Some(Decision::new(true, DecisionOrigin::EmergencyEvacuation))
        } else {
            Some(Decision::new(false, DecisionOrigin::Emergency))
        }
    }

    /// Command a lockdown under this state sends to `access_point`.
    fn lockdown_command(&self, access_point: &AccessPoint) -> DoorCommand {
        if self.evacuation_mode && access_point.is_exit_route {
            DoorCommand::Unlock
        } else {
            DoorCommand::Lock
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyProgress {
    /// Doors of the running fan-out, including doors of an earlier lockdown
    /// still being restored.
    pub doors_in_scope: usize,
    pub doors_commanded: usize,
    /// `doors_commanded / doors_in_scope`, 1.0 for an empty scope.
    pub fraction: f64,
}

impl EmergencyProgress {
    fn new(doors_in_scope: usize, doors_commanded: usize) -> Self {
        let fraction = if doors_in_scope == 0 {
            1.0
        } else {
            doors_commanded as f64 / doors_in_scope as f64
        };
        Self {
            doors_in_scope,
            doors_commanded,
            fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub access_point_id: AccessPointId,
    pub command: DoorCommand,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
    pub category: ErrorCategory,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStatus {
    pub state: EmergencyState,
    pub progress: EmergencyProgress,
    pub failures: Vec<CommandFailure>,
    /// Transition records waiting for the ledger to come back.
    pub pending_audit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    /// Storage failure aborts the transition.
    FailClosed,
    /// Storage failure is logged and the audit record held for the next commit.
    BestEffort,
}

struct DoorTask {
    ticket: u64,
    settled: bool,
}

struct ControllerInner {
    state: EmergencyState,
    /// Command sent to each door by the current lockdown. Restoration sends
    /// the inverse.
    lockdown: BTreeMap<AccessPointId, DoorCommand>,
    /// Doors an earlier lockdown commanded that the current one does not
    /// cover and whose restoration has not been acknowledged yet. Keyed like
    /// `lockdown`: the value is the lockdown command, not its inverse.
    restoring: BTreeMap<AccessPointId, DoorCommand>,
    /// Doors of the running fan-out (lockdown or restoration).
    tasks: BTreeMap<AccessPointId, DoorTask>,
    failures: Vec<CommandFailure>,
    cancel: CancellationToken,
    next_ticket: u64,
    pending_audit: Vec<AuditRecord>,
}

impl ControllerInner {
    fn new(state: EmergencyState) -> Self {
        Self {
            state,
            lockdown: BTreeMap::new(),
            restoring: BTreeMap::new(),
            tasks: BTreeMap::new(),
            failures: Vec::new(),
            cancel: CancellationToken::new(),
            next_ticket: 0,
            pending_audit: Vec::new(),
        }
    }

    fn all_settled(&self) -> bool {
        self.tasks.values().all(|t| t.settled)
    }

    /// Stop the running fan-out and start a fresh one.
    fn reset_fan_out(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.tasks.clear();
        self.failures.clear();
    }

    /// Inverse commands for every door still needing restoration.
    fn restore_commands(&self) -> BTreeMap<AccessPointId, DoorCommand> {
        self.restoring
            .iter()
            .chain(&self.lockdown)
            .map(|(id, cmd)| (id.clone(), cmd.inverse()))
            .collect()
    }

    fn is_pending(&self, access_point_id: &AccessPointId) -> bool {
        self.tasks
            .get(access_point_id)
            .is_none_or(|task| !task.settled)
    }

    fn status(&self) -> EmergencyStatus {
        let commanded = self.tasks.values().filter(|t| t.settled).count();
        EmergencyStatus {
            state: self.state.clone(),
            progress: EmergencyProgress::new(self.tasks.len(), commanded),
            failures: self.failures.clone(),
            pending_audit: self.pending_audit.len(),
        }
    }
}

pub struct EmergencyController {
    inner: Mutex<ControllerInner>,
    state_tx: watch::Sender<EmergencyState>,
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn Ledger>,
    bus: ChangeBus,
    dispatcher: Arc<CommandDispatcher>,
}

impl EmergencyController {
    /// Load the singleton from the ledger (creating it on first boot) and
    /// re-assert any lockdown or restoration that was in progress.
    pub async fn bootstrap(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn Ledger>,
        bus: ChangeBus,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Result<Arc<Self>> {
        let state = match ledger.load_emergency()? {
            Some(state) => state,
            None => {
                let state = EmergencyState::normal();
                ledger.commit_emergency(&state, Vec::new())?;
                state
            }
        };
        let (state_tx, _) = watch::channel(state.clone());
        let controller = Arc::new(Self {
            inner: Mutex::new(ControllerInner::new(state.clone())),
            state_tx,
            directory,
            ledger,
            bus,
            dispatcher,
        });

        if state.phase != EmergencyPhase::Normal {
            tracing::warn!(
                phase = state.phase.as_str(),
                generation = state.generation,
                "Resuming emergency transition found at startup"
            );
            controller.resume(state).await;
        }
        Ok(controller)
    }

    async fn resume(self: &Arc<Self>, persisted: EmergencyState) {
        let mut inner = self.inner.lock().await;
        inner.lockdown = self.lockdown_commands(&persisted);
        inner.reset_fan_out();
        let mut next = persisted.clone();
        next.generation += 1;
        next.changed_at = Utc::now();
        let commands = if persisted.phase.overrides_access() {
            next.phase = EmergencyPhase::Activating;
            inner.lockdown.clone()
        } else {
            inner
                .lockdown
                .iter()
                .map(|(id, cmd)| (id.clone(), cmd.inverse()))
                .collect()
        };
        self.commit(&mut inner, next, SYSTEM_ACTOR, CommitMode::BestEffort)
            .unwrap_or_default();
        self.start_fan_out(&mut inner, commands);
        self.complete_if_settled(&mut inner);
    }

    /// Latest committed state. Never blocks on a transition in progress.
    pub fn snapshot(&self) -> EmergencyState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EmergencyState> {
        self.state_tx.subscribe()
    }

    /// Wait until the published phase equals `phase`. False on timeout.
    pub async fn wait_for_phase(&self, phase: EmergencyPhase, timeout: Duration) -> bool {
        let mut rx = self.watch();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.phase == phase))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub async fn status(&self) -> EmergencyStatus {
        self.inner.lock().await.status()
    }

    /// Start a lockdown, or widen the one in progress.
    ///
    /// While `ACTIVATING`/`ACTIVE` the request must add at least one zone;
    /// the scope becomes the union and evacuation mode can only be switched
    /// on. Fails closed when the ledger cannot record the transition.
    pub async fn activate(
        self: &Arc<Self>,
        scope: EmergencyScope,
        evacuation_mode: bool,
        actor: &str,
    ) -> Result<EmergencyStatus> {
        self.validate_scope(&scope)?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        match inner.state.phase {
            EmergencyPhase::Normal | EmergencyPhase::Deactivating => {
                let mut next = inner.state.clone();
                next.phase = EmergencyPhase::Activating;
                next.scope = scope;
                next.evacuation_mode = evacuation_mode;
                next.activated_at = Some(now);
                next.activated_by = Some(actor.to_string());
                next.generation += 1;
                next.changed_at = now;
                let commands = self.lockdown_commands(&next);

                self.commit(&mut inner, next, actor, CommitMode::FailClosed)?;
                // Doors of the lockdown being restored that the new scope
                // leaves out still owe their inverse command.
                let carried: BTreeMap<AccessPointId, DoorCommand> = inner
                    .lockdown
                    .iter()
                    .filter(|(id, _)| !commands.contains_key(*id) && inner.is_pending(id))
                    .map(|(id, cmd)| (id.clone(), *cmd))
                    .collect();
                inner.reset_fan_out();
                inner.lockdown = commands.clone();
                inner.restoring = carried;
                tracing::info!(
                    actor,
                    doors = commands.len(),
                    restoring = inner.restoring.len(),
                    evacuation_mode,
                    generation = inner.state.generation,
                    "Emergency lockdown activating"
                );
                let mut fan_out = inner.restore_commands();
                fan_out.extend(commands);
                self.start_fan_out(&mut inner, fan_out);
            }
            EmergencyPhase::Activating | EmergencyPhase::Active => {
                let Some(widened) = inner.state.scope.widen(&scope) else {
                    return Err(WardenError::invalid_state(format!(
                        "lockdown already {} with an equal or wider scope",
                        inner.state.phase.as_str()
                    )));
                };
                let mut next = inner.state.clone();
                next.scope = widened;
                next.evacuation_mode = inner.state.evacuation_mode || evacuation_mode;
                next.changed_at = now;
                let commands = self.lockdown_commands(&next);
                let added: BTreeMap<AccessPointId, DoorCommand> = commands
                    .iter()
                    .filter(|(id, cmd)| inner.lockdown.get(*id) != Some(*cmd))
                    .map(|(id, cmd)| (id.clone(), *cmd))
                    .collect();
                if !added.is_empty() {
                    next.phase = EmergencyPhase::Activating;
                }

                self.commit(&mut inner, next, actor, CommitMode::FailClosed)?;
                inner.restoring.retain(|id, _| !commands.contains_key(id));
                inner.lockdown = commands;
                tracing::info!(
                    actor,
                    added_doors = added.len(),
                    generation = inner.state.generation,
                    "Emergency lockdown widened"
                );
                self.start_fan_out(&mut inner, added);
            }
        }

        self.complete_if_settled(&mut inner);
        Ok(inner.status())
    }

    /// End the lockdown. Always accepted: it cancels an in-flight activation
    /// instead of waiting for it, and a ledger outage only delays the audit
    /// record.
    pub async fn deactivate(self: &Arc<Self>, actor: &str) -> EmergencyStatus {
        let mut inner = self.inner.lock().await;
        if !inner.state.phase.overrides_access() {
            tracing::debug!(
                actor,
                phase = inner.state.phase.as_str(),
                "Deactivate with no lockdown in force"
            );
            return inner.status();
        }

        let mut next = inner.state.clone();
        next.phase = EmergencyPhase::Deactivating;
        next.generation += 1;
        next.changed_at = Utc::now();
        inner.reset_fan_out();
        // BestEffort never returns an error.
        self.commit(&mut inner, next, actor, CommitMode::BestEffort)
            .unwrap_or_default();

        let restore = inner.restore_commands();
        let restoring = std::mem::take(&mut inner.restoring);
        inner.lockdown.extend(restoring);
        tracing::info!(
            actor,
            doors = restore.len(),
            generation = inner.state.generation,
            "Emergency lockdown deactivating"
        );
        self.start_fan_out(&mut inner, restore);
        self.complete_if_settled(&mut inner);
        inner.status()
    }

    fn validate_scope(&self, scope: &EmergencyScope) -> Result<()> {
        if let EmergencyScope::Zones(zones) = scope {
            if zones.is_empty() {
                return Err(WardenError::validation("emergency scope has no zones"));
            }
            for zone in zones {
                self.directory.get_zone(zone)?;
            }
        }
        Ok(())
    }

    fn lockdown_commands(&self, state: &EmergencyState) -> BTreeMap<AccessPointId, DoorCommand> {
        self.directory
            .list_access_points()
            .into_iter()
            .filter(|ap| state.scope.contains(&ap.zone_id))
            .map(|ap| {
                let cmd = state.lockdown_command(&ap);
                (ap.id, cmd)
            })
            .collect()
    }

    fn start_fan_out(
        self: &Arc<Self>,
        inner: &mut ControllerInner,
        commands: BTreeMap<AccessPointId, DoorCommand>,
    ) {
        let generation = inner.state.generation;
        for (access_point_id, command) in commands {
            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            inner.tasks.insert(
                access_point_id.clone(),
                DoorTask {
                    ticket,
                    settled: false,
                },
            );
            let controller = Arc::clone(self);
            let cancel = inner.cancel.clone();
            tokio::spawn(async move {
                let outcome = controller
                    .dispatcher
                    .dispatch(&access_point_id, command, &cancel)
                    .await;
                controller
                    .settle(generation, access_point_id, ticket, command, outcome)
                    .await;
            });
        }
    }

    async fn settle(
        &self,
        generation: u64,
        access_point_id: AccessPointId,
        ticket: u64,
        command: DoorCommand,
        outcome: CommandOutcome,
    ) {
        if outcome == CommandOutcome::Cancelled {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.state.generation != generation {
            return;
        }
        match inner.tasks.get_mut(&access_point_id) {
            Some(task) if task.ticket == ticket => task.settled = true,
            _ => return,
        }
        if outcome.is_acked()
            && inner
                .restoring
                .get(&access_point_id)
                .copied()
                .map(DoorCommand::inverse)
                == Some(command)
        {
            inner.restoring.remove(&access_point_id);
        }
        let attempt_timeout = self.dispatcher.policy().attempt_timeout;
        if let Some(err) = outcome.to_error(&access_point_id, command, attempt_timeout) {
            inner.failures.push(CommandFailure {
                access_point_id,
                command,
                outcome,
                category: err.category(),
                error: err.to_string(),
            });
        }
        self.complete_if_settled(&mut inner);
    }

    fn complete_if_settled(&self, inner: &mut ControllerInner) {
        if !inner.all_settled() {
            return;
        }
        let mut next = inner.state.clone();
        match inner.state.phase {
            EmergencyPhase::Activating => {
                next.phase = EmergencyPhase::Active;
            }
            EmergencyPhase::Deactivating => {
                next = EmergencyState {
                    generation: inner.state.generation,
                    ..EmergencyState::normal()
                };
                inner.lockdown.clear();
                inner.restoring.clear();
            }
            EmergencyPhase::Normal | EmergencyPhase::Active => return,
        }
        next.changed_at = Utc::now();
        if !inner.failures.is_empty() {
            tracing::warn!(
                failures = inner.failures.len(),
                "Door commands unconfirmed; phase advances anyway"
            );
        }
        self.commit(inner, next, SYSTEM_ACTOR, CommitMode::BestEffort)
            .unwrap_or_default();
    }

    fn commit(
        &self,
        inner: &mut ControllerInner,
        next: EmergencyState,
        actor: &str,
        mode: CommitMode,
    ) -> Result<()> {
        let previous = inner.state.clone();
        let mut records = std::mem::take(&mut inner.pending_audit);
        records.push(AuditRecord::emergency(actor, previous.clone(), next.clone()));

        if let Err(err) = self.ledger.commit_emergency(&next, records.clone()) {
            match mode {
                CommitMode::FailClosed => {
                    records.pop();
                    inner.pending_audit = records;
                    tracing::warn!(
                        actor,
                        error = %err,
                        "Emergency transition rejected: audit unavailable"
                    );
                    return Err(err);
                }
                CommitMode::BestEffort => {
                    tracing::warn!(
                        actor,
                        error = %err,
                        held = records.len(),
                        "Emergency transition applied; audit held until storage recovers"
                    );
                    inner.pending_audit = records;
                }
            }
        }

        tracing::info!(
            from = previous.phase.as_str(),
            to = next.phase.as_str(),
            generation = next.generation,
            "Emergency phase transition"
        );
        inner.state = next.clone();
        self.state_tx.send_replace(next.clone());
        self.bus.publish(
            vec![Delta::EmergencyTransition {
                from: previous,
                to: next,
            }],
            None,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doors::{DoorCommandError, DoorController, DoorRegistry};
    use crate::ledger::MemoryLedger;
    use crate::model::DoorState;
    use crate::test_support::{RecordingController, fixture_directory, test_policy};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(5);

    async fn controller_with(
        door_controller: Arc<dyn DoorController>,
        ledger: Arc<MemoryLedger>,
    ) -> Arc<EmergencyController> {
        let bus = ChangeBus::new(64, 64);
        let registry = Arc::new(DoorRegistry::new(bus.clone(), Duration::from_secs(60)));
        let dispatcher = Arc::new(CommandDispatcher::new(
            door_controller,
            registry,
            test_policy(),
        ));
        EmergencyController::bootstrap(fixture_directory(), ledger, bus, dispatcher)
            .await
            .expect("bootstrap")
    }

    fn zones(ids: &[&str]) -> EmergencyScope {
        EmergencyScope::Zones(ids.iter().map(|z| ZoneId::from(*z)).collect())
    }

    /// Never acknowledges LOCK; acknowledges UNLOCK at once.
    struct StuckLockController;

    #[async_trait]
    impl DoorController for StuckLockController {
        async fn send_command(
            &self,
            _access_point_id: &AccessPointId,
            command: DoorCommand,
        ) -> std::result::Result<(), DoorCommandError> {
            if command == DoorCommand::Lock {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
    }

    /// Acknowledges LOCK at once and UNLOCK after a short delay.
    struct SlowUnlockController;

    #[async_trait]
    impl DoorController for SlowUnlockController {
        async fn send_command(
            &self,
            _access_point_id: &AccessPointId,
            command: DoorCommand,
        ) -> std::result::Result<(), DoorCommandError> {
            if command == DoorCommand::Unlock {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }
    }

    #[test]
    fn widen_only_accepts_larger_scopes() {
        assert_eq!(zones(&["z1"]).widen(&zones(&["z1"])), None);
        assert_eq!(
            zones(&["z1"]).widen(&zones(&["z2"])),
            Some(zones(&["z1", "z2"]))
        );
        assert_eq!(
            zones(&["z1"]).widen(&EmergencyScope::All),
            Some(EmergencyScope::All)
        );
        assert_eq!(EmergencyScope::All.widen(&zones(&["z9"])), None);
    }

    #[tokio::test]
    async fn activation_reaches_active_and_commands_every_door() {
        let recorder = Arc::new(RecordingController::default());
        let controller = controller_with(recorder.clone(), Arc::new(MemoryLedger::new())).await;

        let status = controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .expect("activate");
        assert!(status.state.phase.overrides_access());
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        let status = controller.status().await;
        assert_eq!(status.progress.doors_in_scope, 4);
        assert_eq!(status.progress.doors_commanded, 4);
        assert_eq!(status.progress.fraction, 1.0);
        assert_eq!(recorder.count(DoorCommand::Lock), 4);
    }

    #[tokio::test]
    async fn evacuation_unlocks_exit_routes() {
        let recorder = Arc::new(RecordingController::default());
        let controller = controller_with(recorder.clone(), Arc::new(MemoryLedger::new())).await;
        controller
            .activate(EmergencyScope::All, true, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);
        assert_eq!(recorder.count(DoorCommand::Unlock), 1);
        assert_eq!(recorder.count(DoorCommand::Lock), 3);
    }

    #[tokio::test]
    async fn reactivating_requires_a_wider_scope() {
        let controller = controller_with(
            Arc::new(RecordingController::default()),
            Arc::new(MemoryLedger::new()),
        )
        .await;
        controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .expect("activate");

        let err = controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidState);

        let status = controller
            .activate(zones(&["z2"]), true, "guard")
            .await
            .expect("widen");
        assert_eq!(status.state.scope, zones(&["z1", "z2"]));
        assert!(status.state.evacuation_mode);
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);
    }

    #[tokio::test]
    async fn deactivate_is_not_blocked_by_stuck_activation() {
        let controller =
            controller_with(Arc::new(StuckLockController), Arc::new(MemoryLedger::new())).await;
        controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .expect("activate");
        assert_eq!(controller.snapshot().phase, EmergencyPhase::Activating);

        let status = tokio::time::timeout(Duration::from_millis(500), controller.deactivate("guard"))
            .await
            .expect("deactivate returns promptly");
        assert_eq!(status.state.phase, EmergencyPhase::Deactivating);
        assert!(controller.wait_for_phase(EmergencyPhase::Normal, WAIT).await);
    }

    #[tokio::test]
    async fn failed_commands_do_not_block_the_transition() {
        let recorder = Arc::new(RecordingController::failing());
        let controller = controller_with(recorder, Arc::new(MemoryLedger::new())).await;
        controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);
        let status = controller.status().await;
        assert_eq!(status.failures.len(), status.progress.doors_in_scope);
        assert!(matches!(
            status.failures[0].outcome,
            CommandOutcome::Failed { .. }
        ));
        assert_eq!(status.failures[0].category, ErrorCategory::Unavailable);
    }

    #[tokio::test]
    async fn unacknowledged_lock_is_reported_as_command_timeout() {
        let controller =
            controller_with(Arc::new(StuckLockController), Arc::new(MemoryLedger::new())).await;
        controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        let status = controller.status().await;
        assert_eq!(status.failures.len(), 2);
        for failure in &status.failures {
            assert_eq!(failure.outcome, CommandOutcome::TimedOut { attempts: 3 });
            assert_eq!(failure.category, ErrorCategory::CommandTimeout);
            assert!(failure.error.contains("did not acknowledge"), "{}", failure.error);
        }
    }

    #[tokio::test]
    async fn activation_fails_closed_but_deactivation_does_not() {
        let ledger = Arc::new(MemoryLedger::new());
        let controller =
            controller_with(Arc::new(RecordingController::default()), ledger.clone()).await;

        ledger.set_available(false);
        let err = controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Unavailable);
        assert_eq!(controller.snapshot().phase, EmergencyPhase::Normal);

        ledger.set_available(true);
        controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        ledger.set_available(false);
        let status = controller.deactivate("guard").await;
        assert_eq!(status.state.phase, EmergencyPhase::Deactivating);
        assert!(status.pending_audit >= 1);
        assert!(controller.wait_for_phase(EmergencyPhase::Normal, WAIT).await);
    }

    #[tokio::test]
    async fn bootstrap_reasserts_persisted_lockdown() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut persisted = EmergencyState::normal();
        persisted.phase = EmergencyPhase::Active;
        persisted.scope = EmergencyScope::All;
        persisted.generation = 3;
        ledger
            .commit_emergency(&persisted, Vec::new())
            .expect("seed");

        let recorder = Arc::new(RecordingController::default());
        let controller = controller_with(recorder.clone(), ledger).await;
        assert!(controller.snapshot().phase.overrides_access());
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);
        assert_eq!(controller.snapshot().generation, 4);
        assert_eq!(recorder.count(DoorCommand::Lock), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn narrower_lockdown_during_restoration_still_restores_dropped_doors() {
        let controller =
            controller_with(Arc::new(SlowUnlockController), Arc::new(MemoryLedger::new())).await;
        controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        let status = controller.deactivate("guard").await;
        assert_eq!(status.state.phase, EmergencyPhase::Deactivating);
        let status = controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .expect("activate from deactivating");
        assert_eq!(status.progress.doors_in_scope, 4);
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        controller.deactivate("guard").await;
        assert!(controller.wait_for_phase(EmergencyPhase::Normal, WAIT).await);

        let registry = controller.dispatcher.registry();
        for door in ["d1", "d2", "d3", "e1"] {
            let record = registry.get(&AccessPointId::from(door)).expect("tracked");
            assert_eq!(record.state, Some(DoorState::Unlocked), "{door}");
        }
    }

    #[tokio::test]
    async fn restoration_owed_by_a_dropped_door_survives_a_second_deactivate() {
        let controller =
            controller_with(Arc::new(SlowUnlockController), Arc::new(MemoryLedger::new())).await;
        controller
            .activate(EmergencyScope::All, false, "guard")
            .await
            .expect("activate");
        assert!(controller.wait_for_phase(EmergencyPhase::Active, WAIT).await);

        controller.deactivate("guard").await;
        controller
            .activate(zones(&["z1"]), false, "guard")
            .await
            .expect("activate from deactivating");
        // Deactivate again before the carried restorations are acknowledged.
        let status = controller.deactivate("guard").await;
        assert_eq!(status.progress.doors_in_scope, 4);
        assert!(controller.wait_for_phase(EmergencyPhase::Normal, WAIT).await);

        let registry = controller.dispatcher.registry();
        for door in ["d3", "e1"] {
            let record = registry.get(&AccessPointId::from(door)).expect("tracked");
            assert_eq!(record.state, Some(DoorState::Unlocked), "{door}");
        }
    }

    #[tokio::test]
    async fn deactivate_when_normal_is_a_noop() {
        let controller = controller_with(
            Arc::new(RecordingController::default()),
            Arc::new(MemoryLedger::new()),
        )
        .await;
        let status = controller.deactivate("guard").await;
        assert_eq!(status.state.phase, EmergencyPhase::Normal);
        assert_eq!(status.state.generation, 0);
    }
}
