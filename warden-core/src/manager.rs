//! AccessManager: the single entry point the service talks to.
//!
//! Wires the directory, grant store, resolver, emergency controller, door
//! dispatch, bulk coordinator, change bus and audit log together. Grant
//! deltas are published by the grant store itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
use crate::bulk::{BulkCoordinator, BulkReport, BulkRequest};
use crate::bus::{ChangeBus, Subscription};
use crate::directory::Directory;
use crate::doors::{CommandDispatcher, CommandPolicy, DoorController, DoorRecord, DoorRegistry};
use crate::emergency::{EmergencyController, EmergencyPhase, EmergencyScope, EmergencyStatus};
use crate::errors::Result;
use crate::grants::{GrantFilter, GrantStore, WriteContext};
use crate::ledger::Ledger;
use crate::model::{
    AccessGrant, AccessPointId, Decision, DoorState, GrantKey, GrantWrite, IdentityId, TemplateId,
};
use crate::resolver::{ResolutionInput, resolve};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub bulk_workers: usize,
    pub bus_capacity: usize,
    pub replay_window: usize,
    pub command_policy: CommandPolicy,
    pub heartbeat_stale_after: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            bulk_workers: 4,
            bus_capacity: 1024,
            replay_window: 4096,
            command_policy: CommandPolicy::default(),
            heartbeat_stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub uptime_s: u64,
    pub grant_count: usize,
    pub emergency_phase: EmergencyPhase,
    pub bus_sequence: u64,
    /// Newest audit sequence; absent while the ledger is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_sequence: Option<u64>,
    pub connections: u32,
}

pub struct AccessManager {
    directory: Arc<dyn Directory>,
    store: Arc<GrantStore>,
    audit: AuditLog,
    bus: ChangeBus,
    bulk: BulkCoordinator,
    emergency: Arc<EmergencyController>,
    registry: Arc<DoorRegistry>,
    started_at: Instant,
    connection_count: AtomicU32,
}

impl AccessManager {
    /// Rebuild in-memory state from `ledger` and resume any emergency
    /// transition that was in flight when the previous process stopped.
    pub async fn bootstrap(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn Ledger>,
        controller: Arc<dyn DoorController>,
        options: ManagerOptions,
    ) -> Result<Arc<Self>> {
        let bus = ChangeBus::new(options.bus_capacity, options.replay_window);
        let store = Arc::new(GrantStore::load(Arc::clone(&ledger), bus.clone())?);
        let registry = Arc::new(DoorRegistry::new(bus.clone(), options.heartbeat_stale_after));
        let dispatcher = Arc::new(CommandDispatcher::new(
            controller,
            Arc::clone(&registry),
            options.command_policy.clone(),
        ));
        let emergency = EmergencyController::bootstrap(
            Arc::clone(&directory),
            Arc::clone(&ledger),
            bus.clone(),
            dispatcher,
        )
        .await?;
        let bulk = BulkCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            options.bulk_workers,
        );

        tracing::info!(
            grants = store.len(),
            phase = emergency.snapshot().phase.as_str(),
            "Access manager ready"
        );
        Ok(Arc::new(Self {
            directory,
            store,
            audit: AuditLog::new(ledger),
            bus,
            bulk,
            emergency,
            registry,
            started_at: Instant::now(),
            connection_count: AtomicU32::new(0),
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access checks
    // ─────────────────────────────────────────────────────────────────────────

    /// Effective decision for one pair, read against the latest committed
    /// grant row and emergency state.
    pub fn is_allowed(&self, identity_id: &IdentityId, access_point_id: &AccessPointId) -> Decision {
        let identity = self.directory.get_identity(identity_id).ok();
        let access_point = self.directory.get_access_point(access_point_id).ok();
        let zone = access_point
            .as_ref()
            .and_then(|ap| self.directory.get_zone(&ap.zone_id).ok());
        let grant = self
            .store
            .get(&GrantKey::new(identity_id.clone(), access_point_id.clone()));
        let emergency = self.emergency.snapshot();

        resolve(&ResolutionInput {
            identity: identity.as_ref(),
            access_point: access_point.as_ref(),
            zone: zone.as_ref(),
            grant: grant.as_ref(),
            emergency: &emergency,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    pub fn upsert_grant(&self, write: &GrantWrite, actor: &str) -> Result<AccessGrant> {
        self.directory.get_identity(&write.identity_id)?;
        self.directory.get_access_point(&write.access_point_id)?;
        if let Some(template_id) = &write.template_id {
            self.directory.list_template_members(template_id)?;
        }
        let change = self
            .store
            .upsert(write, &WriteContext::new(actor, AuditAction::GrantUpsert))?;
        Ok(change.after)
    }

    /// Remove a direct decision, falling back to the retained template grant
    /// or the zone default.
    pub fn clear_direct_grant(
        &self,
        identity_id: &IdentityId,
        access_point_id: &AccessPointId,
        expected_version: Option<u64>,
        actor: &str,
    ) -> Result<AccessGrant> {
        let key = GrantKey::new(identity_id.clone(), access_point_id.clone());
        let change = self.store.clear_direct(
            &key,
            expected_version,
            &WriteContext::new(actor, AuditAction::GrantClearDirect),
        )?;
        Ok(change.after)
    }

    pub fn get_grant(
        &self,
        identity_id: &IdentityId,
        access_point_id: &AccessPointId,
    ) -> Result<AccessGrant> {
        self.store
            .find(&GrantKey::new(identity_id.clone(), access_point_id.clone()))
    }

    pub fn list_grants(&self, filter: &GrantFilter) -> impl Iterator<Item = AccessGrant> + use<> {
        self.store.list(filter)
    }

    pub fn grant_count(&self) -> usize {
        self.store.len()
    }

    pub async fn apply_bulk(&self, request: BulkRequest, actor: &str) -> Result<BulkReport> {
        self.bulk.apply_bulk(request, actor).await
    }

    pub async fn apply_template(
        &self,
        template_id: &TemplateId,
        identity_ids: Vec<IdentityId>,
        actor: &str,
    ) -> Result<BulkReport> {
        self.bulk.apply_template(template_id, identity_ids, actor).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emergency
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn activate_emergency(
        &self,
        scope: EmergencyScope,
        evacuation_mode: bool,
        actor: &str,
    ) -> Result<EmergencyStatus> {
        self.emergency.activate(scope, evacuation_mode, actor).await
    }

    pub async fn deactivate_emergency(&self, actor: &str) -> EmergencyStatus {
        self.emergency.deactivate(actor).await
    }

    pub async fn emergency_status(&self) -> EmergencyStatus {
        self.emergency.status().await
    }

    pub fn emergency(&self) -> &Arc<EmergencyController> {
        &self.emergency
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Doors
    // ─────────────────────────────────────────────────────────────────────────

    /// Inbound controller heartbeat. Returns false for an out-of-order one.
    pub fn record_heartbeat(
        &self,
        access_point_id: &AccessPointId,
        state: DoorState,
        observed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.directory.get_access_point(access_point_id)?;
        Ok(self
            .registry
            .record_heartbeat(access_point_id, state, observed_at))
    }

    /// Every directory door, with unknown state for those never heard from.
    pub fn door_status(&self) -> Vec<DoorRecord> {
        self.directory
            .list_access_points()
            .into_iter()
            .map(|ap| {
                self.registry
                    .get(&ap.id)
                    .unwrap_or_else(|| DoorRecord::unknown(ap.id))
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Changes, audit, status
    // ─────────────────────────────────────────────────────────────────────────

    /// Change stream; with `since`, buffered batches after it come first.
    pub fn subscribe(&self, since: Option<u64>) -> Subscription {
        match since {
            Some(sequence) => self.bus.subscribe_from(sequence),
            None => self.bus.subscribe(),
        }
    }

    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit.query(filter)
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn inc_connections(&self) -> u32 {
        self.connection_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec_connections(&self) -> u32 {
        self.connection_count
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1)
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            uptime_s: self.uptime_s(),
            grant_count: self.store.len(),
            emergency_phase: self.emergency.snapshot().phase,
            bus_sequence: self.bus.current_sequence(),
            audit_sequence: self.audit.last_sequence().ok(),
            connections: self.connection_count.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for AccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessManager")
            .field("grants", &self.store.len())
            .field("bus_sequence", &self.bus.current_sequence())
            .finish_non_exhaustive()
    }
}
