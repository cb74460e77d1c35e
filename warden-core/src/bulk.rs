//! Bulk Mutation Coordinator.
//!
//! Applies one decision to the cartesian product of an identity set and an
//! access point set. Non-atomic requests go through `GrantStore::commit_each`,
//! which commits pairs on a bounded pool of workers and reports per-pair
//! outcomes. Atomic requests go through `GrantStore::commit_staged`, so
//! either every pair commits or none does.
//!
//! Each call publishes at most one change batch, tagged with the operation id.
//! The store publishes it before releasing the pairs it wrote.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditAction;
use crate::directory::Directory;
use crate::errors::{ErrorCategory, PairFailure, Result, WardenError};
use crate::grants::{GrantStore, WriteContext};
use crate::model::{AccessPointId, GrantKey, GrantOrigin, GrantWrite, IdentityId, TemplateId};

/// Version a caller observed for one pair before submitting a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedVersion {
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRequest {
    pub identity_ids: Vec<IdentityId>,
    pub access_point_ids: Vec<AccessPointId>,
    pub allowed: bool,
    /// Set for template-derived writes; `None` writes direct grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub atomic: bool,
    /// Pairs not listed are checked against the version read at the start
    /// of the call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_versions: Vec<ExpectedVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    Complete,
    PartialFailure,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkReport {
    pub operation_id: Uuid,
    pub succeeded: Vec<GrantKey>,
    pub failed: Vec<PairFailure>,
    /// Sequence of the change batch, absent when nothing was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_sequence: Option<u64>,
}

impl BulkReport {
    pub fn status(&self) -> BulkStatus {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (_, true) => BulkStatus::Complete,
            (false, false) => BulkStatus::PartialFailure,
            (true, false) => BulkStatus::Failed,
        }
    }

    /// `PartialFailure` error view of a report with failures.
    pub fn to_error(&self) -> Option<WardenError> {
        (!self.failed.is_empty()).then(|| WardenError::PartialFailure {
            failed: self.failed.len(),
            total: self.failed.len() + self.succeeded.len(),
        })
    }

    pub fn conflicts(&self) -> usize {
        self.failed
            .iter()
            .filter(|f| f.category == ErrorCategory::Conflict)
            .count()
    }
}

pub struct BulkCoordinator {
    store: Arc<GrantStore>,
    directory: Arc<dyn Directory>,
    workers: usize,
}

impl BulkCoordinator {
    pub fn new(
        store: Arc<GrantStore>,
        directory: Arc<dyn Directory>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            directory,
            workers: workers.max(1),
        }
    }

    pub async fn apply_bulk(&self, request: BulkRequest, actor: &str) -> Result<BulkReport> {
        self.run(request, actor, AuditAction::BulkApply).await
    }

    /// Grant every member door of `template_id` to each identity.
    ///
    /// Additive only: doors outside the template are never touched, and
    /// pairs holding a direct grant keep their direct decision.
    pub async fn apply_template(
        &self,
        template_id: &TemplateId,
        identity_ids: Vec<IdentityId>,
        actor: &str,
    ) -> Result<BulkReport> {
        let members = self
            .directory
            .list_template_members(template_id)
            .map_err(|_| WardenError::validation(format!("unknown template {template_id}")))?;
        if members.is_empty() {
            return Err(WardenError::validation(format!(
                "template {template_id} has no access points"
            )));
        }
        let request = BulkRequest {
            identity_ids,
            access_point_ids: members.into_iter().collect(),
            allowed: true,
            template_id: Some(template_id.clone()),
            atomic: false,
            expected_versions: Vec::new(),
        };
        self.run(request, actor, AuditAction::TemplateApply).await
    }

    async fn run(&self, request: BulkRequest, actor: &str, action: AuditAction) -> Result<BulkReport> {
        if request.identity_ids.is_empty() {
            return Err(WardenError::validation("identity set is empty"));
        }
        if request.access_point_ids.is_empty() {
            return Err(WardenError::validation("access point set is empty"));
        }
        if let Some(template_id) = &request.template_id
            && self.directory.list_template_members(template_id).is_err()
        {
            return Err(WardenError::validation(format!(
                "unknown template {template_id}"
            )));
        }

        let identities: BTreeSet<IdentityId> = request.identity_ids.iter().cloned().collect();
        let doors: BTreeSet<AccessPointId> = request.access_point_ids.iter().cloned().collect();
        let unknown_identities: BTreeSet<&IdentityId> = identities
            .iter()
            .filter(|id| self.directory.get_identity(id).is_err())
            .collect();
        let unknown_doors: BTreeSet<&AccessPointId> = doors
            .iter()
            .filter(|id| self.directory.get_access_point(id).is_err())
            .collect();

        let observed: HashMap<GrantKey, u64> = request
            .expected_versions
            .iter()
            .map(|e| {
                (
                    GrantKey::new(e.identity_id.clone(), e.access_point_id.clone()),
                    e.version,
                )
            })
            .collect();
        let origin = if request.template_id.is_some() {
            GrantOrigin::Template
        } else {
            GrantOrigin::Direct
        };

        let mut failed = Vec::new();
        let mut writes = Vec::with_capacity(identities.len() * doors.len());
        for identity_id in &identities {
            for access_point_id in &doors {
                let key = GrantKey::new(identity_id.clone(), access_point_id.clone());
                if unknown_identities.contains(identity_id) {
                    let err = WardenError::not_found("identity", identity_id);
                    failed.push(PairFailure::new(key, &err));
                    continue;
                }
                if unknown_doors.contains(access_point_id) {
                    let err = WardenError::not_found("access point", access_point_id);
                    failed.push(PairFailure::new(key, &err));
                    continue;
                }
                // Snapshot before any write of this call lands.
                let expected = observed
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| self.store.version_of(&key));
                writes.push(GrantWrite {
                    identity_id: identity_id.clone(),
                    access_point_id: access_point_id.clone(),
                    allowed: request.allowed,
                    origin,
                    template_id: request.template_id.clone(),
                    expected_version: Some(expected),
                });
            }
        }

        let operation_id = Uuid::new_v4();
        if request.atomic && !failed.is_empty() {
            tracing::info!(
                %operation_id,
                failing = failed.len(),
                "Atomic bulk rejected before staging"
            );
            return Err(WardenError::BulkAborted { failures: failed });
        }

        let ctx = WriteContext::new(actor, action).with_correlation(operation_id);
        let store = Arc::clone(&self.store);
        let atomic = request.atomic;
        let workers = self.workers;
        let mut commit = tokio::task::spawn_blocking(move || {
            if atomic {
                store.commit_staged(&writes, &ctx)
            } else {
                Ok(store.commit_each(&writes, &ctx, workers))
            }
        })
        .await
        .map_err(|e| WardenError::internal(format!("bulk worker failed: {e}")))??;
        failed.append(&mut commit.failures);

        let mut succeeded: Vec<GrantKey> = commit.changes.iter().map(|c| c.after.key()).collect();
        succeeded.sort();
        failed.sort_by(|a, b| a.key.cmp(&b.key));
        let change_sequence = commit.sequence;

        tracing::info!(
            %operation_id,
            action = action.as_str(),
            actor,
            atomic = request.atomic,
            succeeded = succeeded.len(),
            failed = failed.len(),
            "Bulk operation finished"
        );
        Ok(BulkReport {
            operation_id,
            succeeded,
            failed,
            change_sequence,
        })
    }
}
