//! Grant Store: versioned grant rows keyed by (identity, access point).
//!
//! Each key owns a slot behind its own mutex, so writers to one pair are
//! serialized while unrelated pairs proceed in parallel. A write takes the
//! slot lock, checks the caller's expected version, commits row and audit
//! record to the ledger together, and only then replaces the in-memory row.
//! Reads always see the latest committed row.
//!
//! Multi-row commits lock their slots in key order.
//!
//! Every committed write is published on the change bus before its slot
//! lock is released, so bus sequence order matches version order per key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditRecord};
use crate::bus::{ChangeBus, Delta};
use crate::errors::{PairFailure, Result, WardenError};
use crate::ledger::Ledger;
use crate::model::{
    AccessGrant, AccessPointId, GrantKey, GrantOrigin, GrantWrite, IdentityId, InheritedGrant,
    TemplateId,
};

type Slot = Arc<Mutex<Option<AccessGrant>>>;

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<AccessGrant>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Who is writing and why; copied into every audit record of the write.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub actor: String,
    pub action: AuditAction,
    pub correlation_id: Option<Uuid>,
}

impl WriteContext {
    pub fn new(actor: impl Into<String>, action: AuditAction) -> Self {
        Self {
            actor: actor.into(),
            action,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<AccessGrant>,
    pub after: AccessGrant,
    pub audit_sequence: u64,
}

impl GrantChange {
    fn delta(&self) -> Delta {
        Delta::GrantChanged {
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

/// Result of a multi-row commit.
#[derive(Debug, Default)]
pub struct BatchCommit {
    pub changes: Vec<GrantChange>,
    pub failures: Vec<PairFailure>,
    /// Sequence of the change batch; `None` when nothing was written.
    pub sequence: Option<u64>,
}

/// A row that passed its checks and waits for its ledger commit.
struct PendingRow {
    slot_index: usize,
    before: Option<AccessGrant>,
    after: AccessGrant,
    record: AuditRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_point_id: Option<AccessPointId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<GrantOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
}

impl GrantFilter {
    pub fn matches(&self, grant: &AccessGrant) -> bool {
        self.identity_id
            .as_ref()
            .is_none_or(|id| &grant.identity_id == id)
            && self
                .access_point_id
                .as_ref()
                .is_none_or(|id| &grant.access_point_id == id)
            && self.origin.is_none_or(|o| grant.origin == o)
            && self
                .template_id
                .as_ref()
                .is_none_or(|id| grant.template_id.as_ref() == Some(id))
            && self.allowed.is_none_or(|a| grant.allowed == a)
    }
}

/// Reject writes whose origin and template id disagree.
fn validate_write(write: &GrantWrite) -> Result<()> {
    match (write.origin, &write.template_id) {
        (GrantOrigin::Template, None) => Err(WardenError::validation(format!(
            "template grant on {} has no template id",
            write.key()
        ))),
        (GrantOrigin::Direct | GrantOrigin::ZoneDefault, Some(template)) => {
            Err(WardenError::validation(format!(
                "{} grant on {} cannot carry template id {template}",
                write.origin.as_str(),
                write.key()
            )))
        }
        _ => Ok(()),
    }
}

fn check_version(key: &GrantKey, current: Option<&AccessGrant>, expected: Option<u64>) -> Result<()> {
    let actual = current.map_or(0, |g| g.version);
    match expected {
        Some(expected) if expected != actual => Err(WardenError::Conflict {
            key: key.clone(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Row produced by applying `write` on top of `current`.
///
/// A direct write over a template row keeps the template decision as
/// `inherited`. A template write over a direct row only refreshes
/// `inherited`; the direct decision stays in force.
fn next_row(
    current: Option<&AccessGrant>,
    write: &GrantWrite,
    actor: &str,
    now: DateTime<Utc>,
) -> AccessGrant {
    let mut row = match current {
        Some(existing) => existing.clone(),
        None => AccessGrant {
            grant_id: Uuid::new_v4(),
            identity_id: write.identity_id.clone(),
            access_point_id: write.access_point_id.clone(),
            allowed: false,
            origin: write.origin,
            template_id: None,
            inherited: None,
            version: 0,
            updated_at: now,
            updated_by: actor.to_string(),
        },
    };

    match write.origin {
        GrantOrigin::Direct => {
            if let Some(existing) = current
                && existing.origin == GrantOrigin::Template
            {
                row.inherited = existing
                    .template_id
                    .clone()
                    .map(|template_id| InheritedGrant {
                        allowed: existing.allowed,
                        template_id,
                        applied_at: existing.updated_at,
                    });
            }
            row.origin = GrantOrigin::Direct;
            row.allowed = write.allowed;
            row.template_id = None;
        }
        GrantOrigin::Template => {
            let template_id = write.template_id.clone();
            if current.is_some_and(|g| g.origin == GrantOrigin::Direct) {
                row.inherited = template_id.map(|template_id| InheritedGrant {
                    allowed: write.allowed,
                    template_id,
                    applied_at: now,
                });
            } else {
                row.origin = GrantOrigin::Template;
                row.allowed = write.allowed;
                row.template_id = template_id;
                row.inherited = None;
            }
        }
        GrantOrigin::ZoneDefault => {
            row.origin = GrantOrigin::ZoneDefault;
            row.allowed = write.allowed;
            row.template_id = None;
            row.inherited = None;
        }
    }

    row.version += 1;
    row.updated_at = now;
    row.updated_by = actor.to_string();
    row
}

pub struct GrantStore {
    rows: RwLock<HashMap<GrantKey, Slot>>,
    ledger: Arc<dyn Ledger>,
    bus: ChangeBus,
}

impl GrantStore {
    /// Rebuild the store from the rows already committed to `ledger`.
    pub fn load(ledger: Arc<dyn Ledger>, bus: ChangeBus) -> Result<Self> {
        let rows: HashMap<GrantKey, Slot> = ledger
            .load_grants()?
            .into_iter()
            .map(|g| (g.key(), Arc::new(Mutex::new(Some(g)))))
            .collect();
        tracing::debug!(rows = rows.len(), "Grant store loaded");
        Ok(Self {
            rows: RwLock::new(rows),
            ledger,
            bus,
        })
    }

    fn existing_slot(&self, key: &GrantKey) -> Option<Slot> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot(&self, key: &GrantKey) -> Slot {
        if let Some(slot) = self.existing_slot(key) {
            return slot;
        }
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(rows.entry(key.clone()).or_default())
    }

    pub fn get(&self, key: &GrantKey) -> Option<AccessGrant> {
        self.existing_slot(key).and_then(|slot| lock_slot(&slot).clone())
    }

    /// Like `get`, but an absent row is `NotFound`.
    pub fn find(&self, key: &GrantKey) -> Result<AccessGrant> {
        self.get(key)
            .ok_or_else(|| WardenError::not_found("grant", key))
    }

    /// Current version of `key`, 0 when no row exists.
    pub fn version_of(&self, key: &GrantKey) -> u64 {
        self.get(key).map_or(0, |g| g.version)
    }

    /// Matching rows, ordered by key.
    pub fn list(&self, filter: &GrantFilter) -> impl Iterator<Item = AccessGrant> + use<> {
        let slots: Vec<Slot> = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut grants: Vec<AccessGrant> = slots
            .iter()
            .filter_map(|slot| lock_slot(slot).clone())
            .filter(|g| filter.matches(g))
            .collect();
        grants.sort_by_key(AccessGrant::key);
        grants.into_iter()
    }

    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.iter().filter(|s| lock_slot(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one row under optimistic concurrency.
    ///
    /// `write.expected_version` is the version the caller last saw (0 for
    /// "no row yet"); `None` skips the check. Fails with `Conflict` on a
    /// mismatch and with `Unavailable` if the ledger cannot record the
    /// write, leaving the row untouched in both cases.
    pub fn upsert(&self, write: &GrantWrite, ctx: &WriteContext) -> Result<GrantChange> {
        validate_write(write)?;
        let key = write.key();
        let slot = self.slot(&key);
        let mut current = lock_slot(&slot);
        check_version(&key, current.as_ref(), write.expected_version)?;

        let after = next_row(current.as_ref(), write, &ctx.actor, Utc::now());
        self.commit_one(&mut current, after, ctx)
    }

    /// Drop the direct decision on `key`: revert to the retained template
    /// grant, or to the zone default when none was retained.
    pub fn clear_direct(
        &self,
        key: &GrantKey,
        expected_version: Option<u64>,
        ctx: &WriteContext,
    ) -> Result<GrantChange> {
        let slot = self
            .existing_slot(key)
            .ok_or_else(|| WardenError::not_found("direct grant", key))?;
        let mut current = lock_slot(&slot);
        let Some(row) = current.as_ref().filter(|g| g.origin == GrantOrigin::Direct) else {
            return Err(WardenError::not_found("direct grant", key));
        };
        check_version(key, Some(row), expected_version)?;

        let mut after = row.clone();
        match after.inherited.take() {
            Some(inherited) => {
                after.origin = GrantOrigin::Template;
                after.allowed = inherited.allowed;
                after.template_id = Some(inherited.template_id);
            }
            None => {
                after.origin = GrantOrigin::ZoneDefault;
                after.allowed = false;
                after.template_id = None;
            }
        }
        after.version += 1;
        after.updated_at = Utc::now();
        after.updated_by = ctx.actor.clone();
        self.commit_one(&mut current, after, ctx)
    }

    fn commit_one(
        &self,
        current: &mut MutexGuard<'_, Option<AccessGrant>>,
        after: AccessGrant,
        ctx: &WriteContext,
    ) -> Result<GrantChange> {
        let before = current.as_ref().cloned();
        let record = AuditRecord::grant(
            &ctx.actor,
            ctx.action,
            ctx.correlation_id,
            before.clone(),
            after.clone(),
        );
        let entries = self
            .ledger
            .commit_grants(std::slice::from_ref(&after), vec![record])?;
        let audit_sequence = entries.last().map_or(0, |e| e.sequence);
        tracing::debug!(
            key = %after.key(),
            version = after.version,
            origin = after.origin.as_str(),
            allowed = after.allowed,
            "Grant committed"
        );
        **current = Some(after.clone());
        let change = GrantChange {
            before,
            after,
            audit_sequence,
        };
        self.bus.publish(vec![change.delta()], None);
        Ok(change)
    }

    /// Slots for `keys`, sorted so they can be locked without deadlock.
    fn slots_in_key_order(&self, keys: impl Iterator<Item = GrantKey>) -> Vec<(GrantKey, Slot)> {
        let mut slots: Vec<(GrantKey, Slot)> = keys
            .map(|key| {
                let slot = self.slot(&key);
                (key, slot)
            })
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Publish one batch for `changes` tagged with the write's correlation id.
    fn publish_batch(&self, changes: &[GrantChange], ctx: &WriteContext) -> Option<u64> {
        (!changes.is_empty()).then(|| {
            let deltas = changes.iter().map(GrantChange::delta).collect();
            self.bus.publish(deltas, ctx.correlation_id)
        })
    }

    /// Stage, validate and commit several writes as one unit.
    ///
    /// Every slot is locked (in key order) before any check runs. If any
    /// write fails validation or its version check, nothing is committed and
    /// the error is `BulkAborted` listing every failing pair.
    pub fn commit_staged(&self, writes: &[GrantWrite], ctx: &WriteContext) -> Result<BatchCommit> {
        let mut staged: BTreeMap<GrantKey, &GrantWrite> = BTreeMap::new();
        for write in writes {
            if staged.insert(write.key(), write).is_some() {
                return Err(WardenError::validation(format!(
                    "pair {} appears twice in one commit",
                    write.key()
                )));
            }
        }

        let slots = self.slots_in_key_order(staged.keys().cloned());
        let mut guards: Vec<MutexGuard<'_, Option<AccessGrant>>> =
            slots.iter().map(|(_, slot)| lock_slot(slot)).collect();

        let now = Utc::now();
        let mut failures = Vec::new();
        let mut rows = Vec::with_capacity(slots.len());
        let mut records = Vec::with_capacity(slots.len());
        for ((key, _), guard) in slots.iter().zip(guards.iter()) {
            let Some(write) = staged.get(key) else {
                continue;
            };
            let checked = validate_write(write)
                .and_then(|()| check_version(key, guard.as_ref(), write.expected_version));
            if let Err(err) = checked {
                failures.push(PairFailure::new(key.clone(), &err));
                continue;
            }
            let after = next_row(guard.as_ref(), write, &ctx.actor, now);
            records.push(AuditRecord::grant(
                &ctx.actor,
                ctx.action,
                ctx.correlation_id,
                guard.as_ref().cloned(),
                after.clone(),
            ));
            rows.push(after);
        }
        if !failures.is_empty() {
            tracing::debug!(
                failing = failures.len(),
                staged = slots.len(),
                "Staged commit aborted"
            );
            return Err(WardenError::BulkAborted { failures });
        }

        let entries = self.ledger.commit_grants(&rows, records)?;
        let mut changes = Vec::with_capacity(rows.len());
        for ((guard, after), entry) in guards.iter_mut().zip(rows).zip(entries) {
            let before = guard.replace(after.clone());
            changes.push(GrantChange {
                before,
                after,
                audit_sequence: entry.sequence,
            });
        }
        let sequence = self.publish_batch(&changes, ctx);
        tracing::debug!(rows = changes.len(), ?sequence, "Staged commit applied");
        Ok(BatchCommit {
            changes,
            failures: Vec::new(),
            sequence,
        })
    }

    /// Commit several writes pair by pair: a failing pair is reported and the
    /// rest still commit.
    ///
    /// All slots stay locked in key order until the one change batch is
    /// published. Ledger commits run on up to `workers` threads.
    pub fn commit_each(&self, writes: &[GrantWrite], ctx: &WriteContext, workers: usize) -> BatchCommit {
        let mut staged: BTreeMap<GrantKey, &GrantWrite> = BTreeMap::new();
        let mut failures = Vec::new();
        for write in writes {
            if staged.insert(write.key(), write).is_some() {
                let err = WardenError::validation("pair appears twice in one commit");
                failures.push(PairFailure::new(write.key(), &err));
            }
        }

        let slots = self.slots_in_key_order(staged.keys().cloned());
        let mut guards: Vec<MutexGuard<'_, Option<AccessGrant>>> =
            slots.iter().map(|(_, slot)| lock_slot(slot)).collect();

        let now = Utc::now();
        let mut pending = Vec::with_capacity(slots.len());
        for (slot_index, ((key, _), guard)) in slots.iter().zip(guards.iter()).enumerate() {
            let Some(write) = staged.get(key) else {
                continue;
            };
            let checked = validate_write(write)
                .and_then(|()| check_version(key, guard.as_ref(), write.expected_version));
            if let Err(err) = checked {
                failures.push(PairFailure::new(key.clone(), &err));
                continue;
            }
            let before = guard.as_ref().cloned();
            let after = next_row(before.as_ref(), write, &ctx.actor, now);
            let record = AuditRecord::grant(
                &ctx.actor,
                ctx.action,
                ctx.correlation_id,
                before.clone(),
                after.clone(),
            );
            pending.push(PendingRow {
                slot_index,
                before,
                after,
                record,
            });
        }

        let committed = self.commit_rows(&pending, workers);
        let mut changes = Vec::with_capacity(pending.len());
        for (row, result) in pending.into_iter().zip(committed) {
            match result {
                Ok(audit_sequence) => {
                    if let Some(guard) = guards.get_mut(row.slot_index) {
                        **guard = Some(row.after.clone());
                    }
                    changes.push(GrantChange {
                        before: row.before,
                        after: row.after,
                        audit_sequence,
                    });
                }
                Err(err) => failures.push(PairFailure::new(row.after.key(), &err)),
            }
        }

        let sequence = self.publish_batch(&changes, ctx);
        tracing::debug!(
            rows = changes.len(),
            failing = failures.len(),
            ?sequence,
            "Pairwise commit applied"
        );
        BatchCommit {
            changes,
            failures,
            sequence,
        }
    }

    /// One ledger commit per row, in `pending` order. Returns each row's
    /// audit sequence.
    fn commit_rows(&self, pending: &[PendingRow], workers: usize) -> Vec<Result<u64>> {
        let ledger = self.ledger.as_ref();
        let commit = |rows: &[PendingRow]| -> Vec<Result<u64>> {
            rows.iter()
                .map(|row| {
                    ledger
                        .commit_grants(std::slice::from_ref(&row.after), vec![row.record.clone()])
                        .map(|entries| entries.last().map_or(0, |e| e.sequence))
                })
                .collect()
        };

        let chunk_size = pending.len().div_ceil(workers.max(1)).max(1);
        if pending.len() <= chunk_size {
            return commit(pending);
        }
        let commit = &commit;
        std::thread::scope(|scope| {
            let handles: Vec<_> = pending
                .chunks(chunk_size)
                .map(|chunk| (chunk.len(), scope.spawn(move || commit(chunk))))
                .collect();
            handles
                .into_iter()
                .flat_map(|(len, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        (0..len)
                            .map(|_| Err(WardenError::internal("grant commit worker panicked")))
                            .collect()
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::errors::ErrorCategory;
    use crate::ledger::MemoryLedger;
    use pretty_assertions::assert_eq;

    fn store() -> (GrantStore, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = GrantStore::load(ledger.clone(), ChangeBus::new(64, 64)).expect("load");
        (store, ledger)
    }

    fn ctx() -> WriteContext {
        WriteContext::new("admin", AuditAction::GrantUpsert)
    }

    fn template_write(identity: &str, door: &str, template: &str) -> GrantWrite {
        GrantWrite {
            origin: GrantOrigin::Template,
            template_id: Some(TemplateId::from(template)),
            ..GrantWrite::direct(identity, door, true)
        }
    }

    #[test]
    fn first_write_is_version_one_and_audited() {
        let (store, ledger) = store();
        let change = store
            .upsert(&GrantWrite::direct("u1", "d1", true), &ctx())
            .expect("upsert");
        assert_eq!(change.before, None);
        assert_eq!(change.after.version, 1);
        assert_eq!(change.audit_sequence, 1);
        assert_eq!(ledger.load_grants().expect("load"), vec![change.after]);
        assert_eq!(
            ledger.query_audit(&AuditFilter::default()).expect("audit").len(),
            1
        );
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let (store, _) = store();
        store
            .upsert(&GrantWrite::direct("u1", "d1", true), &ctx())
            .expect("upsert");

        let stale = GrantWrite {
            expected_version: Some(0),
            ..GrantWrite::direct("u1", "d1", false)
        };
        let err = store.upsert(&stale, &ctx()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);

        let fresh = GrantWrite {
            expected_version: Some(1),
            ..GrantWrite::direct("u1", "d1", false)
        };
        let change = store.upsert(&fresh, &ctx()).expect("upsert");
        assert_eq!(change.after.version, 2);
        assert!(!change.after.allowed);
    }

    #[test]
    fn direct_write_shadows_template_and_clear_restores_it() {
        let (store, _) = store();
        store
            .upsert(&template_write("u1", "d1", "manager"), &ctx())
            .expect("template");
        let direct = store
            .upsert(&GrantWrite::direct("u1", "d1", false), &ctx())
            .expect("direct");
        assert_eq!(direct.after.origin, GrantOrigin::Direct);
        let inherited = direct.after.inherited.clone().expect("inherited");
        assert!(inherited.allowed);
        assert_eq!(inherited.template_id.as_str(), "manager");

        let cleared = store
            .clear_direct(&direct.after.key(), None, &ctx())
            .expect("clear");
        assert_eq!(cleared.after.origin, GrantOrigin::Template);
        assert!(cleared.after.allowed);
        assert_eq!(cleared.after.version, 3);
        assert_eq!(cleared.after.grant_id, direct.after.grant_id);
    }

    #[test]
    fn template_over_direct_only_refreshes_provenance() {
        let (store, _) = store();
        store
            .upsert(&GrantWrite::direct("u1", "d1", false), &ctx())
            .expect("direct");
        let change = store
            .upsert(&template_write("u1", "d1", "manager"), &ctx())
            .expect("template");
        assert_eq!(change.after.origin, GrantOrigin::Direct);
        assert!(!change.after.allowed);
        assert!(change.after.inherited.is_some());
    }

    #[test]
    fn clear_without_retained_template_falls_back_to_zone_default() {
        let (store, _) = store();
        let key = GrantKey::new(IdentityId::from("u1"), AccessPointId::from("d1"));
        assert_eq!(
            store.clear_direct(&key, None, &ctx()).unwrap_err().category(),
            ErrorCategory::NotFound
        );

        store
            .upsert(&GrantWrite::direct("u1", "d1", true), &ctx())
            .expect("direct");
        let cleared = store.clear_direct(&key, Some(1), &ctx()).expect("clear");
        assert_eq!(cleared.after.origin, GrantOrigin::ZoneDefault);
    }

    #[test]
    fn origin_and_template_id_must_agree() {
        let (store, _) = store();
        let bad = GrantWrite {
            origin: GrantOrigin::Template,
            ..GrantWrite::direct("u1", "d1", true)
        };
        assert_eq!(
            store.upsert(&bad, &ctx()).unwrap_err().category(),
            ErrorCategory::Validation
        );
        assert!(store.is_empty());
    }

    #[test]
    fn unavailable_ledger_leaves_row_untouched() {
        let (store, ledger) = store();
        store
            .upsert(&GrantWrite::direct("u1", "d1", true), &ctx())
            .expect("upsert");
        ledger.set_available(false);
        let err = store
            .upsert(&GrantWrite::direct("u1", "d1", false), &ctx())
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Unavailable);
        let key = GrantKey::new(IdentityId::from("u1"), AccessPointId::from("d1"));
        let row = store.find(&key).expect("row");
        assert!(row.allowed);
        assert_eq!(row.version, 1);
    }

    #[test]
    fn staged_commit_is_all_or_nothing() {
        let (store, _) = store();
        store
            .upsert(&GrantWrite::direct("u1", "d2", true), &ctx())
            .expect("seed");

        let writes = vec![
            GrantWrite {
                expected_version: Some(0),
                ..GrantWrite::direct("u1", "d1", true)
            },
            GrantWrite {
                expected_version: Some(0),
                ..GrantWrite::direct("u1", "d2", false)
            },
        ];
        let err = store.commit_staged(&writes, &ctx()).unwrap_err();
        let WardenError::BulkAborted { failures } = err else {
            panic!("expected BulkAborted");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key.access_point_id.as_str(), "d2");
        assert_eq!(store.len(), 1);

        let writes = vec![
            GrantWrite::direct("u1", "d1", true),
            GrantWrite::direct("u1", "d2", false),
        ];
        let commit = store.commit_staged(&writes, &ctx()).expect("commit");
        assert_eq!(commit.changes.len(), 2);
        assert!(commit.sequence.is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn pairwise_commit_keeps_going_past_a_failing_pair() {
        let (store, ledger) = store();
        store
            .upsert(&GrantWrite::direct("u1", "d2", true), &ctx())
            .expect("seed");

        let mut writes: Vec<GrantWrite> = ["d1", "d3", "d4", "d5"]
            .iter()
            .map(|door| GrantWrite::direct("u1", door, true))
            .collect();
        writes.push(GrantWrite {
            expected_version: Some(0),
            ..GrantWrite::direct("u1", "d2", false)
        });
        let commit = store.commit_each(&writes, &ctx().with_correlation(Uuid::new_v4()), 2);

        assert_eq!(commit.changes.len(), 4);
        assert_eq!(commit.failures.len(), 1);
        assert_eq!(commit.failures[0].category, ErrorCategory::Conflict);
        assert_eq!(store.len(), 5);
        assert_eq!(ledger.load_grants().expect("load").len(), 5);
        let audit_sequences: std::collections::BTreeSet<u64> =
            commit.changes.iter().map(|c| c.audit_sequence).collect();
        assert_eq!(audit_sequences.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn published_versions_follow_commit_order_under_contention() {
        const WRITERS: usize = 8;
        const WRITES_EACH: usize = 100;
        let bus = ChangeBus::new(2048, 2048);
        let store = Arc::new(
            GrantStore::load(Arc::new(MemoryLedger::new()), bus.clone()).expect("load"),
        );
        let mut sub = bus.subscribe();

        let mut handles = Vec::new();
        for writer in 0..WRITERS {
            let store = Arc::clone(&store);
            handles.push(tokio::task::spawn_blocking(move || {
                for i in 0..WRITES_EACH {
                    let write = GrantWrite::direct("u1", "d1", (writer + i) % 2 == 0);
                    store.upsert(&write, &ctx()).expect("upsert");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("writer");
        }

        let mut last_version = 0;
        for _ in 0..WRITERS * WRITES_EACH {
            let batch = sub.next().await.expect("batch");
            let [Delta::GrantChanged { after, .. }] = batch.deltas.as_slice() else {
                panic!("unexpected batch {batch:?}");
            };
            assert!(
                after.version > last_version,
                "version {} published after {last_version}",
                after.version
            );
            last_version = after.version;
        }
        assert_eq!(last_version, (WRITERS * WRITES_EACH) as u64);
    }

    #[test]
    fn load_rebuilds_from_ledger_and_list_filters() {
        let ledger = Arc::new(MemoryLedger::new());
        {
            let store = GrantStore::load(ledger.clone(), ChangeBus::new(16, 16)).expect("load");
            store
                .upsert(&GrantWrite::direct("u1", "d1", true), &ctx())
                .expect("upsert");
            store
                .upsert(&template_write("u2", "d1", "manager"), &ctx())
                .expect("upsert");
        }
        let store = GrantStore::load(ledger, ChangeBus::new(16, 16)).expect("reload");
        assert_eq!(store.len(), 2);
        let templated: Vec<AccessGrant> = store
            .list(&GrantFilter {
                origin: Some(GrantOrigin::Template),
                ..Default::default()
            })
            .collect();
        assert_eq!(templated.len(), 1);
        assert_eq!(templated[0].identity_id.as_str(), "u2");
    }
}
