//! Durable state behind the Grant Store, the emergency singleton and the audit
//! trail.
//!
//! A commit carries both the changed state and its audit records. Backends
//! must write them as one unit: either everything lands or nothing does and
//! the caller gets `Unavailable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::audit::{AuditEntry, AuditFilter, AuditRecord};
use crate::emergency::EmergencyState;
use crate::errors::{Result, WardenError};
use crate::model::{AccessGrant, GrantKey};

pub trait Ledger: Send + Sync {
    /// Persist grant rows (full row replacement by key) with their audit records.
    fn commit_grants(&self, rows: &[AccessGrant], audit: Vec<AuditRecord>)
    -> Result<Vec<AuditEntry>>;

    /// Persist the emergency singleton with its audit records.
    fn commit_emergency(
        &self,
        state: &EmergencyState,
        audit: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEntry>>;

    fn append_audit(&self, audit: Vec<AuditRecord>) -> Result<Vec<AuditEntry>>;

    fn load_grants(&self) -> Result<Vec<AccessGrant>>;

    fn load_emergency(&self) -> Result<Option<EmergencyState>>;

    /// Matching audit entries, ascending by sequence, capped by `filter.limit`.
    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Highest sequence assigned so far, 0 when the trail is empty.
    fn last_audit_sequence(&self) -> Result<u64>;
}

#[derive(Default)]
struct MemoryState {
    grants: BTreeMap<GrantKey, AccessGrant>,
    emergency: Option<EmergencyState>,
    audit: Vec<AuditEntry>,
    next_sequence: u64,
}

impl MemoryState {
    fn sequence(&mut self, records: Vec<AuditRecord>) -> Vec<AuditEntry> {
        let entries: Vec<AuditEntry> = records
            .into_iter()
            .map(|record| {
                self.next_sequence += 1;
                AuditEntry {
                    sequence: self.next_sequence,
                    record,
                }
            })
            .collect();
        self.audit.extend(entries.iter().cloned());
        entries
    }
}

/// In-process ledger. The availability switch simulates a storage outage.
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WardenError::unavailable("memory ledger marked unavailable"))
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        self.ensure_available()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state))
    }
}

impl Ledger for MemoryLedger {
    fn commit_grants(
        &self,
        rows: &[AccessGrant],
        audit: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEntry>> {
        self.with_state(|state| {
            for row in rows {
                state.grants.insert(row.key(), row.clone());
            }
            state.sequence(audit)
        })
    }

    fn commit_emergency(
        &self,
        emergency: &EmergencyState,
        audit: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEntry>> {
        self.with_state(|state| {
            state.emergency = Some(emergency.clone());
            state.sequence(audit)
        })
    }

    fn append_audit(&self, audit: Vec<AuditRecord>) -> Result<Vec<AuditEntry>> {
        self.with_state(|state| state.sequence(audit))
    }

    fn load_grants(&self) -> Result<Vec<AccessGrant>> {
        self.with_state(|state| state.grants.values().cloned().collect())
    }

    fn load_emergency(&self) -> Result<Option<EmergencyState>> {
        self.with_state(|state| state.emergency.clone())
    }

    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.with_state(|state| {
            state
                .audit
                .iter()
                .filter(|e| filter.matches(e))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }

    fn last_audit_sequence(&self) -> Result<u64> {
        self.with_state(|state| state.next_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::model::{AccessPointId, GrantOrigin, IdentityId};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn row(version: u64) -> AccessGrant {
        AccessGrant {
            grant_id: Uuid::new_v4(),
            identity_id: IdentityId::from("u1"),
            access_point_id: AccessPointId::from("d1"),
            allowed: true,
            origin: GrantOrigin::Direct,
            template_id: None,
            inherited: None,
            version,
            updated_at: Utc::now(),
            updated_by: "admin".to_string(),
        }
    }

    #[test]
    fn commit_replaces_rows_by_key() {
        let ledger = MemoryLedger::new();
        let first = row(1);
        ledger
            .commit_grants(
                std::slice::from_ref(&first),
                vec![AuditRecord::grant("admin", AuditAction::GrantUpsert, None, None, first.clone())],
            )
            .expect("commit");
        let second = row(2);
        ledger
            .commit_grants(
                std::slice::from_ref(&second),
                vec![AuditRecord::grant(
                    "admin",
                    AuditAction::GrantUpsert,
                    None,
                    Some(first),
                    second.clone(),
                )],
            )
            .expect("commit");

        let rows = ledger.load_grants().expect("load");
        assert_eq!(rows, vec![second]);
        assert_eq!(ledger.last_audit_sequence().expect("seq"), 2);
    }

    #[test]
    fn unavailable_ledger_commits_nothing() {
        let ledger = MemoryLedger::new();
        ledger.set_available(false);
        let r = row(1);
        let err = ledger
            .commit_grants(
                std::slice::from_ref(&r),
                vec![AuditRecord::grant("admin", AuditAction::GrantUpsert, None, None, r.clone())],
            )
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));

        ledger.set_available(true);
        assert!(ledger.load_grants().expect("load").is_empty());
        assert_eq!(ledger.last_audit_sequence().expect("seq"), 0);
    }
}
