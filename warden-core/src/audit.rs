//! Append-only audit trail.
//!
//! Entries are sequenced by the ledger at commit time. Grant and emergency
//! mutations hand their records to the ledger together with the state they
//! change, so an entry exists exactly when the mutation does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::emergency::EmergencyState;
use crate::errors::Result;
use crate::ledger::Ledger;
use crate::model::{AccessGrant, AccessPointId, IdentityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GrantUpsert,
    GrantClearDirect,
    BulkApply,
    TemplateApply,
    EmergencyTransition,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrantUpsert => "grant_upsert",
            Self::GrantClearDirect => "grant_clear_direct",
            Self::BulkApply => "bulk_apply",
            Self::TemplateApply => "template_apply",
            Self::EmergencyTransition => "emergency_transition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant_upsert" => Some(Self::GrantUpsert),
            "grant_clear_direct" => Some(Self::GrantClearDirect),
            "bulk_apply" => Some(Self::BulkApply),
            "template_apply" => Some(Self::TemplateApply),
            "emergency_transition" => Some(Self::EmergencyTransition),
            _ => None,
        }
    }
}

/// Before/after snapshot of what an entry changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditSubject {
    Grant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<AccessGrant>,
        after: AccessGrant,
    },
    Emergency {
        from: EmergencyState,
        to: EmergencyState,
    },
}

/// An audit record before the ledger assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor: String,
    pub action: AuditAction,
    pub recorded_at: DateTime<Utc>,
    /// Shared by every record of one bulk or template operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub subject: AuditSubject,
}

impl AuditRecord {
    pub fn grant(
        actor: &str,
        action: AuditAction,
        correlation_id: Option<Uuid>,
        before: Option<AccessGrant>,
        after: AccessGrant,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            recorded_at: after.updated_at,
            correlation_id,
            subject: AuditSubject::Grant { before, after },
        }
    }

    pub fn emergency(actor: &str, from: EmergencyState, to: EmergencyState) -> Self {
        Self {
            actor: actor.to_string(),
            action: AuditAction::EmergencyTransition,
            recorded_at: Utc::now(),
            correlation_id: None,
            subject: AuditSubject::Emergency { from, to },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    #[serde(flatten)]
    pub record: AuditRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<AuditAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_point_id: Option<AccessPointId>,
    /// Only entries with a sequence strictly greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(since) = self.since_sequence
            && entry.sequence <= since
        {
            return false;
        }
        if let Some(actor) = &self.actor
            && &entry.record.actor != actor
        {
            return false;
        }
        if let Some(action) = self.action
            && entry.record.action != action
        {
            return false;
        }
        if self.identity_id.is_none() && self.access_point_id.is_none() {
            return true;
        }
        match &entry.record.subject {
            AuditSubject::Grant { after, .. } => {
                self.identity_id
                    .as_ref()
                    .is_none_or(|id| &after.identity_id == id)
                    && self
                        .access_point_id
                        .as_ref()
                        .is_none_or(|id| &after.access_point_id == id)
            }
            AuditSubject::Emergency { .. } => false,
        }
    }
}

/// Read-only front for the ledger's audit table. Records are written by the
/// ledger commits that carry them.
pub struct AuditLog {
    ledger: Arc<dyn Ledger>,
}

impl AuditLog {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Matching entries in ascending sequence order.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.ledger.query_audit(filter)
    }

    /// Sequence of the newest entry, 0 for an empty log.
    pub fn last_sequence(&self) -> Result<u64> {
        self.ledger.last_audit_sequence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use crate::ledger::MemoryLedger;
    use crate::model::GrantOrigin;
    use pretty_assertions::assert_eq;

    fn grant(identity: &str, door: &str) -> AccessGrant {
        AccessGrant {
            grant_id: Uuid::new_v4(),
            identity_id: IdentityId::from(identity),
            access_point_id: AccessPointId::from(door),
            allowed: true,
            origin: GrantOrigin::Direct,
            template_id: None,
            inherited: None,
            version: 1,
            updated_at: Utc::now(),
            updated_by: "admin".to_string(),
        }
    }

    fn record(identity: &str, door: &str) -> AuditRecord {
        AuditRecord::grant(
            "admin",
            AuditAction::GrantUpsert,
            None,
            None,
            grant(identity, door),
        )
    }

    #[test]
    fn last_sequence_tracks_the_newest_entry() {
        let ledger = Arc::new(MemoryLedger::new());
        let log = AuditLog::new(ledger.clone());
        assert_eq!(log.last_sequence().expect("seq"), 0);
        let entries = ledger
            .append_audit(vec![record("u1", "d1"), record("u2", "d1")])
            .expect("append");
        assert!(entries[1].sequence > entries[0].sequence);
        assert_eq!(log.last_sequence().expect("seq"), entries[1].sequence);
    }

    #[test]
    fn filter_by_pair_and_since() {
        let ledger = Arc::new(MemoryLedger::new());
        let log = AuditLog::new(ledger.clone());
        ledger
            .append_audit(vec![record("u1", "d1"), record("u1", "d2"), record("u2", "d1")])
            .expect("append");

        let by_identity = log
            .query(&AuditFilter {
                identity_id: Some(IdentityId::from("u1")),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(by_identity.len(), 2);

        let after_first = log
            .query(&AuditFilter {
                since_sequence: Some(by_identity[0].sequence),
                access_point_id: Some(AccessPointId::from("d1")),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(after_first.len(), 1);
        let AuditSubject::Grant { after, .. } = &after_first[0].record.subject else {
            panic!("expected grant subject");
        };
        assert_eq!(after.identity_id.as_str(), "u2");
    }

    #[test]
    fn reads_fail_when_storage_is_down() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_available(false);
        let log = AuditLog::new(ledger);
        let err = log.query(&AuditFilter::default()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Unavailable);
        assert!(log.last_sequence().is_err());
    }
}
