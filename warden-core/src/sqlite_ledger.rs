//! SQLite-backed ledger.
//!
//! Every commit runs in one transaction: the changed rows and their audit
//! entries land together or not at all. Audit sequence numbers come from the
//! `audit_log` AUTOINCREMENT key.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditRecord, AuditSubject};
use crate::emergency::{EmergencyPhase, EmergencyScope, EmergencyState};
use crate::errors::{Result, WardenError};
use crate::ledger::Ledger;
use crate::model::{AccessGrant, GrantOrigin, InheritedGrant};

/// Embedded schema SQL from WARDEN_SCHEMA.sql
const SCHEMA_SQL: &str = include_str!("../WARDEN_SCHEMA.sql");

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> WardenError + '_ {
    move |e| WardenError::unavailable_with_source(context.to_string(), e)
}

fn corrupt(what: &str, value: &str) -> WardenError {
    WardenError::unavailable(format!("corrupt {what} in ledger: {value:?}"))
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", value))
}

/// Raw `grants` row as stored.
struct GrantRow {
    identity_id: String,
    access_point_id: String,
    grant_id: String,
    allowed: bool,
    origin: String,
    template_id: Option<String>,
    inherited_allowed: Option<bool>,
    inherited_template_id: Option<String>,
    inherited_applied_at: Option<String>,
    version: i64,
    updated_at: String,
    updated_by: String,
}

impl GrantRow {
    fn into_grant(self) -> Result<AccessGrant> {
        let inherited = match (
            self.inherited_allowed,
            self.inherited_template_id,
            self.inherited_applied_at,
        ) {
            (Some(allowed), Some(template_id), Some(applied_at)) => Some(InheritedGrant {
                allowed,
                template_id: template_id.into(),
                applied_at: parse_ts(&applied_at)?,
            }),
            _ => None,
        };
        Ok(AccessGrant {
            grant_id: Uuid::parse_str(&self.grant_id)
                .map_err(|_| corrupt("grant id", &self.grant_id))?,
            identity_id: self.identity_id.into(),
            access_point_id: self.access_point_id.into(),
            allowed: self.allowed,
            origin: GrantOrigin::parse(&self.origin).ok_or_else(|| corrupt("origin", &self.origin))?,
            template_id: self.template_id.map(Into::into),
            inherited,
            version: u64::try_from(self.version)
                .map_err(|_| corrupt("version", &self.version.to_string()))?,
            updated_at: parse_ts(&self.updated_at)?,
            updated_by: self.updated_by,
        })
    }
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WardenError::unavailable_with_source(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            WardenError::unavailable_with_source(
                format!("failed to open db at {}", path.display()),
                e,
            )
        })?;
        Self::apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "Ledger DB initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("failed to open in-memory db"))?;
        Self::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(db_err("failed to apply schema"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_audit(tx: &Transaction<'_>, records: Vec<AuditRecord>) -> Result<Vec<AuditEntry>> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let (identity_id, access_point_id) = match &record.subject {
                AuditSubject::Grant { after, .. } => (
                    Some(after.identity_id.to_string()),
                    Some(after.access_point_id.to_string()),
                ),
                AuditSubject::Emergency { .. } => (None, None),
            };
            let subject_json = serde_json::to_string(&record.subject).map_err(|e| {
                WardenError::unavailable_with_source("failed to encode audit subject", e)
            })?;
            tx.execute(
                r#"
                INSERT INTO audit_log
                    (actor, action, recorded_at, correlation_id, identity_id, access_point_id, subject_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.actor,
                    record.action.as_str(),
                    record.recorded_at.to_rfc3339(),
                    record.correlation_id.map(|id| id.to_string()),
                    identity_id,
                    access_point_id,
                    subject_json,
                ],
            )
            .map_err(db_err("failed to append audit entry"))?;
            let sequence = u64::try_from(tx.last_insert_rowid()).unwrap_or_default();
            entries.push(AuditEntry { sequence, record });
        }
        Ok(entries)
    }
}

impl Ledger for SqliteLedger {
    fn commit_grants(
        &self,
        rows: &[AccessGrant],
        audit: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEntry>> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        for row in rows {
            let inherited = row.inherited.as_ref();
            tx.execute(
                r#"
                INSERT INTO grants
                    (identity_id, access_point_id, grant_id, allowed, origin, template_id,
                     inherited_allowed, inherited_template_id, inherited_applied_at,
                     version, updated_at, updated_by)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT (identity_id, access_point_id) DO UPDATE SET
                    grant_id = excluded.grant_id,
                    allowed = excluded.allowed,
                    origin = excluded.origin,
                    template_id = excluded.template_id,
                    inherited_allowed = excluded.inherited_allowed,
                    inherited_template_id = excluded.inherited_template_id,
                    inherited_applied_at = excluded.inherited_applied_at,
                    version = excluded.version,
                    updated_at = excluded.updated_at,
                    updated_by = excluded.updated_by
                "#,
                params![
                    row.identity_id.as_str(),
                    row.access_point_id.as_str(),
                    row.grant_id.to_string(),
                    row.allowed,
                    row.origin.as_str(),
                    row.template_id.as_ref().map(|t| t.as_str()),
                    inherited.map(|i| i.allowed),
                    inherited.map(|i| i.template_id.as_str()),
                    inherited.map(|i| i.applied_at.to_rfc3339()),
                    i64::try_from(row.version).unwrap_or(i64::MAX),
                    row.updated_at.to_rfc3339(),
                    row.updated_by,
                ],
            )
            .map_err(db_err("failed to write grant"))?;
        }
        let entries = Self::insert_audit(&tx, audit)?;
        tx.commit().map_err(db_err("failed to commit grants"))?;
        Ok(entries)
    }

    fn commit_emergency(
        &self,
        state: &EmergencyState,
        audit: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEntry>> {
        let scope_json = serde_json::to_string(&state.scope)
            .map_err(|e| WardenError::unavailable_with_source("failed to encode scope", e))?;
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        tx.execute(
            r#"
            INSERT INTO emergency_state
                (id, phase, scope_json, evacuation_mode, activated_at, activated_by, generation, changed_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (id) DO UPDATE SET
                phase = excluded.phase,
                scope_json = excluded.scope_json,
                evacuation_mode = excluded.evacuation_mode,
                activated_at = excluded.activated_at,
                activated_by = excluded.activated_by,
                generation = excluded.generation,
                changed_at = excluded.changed_at
            "#,
            params![
                state.phase.as_str(),
                scope_json,
                state.evacuation_mode,
                state.activated_at.map(|t| t.to_rfc3339()),
                state.activated_by,
                i64::try_from(state.generation).unwrap_or(i64::MAX),
                state.changed_at.to_rfc3339(),
            ],
        )
        .map_err(db_err("failed to write emergency state"))?;
        let entries = Self::insert_audit(&tx, audit)?;
        tx.commit()
            .map_err(db_err("failed to commit emergency state"))?;
        Ok(entries)
    }

    fn append_audit(&self, audit: Vec<AuditRecord>) -> Result<Vec<AuditEntry>> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        let entries = Self::insert_audit(&tx, audit)?;
        tx.commit().map_err(db_err("failed to commit audit"))?;
        Ok(entries)
    }

    fn load_grants(&self) -> Result<Vec<AccessGrant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT identity_id, access_point_id, grant_id, allowed, origin, template_id,
                       inherited_allowed, inherited_template_id, inherited_applied_at,
                       version, updated_at, updated_by
                FROM grants
                ORDER BY identity_id, access_point_id
                "#,
            )
            .map_err(db_err("failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GrantRow {
                    identity_id: row.get(0)?,
                    access_point_id: row.get(1)?,
                    grant_id: row.get(2)?,
                    allowed: row.get(3)?,
                    origin: row.get(4)?,
                    template_id: row.get(5)?,
                    inherited_allowed: row.get(6)?,
                    inherited_template_id: row.get(7)?,
                    inherited_applied_at: row.get(8)?,
                    version: row.get(9)?,
                    updated_at: row.get(10)?,
                    updated_by: row.get(11)?,
                })
            })
            .map_err(db_err("failed to load grants"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("failed to read grant row"))?;
        rows.into_iter().map(GrantRow::into_grant).collect()
    }

    fn load_emergency(&self) -> Result<Option<EmergencyState>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                r#"
                SELECT phase, scope_json, evacuation_mode, activated_at, activated_by,
                       generation, changed_at
                FROM emergency_state
                WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("failed to load emergency state"))?;

        let Some((phase, scope_json, evacuation_mode, activated_at, activated_by, generation, changed_at)) =
            raw
        else {
            return Ok(None);
        };
        let scope: EmergencyScope =
            serde_json::from_str(&scope_json).map_err(|_| corrupt("scope", &scope_json))?;
        Ok(Some(EmergencyState {
            phase: EmergencyPhase::parse(&phase).ok_or_else(|| corrupt("phase", &phase))?,
            scope,
            evacuation_mode,
            activated_at: activated_at.as_deref().map(parse_ts).transpose()?,
            activated_by,
            generation: u64::try_from(generation)
                .map_err(|_| corrupt("generation", &generation.to_string()))?,
            changed_at: parse_ts(&changed_at)?,
        }))
    }

    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT sequence, actor, action, recorded_at, correlation_id, subject_json
                FROM audit_log
                WHERE sequence > ?1
                  AND (?2 IS NULL OR actor = ?2)
                  AND (?3 IS NULL OR action = ?3)
                  AND (?4 IS NULL OR identity_id = ?4)
                  AND (?5 IS NULL OR access_point_id = ?5)
                ORDER BY sequence
                LIMIT ?6
                "#,
            )
            .map_err(db_err("failed to prepare query"))?;
        let since = filter
            .since_sequence
            .map_or(0, |s| i64::try_from(s).unwrap_or(i64::MAX));
        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let raw = stmt
            .query_map(
                params![
                    since,
                    filter.actor,
                    filter.action.map(|a| a.as_str()),
                    filter.identity_id.as_ref().map(|id| id.as_str()),
                    filter.access_point_id.as_ref().map(|id| id.as_str()),
                    limit,
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map_err(db_err("failed to query audit log"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("failed to read audit row"))?;

        raw.into_iter()
            .map(
                |(sequence, actor, action, recorded_at, correlation_id, subject_json)| {
                    let correlation_id = correlation_id
                        .map(|id| Uuid::parse_str(&id).map_err(|_| corrupt("correlation id", &id)))
                        .transpose()?;
                    Ok(AuditEntry {
                        sequence: u64::try_from(sequence).unwrap_or_default(),
                        record: AuditRecord {
                            actor,
                            action: AuditAction::parse(&action)
                                .ok_or_else(|| corrupt("audit action", &action))?,
                            recorded_at: parse_ts(&recorded_at)?,
                            correlation_id,
                            subject: serde_json::from_str(&subject_json)
                                .map_err(|_| corrupt("audit subject", &subject_json))?,
                        },
                    })
                },
            )
            .collect()
    }

    fn last_audit_sequence(&self) -> Result<u64> {
        let conn = self.conn();
        let max: Option<i64> = conn
            .query_row("SELECT MAX(sequence) FROM audit_log", [], |row| row.get(0))
            .map_err(db_err("failed to read audit sequence"))?;
        Ok(max.and_then(|m| u64::try_from(m).ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessPointId, IdentityId, TemplateId, ZoneId};
    use pretty_assertions::assert_eq;

    fn grant() -> AccessGrant {
        AccessGrant {
            grant_id: Uuid::new_v4(),
            identity_id: IdentityId::from("u1"),
            access_point_id: AccessPointId::from("d1"),
            allowed: false,
            origin: GrantOrigin::Direct,
            template_id: None,
            inherited: Some(InheritedGrant {
                allowed: true,
                template_id: TemplateId::from("manager"),
                applied_at: Utc::now(),
            }),
            version: 2,
            updated_at: Utc::now(),
            updated_by: "admin".to_string(),
        }
    }

    #[test]
    fn grants_and_audit_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger").join("warden.db");
        let row = grant();
        {
            let ledger = SqliteLedger::open(&path).expect("open");
            let entries = ledger
                .commit_grants(
                    std::slice::from_ref(&row),
                    vec![AuditRecord::grant(
                        "admin",
                        AuditAction::GrantUpsert,
                        Some(Uuid::new_v4()),
                        None,
                        row.clone(),
                    )],
                )
                .expect("commit");
            assert_eq!(entries[0].sequence, 1);
        }

        let ledger = SqliteLedger::open(&path).expect("reopen");
        assert_eq!(ledger.load_grants().expect("load"), vec![row]);

        let audit = ledger
            .query_audit(&AuditFilter {
                identity_id: Some(IdentityId::from("u1")),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(audit.len(), 1);
        assert!(audit[0].record.correlation_id.is_some());
        assert_eq!(ledger.last_audit_sequence().expect("seq"), 1);
    }

    #[test]
    fn emergency_singleton_upserts() {
        let ledger = SqliteLedger::open_in_memory().expect("open");
        assert_eq!(ledger.load_emergency().expect("load"), None);

        let mut state = EmergencyState::normal();
        ledger.commit_emergency(&state, Vec::new()).expect("commit");
        let from = state.clone();
        state.phase = EmergencyPhase::Active;
        state.scope = EmergencyScope::Zones([ZoneId::from("z1")].into_iter().collect());
        state.generation = 1;
        ledger
            .commit_emergency(&state, vec![AuditRecord::emergency("guard", from, state.clone())])
            .expect("commit");

        let loaded = ledger.load_emergency().expect("load").expect("state");
        assert_eq!(loaded.phase, EmergencyPhase::Active);
        assert_eq!(loaded.scope, state.scope);
        assert_eq!(loaded.generation, 1);

        // Emergency entries carry no pair and drop out of pair filters.
        let by_door = ledger
            .query_audit(&AuditFilter {
                access_point_id: Some(AccessPointId::from("d1")),
                ..Default::default()
            })
            .expect("query");
        assert!(by_door.is_empty());
        let all = ledger.query_audit(&AuditFilter::default()).expect("query");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn audit_query_honours_since_and_limit() {
        let ledger = SqliteLedger::open_in_memory().expect("open");
        let row = grant();
        for _ in 0..5 {
            ledger
                .append_audit(vec![AuditRecord::grant(
                    "admin",
                    AuditAction::BulkApply,
                    None,
                    None,
                    row.clone(),
                )])
                .expect("append");
        }
        let page = ledger
            .query_audit(&AuditFilter {
                since_sequence: Some(2),
                limit: Some(2),
                action: Some(AuditAction::BulkApply),
                ..Default::default()
            })
            .expect("query");
        let sequences: Vec<u64> = page.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
    }
}
