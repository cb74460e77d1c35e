//! Domain types shared by every component.
//!
//! Directory-owned records (identities, access points, zones, templates) are
//! read-only here. Grant rows and door state are owned by the core.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque identity (badge holder) id from the directory.
    IdentityId
);
string_id!(
    /// Opaque access point (door) id from the directory.
    AccessPointId
);
string_id!(ZoneId);
string_id!(TemplateId);

// ─────────────────────────────────────────────────────────────────────────────
// Directory records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: IdentityStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub id: AccessPointId,
    pub zone_id: ZoneId,
    #[serde(default)]
    pub name: String,
    /// Kept passable during an evacuation-mode lockdown.
    #[serde(default)]
    pub is_exit_route: bool,
}

/// Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZonePolicy {
    Allow,
    Deny,
}

impl ZonePolicy {
    pub fn allows(self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub security_level: SecurityLevel,
    pub default_policy: ZonePolicy,
}

/// Named reusable bundle of access points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    #[serde(default)]
    pub name: String,
    pub access_point_ids: BTreeSet<AccessPointId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Grants
// ─────────────────────────────────────────────────────────────────────────────

/// Row key: at most one grant row exists per pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
}

impl GrantKey {
    pub fn new(identity_id: IdentityId, access_point_id: AccessPointId) -> Self {
        Self {
            identity_id,
            access_point_id,
        }
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity_id, self.access_point_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOrigin {
    Direct,
    Template,
    ZoneDefault,
}

impl GrantOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Template => "template",
            Self::ZoneDefault => "zone_default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "template" => Some(Self::Template),
            "zone_default" => Some(Self::ZoneDefault),
            _ => None,
        }
    }
}

/// Template-derived decision shadowed by a direct grant on the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritedGrant {
    pub allowed: bool,
    pub template_id: TemplateId,
    pub applied_at: DateTime<Utc>,
}

/// Versioned grant row. Never deleted; revocation sets `allowed = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub grant_id: Uuid,
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
    pub allowed: bool,
    pub origin: GrantOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    /// Set while `origin == Direct` and a template grant was shadowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited: Option<InheritedGrant>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl AccessGrant {
    pub fn key(&self) -> GrantKey {
        GrantKey::new(self.identity_id.clone(), self.access_point_id.clone())
    }
}

/// A single upsert as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantWrite {
    pub identity_id: IdentityId,
    pub access_point_id: AccessPointId,
    pub allowed: bool,
    pub origin: GrantOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<TemplateId>,
    /// Version last observed by the caller; `Some(0)` means "no row yet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl GrantWrite {
    pub fn direct(identity_id: &str, access_point_id: &str, allowed: bool) -> Self {
        Self {
            identity_id: IdentityId::from(identity_id),
            access_point_id: AccessPointId::from(access_point_id),
            allowed,
            origin: GrantOrigin::Direct,
            template_id: None,
            expected_version: None,
        }
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(self.identity_id.clone(), self.access_point_id.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decisions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    Direct,
    Template,
    ZoneDefault,
    IdentityInactive,
    Emergency,
    EmergencyEvacuation,
}

impl From<GrantOrigin> for DecisionOrigin {
    fn from(origin: GrantOrigin) -> Self {
        match origin {
            GrantOrigin::Direct => Self::Direct,
            GrantOrigin::Template => Self::Template,
            GrantOrigin::ZoneDefault => Self::ZoneDefault,
        }
    }
}

/// Effective access decision for one (identity, access point) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub origin: DecisionOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_grant_id: Option<Uuid>,
}

impl Decision {
    pub fn new(allowed: bool, origin: DecisionOrigin) -> Self {
        Self {
            allowed,
            origin,
            evidence_grant_id: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Doors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorState {
    Locked,
    Unlocked,
    ForcedOpen,
    HeldOpen,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorCommand {
    Lock,
    Unlock,
}

impl DoorCommand {
    pub fn inverse(self) -> Self {
        match self {
            Self::Lock => Self::Unlock,
            Self::Unlock => Self::Lock,
        }
    }

    /// State the door reports once the command is acknowledged.
    pub fn resulting_state(self) -> DoorState {
        match self {
            Self::Lock => DoorState::Locked,
            Self::Unlock => DoorState::Unlocked,
        }
    }
}

impl fmt::Display for DoorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => f.write_str("LOCK"),
            Self::Unlock => f.write_str("UNLOCK"),
        }
    }
}
