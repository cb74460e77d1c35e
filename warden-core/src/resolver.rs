//! Precedence resolver.
//!
//! Pure functions over already-fetched inputs: no I/O, no locks, no clock.
//! The same inputs always give the same `Decision`, so live checks and audit
//! replay share this code.
//!
//! Order of evaluation:
//! 1. unknown access point: deny (`ZONE_DEFAULT`)
//! 2. emergency override covering the door's zone
//! 3. inactive identity: deny (`IDENTITY_INACTIVE`)
//! 4. `DIRECT` row, else `TEMPLATE` row, else the zone's default policy

use crate::emergency::EmergencyState;
use crate::model::{
    AccessGrant, AccessPoint, Decision, DecisionOrigin, GrantOrigin, Identity, IdentityStatus, Zone,
};

/// Everything a single decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionInput<'a> {
    /// `None` for an identity the directory does not know.
    pub identity: Option<&'a Identity>,
    pub access_point: Option<&'a AccessPoint>,
    pub zone: Option<&'a Zone>,
    pub grant: Option<&'a AccessGrant>,
    pub emergency: &'a EmergencyState,
}

pub fn resolve(input: &ResolutionInput<'_>) -> Decision {
    let Some(access_point) = input.access_point else {
        return Decision::new(false, DecisionOrigin::ZoneDefault);
    };
    if let Some(forced) = input.emergency.override_for(access_point) {
        return forced;
    }
    if input
        .identity
        .is_some_and(|i| i.status == IdentityStatus::Inactive)
    {
        return Decision::new(false, DecisionOrigin::IdentityInactive);
    }
    resolve_grant(input.grant, input.zone)
}

/// Grant-level precedence only. A row is unique per pair, so "most recently
/// applied template" is whatever the row currently says.
pub fn resolve_grant(grant: Option<&AccessGrant>, zone: Option<&Zone>) -> Decision {
    match grant {
        Some(row) if row.origin != GrantOrigin::ZoneDefault => Decision {
            allowed: row.allowed,
            origin: row.origin.into(),
            evidence_grant_id: Some(row.grant_id),
        },
        _ => zone_default(zone),
    }
}

fn zone_default(zone: Option<&Zone>) -> Decision {
    let allowed = zone.is_some_and(|z| z.default_policy.allows());
    Decision::new(allowed, DecisionOrigin::ZoneDefault)
}
