//! Read-only view of the external identity/door/zone directory.
//!
//! The directory owns creation and editing of these records; the core only
//! looks them up. `InMemoryDirectory` holds a snapshot that can be swapped
//! wholesale when the upstream directory syncs.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WardenError};
use crate::model::{
    AccessPoint, AccessPointId, Identity, IdentityId, Template, TemplateId, Zone, ZoneId,
};

pub trait Directory: Send + Sync {
    fn get_identity(&self, id: &IdentityId) -> Result<Identity>;
    fn get_access_point(&self, id: &AccessPointId) -> Result<AccessPoint>;
    fn get_zone(&self, id: &ZoneId) -> Result<Zone>;
    fn list_template_members(&self, id: &TemplateId) -> Result<BTreeSet<AccessPointId>>;
    /// Every access point, sorted by id.
    fn list_access_points(&self) -> Vec<AccessPoint>;
}

/// Serialized directory export, as consumed by the service at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub access_points: Vec<AccessPoint>,
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl DirectorySnapshot {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WardenError::unavailable_with_source(
                format!("failed to read directory snapshot at {}", path.display()),
                e,
            )
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            WardenError::unavailable_with_source("failed to parse directory snapshot", e)
        })
    }
}

#[derive(Default)]
struct Indexed {
    identities: HashMap<IdentityId, Identity>,
    zones: HashMap<ZoneId, Zone>,
    access_points: HashMap<AccessPointId, AccessPoint>,
    templates: HashMap<TemplateId, Template>,
}

impl From<DirectorySnapshot> for Indexed {
    fn from(snapshot: DirectorySnapshot) -> Self {
        Self {
            identities: snapshot
                .identities
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect(),
            zones: snapshot
                .zones
                .into_iter()
                .map(|z| (z.id.clone(), z))
                .collect(),
            access_points: snapshot
                .access_points
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            templates: snapshot
                .templates
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryDirectory {
    inner: RwLock<Indexed>,
}

impl InMemoryDirectory {
    pub fn new(snapshot: DirectorySnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot.into()),
        }
    }

    /// Swap in a fresh export from the upstream directory.
    pub fn replace(&self, snapshot: DirectorySnapshot) {
        let indexed: Indexed = snapshot.into();
        tracing::info!(
            identities = indexed.identities.len(),
            access_points = indexed.access_points.len(),
            zones = indexed.zones.len(),
            templates = indexed.templates.len(),
            "Directory snapshot replaced"
        );
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = indexed;
    }

    fn read<T>(&self, f: impl FnOnce(&Indexed) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Directory for InMemoryDirectory {
    fn get_identity(&self, id: &IdentityId) -> Result<Identity> {
        self.read(|d| d.identities.get(id).cloned())
            .ok_or_else(|| WardenError::not_found("identity", id))
    }

    fn get_access_point(&self, id: &AccessPointId) -> Result<AccessPoint> {
        self.read(|d| d.access_points.get(id).cloned())
            .ok_or_else(|| WardenError::not_found("access point", id))
    }

    fn get_zone(&self, id: &ZoneId) -> Result<Zone> {
        self.read(|d| d.zones.get(id).cloned())
            .ok_or_else(|| WardenError::not_found("zone", id))
    }

    fn list_template_members(&self, id: &TemplateId) -> Result<BTreeSet<AccessPointId>> {
        self.read(|d| d.templates.get(id).map(|t| t.access_point_ids.clone()))
            .ok_or_else(|| WardenError::not_found("template", id))
    }

    fn list_access_points(&self) -> Vec<AccessPoint> {
        let mut points: Vec<AccessPoint> = self.read(|d| d.access_points.values().cloned().collect());
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }
}
