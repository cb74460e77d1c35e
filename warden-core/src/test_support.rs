//! Shared fixtures for unit tests.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::{DirectorySnapshot, InMemoryDirectory};
use crate::doors::{CommandPolicy, DoorCommandError, DoorController};
use crate::model::{AccessPointId, DoorCommand};

/// Two zones and four doors:
/// - `z1` (deny by default): `d1`, `d2`
/// - `z2` (allow by default): `d3`, exit route `e1`
///
/// Identities `u1`, `u2` are active, `u3` is inactive. Template `manager`
/// covers `d1`..`d3`.
pub(crate) fn fixture_snapshot() -> DirectorySnapshot {
    serde_json::from_value(serde_json::json!({
        "identities": [
            {"id": "u1", "role": "manager"},
            {"id": "u2", "role": "manager"},
            {"id": "u3", "role": "contractor", "status": "inactive"}
        ],
        "zones": [
            {"id": "z1", "security_level": "high", "default_policy": "deny"},
            {"id": "z2", "security_level": "low", "default_policy": "allow"}
        ],
        "access_points": [
            {"id": "d1", "zone_id": "z1"},
            {"id": "d2", "zone_id": "z1"},
            {"id": "d3", "zone_id": "z2"},
            {"id": "e1", "zone_id": "z2", "is_exit_route": true}
        ],
        "templates": [
            {"id": "manager", "name": "Manager", "access_point_ids": ["d1", "d2", "d3"]},
            {"id": "empty", "access_point_ids": []}
        ]
    }))
    .expect("fixture snapshot")
}

pub(crate) fn fixture_directory() -> Arc<InMemoryDirectory> {
    Arc::new(InMemoryDirectory::new(fixture_snapshot()))
}

pub(crate) fn test_policy() -> CommandPolicy {
    CommandPolicy {
        attempt_timeout: Duration::from_millis(20),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        max_in_flight: 8,
    }
}

/// Records every command it receives. Acks unless built with `failing()`.
#[derive(Default)]
pub(crate) struct RecordingController {
    sent: Mutex<Vec<(AccessPointId, DoorCommand)>>,
    fail: bool,
}

impl RecordingController {
    pub(crate) fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn count(&self, command: DoorCommand) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, c)| *c == command)
            .count()
    }
}

#[async_trait]
impl DoorController for RecordingController {
    async fn send_command(
        &self,
        access_point_id: &AccessPointId,
        command: DoorCommand,
    ) -> Result<(), DoorCommandError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((access_point_id.clone(), command));
        if self.fail {
            Err(DoorCommandError::Rejected("jammed".to_string()))
        } else {
            Ok(())
        }
    }
}
