//! Unix domain socket IPC listener.
//!
//! Listens on the socket path and dispatches JSON-RPC-lite messages
//! to the [`AccessManager`]. A connection that calls `changes.subscribe`
//! keeps serving requests while change batches are pushed to it as
//! `changes.batch` notifications.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use warden_core::{
    AccessManager, AuditFilter, ChangeBatch, GrantFilter, Subscription, WardenError,
};

use crate::PROTOCOL_VERSION;
use crate::protocol::*;

/// Methods advertised in the `hello` result.
const CAPABILITIES: &[&str] = &[
    "access.check",
    "grants.upsert",
    "grants.clear_direct",
    "grants.get",
    "grants.list",
    "grants.bulk",
    "grants.apply_template",
    "emergency.activate",
    "emergency.deactivate",
    "emergency.status",
    "changes.subscribe",
    "audit.query",
    "doors.heartbeat",
    "doors.status",
    "service.status",
];

/// Error half of a dispatch; becomes the `error` member of the response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    fn into_body(self) -> JsonRpcErrorBody {
        JsonRpcErrorBody {
            code: self.code,
            message: self.message,
            data: self.data,
        }
    }
}

impl From<WardenError> for RpcError {
    fn from(err: WardenError) -> Self {
        let category = err.category();
        let mut data = serde_json::json!({
            "category": category.as_str(),
            "retryable": category.retryable(),
        });
        if let WardenError::BulkAborted { failures } = &err {
            data["failures"] = serde_json::to_value(failures).unwrap_or_default();
        }
        Self {
            code: category_code(category),
            message: err.to_string(),
            data: Some(data),
        }
    }
}

type DispatchResult = Result<serde_json::Value, RpcError>;

/// Per-connection state.
#[derive(Default)]
struct Session {
    subscription: Option<Subscription>,
}

/// Bind the listener, replacing a stale socket file left by a previous run.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    tracing::info!("Warden service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
///
/// Each connection reads newline-delimited JSON-RPC messages, dispatches
/// them to the manager, and writes one response line per request.
pub async fn serve(
    manager: Arc<AccessManager>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let mgr = Arc::clone(&manager);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let open = mgr.inc_connections();
                        tracing::debug!(connections = open, "Client connected");
                        if let Err(e) = handle_connection(&mgr, stream, conn_shutdown).await {
                            tracing::warn!("Connection error: {e}");
                        }
                        let open = mgr.dec_connections();
                        tracing::debug!(connections = open, "Client disconnected");
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("IPC listener stopped");
    Ok(())
}

async fn handle_connection(
    manager: &AccessManager,
    stream: UnixStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut session = Session::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break; // EOF
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = dispatch_message(manager, &mut session, trimmed).await;
                write_line(&mut writer, &response).await?;
            }
            Some(batch) = next_batch(&mut session.subscription) => {
                let params = serde_json::to_value(&batch).unwrap_or_default();
                write_line(&mut writer, &notification(CHANGES_BATCH, params)).await?;
            }
            _ = shutdown.changed() => break,
        }
    }

    Ok(())
}

async fn next_batch(subscription: &mut Option<Subscription>) -> Option<ChangeBatch> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

fn notification(method: &str, params: serde_json::Value) -> JsonRpcNotification {
    JsonRpcNotification {
        method: method.to_string(),
        params: Some(params),
    }
}

/// Parse and dispatch a single JSON-RPC message.
async fn dispatch_message(
    manager: &AccessManager,
    session: &mut Session,
    raw: &str,
) -> serde_json::Value {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return serde_json::to_value(JsonRpcError {
                id: RequestId::Integer(0),
                error: RpcError::new(ERR_INVALID_REQUEST, format!("Invalid JSON-RPC: {e}"))
                    .into_body(),
            })
            .unwrap_or_default();
        }
    };

    let id = request.id;
    match dispatch_method(manager, session, &request.method, request.params).await {
        Ok(result) => serde_json::to_value(JsonRpcResponse { id, result }).unwrap_or_default(),
        Err(err) => {
            tracing::debug!(method = %request.method, code = err.code, "Request failed: {}", err.message);
            serde_json::to_value(JsonRpcError {
                id,
                error: err.into_body(),
            })
            .unwrap_or_default()
        }
    }
}

async fn dispatch_method(
    manager: &AccessManager,
    session: &mut Session,
    method: &str,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    match method {
        "hello" => handle_hello(params),
        "access.check" => handle_access_check(manager, params),
        "grants.upsert" => handle_grants_upsert(manager, params),
        "grants.clear_direct" => handle_grants_clear_direct(manager, params),
        "grants.get" => handle_grants_get(manager, params),
        "grants.list" => handle_grants_list(manager, params),
        "grants.bulk" => handle_grants_bulk(manager, params).await,
        "grants.apply_template" => handle_apply_template(manager, params).await,
        "emergency.activate" => handle_emergency_activate(manager, params).await,
        "emergency.deactivate" => handle_emergency_deactivate(manager, params).await,
        "emergency.status" => to_result(manager.emergency_status().await),
        "changes.subscribe" => handle_changes_subscribe(manager, session, params),
        "audit.query" => handle_audit_query(manager, params),
        "doors.heartbeat" => handle_doors_heartbeat(manager, params),
        "doors.status" => to_result(DoorStatusResult {
            doors: manager.door_status(),
        }),
        "service.status" => to_result(ServiceStatusResult {
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            status: manager.status(),
        }),
        _ => Err(RpcError::new(
            ERR_METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        )),
    }
}

fn parse_params<T: DeserializeOwned>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, RpcError> {
    let value = params.ok_or_else(|| RpcError::invalid_params("Missing params"))?;
    serde_json::from_value(value)
        .map_err(|e| RpcError::invalid_params(format!("Invalid {method} params: {e}")))
}

/// Like [`parse_params`], but absent params mean the type's default.
fn parse_optional_params<T: DeserializeOwned + Default>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, RpcError> {
    match params {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => parse_params(method, Some(value)),
    }
}

fn to_result<T: Serialize>(value: T) -> DispatchResult {
    serde_json::to_value(value)
        .map_err(|e| RpcError::new(ERR_INTERNAL, format!("Serialize error: {e}")))
}

fn require_actor(actor: &str) -> Result<&str, RpcError> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(RpcError::invalid_params("actor must not be empty"));
    }
    Ok(actor)
}

/// Handle the `hello` handshake.
fn handle_hello(params: Option<serde_json::Value>) -> DispatchResult {
    let hello: HelloParams = parse_params("hello", params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(RpcError::invalid_params(format!(
            "Incompatible protocol version: client={}, service={}",
            hello.protocol_version, PROTOCOL_VERSION
        )));
    }

    tracing::debug!(client_version = %hello.client_version, "Handshake");
    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
    })
}

fn handle_access_check(manager: &AccessManager, params: Option<serde_json::Value>) -> DispatchResult {
    let pair: PairParams = parse_params("access.check", params)?;
    to_result(manager.is_allowed(&pair.identity_id, &pair.access_point_id))
}

fn handle_grants_upsert(manager: &AccessManager, params: Option<serde_json::Value>) -> DispatchResult {
    let params: GrantUpsertParams = parse_params("grants.upsert", params)?;
    let actor = require_actor(&params.actor)?;
    to_result(manager.upsert_grant(&params.write, actor)?)
}

fn handle_grants_clear_direct(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: GrantClearDirectParams = parse_params("grants.clear_direct", params)?;
    let actor = require_actor(&params.actor)?;
    to_result(manager.clear_direct_grant(
        &params.identity_id,
        &params.access_point_id,
        params.expected_version,
        actor,
    )?)
}

fn handle_grants_get(manager: &AccessManager, params: Option<serde_json::Value>) -> DispatchResult {
    let pair: PairParams = parse_params("grants.get", params)?;
    to_result(manager.get_grant(&pair.identity_id, &pair.access_point_id)?)
}

fn handle_grants_list(manager: &AccessManager, params: Option<serde_json::Value>) -> DispatchResult {
    let filter: GrantFilter = parse_optional_params("grants.list", params)?;
    to_result(GrantListResult {
        grants: manager.list_grants(&filter).collect(),
    })
}

async fn handle_grants_bulk(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: GrantBulkParams = parse_params("grants.bulk", params)?;
    let actor = require_actor(&params.actor)?;
    let report = manager.apply_bulk(params.request, actor).await?;
    to_result(BulkResult::from(report))
}

async fn handle_apply_template(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: ApplyTemplateParams = parse_params("grants.apply_template", params)?;
    let actor = require_actor(&params.actor)?;
    let report = manager
        .apply_template(&params.template_id, params.identity_ids, actor)
        .await?;
    to_result(BulkResult::from(report))
}

async fn handle_emergency_activate(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: EmergencyActivateParams = parse_params("emergency.activate", params)?;
    let actor = require_actor(&params.actor)?;
    let status = manager
        .activate_emergency(params.scope, params.evacuation_mode, actor)
        .await?;
    to_result(status)
}

async fn handle_emergency_deactivate(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: EmergencyDeactivateParams = parse_params("emergency.deactivate", params)?;
    let actor = require_actor(&params.actor)?;
    to_result(manager.deactivate_emergency(actor).await)
}

fn handle_changes_subscribe(
    manager: &AccessManager,
    session: &mut Session,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: SubscribeParams = parse_optional_params("changes.subscribe", params)?;
    let subscription = manager.subscribe(params.since_sequence);
    let sequence = subscription.last_seen();
    if session.subscription.replace(subscription).is_some() {
        tracing::debug!(sequence, "Subscription replaced");
    }
    to_result(SubscribeResult {
        subscribed: true,
        sequence,
    })
}

fn handle_audit_query(manager: &AccessManager, params: Option<serde_json::Value>) -> DispatchResult {
    let filter: AuditFilter = parse_optional_params("audit.query", params)?;
    to_result(AuditQueryResult {
        entries: manager.query_audit(&filter)?,
    })
}

fn handle_doors_heartbeat(
    manager: &AccessManager,
    params: Option<serde_json::Value>,
) -> DispatchResult {
    let params: DoorHeartbeatParams = parse_params("doors.heartbeat", params)?;
    let observed_at = params.observed_at.unwrap_or_else(chrono::Utc::now);
    let accepted = manager.record_heartbeat(&params.access_point_id, params.state, observed_at)?;
    to_result(DoorHeartbeatResult { accepted })
}
