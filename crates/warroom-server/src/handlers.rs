//! RPC method handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use warroom_core::events::BroadcastEvent;
use warroom_core::identity::{Identity, Role};
use warroom_core::ids::{AlertId, SessionId};
use warroom_core::incident::IncidentRecord;
use warroom_core::session::Session;
use warroom_engine::SessionCoordinator;
use warroom_store::incidents::IncidentRepo;
use warroom_store::users::UserRepo;
use warroom_store::{Database, StoreError};

use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub coordinator: Arc<SessionCoordinator>,
}

impl HandlerState {
    pub fn new(db: Database, coordinator: Arc<SessionCoordinator>) -> Self {
        Self { db, coordinator }
    }

    /// Resolve an upstream-validated email to a stored identity. Unknown
    /// emails are registered as plain users.
    pub fn identify(&self, email: &str) -> Result<Identity, StoreError> {
        UserRepo::new(self.db.clone()).get_or_create(email, Role::User)
    }
}

const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("sessionId", "session_id"),
    ("incidentId", "incident_id"),
    ("packetId", "packet_id"),
    ("modelVersion", "model_version"),
];

/// Rewrite known camelCase keys to snake_case. An existing snake_case key wins.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            result.insert(snake.to_string(), val);
        }
    }
    serde_json::Value::Object(result)
}

/// Route a method to its handler. Blocking: call from the blocking pool.
pub fn dispatch(
    state: &HandlerState,
    method: &str,
    params: &serde_json::Value,
    caller: Option<&Identity>,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = normalize_params(params);

    match method {
        "health" => health(state, id),

        // Reads
        "session.get" => session_get(state, &params, id),
        "session.getByCode" => session_get_by_code(state, &params, id),
        "session.duration" => session_duration(state, &params, id),
        "incident.list" => incident_list(state, &params, id),
        "incident.get" => incident_get(state, &params, id),
        "incident.latest" => incident_latest(state, &params, id),
        "incident.listResolved" => incident_list_resolved(state, id),
        "incident.listActive" => incident_list_active(state, &params, id),

        // Writes
        "session.create" | "session.join" | "session.leave" | "session.resolve"
        | "incident.report" => {
            let Some(caller) = caller else {
                return RpcResponse::unauthorized(id);
            };
            match method {
                "session.create" => session_create(state, &params, caller, id),
                "session.join" => session_join(state, &params, caller, id),
                "session.leave" => session_leave(state, &params, caller, id),
                "session.resolve" => session_resolve(state, &params, caller, id),
                _ => incident_report(state, &params, id),
            }
        }

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn session_json(state: &HandlerState, session: &Session) -> serde_json::Value {
    let mut value = serde_json::to_value(session).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "currentDuration".into(),
            state.coordinator.current_duration(session).into(),
        );
    }
    value
}

fn session_reply(
    state: &HandlerState,
    id: Option<serde_json::Value>,
    result: Result<Session, warroom_engine::CoordinatorError>,
) -> RpcResponse {
    match result {
        Ok(session) => RpcResponse::success(id, session_json(state, &session)),
        Err(e) => {
            if e.is_rejection() {
                tracing::debug!(kind = e.error_kind(), error = %e, "request rejected");
            } else {
                tracing::error!(kind = e.error_kind(), error = %e, "request failed");
            }
            RpcResponse::from_coordinator(id, &e)
        }
    }
}

fn session_id_param(params: &serde_json::Value) -> Result<SessionId, String> {
    rpc::require_str(params, "session_id").map(|s| SessionId::from_raw(s.trim()))
}

fn session_create(
    state: &HandlerState,
    params: &serde_json::Value,
    caller: &Identity,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let result = state.coordinator.create_session(
        title,
        rpc::optional_str(params, "description"),
        rpc::optional_str(params, "incident_id"),
        caller,
    );
    session_reply(state, id, result)
}

fn session_join(
    state: &HandlerState,
    params: &serde_json::Value,
    caller: &Identity,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match rpc::require_str(params, "code") {
        Ok(code) => session_reply(state, id, state.coordinator.join_session(code, caller)),
        Err(e) => RpcResponse::invalid_params(id, e),
    }
}

fn session_leave(
    state: &HandlerState,
    params: &serde_json::Value,
    caller: &Identity,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match session_id_param(params) {
        Ok(sid) => session_reply(state, id, state.coordinator.leave_session(&sid, caller)),
        Err(e) => RpcResponse::invalid_params(id, e),
    }
}

fn session_resolve(
    state: &HandlerState,
    params: &serde_json::Value,
    caller: &Identity,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match session_id_param(params) {
        Ok(sid) => session_reply(state, id, state.coordinator.resolve_incident(&sid, caller)),
        Err(e) => RpcResponse::invalid_params(id, e),
    }
}

fn session_get(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match session_id_param(params) {
        Ok(sid) => session_reply(state, id, state.coordinator.session(&sid)),
        Err(e) => RpcResponse::invalid_params(id, e),
    }
}

fn session_get_by_code(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match rpc::require_str(params, "code") {
        Ok(code) => session_reply(state, id, state.coordinator.session_by_code(code)),
        Err(e) => RpcResponse::invalid_params(id, e),
    }
}

fn session_duration(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let sid = match session_id_param(params) {
        Ok(sid) => sid,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.coordinator.session(&sid) {
        Ok(session) => RpcResponse::success(
            id,
            serde_json::json!({
                "sessionId": session.id,
                "status": session.status,
                "seconds": state.coordinator.current_duration(&session),
            }),
        ),
        Err(e) => RpcResponse::from_coordinator(id, &e),
    }
}

fn incident_report(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let fields = ["packet_id", "incident_id", "severity"].map(|k| rpc::require_str(params, k));
    let [packet_id, incident_id, severity] = match fields {
        [Ok(p), Ok(i), Ok(s)] => [p, i, s],
        [p, i, s] => {
            let msg = [p, i, s].into_iter().find_map(Result::err).unwrap_or_default();
            return RpcResponse::invalid_params(id, msg);
        }
    };
    let timestamp = match rpc::optional_str(params, "timestamp") {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => return RpcResponse::invalid_params(id, format!("Invalid timestamp: {e}")),
        },
        None => Utc::now(),
    };

    let mut record = IncidentRecord::new(packet_id.trim(), incident_id.trim(), severity.trim(), timestamp);
    if let Some(score) = rpc::optional_f64(params, "score") {
        record = record.with_score(score);
    }
    if let Some(version) = rpc::optional_str(params, "model_version") {
        record = record.with_model_version(version);
    }

    match IncidentRepo::new(state.db.clone()).record(&record) {
        Ok((stored, created)) => {
            if created {
                if let Err(e) = state.coordinator.hub().publish(&BroadcastEvent::alert_raised(&stored)) {
                    tracing::warn!(alert_id = %stored.id, error = %e, "alert broadcast failed");
                }
            }
            let mut value = serde_json::to_value(&stored).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("created".into(), created.into());
            }
            RpcResponse::success(id, value)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to record alert");
            RpcResponse::internal_error(id, e.to_string())
        }
    }
}

fn incident_list(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let incident_id = match rpc::require_str(params, "incident_id") {
        Ok(i) => i.trim(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    alerts_reply(id, IncidentRepo::new(state.db.clone()).find_by_incident_id(incident_id))
}

/// Default page size for `incident.listActive`.
const DEFAULT_ALERT_LIMIT: u32 = 1000;

/// An alert plus the war-room fields of its correlated session, if any.
fn incident_view(state: &HandlerState, record: &IncidentRecord) -> serde_json::Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    let Some(session_id) = &record.session_id else {
        return value;
    };
    let session = match state.coordinator.session(session_id) {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(alert_id = %record.id, error = %e, "correlated session unavailable");
            return value;
        }
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("warRoomCode".into(), session.code.clone().into());
        obj.insert("warRoomStatus".into(), session.status.to_string().into());
        obj.insert(
            "warRoomStartTime".into(),
            serde_json::to_value(session.start_time).unwrap_or_default(),
        );
        obj.insert(
            "warRoomDuration".into(),
            state.coordinator.current_duration(&session).into(),
        );
    }
    value
}

fn incident_reply(
    state: &HandlerState,
    id: Option<serde_json::Value>,
    what: String,
    result: Result<Option<IncidentRecord>, StoreError>,
) -> RpcResponse {
    match result {
        Ok(Some(record)) => RpcResponse::success(id, incident_view(state, &record)),
        Ok(None) => RpcResponse::error(id, rpc::NOT_FOUND, format!("no alert for {what}")),
        Err(e) => {
            tracing::error!(error = %e, "alert lookup failed");
            RpcResponse::internal_error(id, e.to_string())
        }
    }
}

fn incident_get(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let alert_id = match rpc::require_str(params, "id") {
        Ok(a) => AlertId::from_raw(a.trim()),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let result = IncidentRepo::new(state.db.clone()).get(&alert_id);
    incident_reply(state, id, format!("id {alert_id}"), result)
}

fn incident_latest(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let incident_id = match rpc::require_str(params, "incident_id") {
        Ok(i) => i.trim(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let result = IncidentRepo::new(state.db.clone()).latest_for_incident(incident_id);
    incident_reply(state, id, format!("incident {incident_id}"), result)
}

fn alerts_reply(
    id: Option<serde_json::Value>,
    result: Result<Vec<IncidentRecord>, StoreError>,
) -> RpcResponse {
    match result {
        Ok(alerts) => RpcResponse::success(id, serde_json::json!({ "alerts": alerts })),
        Err(e) => {
            tracing::error!(error = %e, "alert listing failed");
            RpcResponse::internal_error(id, e.to_string())
        }
    }
}

fn incident_list_resolved(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    alerts_reply(id, IncidentRepo::new(state.db.clone()).list_resolved())
}

fn incident_list_active(
    state: &HandlerState,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let limit = match rpc::optional_u64(params, "limit") {
        Some(0) => return RpcResponse::invalid_params(id, "limit must be positive"),
        Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
        None => DEFAULT_ALERT_LIMIT,
    };
    alerts_reply(id, IncidentRepo::new(state.db.clone()).list_active(limit))
}

fn health(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state.db.ping();
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "components": {
                "database": if db_ok { "ok" } else { "error" },
                "observers": state.coordinator.hub().observer_count(),
            },
        }),
    )
}
