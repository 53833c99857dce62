//! HTTP/JSON routes.
//!
//! Every route maps to exactly one registered method and produces the same
//! `api_name` and namespace the binary frontend would for that operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde_json::{Map, Value, json};
use tower_http::trace::TraceLayer;

use crate::frontend::http::HttpPeer;
use crate::pipeline::{AuthPipeline, CallContext, Dispatch};
use crate::rpc::Status;
use crate::service::methods;

/// Header carrying the caller deadline in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "request-timeout";

/// Shared handler state.
#[derive(Clone)]
pub struct GatewayState {
    /// Pipeline shared with the binary frontend.
    pub pipeline: Arc<AuthPipeline>,
}

/// Build the gateway router.
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/v1/system-info", get(system_info))
        .route("/health", get(health))
        .route(
            "/api/v1/namespaces",
            get(list_namespaces).post(register_namespace),
        )
        .route("/api/v1/namespaces/{namespace}", get(describe_namespace))
        .route(
            "/api/v1/namespaces/{namespace}/workflows",
            get(list_workflows),
        )
        .route(
            "/api/v1/namespaces/{namespace}/workflows/open",
            get(list_open_workflows),
        )
        .route(
            "/api/v1/namespaces/{namespace}/workflows/{workflow_id}",
            get(describe_workflow).post(start_workflow),
        )
        .route(
            "/api/v1/namespaces/{namespace}/workflows/{workflow_id}/terminate",
            post(terminate_workflow),
        )
        .route(
            "/api/v1/namespaces/{namespace}/workflows/{workflow_id}/history",
            get(workflow_history),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn system_info(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    headers: HeaderMap,
) -> Response {
    dispatch(&state, peer, &headers, methods::GET_SYSTEM_INFO, "", json!({})).await
}

async fn health(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    headers: HeaderMap,
) -> Response {
    dispatch(&state, peer, &headers, methods::HEALTH_CHECK, "", json!({})).await
}

async fn list_namespaces(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    headers: HeaderMap,
) -> Response {
    dispatch(&state, peer, &headers, methods::LIST_NAMESPACES, "", json!({})).await
}

async fn register_namespace(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(status) => return status_response(&status),
    };
    let namespace = request
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    dispatch(
        &state,
        peer,
        &headers,
        methods::REGISTER_NAMESPACE,
        &namespace,
        Value::Object(request),
    )
    .await
}

async fn describe_namespace(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request = json!({ "namespace": namespace });
    dispatch(&state, peer, &headers, methods::DESCRIBE_NAMESPACE, &namespace, request).await
}

async fn list_workflows(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = list_request(&namespace, &query);
    dispatch(&state, peer, &headers, methods::LIST_WORKFLOW_EXECUTIONS, &namespace, request).await
}

async fn list_open_workflows(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = list_request(&namespace, &query);
    dispatch(
        &state,
        peer,
        &headers,
        methods::LIST_OPEN_WORKFLOW_EXECUTIONS,
        &namespace,
        request,
    )
    .await
}

async fn describe_workflow(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path((namespace, workflow_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let request = json!({ "namespace": namespace, "workflowId": workflow_id });
    dispatch(
        &state,
        peer,
        &headers,
        methods::DESCRIBE_WORKFLOW_EXECUTION,
        &namespace,
        request,
    )
    .await
}

async fn start_workflow(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path((namespace, workflow_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request = match parse_body(&body) {
        Ok(request) => request,
        Err(status) => return status_response(&status),
    };
    request.insert("namespace".to_string(), Value::String(namespace.clone()));
    request.insert("workflowId".to_string(), Value::String(workflow_id));
    dispatch(
        &state,
        peer,
        &headers,
        methods::START_WORKFLOW_EXECUTION,
        &namespace,
        Value::Object(request),
    )
    .await
}

async fn terminate_workflow(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path((namespace, workflow_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request = match parse_body(&body) {
        Ok(request) => request,
        Err(status) => return status_response(&status),
    };
    request.insert("namespace".to_string(), Value::String(namespace.clone()));
    request.insert("workflowId".to_string(), Value::String(workflow_id));
    dispatch(
        &state,
        peer,
        &headers,
        methods::TERMINATE_WORKFLOW_EXECUTION,
        &namespace,
        Value::Object(request),
    )
    .await
}

async fn workflow_history(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<HttpPeer>,
    Path((namespace, workflow_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let request = json!({ "namespace": namespace, "workflowId": workflow_id });
    dispatch(
        &state,
        peer,
        &headers,
        methods::GET_WORKFLOW_EXECUTION_HISTORY,
        &namespace,
        request,
    )
    .await
}

async fn not_found() -> Response {
    status_response(&Status::not_found("no such route"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch(
    state: &GatewayState,
    peer: HttpPeer,
    headers: &HeaderMap,
    api_name: &str,
    namespace: &str,
    request: Value,
) -> Response {
    let Some(connection) = peer.connection else {
        return status_response(&Status::internal());
    };
    let timeout = match request_timeout(headers) {
        Ok(timeout) => timeout,
        Err(status) => return status_response(&status),
    };
    let deadline = state.pipeline.deadline_for(timeout);
    let ctx = CallContext::new(connection, Some(deadline), bearer_token(headers));

    match state.pipeline.invoke(&ctx, api_name, namespace, request).await {
        Ok(Dispatch::Unary(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Dispatch::Stream(stream)) => match stream.try_collect::<Vec<Value>>().await {
            Ok(items) => (StatusCode::OK, Json(json!({ "events": items }))).into_response(),
            Err(status) => status_response(&status),
        },
        Err(status) => status_response(&status),
    }
}

/// `{"code": ..., "message": ...}` with the status mapped to HTTP.
pub fn status_response(status: &Status) -> Response {
    (
        status.code.http_status(),
        Json(json!({ "code": status.code.as_str(), "message": status.message })),
    )
        .into_response()
}

fn parse_body(body: &Bytes) -> Result<Map<String, Value>, Status> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Status::invalid_argument("request body must be a JSON object")),
        Err(e) => Err(Status::invalid_argument(format!(
            "request body is not valid JSON: {e}"
        ))),
    }
}

fn list_request(namespace: &str, query: &HashMap<String, String>) -> Value {
    let mut request = json!({ "namespace": namespace });
    if let Some(workflow_type) = query.get("workflowType") {
        request["workflowType"] = Value::String(workflow_type.clone());
    }
    request
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

fn request_timeout(headers: &HeaderMap) -> Result<Option<Duration>, Status> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| {
            Status::invalid_argument(format!(
                "{REQUEST_TIMEOUT_HEADER} must be a positive number of milliseconds"
            ))
        })
}
