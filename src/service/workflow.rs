//! In-memory workflow service.
//!
//! Enough of a workflow frontend to exercise authorization end to end:
//! namespaces, workflow executions and their event history. State lives in
//! process memory and is lost on restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::auth::Access;
use crate::pipeline::CallContext;
use crate::rpc::Status;
use crate::service::registry::ServiceRegistry;

/// Service name of the workflow API.
pub const WORKFLOW_SERVICE: &str = "temporal.api.workflowservice.v1.WorkflowService";
/// Service name of the health API.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Fully-qualified method names.
pub mod methods {
    /// Server version and capabilities (public).
    pub const GET_SYSTEM_INFO: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/GetSystemInfo";
    /// List namespaces.
    pub const LIST_NAMESPACES: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/ListNamespaces";
    /// Create a namespace.
    pub const REGISTER_NAMESPACE: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/RegisterNamespace";
    /// Describe one namespace.
    pub const DESCRIBE_NAMESPACE: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/DescribeNamespace";
    /// Start a workflow execution.
    pub const START_WORKFLOW_EXECUTION: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/StartWorkflowExecution";
    /// Describe one workflow execution.
    pub const DESCRIBE_WORKFLOW_EXECUTION: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/DescribeWorkflowExecution";
    /// List running executions.
    pub const LIST_OPEN_WORKFLOW_EXECUTIONS: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/ListOpenWorkflowExecutions";
    /// List all executions.
    pub const LIST_WORKFLOW_EXECUTIONS: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/ListWorkflowExecutions";
    /// Terminate a running execution.
    pub const TERMINATE_WORKFLOW_EXECUTION: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/TerminateWorkflowExecution";
    /// Stream the event history of an execution.
    pub const GET_WORKFLOW_EXECUTION_HISTORY: &str =
        "/temporal.api.workflowservice.v1.WorkflowService/GetWorkflowExecutionHistory";
    /// Liveness (public).
    pub const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A registered namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceInfo {
    /// Namespace name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Owner contact.
    #[serde(default)]
    pub owner_email: String,
    /// Creation time.
    pub registered_at: DateTime<Utc>,
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Still running.
    Running,
    /// Terminated by a caller.
    Terminated,
}

/// One history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    /// 1-based position in the history.
    pub event_id: u64,
    /// Event kind, e.g. `WorkflowExecutionStarted`.
    pub event_type: String,
    /// When the event was recorded.
    pub event_time: DateTime<Utc>,
    /// Event-specific attributes.
    #[serde(default)]
    pub attributes: Value,
}

/// A workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// Caller-chosen id, unique per namespace.
    pub workflow_id: String,
    /// Server-assigned run id.
    pub run_id: Uuid,
    /// Workflow type name.
    pub workflow_type: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// Close time, once terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<DateTime<Utc>>,
    /// Event history.
    #[serde(skip)]
    pub history: Vec<HistoryEvent>,
}

impl WorkflowExecution {
    fn record(&mut self, event_type: &str, attributes: Value) {
        let event_id = self.history.len() as u64 + 1;
        self.history.push(HistoryEvent {
            event_id,
            event_type: event_type.to_owned(),
            event_time: Utc::now(),
            attributes,
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterNamespaceRequest {
    namespace: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    owner_email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceRequest {
    namespace: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartWorkflowRequest {
    namespace: String,
    workflow_id: String,
    workflow_type: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionRequest {
    namespace: String,
    workflow_id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListExecutionsRequest {
    namespace: String,
    #[serde(default)]
    workflow_type: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(request: Value) -> Result<T, Status> {
    serde_json::from_value(request).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, Status> {
    serde_json::to_value(value).map_err(|_| Status::internal())
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory state behind the workflow API.
#[derive(Debug, Default)]
pub struct WorkflowService {
    namespaces: DashMap<String, NamespaceInfo>,
    executions: DashMap<(String, String), WorkflowExecution>,
}

impl WorkflowService {
    /// Empty service.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Service with the given namespaces pre-registered.
    #[must_use]
    pub fn with_namespaces<I, S>(names: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::default();
        for name in names {
            let name = name.into();
            service.namespaces.insert(
                name.clone(),
                NamespaceInfo {
                    name,
                    description: String::new(),
                    owner_email: String::new(),
                    registered_at: Utc::now(),
                },
            );
        }
        Arc::new(service)
    }

    /// Register every method on `registry`.
    pub fn register(self: &Arc<Self>, registry: &mut ServiceRegistry) {
        registry.unary(methods::HEALTH_CHECK, Access::Public, |_, _| async {
            Ok(json!({ "status": "SERVING" }))
        });
        registry.unary(methods::GET_SYSTEM_INFO, Access::Public, |_, _| async {
            Ok(Self::system_info())
        });

        let svc = Arc::clone(self);
        registry.unary(methods::LIST_NAMESPACES, Access::Reader, move |_, _| {
            let svc = Arc::clone(&svc);
            async move { svc.list_namespaces() }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::REGISTER_NAMESPACE, Access::Admin, move |_, req| {
            let svc = Arc::clone(&svc);
            async move { svc.register_namespace(decode(req)?) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::DESCRIBE_NAMESPACE, Access::Reader, move |_, req| {
            let svc = Arc::clone(&svc);
            async move { svc.describe_namespace(&decode::<NamespaceRequest>(req)?.namespace) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::START_WORKFLOW_EXECUTION, Access::Writer, move |ctx, req| {
            let svc = Arc::clone(&svc);
            async move { svc.start_workflow(&ctx, decode(req)?) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::DESCRIBE_WORKFLOW_EXECUTION, Access::Reader, move |_, req| {
            let svc = Arc::clone(&svc);
            async move { svc.describe_workflow(&decode(req)?) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::LIST_OPEN_WORKFLOW_EXECUTIONS, Access::Reader, move |_, req| {
            let svc = Arc::clone(&svc);
            async move { svc.list_workflows(&decode(req)?, true) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::LIST_WORKFLOW_EXECUTIONS, Access::Reader, move |_, req| {
            let svc = Arc::clone(&svc);
            async move { svc.list_workflows(&decode(req)?, false) }
        });
        let svc = Arc::clone(self);
        registry.unary(methods::TERMINATE_WORKFLOW_EXECUTION, Access::Writer, move |ctx, req| {
            let svc = Arc::clone(&svc);
            async move { svc.terminate_workflow(&ctx, &decode(req)?) }
        });
        let svc = Arc::clone(self);
        registry.server_streaming(
            methods::GET_WORKFLOW_EXECUTION_HISTORY,
            Access::Reader,
            move |_, req| {
                let events = decode::<ExecutionRequest>(req).and_then(|req| svc.history(&req));
                match events {
                    Ok(events) => futures::stream::iter(
                        events.into_iter().map(|event| encode(&event)).collect::<Vec<_>>(),
                    )
                    .left_stream(),
                    Err(status) => futures::stream::iter(vec![Err(status)]).right_stream(),
                }
            },
        );
    }

    fn system_info() -> Value {
        json!({
            "serverVersion": env!("CARGO_PKG_VERSION"),
            "capabilities": {
                "signalAndQueryHeader": false,
                "internalErrorDifferentiation": true,
                "activityFailureIncludeHeartbeat": false,
            }
        })
    }

    fn list_namespaces(&self) -> Result<Value, Status> {
        let mut namespaces: Vec<NamespaceInfo> =
            self.namespaces.iter().map(|e| e.value().clone()).collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(json!({ "namespaces": encode(&namespaces)? }))
    }

    fn register_namespace(&self, req: RegisterNamespaceRequest) -> Result<Value, Status> {
        if req.namespace.is_empty() {
            return Err(Status::invalid_argument("namespace is required"));
        }
        match self.namespaces.entry(req.namespace.clone()) {
            Entry::Occupied(_) => Err(Status::already_exists(format!(
                "namespace {} already exists",
                req.namespace
            ))),
            Entry::Vacant(slot) => {
                let info = NamespaceInfo {
                    name: req.namespace,
                    description: req.description,
                    owner_email: req.owner_email,
                    registered_at: Utc::now(),
                };
                info!(namespace = %info.name, "Namespace registered");
                let response = encode(&info)?;
                slot.insert(info);
                Ok(response)
            }
        }
    }

    fn describe_namespace(&self, namespace: &str) -> Result<Value, Status> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| Status::not_found(format!("namespace {namespace} not found")))
            .and_then(|info| encode(info.value()))
    }

    fn require_namespace(&self, namespace: &str) -> Result<(), Status> {
        if self.namespaces.contains_key(namespace) {
            Ok(())
        } else {
            Err(Status::not_found(format!("namespace {namespace} not found")))
        }
    }

    fn start_workflow(&self, ctx: &CallContext, req: StartWorkflowRequest) -> Result<Value, Status> {
        if req.workflow_id.is_empty() || req.workflow_type.is_empty() {
            return Err(Status::invalid_argument(
                "workflowId and workflowType are required",
            ));
        }
        self.require_namespace(&req.namespace)?;

        let key = (req.namespace.clone(), req.workflow_id.clone());
        match self.executions.entry(key) {
            Entry::Occupied(entry) if entry.get().status == WorkflowStatus::Running => {
                Err(Status::already_exists(format!(
                    "workflow {} is already running",
                    req.workflow_id
                )))
            }
            entry => {
                let mut execution = WorkflowExecution {
                    workflow_id: req.workflow_id,
                    run_id: Uuid::new_v4(),
                    workflow_type: req.workflow_type,
                    status: WorkflowStatus::Running,
                    start_time: Utc::now(),
                    close_time: None,
                    history: Vec::new(),
                };
                let identity = ctx.claims().map(|c| c.subject.clone()).unwrap_or_default();
                execution.record(
                    "WorkflowExecutionStarted",
                    json!({
                        "workflowType": execution.workflow_type,
                        "input": req.input,
                        "identity": identity,
                    }),
                );
                info!(
                    namespace = %req.namespace,
                    workflow_id = %execution.workflow_id,
                    run_id = %execution.run_id,
                    "Workflow started"
                );
                let response = json!({ "runId": execution.run_id });
                entry.insert(execution);
                Ok(response)
            }
        }
    }

    fn describe_workflow(&self, req: &ExecutionRequest) -> Result<Value, Status> {
        self.executions
            .get(&(req.namespace.clone(), req.workflow_id.clone()))
            .ok_or_else(|| Status::not_found(format!("workflow {} not found", req.workflow_id)))
            .and_then(|execution| encode(execution.value()))
    }

    fn list_workflows(&self, req: &ListExecutionsRequest, open_only: bool) -> Result<Value, Status> {
        self.require_namespace(&req.namespace)?;
        let mut executions: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| e.key().0 == req.namespace)
            .filter(|e| !open_only || e.value().status == WorkflowStatus::Running)
            .filter(|e| {
                req.workflow_type
                    .as_deref()
                    .is_none_or(|wt| e.value().workflow_type == wt)
            })
            .map(|e| e.value().clone())
            .collect();
        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(json!({ "executions": encode(&executions)? }))
    }

    fn terminate_workflow(&self, ctx: &CallContext, req: &ExecutionRequest) -> Result<Value, Status> {
        let mut execution = self
            .executions
            .get_mut(&(req.namespace.clone(), req.workflow_id.clone()))
            .ok_or_else(|| Status::not_found(format!("workflow {} not found", req.workflow_id)))?;
        if execution.status != WorkflowStatus::Running {
            return Err(Status::invalid_argument(format!(
                "workflow {} is not running",
                req.workflow_id
            )));
        }
        let identity = ctx.claims().map(|c| c.subject.clone()).unwrap_or_default();
        execution.status = WorkflowStatus::Terminated;
        execution.close_time = Some(Utc::now());
        execution.record(
            "WorkflowExecutionTerminated",
            json!({ "reason": req.reason, "identity": identity }),
        );
        info!(
            namespace = %req.namespace,
            workflow_id = %req.workflow_id,
            "Workflow terminated"
        );
        Ok(json!({}))
    }

    fn history(&self, req: &ExecutionRequest) -> Result<Vec<HistoryEvent>, Status> {
        self.executions
            .get(&(req.namespace.clone(), req.workflow_id.clone()))
            .map(|execution| execution.history.clone())
            .ok_or_else(|| Status::not_found(format!("workflow {} not found", req.workflow_id)))
    }
}
