//! Transport-independent request handling.
//!
//! Both transports hand every inbound call to `Gateway::handle` with a caller id,
//! the request metadata and a decoded `ToolRequest`. The gateway records caller
//! activity, applies any configuration carried by the metadata, and turns every
//! outcome into a structured `ToolResult`; errors never escape as panics or
//! transport-level failures.

use crate::clock::SharedClock;
use crate::config::{Configuration, ConfigurationResolver, RequestMetadata};
use crate::connection::ConnectionFactory;
use crate::domain::DomainRouter;
use crate::errors::{ErrorContext, GatewayError, GatewayResult};
use crate::session::{TransportMetadata, DEFAULT_CALLER_ID};
use crate::session_store::{SessionRegistry, StatusReport, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS};
use crate::task::{BackoffSchedule, RemoteTask, RemoteTaskRunner, TaskOutcome, DEFAULT_MAX_RETRIES};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One call from a transport
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Any management API command, routed by `target` on multi-domain servers
    ApiCall {
        command: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        target: Option<String>,
    },
    RunScript {
        target: String,
        name: String,
        script: String,
        #[serde(default)]
        max_retries: Option<u32>,
    },
    /// Resume polling a task that previously came back as processing
    ShowTask {
        target: String,
        task_id: String,
        #[serde(default)]
        max_retries: Option<u32>,
    },
    SetDebug { enabled: bool },
}

impl ToolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::ApiCall { .. } => "api_call",
            ToolRequest::RunScript { .. } => "run_script",
            ToolRequest::ShowTask { .. } => "show_task",
            ToolRequest::SetDebug { .. } => "set_debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
    /// A remote task is still running; poll again with the returned task id
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub correlation_id: String,
}

/// Structured result handed back to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            status: ResultStatus::Ok,
            data: Some(data),
            error: None,
            task_id: None,
        }
    }

    pub fn failure(context: &ErrorContext) -> Self {
        Self {
            status: ResultStatus::Error,
            data: None,
            error: Some(ErrorBody {
                kind: context.error.kind().to_string(),
                message: context.user_message(),
                correlation_id: context.correlation_id.clone(),
            }),
            task_id: None,
        }
    }

    pub fn processing(task_id: impl Into<String>, message: String) -> Self {
        Self {
            status: ResultStatus::Processing,
            data: Some(json!({ "message": message })),
            error: None,
            task_id: Some(task_id.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

/// Tunables for caller lifecycle and task polling
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub max_task_polls: u32,
    pub backoff: BackoffSchedule,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_task_polls: DEFAULT_MAX_RETRIES,
            backoff: BackoffSchedule::default(),
        }
    }
}

pub struct Gateway {
    registry: SessionRegistry,
    connections: ConnectionFactory,
    settings: GatewaySettings,
    clock: SharedClock,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, clock: SharedClock) -> Self {
        Self {
            registry: SessionRegistry::new(settings.max_sessions, Arc::clone(&clock)),
            connections: ConnectionFactory::new(Arc::clone(&clock)),
            settings,
            clock,
        }
    }

    /// Register the configuration used by the `default` caller
    pub async fn with_default_configuration(self, config: Configuration) -> GatewayResult<Self> {
        self.connections.configure(DEFAULT_CALLER_ID, config).await?;
        Ok(self)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    /// Handle one call for `caller_id`. Never fails: every error becomes a
    /// structured result.
    pub async fn handle(
        &self,
        caller_id: &str,
        metadata: &RequestMetadata,
        transport: TransportMetadata,
        request: ToolRequest,
    ) -> ToolResult {
        let tool = request.name();
        debug!("[Gateway] {} called {}", caller_id, tool);

        match self.dispatch(caller_id, metadata, transport, request).await {
            Ok(result) => result,
            Err(error) => {
                let context = ErrorContext::new(error)
                    .with_context("caller_id", caller_id)
                    .with_context("tool", tool);
                match &context.error {
                    GatewayError::Internal { .. } => error!("[Gateway] {}", context.technical_message()),
                    _ => warn!("[Gateway] {}", context.technical_message()),
                }
                ToolResult::failure(&context)
            }
        }
    }

    async fn dispatch(
        &self,
        caller_id: &str,
        metadata: &RequestMetadata,
        transport: TransportMetadata,
        request: ToolRequest,
    ) -> GatewayResult<ToolResult> {
        let evicted = self.registry.touch(caller_id, transport)?;
        for evicted_id in evicted {
            self.discard(&evicted_id).await;
        }

        if ConfigurationResolver::has_connection_metadata(metadata) {
            let mut config = ConfigurationResolver::from_request_metadata(metadata)?;
            if ConfigurationResolver::debug_flag(metadata).is_none() {
                if let Some(current) = self.connections.configuration(caller_id).await {
                    config.debug = current.debug;
                }
            }
            if let Some(previous) = self.connections.configure(caller_id, config).await? {
                debug!("[Gateway] {} switched backends, logging out previous connection", caller_id);
                Self::spawn_logout(previous);
            }
        } else if let Some(enabled) = ConfigurationResolver::debug_flag(metadata) {
            self.connections.set_debug(caller_id, enabled).await?;
        }

        if let ToolRequest::SetDebug { enabled } = request {
            self.connections.set_debug(caller_id, enabled).await?;
            info!("[Gateway] Debug logging for {} set to {}", caller_id, enabled);
            return Ok(ToolResult::ok(json!({ "debug": enabled })));
        }

        let router = self.connections.get(caller_id).await?;
        self.execute(router, request).await
    }

    async fn execute(&self, router: Arc<DomainRouter>, request: ToolRequest) -> GatewayResult<ToolResult> {
        match request {
            ToolRequest::ApiCall {
                command,
                payload,
                target,
            } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::InvalidRequest {
                        reason: "api_call requires a non-empty command".to_string(),
                    });
                }
                let payload = if payload.is_null() { json!({}) } else { payload };
                let data = router.call(&command, &payload, target.as_deref()).await?;
                Ok(ToolResult::ok(data))
            }

            ToolRequest::RunScript {
                target,
                name,
                script,
                max_retries,
            } => {
                let runner = self.runner(router);
                let mut task = runner.submit_and_run(&target, &name, &script).await?;
                let max = max_retries.unwrap_or(self.settings.max_task_polls);
                let outcome = runner.await_task(&mut task, max).await?;
                Ok(Self::task_result(&task, outcome))
            }

            ToolRequest::ShowTask {
                target,
                task_id,
                max_retries,
            } => {
                let runner = self.runner(router);
                let mut task = runner.resume(task_id, target);
                let max = max_retries.unwrap_or(self.settings.max_task_polls);
                let outcome = runner.await_task(&mut task, max).await?;
                Ok(Self::task_result(&task, outcome))
            }

            ToolRequest::SetDebug { enabled } => Ok(ToolResult::ok(json!({ "debug": enabled }))),
        }
    }

    fn runner(&self, router: Arc<DomainRouter>) -> RemoteTaskRunner {
        RemoteTaskRunner::new(router, Arc::clone(&self.clock)).with_schedule(self.settings.backoff.clone())
    }

    fn task_result(task: &RemoteTask, outcome: TaskOutcome) -> ToolResult {
        match outcome {
            TaskOutcome::Completed { success, output } => {
                let mut result = ToolResult::ok(json!({
                    "success": success,
                    "output": output,
                    "target": task.target,
                }));
                result.task_id = Some(task.task_id.clone());
                result
            }
            TaskOutcome::NotCompleted { task_id, attempts } => {
                let context = ErrorContext::new(GatewayError::TaskTimeout {
                    task_id: task_id.clone(),
                    attempts,
                });
                info!("[Gateway] {}", context.technical_message());
                ToolResult::processing(task_id, context.user_message())
            }
        }
    }

    /// Explicit teardown by the transport
    pub async fn end_session(&self, caller_id: &str) -> GatewayResult<bool> {
        let removed = self.registry.remove(caller_id)?;
        self.discard(caller_id).await;
        if removed {
            info!("[Gateway] Session {} ended", caller_id);
        }
        Ok(removed)
    }

    /// Evict idle callers and their connections. Returns the evicted ids.
    ///
    /// Connections whose caller is no longer registered (cap-evicted while a
    /// request was in flight) are discarded in the same sweep.
    pub async fn evict_idle(&self) -> GatewayResult<Vec<String>> {
        let evicted = self.registry.evict_idle(self.settings.idle_timeout)?;
        for caller_id in &evicted {
            self.discard(caller_id).await;
        }

        for caller_id in self.connections.caller_ids().await {
            if caller_id != DEFAULT_CALLER_ID && self.registry.get(&caller_id)?.is_none() {
                debug!("[Gateway] Discarding orphaned connection of {}", caller_id);
                self.discard(&caller_id).await;
            }
        }
        Ok(evicted)
    }

    pub fn status_report(&self) -> GatewayResult<StatusReport> {
        self.registry.status_report()
    }

    /// Log out of every backend session and forget all callers
    pub async fn shutdown(&self) {
        let connections = self.connections.clear().await;
        if connections.is_empty() {
            return;
        }
        info!("[Gateway] Logging out of {} connection(s)", connections.len());
        futures::future::join_all(connections.iter().map(|connection| connection.logout_all())).await;
    }

    /// Drop the caller's connection and log it out in the background. The
    /// default caller keeps its process-level configuration.
    async fn discard(&self, caller_id: &str) {
        if caller_id == DEFAULT_CALLER_ID {
            return;
        }
        if let Some(connection) = self.connections.evict(caller_id).await {
            debug!("[Gateway] Logging out connection of {}", caller_id);
            Self::spawn_logout(connection);
        }
    }

    fn spawn_logout(connection: Arc<DomainRouter>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.logout_all().await });
            }
            Err(_) => drop(connection),
        }
    }
}
