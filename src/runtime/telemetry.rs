//! Execution telemetry middleware.
//!
//! Wraps a node's run call and reports its lifecycle to the launcher: one
//! `running` event when the run starts and exactly one terminal event
//! (`completed` or `failed`) when it ends. Runs outside a triggered
//! execution are passed through untouched.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::message::{
    ExecutionEvent, ExecutionStatus, IdRef, NodeSnapshot, Outbox, TriggerRef, WorkerEvent,
};
use crate::error::{ErrorSnapshot, Result};

/// Identifies the triggered execution a node run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: String,
    pub trigger_execution_id: String,
    pub trigger_node_id: String,
}

/// Callback a node uses to hand outputs to the pins connected to `pin`.
pub type NextFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything a node run sees.
#[derive(Clone)]
pub struct NodeRunContext {
    pub inputs: Value,
    pub outputs: Value,
    /// Present only for triggered runs.
    pub execution: Option<ExecutionContext>,
    pub next: NextFn,
}

impl NodeRunContext {
    pub fn new(inputs: Value, next: NextFn) -> Self {
        Self {
            inputs,
            outputs: Value::Object(Default::default()),
            execution: None,
            next,
        }
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionContext) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Forward outputs through `next`.
    pub async fn emit(&self, pin: &str, outputs: Value) -> Result<()> {
        (self.next)(pin.to_string(), outputs).await
    }
}

impl std::fmt::Debug for NodeRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRunContext")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

/// A `NextFn` that accepts and discards outputs.
pub fn noop_next() -> NextFn {
    Arc::new(|_: String, _: Value| -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    })
}

/// Emits execution events for wrapped node runs.
#[derive(Debug, Clone)]
pub struct ExecutionTelemetry {
    outbox: Outbox,
}

/// Per-invocation emitter; guarantees a single terminal event.
struct Tracker {
    outbox: Outbox,
    event_id: String,
    node_id: String,
    execution: ExecutionContext,
    terminal_sent: AtomicBool,
}

impl Tracker {
    fn emit(&self, status: ExecutionStatus, node: NodeSnapshot) {
        self.outbox.send(WorkerEvent::LogExecution {
            data: ExecutionEvent {
                id: self.event_id.clone(),
                status,
                node,
                execution: IdRef {
                    id: self.execution.execution_id.clone(),
                },
                trigger: TriggerRef {
                    execution: IdRef {
                        id: self.execution.trigger_execution_id.clone(),
                    },
                    node: IdRef {
                        id: self.execution.trigger_node_id.clone(),
                    },
                },
            },
        });
    }

    fn running(&self, inputs: Value) {
        self.emit(
            ExecutionStatus::Running,
            NodeSnapshot {
                id: self.node_id.clone(),
                inputs: Some(inputs),
                outputs: None,
                error: None,
            },
        );
    }

    /// Returns false when a terminal event was already sent.
    fn completed(&self, outputs: Value) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(
            ExecutionStatus::Completed,
            NodeSnapshot {
                id: self.node_id.clone(),
                inputs: None,
                outputs: Some(outputs),
                error: None,
            },
        );
        true
    }

    fn failed(&self, error: ErrorSnapshot) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(
            ExecutionStatus::Failed,
            NodeSnapshot {
                id: self.node_id.clone(),
                inputs: None,
                outputs: None,
                error: Some(error),
            },
        );
        true
    }
}

impl ExecutionTelemetry {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    /// Run `run` for node `node_id`, reporting its lifecycle.
    ///
    /// Without an execution context this is a plain call and errors
    /// propagate. With one, node errors are reported as `failed` and
    /// swallowed so a failing node never takes the worker down.
    pub async fn wrap<F, Fut>(&self, node_id: &str, ctx: NodeRunContext, run: F) -> Result<()>
    where
        F: FnOnce(NodeRunContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Some(execution) = ctx.execution.clone() else {
            return run(ctx).await;
        };

        let tracker = Arc::new(Tracker {
            outbox: self.outbox.clone(),
            event_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            execution,
            terminal_sent: AtomicBool::new(false),
        });

        tracker.running(ctx.inputs.clone());
        let pending_outputs = ctx.outputs.clone();

        let original_next = ctx.next.clone();
        let patched_tracker = tracker.clone();
        let patched_next: NextFn = Arc::new(
            move |pin: String, outputs: Value| -> BoxFuture<'static, Result<()>> {
                patched_tracker.completed(outputs.clone());
                original_next(pin, outputs)
            },
        );

        let patched = NodeRunContext {
            next: patched_next,
            ..ctx
        };

        match run(patched).await {
            Ok(()) => {
                if tracker.completed(pending_outputs) {
                    debug!(node_id, "Node finished without emitting outputs");
                }
            }
            Err(e) => {
                error!(node_id, error = %e, "Node execution failed");
                tracker.failed(e.to_snapshot());
            }
        }

        Ok(())
    }
}
