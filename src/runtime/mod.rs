//! Workflow runtime: the launcher, the isolated worker and what runs inside
//! it.

pub mod host;
pub mod launcher;
pub mod message;
pub mod script;
pub mod telemetry;
pub mod worker;

pub use host::{ScriptHost, ScriptTask};
pub use launcher::Launcher;
pub use message::{ExecutionEvent, ExecutionStatus, Outbox, WorkerCommand, WorkerEvent};
pub use script::{build_script, WORKFLOW_MARKER};
pub use telemetry::{ExecutionContext, ExecutionTelemetry, NextFn, NodeRunContext};
pub use worker::{run_worker, run_worker_with_io};
