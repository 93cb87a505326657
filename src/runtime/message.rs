//! Messages exchanged between the launcher and the worker.
//!
//! Each message is one line of JSON tagged by `action`. The launcher writes
//! [`WorkerCommand`]s to the worker's stdin; the worker writes
//! [`WorkerEvent`]s to its stdout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, ErrorSnapshot, Result};

/// Launcher → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Evaluate the assembled script. Sent once, first.
    Load { script: String },
    /// Begin graceful shutdown.
    Terminate,
}

/// Worker → launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum WorkerEvent {
    #[serde(rename = "log:execution")]
    LogExecution { data: ExecutionEvent },
}

/// Status carried by an execution event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One lifecycle event of a tracked node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Shared by the `running` event and its terminal event.
    pub id: String,
    pub status: ExecutionStatus,
    pub node: NodeSnapshot,
    pub execution: IdRef,
    pub trigger: TriggerRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRef {
    pub execution: IdRef,
    pub node: IdRef,
}

/// Read newline-delimited JSON messages from `reader`.
///
/// Blank lines are skipped. Returns `Ok(None)` at end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| Error::Channel(format!("Malformed message '{}': {}", trimmed, e)));
    }
}

/// Write one message as a JSON line and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Sending half of the worker's outbound channel.
///
/// Sends never block and never fail the caller: once the writer is gone,
/// events are dropped.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Forward every outbound event to `writer` until all senders are dropped.
pub async fn pump_events<W>(mut rx: mpsc::UnboundedReceiver<WorkerEvent>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &event).await {
            tracing::warn!("Failed to write worker event: {}", e);
            break;
        }
    }
}
