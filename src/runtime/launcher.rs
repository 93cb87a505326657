//! Launcher side: spawns the worker process and relays to it.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::Command;
use tokio::signal;
use tracing::{error, info, warn};

use super::message::{read_message, write_message, WorkerCommand, WorkerEvent};
use crate::config::EXTERNAL_URL_VARS;
use crate::error::{Error, Result};

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Launcher {
    /// Launch workers as `<this executable> worker`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Pass the external base URL to the worker's environment.
    pub fn external_url(self, url: Option<&str>) -> Self {
        match url {
            Some(url) => self.env(EXTERNAL_URL_VARS[0], url),
            None => self,
        }
    }

    /// Start the worker, load `script` into it and wait for it to exit.
    ///
    /// Every interrupt received meanwhile is relayed as `terminate`.
    /// Returns the worker's exit code.
    pub async fn run(&self, script: String) -> Result<i32> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Worker stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Worker stdout is not piped".to_string()))?;

        let relay = tokio::spawn(log_events(BufReader::new(stdout)));

        write_message(&mut stdin, &WorkerCommand::Load { script }).await?;
        info!("Worker started (pid {:?})", child.id());

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                interrupt = signal::ctrl_c() => {
                    if let Err(e) = interrupt {
                        warn!("Failed to listen for interrupt: {}", e);
                        break child.wait().await?;
                    }
                    info!("Interrupt received; terminating worker");
                    if let Err(e) = write_message(&mut stdin, &WorkerCommand::Terminate).await {
                        warn!("Failed to send terminate to worker: {}", e);
                    }
                }
            }
        };

        match relay.await {
            Ok(count) => info!("Worker reported {} execution event(s)", count),
            Err(e) => warn!("Event relay failed: {}", e),
        }

        let code = status.code().unwrap_or(1);
        if !status.success() {
            error!("Worker exited with code {}", code);
        }
        Ok(code)
    }
}

/// Log every execution event the worker sends. Returns how many were read.
async fn log_events<R>(mut reader: R) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut count = 0;
    loop {
        match read_message::<_, WorkerEvent>(&mut reader).await {
            Ok(Some(WorkerEvent::LogExecution { data })) => {
                count += 1;
                info!(
                    event_id = %data.id,
                    node_id = %data.node.id,
                    execution_id = %data.execution.id,
                    status = %data.status,
                    "Execution event"
                );
                if let Some(error) = &data.node.error {
                    warn!(node_id = %data.node.id, "Node failed: {}", error.message);
                }
            }
            Ok(None) => break,
            Err(Error::Channel(message)) => warn!("{}", message),
            Err(e) => {
                warn!("Failed to read worker events: {}", e);
                break;
            }
        }
    }
    count
}
