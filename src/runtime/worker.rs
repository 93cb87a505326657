//! Worker process: evaluates the workflow script and serves its webhooks
//! until told to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing::{debug, error, info, warn};

use super::host::ScriptHost;
use super::message::{pump_events, read_message, Outbox, WorkerCommand};
use super::telemetry::ExecutionTelemetry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::template::TemplateCompiler;
use crate::webhook::{WebhookRouter, WebhookServer};

const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the worker on the process's stdin/stdout. Returns the exit code.
pub async fn run_worker(config: Config) -> Result<i32> {
    let coordinator = ShutdownCoordinator::new();
    install_panic_hook(coordinator.clone());
    coordinator.start_signal_listener();

    run_worker_with_io(
        config,
        coordinator,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Run the worker over an arbitrary channel.
pub async fn run_worker_with_io<R, W>(
    config: Config,
    coordinator: ShutdownCoordinator,
    mut commands: R,
    events: W,
) -> Result<i32>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let script = match read_message::<_, WorkerCommand>(&mut commands).await? {
        Some(WorkerCommand::Load { script }) => script,
        Some(WorkerCommand::Terminate) | None => {
            info!("Worker stopped before a script was loaded");
            return Ok(0);
        }
    };

    let (outbox, rx) = Outbox::new();
    let pump = tokio::spawn(pump_events(rx, events));
    spawn_command_reader(commands, coordinator.clone());

    let server = WebhookServer::bind(&config.server).await?;
    let base_url = config.base_url(&server.listener_url());
    let webhooks = WebhookRouter::new(&base_url);
    server.serve(webhooks.clone(), coordinator.cleanup());

    let host = ScriptHost::new(
        webhooks,
        Arc::new(TemplateCompiler::new()),
        ExecutionTelemetry::new(outbox),
    );

    let task = match host.start(script).await {
        Ok(task) => {
            coordinator.mark_running();
            info!("Workflow loaded; webhooks at {}", base_url);
            Some(task)
        }
        Err(e) => {
            error!("Workflow script failed: {}", e);
            coordinator.request_shutdown(ShutdownReason::Uncaught(e.to_string()));
            None
        }
    };

    coordinator.wait_for_shutdown().await;
    let code = coordinator.run_cleanups().await;

    if let Some(task) = task {
        task.stop().await;
    }
    drop(host);
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, pump).await.is_err() {
        warn!("Timed out flushing worker events");
    }

    info!("Worker terminated with code {}", code);
    Ok(code)
}

/// Read launcher commands until the channel closes.
fn spawn_command_reader<R>(mut commands: R, coordinator: ShutdownCoordinator)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_message::<_, WorkerCommand>(&mut commands).await {
                Ok(Some(WorkerCommand::Terminate)) => {
                    coordinator.request_shutdown(ShutdownReason::Terminate);
                }
                Ok(Some(WorkerCommand::Load { .. })) => {
                    warn!("Ignoring load after the script was already loaded");
                }
                Ok(None) => {
                    debug!("Launcher channel closed");
                    coordinator.request_shutdown(ShutdownReason::Terminate);
                    break;
                }
                Err(Error::Channel(message)) => warn!("{}", message),
                Err(e) => {
                    warn!("Failed to read from launcher: {}", e);
                    coordinator.request_shutdown(ShutdownReason::Terminate);
                    break;
                }
            }
        }
    });
}

/// Turn any panic into an uncaught-failure shutdown.
fn install_panic_hook(coordinator: ShutdownCoordinator) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        coordinator.request_shutdown(ShutdownReason::Uncaught(info.to_string()));
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::runtime::message::{write_message, WorkerEvent};
    use crate::shutdown::LifecycleState;
    use tokio::io::{duplex, AsyncBufReadExt, DuplexStream};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server = ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
        };
        config.runtime.external_url = Some("https://hooks.example.com".to_string());
        config
    }

    /// Launcher ends of the two pipes, one per direction.
    struct Channel {
        commands: DuplexStream,
        events: BufReader<DuplexStream>,
    }

    fn spawn_worker(
        coordinator: ShutdownCoordinator,
    ) -> (Channel, tokio::task::JoinHandle<Result<i32>>) {
        spawn_worker_with(test_config(), coordinator)
    }

    fn spawn_worker_with(
        config: Config,
        coordinator: ShutdownCoordinator,
    ) -> (Channel, tokio::task::JoinHandle<Result<i32>>) {
        let (commands, worker_commands) = duplex(64 * 1024);
        let (worker_events, events) = duplex(64 * 1024);

        let handle = tokio::spawn(run_worker_with_io(
            config,
            coordinator,
            BufReader::new(worker_commands),
            worker_events,
        ));
        (
            Channel {
                commands,
                events: BufReader::new(events),
            },
            handle,
        )
    }

    async fn exit_code(handle: tokio::task::JoinHandle<Result<i32>>) -> i32 {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker did not exit")
            .unwrap()
            .unwrap()
    }

    async fn wait_for_state(coordinator: &ShutdownCoordinator, state: LifecycleState) {
        for _ in 0..200 {
            if coordinator.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never reached {}", state);
    }

    #[tokio::test]
    async fn test_load_then_terminate_exits_zero() {
        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker(coordinator.clone());

        let script = r#"
            let url = webhook("/hooks/abc", "GET", "/x", "hi");
            if url != "https://hooks.example.com/hooks/abc/x" { throw url; }
        "#;
        write_message(
            &mut channel.commands,
            &WorkerCommand::Load {
                script: script.to_string(),
            },
        )
        .await
        .unwrap();

        wait_for_state(&coordinator, LifecycleState::Running).await;
        assert_eq!(coordinator.cleanup().len(), 1);

        write_message(&mut channel.commands, &WorkerCommand::Terminate)
            .await
            .unwrap();
        write_message(&mut channel.commands, &WorkerCommand::Terminate)
            .await
            .unwrap();

        assert_eq!(exit_code(handle).await, 0);
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_script_failure_exits_one() {
        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker(coordinator.clone());

        write_message(
            &mut channel.commands,
            &WorkerCommand::Load {
                script: r#"throw "bad workflow";"#.to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(exit_code(handle).await, 1);
        assert!(matches!(
            coordinator.reason(),
            Some(ShutdownReason::Uncaught(message)) if message.contains("bad workflow")
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_terminates() {
        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker(coordinator.clone());

        write_message(
            &mut channel.commands,
            &WorkerCommand::Load {
                script: "let x = 1;".to_string(),
            },
        )
        .await
        .unwrap();
        wait_for_state(&coordinator, LifecycleState::Running).await;
        drop(channel.commands);

        assert_eq!(exit_code(handle).await, 0);
        assert_eq!(coordinator.reason(), Some(&ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_events_reach_the_launcher() {
        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker(coordinator.clone());

        let script = r#"
            let execution = #{
                executionId: "exec-1",
                triggerExecutionId: "exec-0",
                triggerNodeId: "trigger"
            };
            run_node("node-1", execution, #{}, |inputs| #{ok: true});
        "#;
        write_message(
            &mut channel.commands,
            &WorkerCommand::Load {
                script: script.to_string(),
            },
        )
        .await
        .unwrap();
        wait_for_state(&coordinator, LifecycleState::Running).await;
        write_message(&mut channel.commands, &WorkerCommand::Terminate)
            .await
            .unwrap();
        assert_eq!(exit_code(handle).await, 0);

        let mut statuses = Vec::new();
        let mut line = String::new();
        while channel.events.read_line(&mut line).await.unwrap() > 0 {
            let WorkerEvent::LogExecution { data } = serde_json::from_str(line.trim()).unwrap();
            statuses.push(data.status.to_string());
            line.clear();
        }
        assert_eq!(statuses, ["running", "completed"]);
    }

    #[tokio::test]
    async fn test_webhook_request_triggers_execution() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = test_config();
        config.server.port = port;

        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker_with(config, coordinator.clone());

        let script = r#"
            webhook("/hooks/abc", "POST", "/run", |request| {
                let execution = #{
                    executionId: "exec-1",
                    triggerExecutionId: "exec-0",
                    triggerNodeId: "trigger"
                };
                run_node("node-1", execution, request.json, |inputs| inputs);
                "accepted"
            });
        "#;
        write_message(
            &mut channel.commands,
            &WorkerCommand::Load {
                script: script.to_string(),
            },
        )
        .await
        .unwrap();
        wait_for_state(&coordinator, LifecycleState::Running).await;

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/hooks/abc/run", port))
            .body(r#"{"n": 1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "accepted");

        write_message(&mut channel.commands, &WorkerCommand::Terminate)
            .await
            .unwrap();
        assert_eq!(exit_code(handle).await, 0);

        let mut events = Vec::new();
        let mut line = String::new();
        while channel.events.read_line(&mut line).await.unwrap() > 0 {
            let WorkerEvent::LogExecution { data } = serde_json::from_str(line.trim()).unwrap();
            events.push(data);
            line.clear();
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status.to_string(), "running");
        assert_eq!(events[0].node.inputs, Some(serde_json::json!({"n": 1})));
        assert_eq!(events[1].status.to_string(), "completed");
    }

    #[tokio::test]
    async fn test_panic_becomes_uncaught_failure() {
        let coordinator = ShutdownCoordinator::new();
        install_panic_hook(coordinator.clone());

        let result = tokio::spawn(async {
            panic!("worker task exploded");
        })
        .await;
        assert!(result.is_err());

        assert!(matches!(
            coordinator.reason(),
            Some(ShutdownReason::Uncaught(message)) if message.contains("worker task exploded")
        ));
        assert_eq!(coordinator.run_cleanups().await, 1);
    }

    #[tokio::test]
    async fn test_terminate_before_load() {
        let coordinator = ShutdownCoordinator::new();
        let (mut channel, handle) = spawn_worker(coordinator.clone());

        write_message(&mut channel.commands, &WorkerCommand::Terminate)
            .await
            .unwrap();
        assert_eq!(exit_code(handle).await, 0);
    }
}
