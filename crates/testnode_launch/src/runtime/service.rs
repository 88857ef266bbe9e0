//! Bring-up of the external server process

use crate::config::{NodeEnvironment, ServiceCommand, SubstitutionContext, SubstitutionError};
use crate::runtime::process::{ChildProcess, ProcessConfig, ProcessError, ProcessHandle};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the service needs to boot
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Name used for logging and registry entries
    pub name: String,
    pub port: u16,
    pub storage_root: PathBuf,
    pub environment: NodeEnvironment,
}

impl ServiceRequest {
    pub fn new(port: u16, storage_root: PathBuf) -> Self {
        let environment = NodeEnvironment::new(&storage_root, &node_url(port));
        Self {
            name: format!("node-{}", port),
            port,
            storage_root,
            environment,
        }
    }

    pub fn node_url(&self) -> String {
        node_url(self.port)
    }
}

/// Base URL of a node listening on `port`
pub fn node_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// A booted service instance
#[derive(Debug, Clone)]
pub struct RunningService {
    /// Whatever the service reports once booted
    pub boot: Value,
    pub handle: Arc<dyn ProcessHandle>,
}

/// Starts the server collaborator
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn start(&self, request: &ServiceRequest) -> Result<RunningService, BootError>;
}

/// Runs the server as an executable and waits for its port to accept
/// connections
#[derive(Debug, Clone, Default)]
pub struct CommandServiceLauncher {
    command: ServiceCommand,
}

impl CommandServiceLauncher {
    pub fn new(command: ServiceCommand) -> Self {
        Self { command }
    }

    fn process_config(&self, request: &ServiceRequest) -> Result<ProcessConfig, BootError> {
        let ctx = SubstitutionContext::new()
            .with_arg("port", request.port.to_string())
            .with_arg("storage_root", request.storage_root.display().to_string())
            .with_arg("node_url", request.node_url())
            .with_arg(
                "config_location",
                request.environment.config_location.display().to_string(),
            )
            .with_envs(self.command.env.clone());

        let mut env = request.environment.vars();
        for (key, value) in &self.command.env {
            env.insert(key.clone(), ctx.substitute(value)?);
        }

        Ok(ProcessConfig {
            name: request.name.clone(),
            executable: ctx.substitute(&self.command.executable)?,
            args: ctx.substitute_all(&self.command.args)?,
            env,
            working_dir: self.command.working_dir.clone(),
        })
    }
}

#[async_trait]
impl ServiceLauncher for CommandServiceLauncher {
    async fn start(&self, request: &ServiceRequest) -> Result<RunningService, BootError> {
        let config = self.process_config(request)?;
        let process = Arc::new(ChildProcess::spawn(&config)?);

        let timeout = Duration::from_millis(self.command.boot_timeout_ms);
        let started = Instant::now();
        loop {
            if let Some(code) = process.try_exit_code().await {
                return Err(BootError::Exited {
                    name: request.name.clone(),
                    code,
                });
            }

            if tokio::net::TcpStream::connect(("127.0.0.1", request.port))
                .await
                .is_ok()
            {
                // Another process may hold the port; the child must outlive
                // its own bind attempt to count as booted.
                tokio::time::sleep(BOOT_POLL_INTERVAL).await;
                if let Some(code) = process.try_exit_code().await {
                    log::warn!(
                        "[{}] Port {} answers but the service exited",
                        request.name,
                        request.port
                    );
                    return Err(BootError::Exited {
                        name: request.name.clone(),
                        code,
                    });
                }
                break;
            }

            if started.elapsed() >= timeout {
                if let Err(e) = process.stop(Duration::from_secs(2)).await {
                    log::warn!("[{}] {}", request.name, e);
                }
                return Err(BootError::Timeout {
                    name: request.name.clone(),
                    port: request.port,
                    waited: timeout,
                });
            }

            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }

        log::info!(
            "[{}] Listening on port {} after {:?}",
            request.name,
            request.port,
            started.elapsed()
        );

        Ok(RunningService {
            boot: json!({
                "pid": process.pid(),
                "port": request.port,
                "url": request.node_url(),
            }),
            handle: process,
        })
    }
}

/// The server collaborator failed to start
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Invalid service command: {0}")]
    Command(#[from] SubstitutionError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Service '{name}' exited during boot with code {code:?}")]
    Exited { name: String, code: Option<i32> },

    #[error("Service '{name}' did not listen on port {port} within {waited:?}")]
    Timeout {
        name: String,
        port: u16,
        waited: Duration,
    },

    #[error("Service failed to start: {0}")]
    Other(String),
}
