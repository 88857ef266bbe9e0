//! Isolated worker: runs the service in a separate process and hands back
//! exactly one message.
//!
//! The parent writes one JSON [`WorkerInput`] line to the worker's stdin.
//! The worker answers with one JSON [`WorkerMessage`] line on stdout and
//! logs everything else to stderr.

use crate::config::{
    ScriptRunnerConfig, ServiceCommand, SubstitutionContext, SubstitutionError, WorkerCommand,
};
use crate::runtime::process::{ChildPipes, ChildProcess, ProcessConfig, ProcessError, ProcessHandle};
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::scripts::{ScriptError, ScriptRunner, BUILD_SCRIPT, CREATE_DOMAIN_SCRIPT};
use crate::runtime::service::{node_url, RunningService, ServiceLauncher, ServiceRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Seed file written by the contract build, relative to the storage root
pub const CONTRACT_SEED_FILE: &str = ".contract-seed";
/// Seed file written by the domain creation, relative to the storage root
pub const DOMAIN_SEED_FILE: &str = ".domain-seed";

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What the launcher asks of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub port: u16,
    pub storage_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_artifact_path: Option<PathBuf>,
}

impl WorkerRequest {
    pub fn name(&self) -> String {
        format!("worker-{}", self.port)
    }
}

/// Initial input line sent to the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInput {
    #[serde(flatten)]
    pub request: WorkerRequest,
    #[serde(default)]
    pub service: ServiceCommand,
    #[serde(default)]
    pub scripts: ScriptRunnerConfig,
}

/// The single message a worker sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Booted { result: Value },
    DomainSeed { domain_seed: String },
    Failed { error: String },
}

/// Successful answer of a worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// The service booted and keeps running inside the worker
    Booted(Value),
    /// Contract bootstrap finished; the worker has been told to stop
    DomainSeed(String),
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub reply: WorkerReply,
    /// Long-lived worker, present only for [`WorkerReply::Booted`]
    pub handle: Option<Arc<dyn ProcessHandle>>,
}

/// Runs a service instance in an isolated unit of execution
#[async_trait]
pub trait IsolatedRunner: Send + Sync {
    async fn run_isolated(&self, request: WorkerRequest) -> Result<WorkerOutcome, WorkerError>;
}

/// Spawns the worker executable and performs the one-message handoff
#[derive(Debug, Clone)]
pub struct WorkerOrchestrator {
    command: WorkerCommand,
    service: ServiceCommand,
    scripts: ScriptRunnerConfig,
    registry: ProcessRegistry,
}

impl WorkerOrchestrator {
    pub fn new(
        command: WorkerCommand,
        service: ServiceCommand,
        scripts: ScriptRunnerConfig,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            command,
            service,
            scripts,
            registry,
        }
    }

    /// Worker args accept `$(arg port)`, `$(arg storage_root)`,
    /// `$(arg node_url)` and `$(env NAME)`
    fn process_config(&self, request: &WorkerRequest) -> Result<ProcessConfig, WorkerError> {
        let ctx = SubstitutionContext::new()
            .with_arg("port", request.port.to_string())
            .with_arg("storage_root", request.storage_root.display().to_string())
            .with_arg("node_url", node_url(request.port));

        Ok(ProcessConfig {
            name: request.name(),
            executable: self.command.resolve_executable().display().to_string(),
            args: ctx.substitute_all(&self.command.args)?,
            env: HashMap::new(),
            working_dir: None,
        })
    }

    async fn handoff(
        &self,
        name: &str,
        input: &WorkerInput,
        pipes: ChildPipes,
    ) -> Result<(WorkerMessage, tokio::io::Lines<BufReader<tokio::process::ChildStdout>>), WorkerError> {
        let ChildPipes { mut stdin, stdout } = pipes;

        let mut line = serde_json::to_string(input).map_err(WorkerError::Encode)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WorkerError::Io {
                name: name.to_string(),
                source: e,
            })?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        loop {
            let next = lines.next_line().await.map_err(|e| WorkerError::Io {
                name: name.to_string(),
                source: e,
            })?;
            let Some(line) = next else {
                return Err(WorkerError::NoMessage {
                    name: name.to_string(),
                });
            };
            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(message) => return Ok((message, lines)),
                Err(_) => log::info!("[{}] {}", name, line),
            }
        }
    }
}

#[async_trait]
impl IsolatedRunner for WorkerOrchestrator {
    async fn run_isolated(&self, request: WorkerRequest) -> Result<WorkerOutcome, WorkerError> {
        let name = request.name();
        let contract_mode = request.contract_artifact_path.is_some();
        let config = self.process_config(&request)?;
        let input = WorkerInput {
            request,
            service: self.service.clone(),
            scripts: self.scripts.clone(),
        };

        let (process, pipes) = ChildProcess::spawn_piped(&config)?;
        let process = Arc::new(process);
        self.registry
            .register(name.clone(), Arc::clone(&process) as Arc<dyn ProcessHandle>);

        let (message, mut lines) = match self.handoff(&name, &input, pipes).await {
            Ok(received) => received,
            Err(WorkerError::NoMessage { name }) => {
                let code = process.wait().await.ok().flatten();
                return Err(WorkerError::Exited { name, code });
            }
            Err(e) => {
                stop_worker(&name, &process).await;
                return Err(e);
            }
        };

        match message {
            WorkerMessage::Failed { error } => {
                stop_worker(&name, &process).await;
                Err(WorkerError::Reported { name, error })
            }
            WorkerMessage::DomainSeed { domain_seed } => {
                log::info!("[{}] Received domain seed, terminating worker", name);
                process.stop(WORKER_STOP_TIMEOUT).await?;
                Ok(WorkerOutcome {
                    reply: WorkerReply::DomainSeed(domain_seed),
                    handle: None,
                })
            }
            WorkerMessage::Booted { result } if !contract_mode => {
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        log::info!("[{}] {}", name, line);
                    }
                });
                Ok(WorkerOutcome {
                    reply: WorkerReply::Booted(result),
                    handle: Some(process as Arc<dyn ProcessHandle>),
                })
            }
            WorkerMessage::Booted { .. } => {
                stop_worker(&name, &process).await;
                Err(WorkerError::Protocol {
                    name,
                    expected: "domain_seed",
                })
            }
        }
    }
}

async fn stop_worker(name: &str, process: &ChildProcess) {
    if let Err(e) = process.stop(WORKER_STOP_TIMEOUT).await {
        log::warn!("[{}] {}", name, e);
    }
}

/// Worker side: start the service and produce the single reply.
///
/// In contract mode the service is terminated before the reply is
/// produced and `None` is returned alongside it; otherwise the running
/// service is handed back to be kept alive.
pub async fn serve(
    input: &WorkerInput,
    launcher: &dyn ServiceLauncher,
    scripts: &dyn ScriptRunner,
) -> (WorkerMessage, Option<RunningService>) {
    let request = ServiceRequest::new(input.request.port, input.request.storage_root.clone());
    let service = match launcher.start(&request).await {
        Ok(service) => service,
        Err(e) => {
            log::error!("[{}] Boot error: {}", request.name, e);
            return (
                WorkerMessage::Failed {
                    error: e.to_string(),
                },
                None,
            );
        }
    };

    let Some(artifact) = &input.request.contract_artifact_path else {
        return (
            WorkerMessage::Booted {
                result: service.boot.clone(),
            },
            Some(service),
        );
    };

    let built = bootstrap_domain(&input.request.storage_root, artifact, scripts).await;
    if let Err(e) = service.handle.kill() {
        log::warn!("[{}] {}", request.name, e);
    }

    match built {
        Ok(domain_seed) => (WorkerMessage::DomainSeed { domain_seed }, None),
        Err(e) => {
            log::error!("[{}] Contract bootstrap failed: {}", request.name, e);
            (
                WorkerMessage::Failed {
                    error: e.to_string(),
                },
                None,
            )
        }
    }
}

/// Registry tracking a booted service under its `node-<port>` name.
///
/// The worker installs its shutdown hooks over this before replying, so
/// the service is covered from the moment the parent learns of it.
pub fn service_registry(port: u16, service: &RunningService) -> ProcessRegistry {
    let registry = ProcessRegistry::new();
    registry.register(format!("node-{}", port), Arc::clone(&service.handle));
    registry
}

/// Build the contract artifact, then create a domain bound to it.
///
/// Returns the domain seed.
pub async fn bootstrap_domain(
    storage_root: &Path,
    artifact: &Path,
    scripts: &dyn ScriptRunner,
) -> Result<String, ScriptError> {
    log::info!("Building and creating contract domain...");
    let contract_seed_path = storage_root.join(CONTRACT_SEED_FILE);
    let domain_seed_path = storage_root.join(DOMAIN_SEED_FILE);

    scripts
        .run(
            BUILD_SCRIPT,
            &[
                format!("--seed={}", contract_seed_path.display()),
                artifact.display().to_string(),
            ],
        )
        .await?;
    let contract_seed = read_seed(&contract_seed_path).await?;
    log::info!("Contract seed: {}", contract_seed);

    scripts
        .run(
            CREATE_DOMAIN_SCRIPT,
            &[
                format!("--dsu-type-ssi={}", contract_seed_path.display()),
                format!("--seed={}", domain_seed_path.display()),
            ],
        )
        .await?;
    read_seed(&domain_seed_path).await
}

async fn read_seed(path: &Path) -> Result<String, ScriptError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ScriptError::Seed {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(content.trim().to_string())
}

/// WorkerFailure: the isolated unit reported an error or never answered
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Invalid worker command: {0}")]
    Command(#[from] SubstitutionError),

    #[error("Failed to encode worker input: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("I/O error talking to '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker '{name}' closed its output without a message")]
    NoMessage { name: String },

    #[error("Worker '{name}' exited with code {code:?} before sending a message")]
    Exited { name: String, code: Option<i32> },

    #[error("Worker '{name}' reported an error: {error}")]
    Reported { name: String, error: String },

    #[error("Worker '{name}' sent an unexpected message, expected '{expected}'")]
    Protocol { name: String, expected: &'static str },
}
