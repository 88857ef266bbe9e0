//! Launch orchestrator: the whole bring-up pipeline with whole-attempt retry

use crate::config::domains::{self, BdnsMap};
use crate::config::writer;
use crate::config::{ConfigError, DomainSpec, LaunchOptions, NodeFile, OptionsError, Validator};
use crate::runtime::identity::{DemoIdentityProvider, IdentityError, IdentityProvider, ResolvedIdentity};
use crate::runtime::ports::{PortAllocator, ReleaseWait, TcpPortProbe};
use crate::runtime::process::ProcessHandle;
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::service::{
    node_url, BootError, CommandServiceLauncher, ServiceLauncher, ServiceRequest,
};
use crate::runtime::worker::{IsolatedRunner, WorkerError, WorkerOrchestrator, WorkerReply, WorkerRequest};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Collaborators threaded through every launch attempt
#[derive(Clone)]
pub struct LaunchContext {
    pub allocator: PortAllocator,
    pub service: Arc<dyn ServiceLauncher>,
    pub worker: Arc<dyn IsolatedRunner>,
    pub identity: Arc<dyn IdentityProvider>,
    pub registry: ProcessRegistry,
    pub release_wait: ReleaseWait,
}

impl LaunchContext {
    /// Real collaborators configured from a node file
    pub fn from_node_file(file: &NodeFile, registry: ProcessRegistry) -> Self {
        Self {
            allocator: PortAllocator::new(Arc::new(TcpPortProbe)),
            service: Arc::new(CommandServiceLauncher::new(file.service.clone())),
            worker: Arc::new(WorkerOrchestrator::new(
                file.worker.clone(),
                file.service.clone(),
                file.scripts.clone(),
                registry.clone(),
            )),
            identity: Arc::new(DemoIdentityProvider),
            registry,
            release_wait: ReleaseWait::default(),
        }
    }
}

/// What a successful launch hands back
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub port: u16,
    /// Service process, or the worker hosting it
    pub handle: Arc<dyn ProcessHandle>,
    pub storage_root: PathBuf,
    /// Seed of the contract domain, when a contract was built
    pub domain_seed: Option<String>,
    pub validator_identity: Option<String>,
    pub validator_url: String,
    pub validator_identity_instance: Option<ResolvedIdentity>,
    /// Final domain list, patched with the constitution when applicable
    pub domains: Vec<DomainSpec>,
    /// Boot result reported by the service
    pub boot: Value,
}

impl LaunchResult {
    pub fn node_url(&self) -> &str {
        &self.validator_url
    }
}

/// Runs the launch pipeline for one set of options
pub struct LaunchOrchestrator {
    options: LaunchOptions,
    storage_root: PathBuf,
    ctx: LaunchContext,
}

impl LaunchOrchestrator {
    /// Complete `options` once; every attempt works from the same copy
    pub fn new(options: LaunchOptions, ctx: LaunchContext) -> Result<Self, OptionsError> {
        let options = options.complete()?;
        let storage_root = options
            .storage_root
            .clone()
            .ok_or_else(|| OptionsError::Validation("storage root missing".to_string()))?;

        Ok(Self {
            options,
            storage_root,
            ctx,
        })
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Run attempts until one succeeds or the retry budget is spent
    pub async fn launch(&self) -> Result<LaunchResult, LaunchError> {
        let max_tries = self.options.max_tries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let remaining = max_tries - attempt + 1;

            match self.run_attempt(remaining).await {
                Ok(result) => {
                    log::info!(
                        "[launch] Node ready at {} (attempt {}/{})",
                        result.validator_url,
                        attempt,
                        max_tries
                    );
                    return Ok(result);
                }
                Err(e) if attempt >= max_tries => {
                    log::error!("[launch] Attempt {}/{} failed: {}", attempt, max_tries, e);
                    return Err(LaunchError::RetryExhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "[launch] Attempt {}/{} failed, retrying: {}",
                        attempt,
                        max_tries,
                        e
                    );
                }
            }
        }
    }

    async fn run_attempt(&self, remaining: u32) -> Result<LaunchResult, StepError> {
        let root = &self.storage_root;

        // ALLOCATE_PORT
        let port = match self.options.port {
            Some(port) => port,
            None => self.ctx.allocator.allocate(remaining).await,
        };
        let url = node_url(port);

        // WRITE_BASE_CONFIG
        writer::write_server_config(root, &self.options.server_config).await?;
        writer::write_domain_configs(root, &self.options.domains).await?;

        // DERIVE_VALIDATORS_AND_BDNS
        let validator_identity = self.validator_identity().await?;
        let validators = self.validators(validator_identity.as_deref(), &url);
        let bdns: BdnsMap = domains::complete_bdns(
            self.options.bdns.as_ref(),
            &self.options.domains,
            &url,
            &validators,
        );

        // WRITE_BDNS
        writer::write_bdns(root, &bdns).await?;

        // BUILD_CONTRACT_AND_DOMAIN, PATCH_DOMAIN_CONFIGS_WITH_CONSTITUTION,
        // WAIT_PORT_RELEASED
        let mut final_domains = self.options.domains.clone();
        let mut domain_seed = None;
        if let Some(artifact) = &self.options.contract_artifact_path {
            let seed = self.build_contract_domain(port, artifact).await?;
            final_domains = domains::patch_with_constitution(&final_domains, &seed);
            writer::write_domain_configs(root, &final_domains).await?;
            self.ctx
                .allocator
                .wait_until_released(port, self.ctx.release_wait)
                .await;
            domain_seed = Some(seed);
        }

        // START_SERVICE_INSTANCE
        if !self.ctx.allocator.is_available(port).await {
            return Err(StepError::PortUnavailable(port));
        }
        let (handle, boot) = self.start_instance(port).await?;

        // RESOLVE_VALIDATOR_IDENTITY
        let validator_identity_instance = match &validator_identity {
            Some(id) => match self.ctx.identity.resolve(id).await {
                Ok(resolved) => Some(resolved),
                Err(e) => {
                    if let Err(kill_err) = handle.kill() {
                        log::warn!("[node-{}] {}", port, kill_err);
                    }
                    return Err(e.into());
                }
            },
            None => None,
        };

        Ok(LaunchResult {
            port,
            handle,
            storage_root: root.clone(),
            domain_seed,
            validator_identity,
            validator_url: url,
            validator_identity_instance,
            domains: final_domains,
            boot,
        })
    }

    async fn validator_identity(&self) -> Result<Option<String>, IdentityError> {
        if let Some(identity) = &self.options.validator_identity {
            return Ok(Some(identity.clone()));
        }
        if self.options.contract_requested() {
            return self.ctx.identity.create_identity().await.map(Some);
        }
        Ok(None)
    }

    fn validators(&self, identity: Option<&str>, url: &str) -> Vec<Validator> {
        if let Some(validators) = &self.options.validators {
            return validators.clone();
        }
        identity
            .map(|identity| Validator {
                identity: identity.to_string(),
                url: url.to_string(),
            })
            .into_iter()
            .collect()
    }

    async fn build_contract_domain(&self, port: u16, artifact: &Path) -> Result<String, StepError> {
        let request = WorkerRequest {
            port,
            storage_root: self.storage_root.clone(),
            contract_artifact_path: Some(artifact.to_path_buf()),
        };
        let name = request.name();
        let outcome = self.ctx.worker.run_isolated(request).await?;

        match outcome.reply {
            WorkerReply::DomainSeed(seed) => {
                log::info!("[{}] Domain seed: {}", name, seed);
                Ok(seed)
            }
            WorkerReply::Booted(_) => {
                if let Some(handle) = outcome.handle {
                    if let Err(e) = handle.kill() {
                        log::warn!("[{}] {}", name, e);
                    }
                }
                Err(WorkerError::Protocol {
                    name,
                    expected: "domain_seed",
                }
                .into())
            }
        }
    }

    async fn start_instance(&self, port: u16) -> Result<(Arc<dyn ProcessHandle>, Value), StepError> {
        if !self.options.use_isolated_worker {
            let request = ServiceRequest::new(port, self.storage_root.clone());
            let service = self.ctx.service.start(&request).await?;
            self.ctx
                .registry
                .register(request.name.clone(), Arc::clone(&service.handle));
            return Ok((service.handle, service.boot));
        }

        let request = WorkerRequest {
            port,
            storage_root: self.storage_root.clone(),
            contract_artifact_path: None,
        };
        let name = request.name();
        let outcome = self.ctx.worker.run_isolated(request).await?;
        match (outcome.reply, outcome.handle) {
            (WorkerReply::Booted(boot), Some(handle)) => {
                self.ctx.registry.register(name, Arc::clone(&handle));
                Ok((handle, boot))
            }
            (_, handle) => {
                if let Some(handle) = handle {
                    if let Err(e) = handle.kill() {
                        log::warn!("[{}] {}", name, e);
                    }
                }
                Err(WorkerError::Protocol {
                    name,
                    expected: "booted",
                }
                .into())
            }
        }
    }
}

/// One failed step; fails the current attempt only
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Config write failed: {0}")]
    ConfigWrite(#[from] ConfigError),

    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("Boot failed: {0}")]
    Boot(#[from] BootError),

    #[error("Validator identity failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("Port {0} is not available")]
    PortUnavailable(u16),
}

/// The only error `launch` returns
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Launch failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: StepError,
    },
}

impl LaunchError {
    pub fn attempts(&self) -> u32 {
        match self {
            LaunchError::RetryExhausted { attempts, .. } => *attempts,
        }
    }
}
