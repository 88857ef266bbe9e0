//! Test harness: one launched node plus the domains bootstrapped on it
//!
//! ```no_run
//! # async fn run(ctx: testnode_launch::LaunchContext,
//! #              engine: std::sync::Arc<dyn testnode_launch::DomainEngine>)
//! #     -> Result<(), testnode_launch::HarnessError> {
//! use testnode_launch::{DomainSetup, Harness, LaunchOptions};
//!
//! let mut harness = Harness::temporary(ctx, engine)?;
//! harness.add_domain(DomainSetup::new("local").with_agents(["alice"]))?;
//! let node = harness.launch(LaunchOptions::default()).await?;
//! println!("node at {}", node.node_url());
//! harness.tear_down();
//! # Ok(())
//! # }
//! ```

use crate::config::{DomainSpec, LaunchOptions, OptionsError, STORAGE_ROOT_PREFIX};
use crate::runtime::{LaunchContext, LaunchError, LaunchOrchestrator, LaunchResult, ProcessHandle};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Domain used by [`Harness::launch_with_contract`] when none is given
pub const CONTRACT_DOMAIN: &str = "contract";

/// Role under which domains are registered with the launcher
pub const SYSTEM_ROLE: &str = "system";

const LAUNCHER_CONSTITUTION: &str = "launcher";
const AGENT_PUBLIC_KEY: &str = "public_key";

/// Transactions the harness runs against the domain engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Transaction {
    AddDomain {
        name: String,
        role: String,
        workspace: PathBuf,
        constitution_seed: String,
    },
    AddAgent {
        name: String,
        public_key: String,
    },
    AddDomainConfig {
        name: String,
        interfaces: Value,
    },
}

/// Sources for a constitution archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstitutionRequest {
    pub domain: String,
    pub constitution_source: Option<PathBuf>,
    pub bundles_source: Option<PathBuf>,
}

/// Storage and transaction engine the domains live in
#[async_trait]
pub trait DomainEngine: Send + Sync {
    /// Build a constitution archive and return its seed
    async fn create_constitution(&self, request: &ConstitutionRequest) -> Result<String, EngineError>;

    /// Execute `transaction` against the archive identified by `seed`
    async fn execute(&self, seed: &str, transaction: Transaction) -> Result<(), EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Constitution build failed: {0}")]
    Constitution(String),
}

/// Explicit inputs of a domain bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineContext {
    /// Seed of the launcher constitution that domains are added to
    pub launcher_seed: String,
    pub node_url: String,
}

/// A domain to bootstrap after the node is up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSetup {
    pub name: String,
    pub agents: Vec<String>,
    pub constitution_source: Option<PathBuf>,
    pub bundles_source: Option<PathBuf>,
}

impl DomainSetup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sources(
        mut self,
        constitution_source: impl Into<PathBuf>,
        bundles_source: impl Into<PathBuf>,
    ) -> Self {
        self.constitution_source = Some(constitution_source.into());
        self.bundles_source = Some(bundles_source.into());
        self
    }
}

/// A domain registered with the harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDomain {
    pub setup: DomainSetup,
    pub workspace: PathBuf,
    /// Constitution seed, once bootstrapped
    pub seed: Option<String>,
}

/// Launch with a contract plus the contract domain's config
#[derive(Debug, Clone)]
pub struct ContractLaunch {
    pub result: LaunchResult,
    pub domain_config: Map<String, Value>,
}

/// `name` lowercased with every non-alphanumeric character replaced by `_`
pub fn domain_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub struct Harness {
    root: PathBuf,
    ctx: LaunchContext,
    engine: Arc<dyn DomainEngine>,
    domains: IndexMap<String, RegisteredDomain>,
    handles: Vec<Arc<dyn ProcessHandle>>,
    launched: bool,
    torn_down: bool,
}

impl Harness {
    pub fn new(root: impl Into<PathBuf>, ctx: LaunchContext, engine: Arc<dyn DomainEngine>) -> Self {
        Self {
            root: root.into(),
            ctx,
            engine,
            domains: IndexMap::new(),
            handles: Vec::new(),
            launched: false,
            torn_down: false,
        }
    }

    /// Harness over a fresh temporary storage root
    pub fn temporary(ctx: LaunchContext, engine: Arc<dyn DomainEngine>) -> Result<Self, HarnessError> {
        let root = tempfile::Builder::new()
            .prefix(STORAGE_ROOT_PREFIX)
            .tempdir()
            .map_err(|e| HarnessError::Io {
                path: std::env::temp_dir().display().to_string(),
                source: e,
            })?
            .keep();
        Ok(Self::new(root, ctx, engine))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a domain to bootstrap at launch; a later setup with the
    /// same name replaces the earlier one
    pub fn add_domain(&mut self, setup: DomainSetup) -> Result<&mut Self, HarnessError> {
        if self.launched {
            return Err(HarnessError::AlreadyLaunched);
        }

        let workspace = self.root.join("nodes").join(domain_key(&setup.name));
        self.domains.insert(
            setup.name.clone(),
            RegisteredDomain {
                setup,
                workspace,
                seed: None,
            },
        );
        Ok(self)
    }

    pub fn domain_config(&self, name: &str) -> Option<&RegisteredDomain> {
        self.domains.get(name)
    }

    /// Launch the node on the harness root, then bootstrap every added
    /// domain in insertion order. A failed launch can be retried.
    pub async fn launch(&mut self, mut options: LaunchOptions) -> Result<LaunchResult, HarnessError> {
        if self.launched {
            return Err(HarnessError::AlreadyLaunched);
        }

        options.storage_root = Some(self.root.clone());
        let orchestrator = LaunchOrchestrator::new(options, self.ctx.clone())?;
        let result = orchestrator.launch().await?;
        self.launched = true;
        self.handles.push(Arc::clone(&result.handle));

        if self.domains.is_empty() {
            return Ok(result);
        }

        let nodes = self.root.join("nodes");
        tokio::fs::create_dir_all(&nodes)
            .await
            .map_err(|e| HarnessError::Io {
                path: nodes.display().to_string(),
                source: e,
            })?;

        let launcher_seed = self
            .engine
            .create_constitution(&ConstitutionRequest {
                domain: LAUNCHER_CONSTITUTION.to_string(),
                constitution_source: None,
                bundles_source: None,
            })
            .await?;
        let ctx = EngineContext {
            launcher_seed,
            node_url: result.validator_url.clone(),
        };

        let pending: Vec<RegisteredDomain> = self.domains.values().cloned().collect();
        for domain in pending {
            let seed = self.build_domain_configuration(&ctx, &domain).await?;
            if let Some(entry) = self.domains.get_mut(&domain.setup.name) {
                entry.seed = Some(seed);
            }
        }

        log::info!("[harness] {} domain(s) ready", self.domains.len());
        Ok(result)
    }

    /// Bootstrap one domain and return its constitution seed
    pub async fn build_domain_configuration(
        &self,
        ctx: &EngineContext,
        domain: &RegisteredDomain,
    ) -> Result<String, HarnessError> {
        let name = &domain.setup.name;
        log::info!(
            "[harness] Domain {} in workspace {}",
            name,
            domain.workspace.display()
        );

        tokio::fs::create_dir_all(&domain.workspace)
            .await
            .map_err(|e| HarnessError::Io {
                path: domain.workspace.display().to_string(),
                source: e,
            })?;

        let seed = self
            .engine
            .create_constitution(&ConstitutionRequest {
                domain: name.clone(),
                constitution_source: domain.setup.constitution_source.clone(),
                bundles_source: domain.setup.bundles_source.clone(),
            })
            .await?;

        self.engine
            .execute(
                &ctx.launcher_seed,
                Transaction::AddDomain {
                    name: name.clone(),
                    role: SYSTEM_ROLE.to_string(),
                    workspace: domain.workspace.clone(),
                    constitution_seed: seed.clone(),
                },
            )
            .await?;

        if domain.setup.agents.is_empty() {
            return Ok(seed);
        }

        log::info!("[harness] Domain {} defining agents...", name);
        for agent in &domain.setup.agents {
            self.engine
                .execute(
                    &seed,
                    Transaction::AddAgent {
                        name: agent.clone(),
                        public_key: AGENT_PUBLIC_KEY.to_string(),
                    },
                )
                .await?;
        }
        self.engine
            .execute(
                &seed,
                Transaction::AddDomainConfig {
                    name: name.clone(),
                    interfaces: json!({ "system": { "virtualMQ": ctx.node_url } }),
                },
            )
            .await?;

        Ok(seed)
    }

    /// Launch with a contract build and hand back the contract domain's
    /// patched config.
    ///
    /// `domain` is put first when given; with no domains at all the list
    /// becomes `["contract"]`.
    pub async fn launch_with_contract(
        &mut self,
        artifact: impl Into<PathBuf>,
        domain: Option<&str>,
        mut options: LaunchOptions,
    ) -> Result<ContractLaunch, HarnessError> {
        if let Some(name) = domain {
            if !options.domains.iter().any(|d| d.name == name) {
                options.domains.insert(0, DomainSpec::new(name));
            }
        }
        if options.domains.is_empty() {
            options.domains.push(DomainSpec::new(CONTRACT_DOMAIN));
        }
        options.contract_artifact_path = Some(artifact.into());

        let result = self.launch(options).await?;
        let domain_config = result
            .domains
            .first()
            .map(|d| d.config.clone())
            .unwrap_or_default();

        Ok(ContractLaunch {
            result,
            domain_config,
        })
    }

    /// Kill every launched node and remove the storage root. Errors are
    /// logged and swallowed; calling it again does nothing.
    pub fn tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::info!("[harness] Tearing down...");

        for handle in self.handles.drain(..) {
            match handle.kill() {
                Ok(()) => log::info!("[harness] Killed node {:?}", handle.pid()),
                Err(e) => log::info!("[harness] Node already gone: {}", e),
            }
        }

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => log::info!("[harness] Removed {}", self.root.display()),
            Err(e) => log::debug!("[harness] Could not remove {}: {}", self.root.display(), e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Domains cannot be added or launched after launch")]
    AlreadyLaunched,

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Domain engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
