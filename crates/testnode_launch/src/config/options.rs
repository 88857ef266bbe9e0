//! Launch options and node file schema definitions

use crate::config::domains::{self, BdnsMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Default number of full pipeline attempts
pub const DEFAULT_MAX_TRIES: u32 = 100;

/// Prefix for generated temporary storage roots
pub const STORAGE_ROOT_PREFIX: &str = "psk_";

/// Input to one launcher instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// Retry budget shared by port allocation and the whole pipeline
    pub max_tries: u32,

    /// Storage root; a fresh temporary directory when absent
    pub storage_root: Option<PathBuf>,

    /// Fixed port; skips allocation
    pub port: Option<u16>,

    /// Content of `apihub.json`
    pub server_config: Map<String, Value>,

    /// Domains hosted by the node (ordered, unique by name)
    pub domains: Vec<DomainSpec>,

    /// Precomputed BDNS map
    pub bdns: Option<BdnsMap>,

    /// Validator identity to use instead of creating one
    pub validator_identity: Option<String>,

    /// Explicit validator set
    pub validators: Option<Vec<Validator>>,

    /// Run the service inside an isolated worker process
    pub use_isolated_worker: bool,

    /// Append "default", "test1" and "test2" when missing
    pub include_default_domains: bool,

    /// Contract build file; enables the contract/domain bootstrap
    pub contract_artifact_path: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            storage_root: None,
            port: None,
            server_config: Map::new(),
            domains: Vec::new(),
            bdns: None,
            validator_identity: None,
            validators: None,
            use_isolated_worker: false,
            include_default_domains: true,
            contract_artifact_path: None,
        }
    }
}

impl LaunchOptions {
    /// Parse options from YAML
    pub fn from_yaml(content: &str) -> Result<Self, OptionsError> {
        let options: LaunchOptions = serde_yaml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| OptionsError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Add a domain, replacing any domain with the same name
    pub fn with_domain(mut self, domain: DomainSpec) -> Self {
        match self.domains.iter_mut().find(|d| d.name == domain.name) {
            Some(existing) => *existing = domain,
            None => self.domains.push(domain),
        }
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.port == Some(0) {
            return Err(OptionsError::Validation(
                "'port' must be a non-zero TCP port".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return Err(OptionsError::Validation(
                    "domain names must not be empty".to_string(),
                ));
            }
            if !seen.insert(domain.name.as_str()) {
                return Err(OptionsError::Validation(format!(
                    "domain '{}' is listed more than once",
                    domain.name
                )));
            }
        }

        Ok(())
    }

    /// Fill in defaults: retry budget, storage root and default domains.
    ///
    /// The returned options always carry a storage root.
    pub fn complete(mut self) -> Result<Self, OptionsError> {
        self.validate()?;

        if self.max_tries == 0 {
            self.max_tries = 1;
        }

        if self.storage_root.is_none() {
            let dir = tempfile::Builder::new()
                .prefix(STORAGE_ROOT_PREFIX)
                .tempdir()
                .map_err(OptionsError::StorageRoot)?;
            let root = dir.keep();
            log::info!("Creating random storage folder: {}", root.display());
            self.storage_root = Some(root);
        }

        self.domains = domains::merge_defaults(self.domains, self.include_default_domains);
        Ok(self)
    }

    /// Whether the contract/domain bootstrap runs
    pub fn contract_requested(&self) -> bool {
        self.contract_artifact_path.is_some()
    }
}

/// A named domain and its JSON configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DomainEntry")]
pub struct DomainSpec {
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl DomainSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Map::new(),
        }
    }

    pub fn with_config(name: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Domains may be written as a bare name or as `{ name, config }`
#[derive(Deserialize)]
#[serde(untagged)]
enum DomainEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        config: Map<String, Value>,
    },
}

impl From<DomainEntry> for DomainSpec {
    fn from(entry: DomainEntry) -> Self {
        match entry {
            DomainEntry::Name(name) => DomainSpec::new(name),
            DomainEntry::Full { name, config } => DomainSpec::with_config(name, config),
        }
    }
}

/// Identity and URL authorised to validate a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(rename = "DID", alias = "identity")]
    pub identity: String,
    #[serde(rename = "URL", alias = "url")]
    pub url: String,
}

/// How to run the external server executable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCommand {
    pub executable: String,
    /// Arguments; support `$(arg port)`, `$(arg storage_root)`,
    /// `$(arg node_url)`, `$(arg config_location)` and `$(env NAME)`
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Time allowed for the port to start accepting connections
    pub boot_timeout_ms: u64,
}

impl Default for ServiceCommand {
    fn default() -> Self {
        Self {
            executable: "apihub".to_string(),
            args: vec![
                "--port".to_string(),
                "$(arg port)".to_string(),
                "--root".to_string(),
                "$(arg storage_root)".to_string(),
            ],
            env: HashMap::new(),
            working_dir: None,
            boot_timeout_ms: 30_000,
        }
    }
}

/// How to run the isolated worker executable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    /// Worker executable; `testnode_worker` next to the current binary when unset
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn resolve_executable(&self) -> PathBuf {
        if let Some(exe) = &self.executable {
            return exe.clone();
        }
        let name = format!("testnode_worker{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// How to run the external build scripts used for contract bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptRunnerConfig {
    /// Interpreter; scripts are executed directly when unset
    pub interpreter: Option<String>,
    pub scripts_dir: PathBuf,
    /// File extension appended to the script name
    pub extension: Option<String>,
    /// Arguments placed before the per-call arguments
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for ScriptRunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: Some("node".to_string()),
            scripts_dir: PathBuf::from("node_modules/octopus/scripts"),
            extension: Some("js".to_string()),
            extra_args: vec!["--bundles=./psknode/bundles".to_string()],
            working_dir: None,
        }
    }
}

/// Root of a node file: launch options plus the commands used to run them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFile {
    #[serde(flatten)]
    pub options: LaunchOptions,
    #[serde(default)]
    pub service: ServiceCommand,
    #[serde(default)]
    pub worker: WorkerCommand,
    #[serde(default)]
    pub scripts: ScriptRunnerConfig,
}

impl NodeFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| OptionsError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, OptionsError> {
        let file: NodeFile = serde_yaml::from_str(content)?;
        file.options.validate()?;
        Ok(file)
    }
}

/// Errors that can occur when loading or completing options
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("Failed to read node file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse options: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to create storage root: {0}")]
    StorageRoot(#[source] std::io::Error),
}
