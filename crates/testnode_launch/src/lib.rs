//! Test Node Launch System
//!
//! Brings up isolated server instances for integration tests and tears
//! them down again, including on abnormal termination.
//!
//! # Overview
//!
//! A launch:
//! - Picks a free port (or uses a fixed one)
//! - Writes server, domain and BDNS configuration under the storage root
//! - Optionally builds a contract and creates its domain in an isolated worker
//! - Starts the server in-process or inside a worker and tracks its handle
//! - Retries the whole pipeline on any failure, up to `max_tries` attempts
//!
//! # Example Node File
//!
//! ```yaml
//! max_tries: 20
//! use_isolated_worker: true
//!
//! server_config:
//!   enableRequestLogger: true
//!
//! domains:
//!   - vault
//!   - name: contract
//!     config:
//!       anchoring:
//!         type: FS
//!
//! service:
//!   executable: "node_modules/.bin/apihub"
//!   args: ["--port", "$(arg port)", "--root", "$(arg storage_root)"]
//!
//! scripts:
//!   scripts_dir: "node_modules/octopus/scripts"
//! ```

pub mod cli;
pub mod config;
pub mod harness;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    DomainSpec, LaunchOptions, NodeFile, OptionsError, ServiceCommand, SubstitutionContext,
    SubstitutionError, Validator,
};
pub use harness::{
    ConstitutionRequest, ContractLaunch, DomainEngine, DomainSetup, EngineContext, EngineError,
    Harness, HarnessError, RegisteredDomain, Transaction,
};
pub use runtime::{
    serve, service_registry, CommandScriptRunner, CommandServiceLauncher, IsolatedRunner,
    LaunchContext, LaunchError, LaunchOrchestrator, LaunchResult, PortAllocator, PortProbe,
    ProcessHandle, ProcessRegistry, ReleaseWait, ServiceRequest, ShutdownManager, StepError,
    WorkerInput, WorkerMessage, WorkerOrchestrator,
};
