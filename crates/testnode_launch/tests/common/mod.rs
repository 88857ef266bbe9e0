//! Fakes shared by the launch integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testnode_launch::runtime::{
    BootError, IdentityError, IdentityProvider, ResolvedIdentity, RunningService, ServiceLauncher,
    WorkerError, WorkerOutcome, WorkerReply, WorkerRequest,
};
use testnode_launch::{
    ConstitutionRequest, DomainEngine, EngineError, IsolatedRunner, LaunchContext, PortAllocator,
    PortProbe, ProcessHandle, ProcessRegistry, ReleaseWait, ServiceRequest, Transaction,
};

pub const DOMAIN_SEED: &str = "domain-seed-0001";
pub const VALIDATOR: &str = "did:fake:validator";

/// Handle that counts kill signals
#[derive(Debug, Default)]
pub struct CountingHandle {
    pub kills: AtomicUsize,
    /// Report every kill as failed, like an already-gone process
    pub refuse: AtomicBool,
}

impl CountingHandle {
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for CountingHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_running(&self) -> bool {
        self.kills() == 0
    }

    fn kill(&self) -> Result<(), testnode_launch::runtime::ProcessError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(testnode_launch::runtime::ProcessError::NotRunning(
                "fake".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replays scripted availability answers, then repeats the last one
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
    last: bool,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(answers: &[bool], last: bool) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            last,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(free: bool) -> Arc<Self> {
        Self::new(&[], free)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for ScriptedProbe {
    async fn is_available(&self, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers.lock().unwrap().pop_front().unwrap_or(self.last)
    }
}

/// Service launcher that fails its first `failures` starts
#[derive(Default)]
pub struct FakeService {
    failures: AtomicUsize,
    pub requests: Mutex<Vec<ServiceRequest>>,
    pub handles: Mutex<Vec<Arc<CountingHandle>>>,
}

impl FakeService {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        })
    }

    pub fn starts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_handle(&self) -> Arc<CountingHandle> {
        Arc::clone(self.handles.lock().unwrap().last().unwrap())
    }
}

#[async_trait]
impl ServiceLauncher for FakeService {
    async fn start(&self, request: &ServiceRequest) -> Result<RunningService, BootError> {
        self.requests.lock().unwrap().push(request.clone());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BootError::Other("address already in use".to_string()));
        }

        let handle = Arc::new(CountingHandle::default());
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        Ok(RunningService {
            boot: json!({ "port": request.port, "url": request.node_url() }),
            handle,
        })
    }
}

/// Isolated runner answering like a well-behaved worker
#[derive(Default)]
pub struct FakeWorker {
    pub requests: Mutex<Vec<WorkerRequest>>,
    pub handles: Mutex<Vec<Arc<CountingHandle>>>,
    pub fail: AtomicBool,
    /// Answer `booted` even when a contract build was asked for
    pub boot_on_contract: AtomicBool,
}

impl FakeWorker {
    pub fn contract_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.contract_artifact_path.is_some())
            .count()
    }
}

#[async_trait]
impl IsolatedRunner for FakeWorker {
    async fn run_isolated(&self, request: WorkerRequest) -> Result<WorkerOutcome, WorkerError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Reported {
                name: request.name(),
                error: "boot error".to_string(),
            });
        }

        if request.contract_artifact_path.is_some() && !self.boot_on_contract.load(Ordering::SeqCst)
        {
            return Ok(WorkerOutcome {
                reply: WorkerReply::DomainSeed(DOMAIN_SEED.to_string()),
                handle: None,
            });
        }

        let handle = Arc::new(CountingHandle::default());
        if request.contract_artifact_path.is_some() {
            handle.refuse.store(true, Ordering::SeqCst);
        }
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        Ok(WorkerOutcome {
            reply: WorkerReply::Booted(json!({ "port": request.port })),
            handle: Some(handle as Arc<dyn ProcessHandle>),
        })
    }
}

/// Identity provider with a fixed identity
#[derive(Default)]
pub struct FakeIdentity {
    pub created: AtomicUsize,
    pub fail_resolve: AtomicBool,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn create_identity(&self) -> Result<String, IdentityError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(VALIDATOR.to_string())
    }

    async fn resolve(&self, identifier: &str) -> Result<ResolvedIdentity, IdentityError> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(IdentityError::Unresolved {
                identifier: identifier.to_string(),
                reason: "unknown method".to_string(),
            });
        }
        Ok(ResolvedIdentity {
            identifier: identifier.to_string(),
            method: "fake".to_string(),
            name: "validator".to_string(),
        })
    }
}

/// Domain engine recording every call
#[derive(Default)]
pub struct RecordingEngine {
    pub constitutions: Mutex<Vec<ConstitutionRequest>>,
    pub transactions: Mutex<Vec<(String, Transaction)>>,
}

#[async_trait]
impl DomainEngine for RecordingEngine {
    async fn create_constitution(&self, request: &ConstitutionRequest) -> Result<String, EngineError> {
        self.constitutions.lock().unwrap().push(request.clone());
        Ok(format!("seed-{}", request.domain))
    }

    async fn execute(&self, seed: &str, transaction: Transaction) -> Result<(), EngineError> {
        self.transactions
            .lock()
            .unwrap()
            .push((seed.to_string(), transaction));
        Ok(())
    }
}

/// All fakes wired into one launch context
pub struct Fakes {
    pub probe: Arc<ScriptedProbe>,
    pub service: Arc<FakeService>,
    pub worker: Arc<FakeWorker>,
    pub identity: Arc<FakeIdentity>,
    pub registry: ProcessRegistry,
}

impl Fakes {
    pub fn new(probe: Arc<ScriptedProbe>) -> Self {
        Self {
            probe,
            service: FakeService::failing(0),
            worker: Arc::new(FakeWorker::default()),
            identity: Arc::new(FakeIdentity::default()),
            registry: ProcessRegistry::new(),
        }
    }

    pub fn free() -> Self {
        Self::new(ScriptedProbe::always(true))
    }

    pub fn context(&self) -> LaunchContext {
        LaunchContext {
            allocator: PortAllocator::new(self.probe.clone()),
            service: self.service.clone(),
            worker: self.worker.clone(),
            identity: self.identity.clone(),
            registry: self.registry.clone(),
            release_wait: ReleaseWait {
                retries: 2,
                interval: Duration::from_millis(1),
            },
        }
    }
}
