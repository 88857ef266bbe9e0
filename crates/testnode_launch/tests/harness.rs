//! Harness tests: domain bootstrap, contract launch and teardown

mod common;

use common::{FakeService, Fakes, RecordingEngine, DOMAIN_SEED};
use serde_json::json;
use std::sync::Arc;
use testnode_launch::harness::CONTRACT_DOMAIN;
use testnode_launch::{
    DomainSetup, EngineContext, Harness, HarnessError, LaunchOptions, ProcessHandle, Transaction,
};

fn harness(fakes: &Fakes, engine: &Arc<RecordingEngine>) -> Harness {
    Harness::temporary(fakes.context(), engine.clone()).unwrap()
}

#[tokio::test]
async fn test_domains_are_bootstrapped_after_launch() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);
    harness
        .add_domain(DomainSetup::new("Alpha One").with_agents(["alice", "bob"]))
        .unwrap()
        .add_domain(DomainSetup::new("beta"))
        .unwrap();

    let result = harness.launch(LaunchOptions::default()).await.unwrap();
    assert!(result.storage_root.starts_with(harness.root()));

    let constitutions: Vec<_> = engine
        .constitutions
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.domain.clone())
        .collect();
    assert_eq!(constitutions, vec!["launcher", "Alpha One", "beta"]);

    let alpha = harness.domain_config("Alpha One").unwrap();
    assert_eq!(alpha.workspace, harness.root().join("nodes").join("alpha_one"));
    assert!(alpha.workspace.is_dir());
    assert_eq!(alpha.seed.as_deref(), Some("seed-Alpha One"));

    let transactions = engine.transactions.lock().unwrap().clone();
    assert_eq!(
        transactions,
        vec![
            (
                "seed-launcher".to_string(),
                Transaction::AddDomain {
                    name: "Alpha One".to_string(),
                    role: "system".to_string(),
                    workspace: alpha.workspace.clone(),
                    constitution_seed: "seed-Alpha One".to_string(),
                }
            ),
            (
                "seed-Alpha One".to_string(),
                Transaction::AddAgent {
                    name: "alice".to_string(),
                    public_key: "public_key".to_string(),
                }
            ),
            (
                "seed-Alpha One".to_string(),
                Transaction::AddAgent {
                    name: "bob".to_string(),
                    public_key: "public_key".to_string(),
                }
            ),
            (
                "seed-Alpha One".to_string(),
                Transaction::AddDomainConfig {
                    name: "Alpha One".to_string(),
                    interfaces: json!({"system": {"virtualMQ": result.validator_url}}),
                }
            ),
            (
                "seed-launcher".to_string(),
                Transaction::AddDomain {
                    name: "beta".to_string(),
                    role: "system".to_string(),
                    workspace: harness.root().join("nodes").join("beta"),
                    constitution_seed: "seed-beta".to_string(),
                }
            ),
        ]
    );

    harness.tear_down();
}

#[tokio::test]
async fn test_no_domains_means_no_engine_calls() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);

    harness.launch(LaunchOptions::default()).await.unwrap();
    assert!(engine.constitutions.lock().unwrap().is_empty());
    harness.tear_down();
}

#[tokio::test]
async fn test_add_domain_after_launch_is_rejected() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);
    harness.launch(LaunchOptions::default()).await.unwrap();

    assert!(matches!(
        harness.add_domain(DomainSetup::new("late")),
        Err(HarnessError::AlreadyLaunched)
    ));
    assert!(matches!(
        harness.launch(LaunchOptions::default()).await,
        Err(HarnessError::AlreadyLaunched)
    ));
    harness.tear_down();
}

#[tokio::test]
async fn test_failed_launch_can_be_retried() {
    let mut fakes = Fakes::free();
    fakes.service = FakeService::failing(1);
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);
    harness.add_domain(DomainSetup::new("first")).unwrap();

    let options = || LaunchOptions {
        max_tries: 1,
        ..Default::default()
    };
    assert!(matches!(
        harness.launch(options()).await,
        Err(HarnessError::Launch(_))
    ));
    assert!(engine.constitutions.lock().unwrap().is_empty());

    // Nothing is up yet, so the harness still accepts domains and launches
    harness.add_domain(DomainSetup::new("second")).unwrap();
    harness.launch(options()).await.unwrap();

    assert_eq!(fakes.service.starts(), 2);
    assert_eq!(
        harness.domain_config("second").unwrap().seed.as_deref(),
        Some("seed-second")
    );
    assert!(matches!(
        harness.add_domain(DomainSetup::new("third")),
        Err(HarnessError::AlreadyLaunched)
    ));
    harness.tear_down();
}

#[tokio::test]
async fn test_build_domain_configuration_directly() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);
    harness.add_domain(DomainSetup::new("solo")).unwrap();
    let domain = harness.domain_config("solo").unwrap().clone();

    let ctx = EngineContext {
        launcher_seed: "seed-root".to_string(),
        node_url: "http://localhost:9999".to_string(),
    };
    let seed = harness.build_domain_configuration(&ctx, &domain).await.unwrap();

    assert_eq!(seed, "seed-solo");
    assert!(domain.workspace.is_dir());
    let transactions = engine.transactions.lock().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].0, "seed-root");
    drop(transactions);
    harness.tear_down();
}

#[tokio::test]
async fn test_launch_with_contract_defaults_domain() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);

    let launch = harness
        .launch_with_contract("contract/build.file", None, LaunchOptions::default())
        .await
        .unwrap();

    assert_eq!(launch.result.domains[0].name, CONTRACT_DOMAIN);
    assert_eq!(launch.result.domain_seed.as_deref(), Some(DOMAIN_SEED));
    assert_eq!(
        serde_json::Value::Object(launch.domain_config),
        json!({"contracts": {"constitution": DOMAIN_SEED}})
    );
    harness.tear_down();
}

#[tokio::test]
async fn test_launch_with_contract_named_domain_goes_first() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);

    let launch = harness
        .launch_with_contract(
            "build.file",
            Some("vault"),
            LaunchOptions::default().with_domain(testnode_launch::DomainSpec::new("other")),
        )
        .await
        .unwrap();

    let names: Vec<_> = launch.result.domains.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(&names[..2], &["vault", "other"]);
    assert_eq!(launch.domain_config["contracts"]["constitution"], DOMAIN_SEED);
    harness.tear_down();
}

#[tokio::test]
async fn test_tear_down_is_idempotent() {
    let fakes = Fakes::free();
    let engine = Arc::new(RecordingEngine::default());
    let mut harness = harness(&fakes, &engine);
    let result = harness.launch(LaunchOptions::default()).await.unwrap();
    let root = harness.root().to_path_buf();
    assert!(root.is_dir());

    harness.tear_down();
    assert!(!root.exists());
    assert!(!result.handle.is_running());
    assert_eq!(fakes.service.last_handle().kills(), 1);

    harness.tear_down();
    assert_eq!(fakes.service.last_handle().kills(), 1);
}
