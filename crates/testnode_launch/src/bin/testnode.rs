//! Test node launcher CLI
//!
//! Usage:
//!   testnode
//!   testnode node.yaml --port 8080
//!   testnode node.yaml --worker --contract contract/build.file
//!   testnode node.yaml --dry-run

use testnode_launch::{LaunchArgs, LaunchContext, LaunchOrchestrator, ProcessRegistry, ShutdownManager};

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    let node_file = match args.node_file() {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load node file: {}", e);
            std::process::exit(1);
        }
    };

    let registry = ProcessRegistry::global();
    let ctx = LaunchContext::from_node_file(&node_file, registry.clone());
    let orchestrator = match LaunchOrchestrator::new(node_file.options, ctx) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("Invalid launch options: {}", e);
            std::process::exit(1);
        }
    };

    if args.dry_run {
        match serde_yaml::to_string(orchestrator.options()) {
            Ok(yaml) => println!("{}", yaml),
            Err(e) => {
                log::error!("Failed to render options: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let shutdown = match ShutdownManager::install(&registry) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    let _exit_guard = shutdown.on_exit();

    let result = match orchestrator.launch().await {
        Ok(result) => result,
        Err(e) => {
            log::error!("{}", e);
            drop(_exit_guard);
            std::process::exit(1);
        }
    };

    println!("port: {}", result.port);
    println!("url: {}", result.validator_url);
    println!("storage_root: {}", result.storage_root.display());
    if let Some(seed) = &result.domain_seed {
        println!("domain_seed: {}", seed);
    }
    if let Some(identity) = &result.validator_identity {
        println!("validator: {}", identity);
    }

    log::info!("Test node running, press Ctrl+C to stop");
    std::future::pending::<()>().await;
}
