//! Isolated worker for the test node launcher
//!
//! Reads one JSON input line from stdin, boots the service and writes one
//! JSON message line to stdout. Logs go to stderr.

use std::io::BufRead;
use std::time::Duration;
use testnode_launch::{
    serve, service_registry, CommandScriptRunner, CommandServiceLauncher, ServiceRequest,
    ShutdownManager, WorkerInput, WorkerMessage,
};

const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let mut line = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
        reply(&WorkerMessage::Failed {
            error: format!("Failed to read worker input: {}", e),
        });
        std::process::exit(1);
    }
    let input: WorkerInput = match serde_json::from_str(&line) {
        Ok(input) => input,
        Err(e) => {
            reply(&WorkerMessage::Failed {
                error: format!("Invalid worker input: {}", e),
            });
            std::process::exit(1);
        }
    };

    // The service may run collaborators that read these at start; set them
    // before any runtime thread exists.
    ServiceRequest::new(input.request.port, input.request.storage_root.clone())
        .environment
        .apply_to_current_process();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            reply(&WorkerMessage::Failed {
                error: format!("Failed to start runtime: {}", e),
            });
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(input));
    std::process::exit(code);
}

async fn run(input: WorkerInput) -> i32 {
    log::info!(
        "[worker-{}] Booting (storage root {})",
        input.request.port,
        input.request.storage_root.display()
    );

    let launcher = CommandServiceLauncher::new(input.service.clone());
    let scripts = CommandScriptRunner::new(input.scripts.clone());
    let (message, service) = serve(&input, &launcher, &scripts).await;

    let Some(service) = service else {
        reply(&message);
        return match message {
            WorkerMessage::Failed { .. } => 1,
            _ => 0,
        };
    };

    // Shutdown hooks must be live before the parent hears `booted`
    let registry = service_registry(input.request.port, &service);
    let _exit_guard = match ShutdownManager::install(&registry) {
        Ok(manager) => Some(manager.on_exit()),
        Err(e) => {
            log::warn!("[worker-{}] {}", input.request.port, e);
            None
        }
    };
    reply(&message);

    while service.handle.is_running() {
        tokio::time::sleep(SERVICE_POLL_INTERVAL).await;
    }
    log::info!("[worker-{}] Service exited", input.request.port);
    0
}

fn reply(message: &WorkerMessage) {
    match serde_json::to_string(message) {
        Ok(line) => println!("{}", line),
        Err(e) => log::error!("Failed to encode worker message: {}", e),
    }
}
