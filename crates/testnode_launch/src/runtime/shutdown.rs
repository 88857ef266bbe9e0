//! Process-wide teardown of tracked children on termination
//!
//! [`ShutdownManager::install`] hooks SIGINT (via `ctrlc`), SIGTERM,
//! SIGUSR1 and SIGUSR2 (via tokio), panics, and normal exit (via
//! [`ExitGuard`]). The first event to fire signals every registered child
//! and, when there was at least one, exits with status 0. Later events are
//! ignored. Children are not waited for.

use crate::runtime::registry::ProcessRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

static INSTALLED: Mutex<Option<Arc<ShutdownManager>>> = Mutex::new(None);

/// Termination paths the manager listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationEvent {
    /// Normal process exit
    Exit,
    /// SIGINT
    Interrupt,
    /// SIGUSR1
    UserSignal1,
    /// SIGUSR2
    UserSignal2,
    /// Unhandled panic
    FatalError,
    /// SIGTERM
    Terminate,
}

impl TerminationEvent {
    pub const ALL: [TerminationEvent; 6] = [
        TerminationEvent::Exit,
        TerminationEvent::Interrupt,
        TerminationEvent::UserSignal1,
        TerminationEvent::UserSignal2,
        TerminationEvent::FatalError,
        TerminationEvent::Terminate,
    ];

    /// Exit status matching the default action of the intercepted signal
    fn signal_exit_code(self) -> Option<i32> {
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            let signal = match self {
                TerminationEvent::Interrupt => Signal::SIGINT,
                TerminationEvent::Terminate => Signal::SIGTERM,
                TerminationEvent::UserSignal1 => Signal::SIGUSR1,
                TerminationEvent::UserSignal2 => Signal::SIGUSR2,
                TerminationEvent::Exit | TerminationEvent::FatalError => return None,
            };
            Some(128 + signal as i32)
        }

        #[cfg(not(unix))]
        {
            match self {
                TerminationEvent::Exit | TerminationEvent::FatalError => None,
                _ => Some(1),
            }
        }
    }
}

/// Result of the one shutdown pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub event: TerminationEvent,
    /// Children that were registered
    pub registered: usize,
    /// Children that accepted the termination signal
    pub signalled: usize,
}

impl ShutdownOutcome {
    pub fn should_exit(&self) -> bool {
        self.registered > 0
    }
}

/// Sends a termination signal to every registered child, once
#[derive(Debug)]
pub struct ShutdownManager {
    registry: ProcessRegistry,
    fired: AtomicBool,
}

impl ShutdownManager {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self {
            registry,
            fired: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Run the shutdown pass for `event`.
    ///
    /// Returns `None` when an earlier event already ran it.
    pub fn handle(&self, event: TerminationEvent) -> Option<ShutdownOutcome> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }

        log::info!(
            "Handling {:?} event on PID {}",
            event,
            std::process::id()
        );

        let children = self.registry.snapshot();
        let mut signalled = 0;
        for (name, handle) in &children {
            log::info!("Sending kill signal to '{}' (PID {:?})", name, handle.pid());
            match handle.kill() {
                Ok(()) => signalled += 1,
                Err(e) => log::warn!("[{}] {}", name, e),
            }
        }

        Some(ShutdownOutcome {
            event,
            registered: children.len(),
            signalled,
        })
    }

    /// Handle an intercepted event and leave the process when required
    fn fire(&self, event: TerminationEvent) {
        if let Some(outcome) = self.handle(event) {
            if outcome.should_exit() {
                std::process::exit(0);
            }
        }
        if let Some(code) = event.signal_exit_code() {
            std::process::exit(code);
        }
    }

    /// Install the process hooks once and return the installed manager.
    ///
    /// Later calls return the first manager and ignore `registry`.
    pub fn install(registry: &ProcessRegistry) -> Result<Arc<ShutdownManager>, ShutdownError> {
        let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = installed.as_ref() {
            return Ok(Arc::clone(manager));
        }

        let manager = Arc::new(ShutdownManager::new(registry.clone()));

        {
            let manager = Arc::clone(&manager);
            ctrlc::set_handler(move || manager.fire(TerminationEvent::Interrupt))?;
        }

        #[cfg(unix)]
        install_unix_signals(&manager);

        {
            let manager = Arc::clone(&manager);
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                previous(info);
                manager.fire(TerminationEvent::FatalError);
            }));
        }

        log::info!("Exit handler set up on PID {}", std::process::id());
        *installed = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Guard that runs the shutdown pass when dropped at normal exit
    pub fn on_exit(self: &Arc<Self>) -> ExitGuard {
        ExitGuard {
            manager: Arc::clone(self),
        }
    }
}

#[cfg(unix)]
fn install_unix_signals(manager: &Arc<ShutdownManager>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        log::warn!("No async runtime; SIGTERM/SIGUSR1/SIGUSR2 are not intercepted");
        return;
    };
    let _enter = runtime.enter();

    let kinds = [
        (SignalKind::terminate(), TerminationEvent::Terminate),
        (SignalKind::user_defined1(), TerminationEvent::UserSignal1),
        (SignalKind::user_defined2(), TerminationEvent::UserSignal2),
    ];
    for (kind, event) in kinds {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Cannot intercept {:?}: {}", event, e);
                continue;
            }
        };
        let manager = Arc::clone(manager);
        runtime.spawn(async move {
            if stream.recv().await.is_some() {
                manager.fire(event);
            }
        });
    }
}

/// Runs the shutdown pass for [`TerminationEvent::Exit`] when dropped
#[must_use = "the shutdown pass runs when the guard is dropped"]
pub struct ExitGuard {
    manager: Arc<ShutdownManager>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        // The process is already on its way out; its exit status is kept.
        let _ = self.manager.handle(TerminationEvent::Exit);
    }
}

/// Errors installing the process hooks
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Failed to install interrupt handler: {0}")]
    Handler(#[from] ctrlc::Error),
}
