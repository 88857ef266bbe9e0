//! Child process handles

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Something that can be told to terminate.
///
/// `kill` only delivers the signal; it never waits for the process to go
/// away, so it is safe to call from a signal or panic handler.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running, as far as can be told
    /// without blocking
    fn is_running(&self) -> bool;

    /// Send a termination signal
    fn kill(&self) -> Result<(), ProcessError>;
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// Pipes kept by the caller when spawning with [`ChildProcess::spawn_piped`]
pub struct ChildPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// A spawned child process
pub struct ChildProcess {
    name: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ChildProcess {
    /// Spawn a process whose stdout and stderr are forwarded to the log
    pub fn spawn(config: &ProcessConfig) -> Result<Self, ProcessError> {
        let mut child = Self::command(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_failed(config, e))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(config.name.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(config.name.clone(), stderr, true);
        }

        Ok(Self::from_child(config, child))
    }

    /// Spawn a process whose stdin and stdout are handed back to the caller.
    ///
    /// stderr is forwarded to the log.
    pub fn spawn_piped(config: &ProcessConfig) -> Result<(Self, ChildPipes), ProcessError> {
        let mut child = Self::command(config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_failed(config, e))?;

        if let Some(stderr) = child.stderr.take() {
            forward_lines(config.name.clone(), stderr, true);
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProcessError::MissingPipe(config.name.clone()));
        };

        Ok((Self::from_child(config, child), ChildPipes { stdin, stdout }))
    }

    fn command(config: &ProcessConfig) -> Command {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable,
            config.args.join(" ")
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args).envs(&config.env);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_failed(config: &ProcessConfig, source: std::io::Error) -> ProcessError {
        log::error!("[{}] Failed to spawn process: {}", config.name, source);
        ProcessError::SpawnFailed {
            name: config.name.clone(),
            source,
        }
    }

    fn from_child(config: &ProcessConfig, child: Child) -> Self {
        let pid = child.id();
        log::info!("[{}] Process started with PID: {:?}", config.name, pid);
        Self {
            name: config.name.clone(),
            pid,
            child: Mutex::new(Some(child)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&self) -> Result<Option<i32>, ProcessError> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Err(ProcessError::NotRunning(self.name.clone()));
        };

        let status = child.wait().await.map_err(|e| ProcessError::Wait {
            name: self.name.clone(),
            source: e,
        })?;
        *guard = None;
        log::info!("[{}] Process exited with code: {:?}", self.name, status.code());
        Ok(status.code())
    }

    /// `Some(code)` once the process has exited, `None` while it runs
    pub async fn try_exit_code(&self) -> Option<Option<i32>> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                Some(status.code())
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("[{}] Error checking process status: {}", self.name, e);
                None
            }
        }
    }

    /// Stop the process: SIGTERM, then SIGKILL after `timeout`
    pub async fn stop(&self, timeout: Duration) -> Result<(), ProcessError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        log::info!("[{}] Stopping process...", self.name);

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let _ = signal_pid(pid, nix::sys::signal::Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("[{}] Process exited with code: {:?}", self.name, status.code());
            }
            Ok(Err(e)) => {
                log::error!("[{}] Error waiting for process: {}", self.name, e);
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit gracefully, forcing kill",
                    self.name
                );
                let _ = child.kill().await;
            }
        }

        Ok(())
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            // Someone is waiting on it right now
            Err(_) => true,
        }
    }

    fn kill(&self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Err(ProcessError::NotRunning(self.name.clone()));
        };

        #[cfg(unix)]
        {
            signal_pid(pid, nix::sys::signal::Signal::SIGTERM).map_err(|errno| {
                if errno == nix::errno::Errno::ESRCH {
                    ProcessError::NotRunning(self.name.clone())
                } else {
                    ProcessError::Signal {
                        name: self.name.clone(),
                        pid,
                        source: std::io::Error::from(errno),
                    }
                }
            })
        }

        #[cfg(not(unix))]
        {
            match self.child.try_lock() {
                Ok(mut guard) => match guard.as_mut() {
                    Some(child) => child.start_kill().map_err(|e| ProcessError::Signal {
                        name: self.name.clone(),
                        pid,
                        source: e,
                    }),
                    None => Err(ProcessError::NotRunning(self.name.clone())),
                },
                Err(_) => Err(ProcessError::Busy(self.name.clone())),
            }
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal)
}

fn forward_lines<R>(name: String, reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log::warn!("[{}] {}", name, line);
            } else {
                log::info!("[{}] {}", name, line);
            }
        }
    });
}

/// Errors that can occur with child processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' is not running")]
    NotRunning(String),

    #[error("Process '{0}' did not expose its stdio pipes")]
    MissingPipe(String),

    #[error("Failed to wait for process '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process '{name}' (PID {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' is busy")]
    Busy(String),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let process = ChildProcess::spawn(&sh("exit-3", "echo hi; exit 3")).unwrap();
        assert!(process.pid().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(3));
        assert!(matches!(
            process.wait().await,
            Err(ProcessError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_terminates_process() {
        let process = ChildProcess::spawn(&sh("sleeper", "sleep 30")).unwrap();
        process.kill().unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("process should exit after SIGTERM")
            .unwrap();
        // Killed by a signal: no exit code
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_not_running() {
        let process = ChildProcess::spawn(&sh("quick", "exit 0")).unwrap();
        process.wait().await.unwrap();
        assert!(!process.is_running());
        assert!(matches!(process.kill(), Err(ProcessError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_is_running_while_alive() {
        let process = ChildProcess::spawn(&sh("alive", "sleep 30")).unwrap();
        assert!(process.is_running());
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let process = ChildProcess::spawn(&sh("stoppable", "sleep 30")).unwrap();
        process.stop(Duration::from_secs(5)).await.unwrap();
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(process.try_exit_code().await, None);
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let config = ProcessConfig {
            name: "missing".to_string(),
            executable: "/definitely/not/here".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        };
        assert!(matches!(
            ChildProcess::spawn(&config),
            Err(ProcessError::SpawnFailed { .. })
        ));
    }
}
