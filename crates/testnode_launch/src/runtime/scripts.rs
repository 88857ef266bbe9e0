//! External build scripts used by the contract bootstrap

use crate::config::ScriptRunnerConfig;
use crate::runtime::process::{ChildProcess, ProcessConfig, ProcessError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Script that builds a contract artifact and writes its seed
pub const BUILD_SCRIPT: &str = "buildDossier";
/// Script that creates a domain bound to a built contract
pub const CREATE_DOMAIN_SCRIPT: &str = "createDomain";

/// Runs a named build script to completion
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &str, args: &[String]) -> Result<(), ScriptError>;
}

/// Runs scripts as `<interpreter> <scripts_dir>/<script>.<ext> <extra args> <args>`
#[derive(Debug, Clone, Default)]
pub struct CommandScriptRunner {
    config: ScriptRunnerConfig,
}

impl CommandScriptRunner {
    pub fn new(config: ScriptRunnerConfig) -> Self {
        Self { config }
    }

    fn script_path(&self, script: &str) -> PathBuf {
        let file = match &self.config.extension {
            Some(ext) => format!("{}.{}", script, ext),
            None => script.to_string(),
        };
        self.config.scripts_dir.join(file)
    }

    fn process_config(&self, script: &str, args: &[String]) -> ProcessConfig {
        let path = self.script_path(script).display().to_string();
        let mut argv = Vec::new();
        let executable = match &self.config.interpreter {
            Some(interpreter) => {
                argv.push(path);
                interpreter.clone()
            }
            None => path,
        };
        argv.extend(self.config.extra_args.iter().cloned());
        argv.extend(args.iter().cloned());

        ProcessConfig {
            name: script.to_string(),
            executable,
            args: argv,
            env: HashMap::new(),
            working_dir: self.config.working_dir.clone(),
        }
    }
}

#[async_trait]
impl ScriptRunner for CommandScriptRunner {
    async fn run(&self, script: &str, args: &[String]) -> Result<(), ScriptError> {
        let process = ChildProcess::spawn(&self.process_config(script, args))?;
        match process.wait().await? {
            Some(0) => Ok(()),
            code => Err(ScriptError::Failed {
                script: script.to_string(),
                code,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Script '{script}' failed with exit code {code:?}")]
    Failed { script: String, code: Option<i32> },

    #[error("Failed to read seed file '{path}': {source}")]
    Seed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
