//! Substitution engine for `$(arg ...)` and `$(env ...)` patterns in
//! service and worker command lines

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)\s+([^)]+)\)").expect("valid substitution regex"));

/// Values available to a command line template
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Launch-time arguments (`port`, `storage_root`, `node_url`, ...)
    pub args: HashMap<String, String>,
    /// Environment overrides, consulted before the process environment
    pub env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Substitute every pattern in `input`.
    ///
    /// Values may themselves contain patterns; resolution repeats until the
    /// string is stable, bounded to a few passes.
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        const MAX_PASSES: usize = 8;

        let mut current = input.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.substitute_once(&current)?;
            if next == current {
                return Ok(next);
            }
            current = next;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }
        Ok(current)
    }

    /// Substitute every entry of an argument list
    pub fn substitute_all(&self, inputs: &[String]) -> Result<Vec<String>, SubstitutionError> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }

    fn substitute_once(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = SUBSTITUTION_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve(&caps[1], caps[2].trim()) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(result.into_owned()),
        }
    }

    fn resolve(&self, kind: &str, name: &str) -> Result<String, SubstitutionError> {
        match kind {
            "arg" => self
                .args
                .get(name)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedArg(name.to_string())),
            "env" => match self.env.get(name) {
                Some(value) => Ok(value.clone()),
                None => std::env::var(name)
                    .map_err(|_| SubstitutionError::UndefinedEnv(name.to_string())),
            },
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Maximum substitution iterations exceeded for: {0}")]
    MaxIterationsExceeded(String),
}
