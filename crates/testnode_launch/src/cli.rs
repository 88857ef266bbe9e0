//! Command-line interface for testnode

use crate::config::{DomainSpec, LaunchOptions, NodeFile, OptionsError};
use argh::FromArgs;
use std::path::PathBuf;

/// Launch an isolated test node: free port, layered config, optional contract domain
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to a YAML node file (optional; defaults apply without one)
    #[argh(positional)]
    pub node_file: Option<PathBuf>,

    /// fixed port instead of a random free one
    #[argh(option, short = 'p')]
    pub port: Option<u16>,

    /// number of full launch attempts
    #[argh(option)]
    pub max_tries: Option<u32>,

    /// run the service inside an isolated worker process
    #[argh(switch)]
    pub worker: bool,

    /// contract build file; bootstraps a contract domain before launch
    #[argh(option)]
    pub contract: Option<PathBuf>,

    /// do not add the default domains
    #[argh(switch)]
    pub no_default_domains: bool,

    /// extra domains to host (comma-separated)
    #[argh(option, short = 'd', from_str_fn(parse_domains))]
    pub domains: Option<Vec<String>>,

    /// storage root instead of a temporary directory
    #[argh(option)]
    pub storage_root: Option<PathBuf>,

    /// server executable
    #[argh(option)]
    pub server: Option<String>,

    /// worker executable (default: testnode_worker next to this binary)
    #[argh(option)]
    pub worker_exe: Option<PathBuf>,

    /// directory holding the contract build scripts
    #[argh(option)]
    pub scripts_dir: Option<PathBuf>,

    /// print the completed options without launching
    #[argh(switch)]
    pub dry_run: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse comma-separated domain list
fn parse_domains(s: &str) -> Result<Vec<String>, String> {
    let domains: Vec<String> = s
        .split(',')
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    if domains.is_empty() {
        return Err(format!("Invalid domain list '{}'", s));
    }
    Ok(domains)
}

impl LaunchArgs {
    /// Load the node file (if any) and apply the command-line overrides
    pub fn node_file(&self) -> Result<NodeFile, OptionsError> {
        let mut file = match &self.node_file {
            Some(path) => NodeFile::from_file(path)?,
            None => NodeFile::default(),
        };
        self.apply(&mut file);
        file.options.validate()?;
        Ok(file)
    }

    fn apply(&self, file: &mut NodeFile) {
        let options: &mut LaunchOptions = &mut file.options;
        if let Some(port) = self.port {
            options.port = Some(port);
        }
        if let Some(max_tries) = self.max_tries {
            options.max_tries = max_tries;
        }
        if self.worker {
            options.use_isolated_worker = true;
        }
        if let Some(contract) = &self.contract {
            options.contract_artifact_path = Some(contract.clone());
        }
        if self.no_default_domains {
            options.include_default_domains = false;
        }
        if let Some(root) = &self.storage_root {
            options.storage_root = Some(root.clone());
        }
        for name in self.domains.iter().flatten() {
            if !options.domains.iter().any(|d| &d.name == name) {
                options.domains.push(DomainSpec::new(name.clone()));
            }
        }

        if let Some(server) = &self.server {
            file.service.executable = server.clone();
        }
        if let Some(exe) = &self.worker_exe {
            file.worker.executable = Some(exe.clone());
        }
        if let Some(dir) = &self.scripts_dir {
            file.scripts.scripts_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> LaunchArgs {
        LaunchArgs::from_args(&["testnode"], args).unwrap()
    }

    #[test]
    fn test_parse_domains() {
        assert_eq!(
            parse_domains("a, b,,c"),
            Ok(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(parse_domains(" , ").is_err());
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let args = parse(&[
            "--port",
            "9100",
            "--max-tries",
            "3",
            "--worker",
            "--no-default-domains",
            "-d",
            "vault,local",
            "--server",
            "/usr/bin/apihub",
        ]);
        let file = args.node_file().unwrap();

        assert_eq!(file.options.port, Some(9100));
        assert_eq!(file.options.max_tries, 3);
        assert!(file.options.use_isolated_worker);
        assert!(!file.options.include_default_domains);
        let names: Vec<_> = file.options.domains.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["vault", "local"]);
        assert_eq!(file.service.executable, "/usr/bin/apihub");
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let args = parse(&["--port", "0"]);
        assert!(matches!(args.node_file(), Err(OptionsError::Validation(_))));
    }

    #[test]
    fn test_node_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "max_tries: 7\ndomains: [vault]\n").unwrap();

        let args = parse(&[path.to_str().unwrap(), "--contract", "build.file"]);
        let file = args.node_file().unwrap();
        assert_eq!(file.options.max_tries, 7);
        assert_eq!(file.options.domains[0].name, "vault");
        assert!(file.options.contract_requested());
    }
}
