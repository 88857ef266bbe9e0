//! Environment handed to the external server and storage collaborators

use crate::config::writer::config_dir;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Config root read by the server at boot
pub const CONFIG_LOCATION_VAR: &str = "PSK_CONFIG_LOCATION";
/// Storage root for message channels
pub const STORAGE_ROOT_VAR: &str = "vmq_channel_storage";
/// Base URL of the node itself
pub const ROOT_HOSTS_VAR: &str = "BDNS_ROOT_HOSTS";

/// Variables the collaborators read once at process start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnvironment {
    pub config_location: PathBuf,
    pub storage_root: PathBuf,
    pub root_hosts: String,
}

impl NodeEnvironment {
    pub fn new(storage_root: &Path, node_url: &str) -> Self {
        Self {
            config_location: config_dir(storage_root),
            storage_root: storage_root.to_path_buf(),
            root_hosts: node_url.to_string(),
        }
    }

    /// Variables to set on spawned children
    pub fn vars(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                CONFIG_LOCATION_VAR.to_string(),
                self.config_location.display().to_string(),
            ),
            (
                STORAGE_ROOT_VAR.to_string(),
                self.storage_root.display().to_string(),
            ),
            (ROOT_HOSTS_VAR.to_string(), self.root_hosts.clone()),
        ])
    }

    /// Export the variables into the current process, for collaborators
    /// running in-process. Must happen before they initialise.
    pub fn apply_to_current_process(&self) {
        for (key, value) in self.vars() {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vars() {
        let env = NodeEnvironment::new(Path::new("/tmp/psk_a"), "http://localhost:9000");
        let vars = env.vars();

        assert_eq!(vars[CONFIG_LOCATION_VAR], "/tmp/psk_a/external-volume/config");
        assert_eq!(vars[STORAGE_ROOT_VAR], "/tmp/psk_a");
        assert_eq!(vars[ROOT_HOSTS_VAR], "http://localhost:9000");
    }
}
