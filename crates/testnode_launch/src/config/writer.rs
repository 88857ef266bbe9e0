//! On-disk configuration layout under a storage root
//!
//! ```text
//! <root>/external-volume/config/apihub.json
//! <root>/external-volume/config/domains/<name>.json
//! <root>/external-volume/config/bdns.hosts
//! <root>/external-volume/config/bdns/<domain>.json
//! ```
//!
//! Every write creates missing directories first and overwrites existing
//! files.

use crate::config::domains::BdnsMap;
use crate::config::options::DomainSpec;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const SERVER_CONFIG_FILE: &str = "apihub.json";
pub const BDNS_HOSTS_FILE: &str = "bdns.hosts";
pub const DOMAINS_DIR: &str = "domains";
pub const BDNS_DIR: &str = "bdns";

/// `<root>/external-volume/config`
pub fn config_dir(storage_root: &Path) -> PathBuf {
    storage_root.join("external-volume").join("config")
}

/// Write `apihub.json`
pub async fn write_server_config(
    storage_root: &Path,
    content: &Map<String, Value>,
) -> Result<(), ConfigError> {
    let dir = config_dir(storage_root);
    write_json(&dir, SERVER_CONFIG_FILE, content).await
}

/// Write one `domains/<name>.json` per domain; last write wins
pub async fn write_domain_configs(
    storage_root: &Path,
    domains: &[DomainSpec],
) -> Result<(), ConfigError> {
    let dir = config_dir(storage_root).join(DOMAINS_DIR);
    for domain in domains {
        write_json(&dir, &format!("{}.json", domain.name), &domain.config).await?;
    }
    Ok(())
}

/// Write `bdns.hosts` with the full map, then `bdns/<domain>.json` per entry
pub async fn write_bdns(storage_root: &Path, bdns: &BdnsMap) -> Result<(), ConfigError> {
    let dir = config_dir(storage_root);
    write_json(&dir, BDNS_HOSTS_FILE, bdns).await?;

    if bdns.is_empty() {
        return Ok(());
    }

    let per_domain = dir.join(BDNS_DIR);
    for (domain, entry) in bdns {
        write_json(&per_domain, &format!("{}.json", domain), entry).await?;
    }
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(
    dir: &Path,
    file_name: &str,
    content: &T,
) -> Result<(), ConfigError> {
    let path = dir.join(file_name);
    let bytes = serde_json::to_vec(content).map_err(|e| ConfigError::Serialize {
        path: path.display().to_string(),
        source: e,
    })?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

    log::debug!("Wrote {}", path.display());
    Ok(())
}

/// Failure to persist configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize '{path}': {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
