//! Domain list merging, BDNS derivation and constitution patching

use crate::config::options::{DomainSpec, Validator};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domains every test node hosts unless told otherwise
pub const DEFAULT_DOMAINS: [&str; 3] = ["default", "test1", "test2"];

/// BDNS: domain name to the endpoints serving it
pub type BdnsMap = IndexMap<String, BdnsEntry>;

/// Endpoints serving one domain
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BdnsEntry {
    pub replicas: Vec<String>,
    pub notifications: Vec<String>,
    pub brick_storages: Vec<String>,
    pub anchoring_services: Vec<String>,
    pub contract_services: Vec<String>,
    pub validators: Vec<Validator>,
    /// Keys not modelled above, preserved as written
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BdnsEntry {
    /// Single-node entry: every role points at `node_url`
    pub fn single_node(node_url: &str, validators: &[Validator]) -> Self {
        Self {
            replicas: Vec::new(),
            notifications: vec![node_url.to_string()],
            brick_storages: vec![node_url.to_string()],
            anchoring_services: vec![node_url.to_string()],
            contract_services: vec![node_url.to_string()],
            validators: validators.to_vec(),
            extra: Map::new(),
        }
    }
}

/// Append each default domain whose name is not already present.
///
/// Caller order is preserved and defaults come after it. Running this on
/// its own output changes nothing.
pub fn merge_defaults(mut domains: Vec<DomainSpec>, include_defaults: bool) -> Vec<DomainSpec> {
    if !include_defaults {
        return domains;
    }

    for name in DEFAULT_DOMAINS {
        if !domains.iter().any(|d| d.name == name) {
            domains.push(DomainSpec::new(name));
        }
    }
    domains
}

/// One BDNS entry per domain, all roles served by `node_url`
pub fn derive_bdns(domains: &[DomainSpec], node_url: &str, validators: &[Validator]) -> BdnsMap {
    domains
        .iter()
        .map(|d| (d.name.clone(), BdnsEntry::single_node(node_url, validators)))
        .collect()
}

/// Complete a caller-supplied BDNS map.
///
/// Entries the caller wrote are kept untouched; domains missing from the
/// map receive a derived entry.
pub fn complete_bdns(
    supplied: Option<&BdnsMap>,
    domains: &[DomainSpec],
    node_url: &str,
    validators: &[Validator],
) -> BdnsMap {
    let Some(supplied) = supplied else {
        return derive_bdns(domains, node_url, validators);
    };

    let mut bdns = supplied.clone();
    for domain in domains {
        if !bdns.contains_key(&domain.name) {
            log::warn!(
                "Supplied BDNS has no entry for domain '{}', deriving one",
                domain.name
            );
            bdns.insert(
                domain.name.clone(),
                BdnsEntry::single_node(node_url, validators),
            );
        }
    }
    bdns
}

/// Return a copy of `domains` where each config has
/// `contracts.constitution = domain_seed`; other keys are untouched.
pub fn patch_with_constitution(domains: &[DomainSpec], domain_seed: &str) -> Vec<DomainSpec> {
    domains
        .iter()
        .map(|domain| {
            let mut config = domain.config.clone();
            let contracts = config
                .entry("contracts")
                .or_insert_with(|| Value::Object(Map::new()));
            if !contracts.is_object() {
                *contracts = Value::Object(Map::new());
            }
            if let Value::Object(contracts) = contracts {
                contracts.insert(
                    "constitution".to_string(),
                    Value::String(domain_seed.to_string()),
                );
            }
            DomainSpec::with_config(domain.name.clone(), config)
        })
        .collect()
}
