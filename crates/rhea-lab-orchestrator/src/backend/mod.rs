use std::time::Duration;

use serde::Deserialize;

use crate::checkpoints::DescriptorPaths;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub mod cloud;
pub mod hypervisor;
pub mod passthrough;

/// Address and role information for one logical node, as reported by
/// the compute substrate (or declared in configuration for substrates
/// that cannot enumerate themselves).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub addr: String,
}

impl NodeDescriptor {
    pub fn matches(&self, selector: &str) -> bool {
        roles_match(&self.roles, selector)
    }
}

/// Capability interface over a lab's compute substrate. One
/// implementation per substrate; selected by `backend.kind` at
/// startup.
pub trait Backend: std::fmt::Debug {
    /// Power on / provision nodes matching `roles` and block until
    /// they are reachable, or fail with `NodeUnreachable`.
    fn start(&mut self, roles: &str, timeout: Duration) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Does a substrate-level snapshot with this name exist?
    fn has(&self, name: &str) -> Result<bool>;
    /// Does a persisted descriptor for this checkpoint exist?
    fn has_config(&self, name: &str) -> Result<bool>;
    fn create(&mut self, name: &str, description: &str, force: bool) -> Result<()>;
    fn revert(&mut self, name: &str) -> Result<()>;
    fn discover_addresses(&self, roles: &str) -> Result<Vec<NodeDescriptor>>;
}

/// Role selector semantics shared by every backend: empty or "*"
/// matches everything, otherwise a comma-separated list matching any
/// declared role.
pub fn roles_match(roles: &[String], selector: &str) -> bool {
    let selector = selector.trim();
    if selector.is_empty() || selector == "*" {
        return true;
    }
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|want| roles.iter().any(|r| r == want))
}

pub fn from_config(doc: &ConfigDoc) -> Result<Box<dyn Backend>> {
    let kind = doc
        .value_path("backend.kind")
        .and_then(toml::Value::as_str)
        .unwrap_or("hypervisor")
        .to_string();
    let descriptors = DescriptorPaths::from_config(doc)?;
    match kind.as_str() {
        "hypervisor" => Ok(Box::new(hypervisor::HypervisorBackend::from_config(
            doc,
            descriptors,
        )?)),
        "passthrough" => Ok(Box::new(passthrough::PassthroughBackend::from_config(
            doc,
            descriptors,
        )?)),
        "cloud" => Ok(Box::new(cloud::CloudBackend::from_config(doc, descriptors)?)),
        other => Err(Error::msg(format!("unknown backend.kind '{other}'"))),
    }
}

/// Node declarations for substrates that take them from configuration
/// (hypervisor and passthrough labs).
pub fn declared_nodes(doc: &ConfigDoc) -> Result<Vec<NodeDescriptor>> {
    Ok(doc.deserialize_path("nodes")?.unwrap_or_default())
}
