use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::backend::{Backend, NodeDescriptor};
use crate::checkpoints::DescriptorPaths;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PassthroughConfig {
    /// Externally supplied label for the state the running lab is in.
    pub current_checkpoint: String,
}

/// Pass-through backend for labs that are already running and managed
/// elsewhere. Power and checkpoint primitives are no-ops; checkpoint
/// existence degrades to an identity check against the declared
/// current-state label.
#[derive(Debug)]
pub struct PassthroughBackend {
    current: String,
    descriptors: DescriptorPaths,
    nodes: Vec<NodeDescriptor>,
}

impl PassthroughBackend {
    pub fn from_config(doc: &ConfigDoc, descriptors: DescriptorPaths) -> Result<Self> {
        let cfg: PassthroughConfig =
            doc.deserialize_path("backend.passthrough")?.unwrap_or_default();
        if cfg.current_checkpoint.trim().is_empty() {
            return Err(Error::msg(
                "backend.passthrough.current_checkpoint must name the state the lab is in",
            ));
        }
        let nodes = crate::backend::declared_nodes(doc)?;
        Ok(Self {
            current: cfg.current_checkpoint.trim().to_string(),
            descriptors,
            nodes,
        })
    }
}

impl Backend for PassthroughBackend {
    fn start(&mut self, _roles: &str, _timeout: Duration) -> Result<()> {
        debug!("passthrough lab is already running; start is a no-op");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        debug!("passthrough lab is externally managed; stop is a no-op");
        Ok(())
    }

    /// The lab can only ever be in the one state its operator declared.
    /// Asking about any other checkpoint is a configuration error, not
    /// a silent miss, so a stale label fails loudly instead of quietly
    /// re-provisioning a live lab.
    fn has(&self, name: &str) -> Result<bool> {
        if name == self.current {
            Ok(true)
        } else {
            Err(Error::EnvironmentWrongState {
                expected: name.to_string(),
                actual: self.current.clone(),
            })
        }
    }

    fn has_config(&self, name: &str) -> Result<bool> {
        Ok(self.descriptors.exists(name))
    }

    fn create(&mut self, name: &str, _description: &str, _force: bool) -> Result<()> {
        debug!(checkpoint = name, "passthrough create is a no-op");
        Ok(())
    }

    fn revert(&mut self, name: &str) -> Result<()> {
        debug!(checkpoint = name, "passthrough revert is a no-op");
        Ok(())
    }

    fn discover_addresses(&self, roles: &str) -> Result<Vec<NodeDescriptor>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.matches(roles))
            .cloned()
            .collect())
    }
}
