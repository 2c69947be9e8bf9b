use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::session::{RemoteSession, SessionFactory};

/// Logical target in the lab. Created once during discovery and
/// immutable for the test run.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub roles: BTreeSet<String>,
    pub addr: String,
    pub user: String,
}

impl Node {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// The aggregate a provisioning run operates on: discovered nodes, the
/// backend handle, the live configuration object, and the pointer to
/// the checkpoint the lab currently sits on. One instance per lab per
/// orchestrator process.
pub struct Environment {
    pub lab: String,
    pub config: ConfigDoc,
    pub nodes: Vec<Node>,
    pub current_checkpoint: Option<String>,
    backend: Option<Box<dyn Backend>>,
    sessions: Box<dyn SessionFactory>,
}

impl Environment {
    pub fn new(config: ConfigDoc, sessions: Box<dyn SessionFactory>) -> Self {
        let lab = config
            .value_path("lab.name")
            .and_then(toml::Value::as_str)
            .unwrap_or("lab")
            .to_string();
        Self {
            lab,
            config,
            nodes: Vec::new(),
            current_checkpoint: None,
            backend: None,
            sessions,
        }
    }

    pub fn bind_backend(&mut self, backend: Box<dyn Backend>) {
        self.backend = Some(backend);
    }

    pub fn backend(&self) -> Result<&dyn Backend> {
        self.backend
            .as_deref()
            .ok_or(Error::EnvironmentNotInitialized)
    }

    pub fn backend_mut(&mut self) -> Result<&mut dyn Backend> {
        match self.backend.as_deref_mut() {
            Some(b) => Ok(b),
            None => Err(Error::EnvironmentNotInitialized),
        }
    }

    /// Populate `nodes` from the backend's address discovery, attaching
    /// remote-access credentials from configuration.
    pub fn discover(&mut self, roles: &str) -> Result<()> {
        let user = self
            .config
            .value_path("ssh.user")
            .and_then(toml::Value::as_str)
            .unwrap_or("root")
            .to_string();
        let descriptors = self.backend()?.discover_addresses(roles)?;
        info!(lab = %self.lab, count = descriptors.len(), "discovered lab nodes");
        self.nodes = descriptors
            .into_iter()
            .map(|d| Node {
                name: d.name,
                roles: d.roles.into_iter().collect(),
                addr: d.addr,
                user: user.clone(),
            })
            .collect();
        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::msg(format!("unknown node '{name}'")))
    }

    /// The node carrying the configuration-management control plane;
    /// StateApply operations are issued from here.
    pub fn control_node(&self) -> Result<&Node> {
        if let Some(n) = self.nodes.iter().find(|n| n.has_role("control")) {
            return Ok(n);
        }
        self.nodes
            .first()
            .ok_or_else(|| Error::msg("no nodes discovered; cannot pick a control node"))
    }

    pub fn open_session(&self, node: &str) -> Result<Box<dyn RemoteSession>> {
        self.sessions.open(self.node(node)?)
    }

    /// Best-effort clock resynchronization on every node, to compensate
    /// for suspend/resume drift after a snapshot round-trip.
    pub fn resync_clocks(&self, cmd: &str, timeout: Duration) -> Result<()> {
        for node in &self.nodes {
            let mut session = self.sessions.open(node)?;
            match session.run(cmd, Some(timeout)) {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(
                    node = %node.name,
                    exit = out.exit_code,
                    "clock resync command failed"
                ),
                Err(e) => warn!(node = %node.name, error = %e, "clock resync unreachable"),
            }
        }
        Ok(())
    }
}
