use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info};

use crate::backend::{Backend, NodeDescriptor};
use crate::checkpoints::DescriptorPaths;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Lab-manager control binary driving the hypervisor.
    pub ctl: String,
    pub ssh_port: u16,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            ctl: "virt-lab".into(),
            ssh_port: 22,
        }
    }
}

/// Hypervisor-backed labs have true live snapshots: create/revert
/// suspend the virtual nodes, apply the snapshot primitive, resume.
#[derive(Debug)]
pub struct HypervisorBackend {
    cfg: HypervisorConfig,
    lab: String,
    descriptors: DescriptorPaths,
    nodes: Vec<NodeDescriptor>,
}

impl HypervisorBackend {
    pub fn from_config(doc: &ConfigDoc, descriptors: DescriptorPaths) -> Result<Self> {
        let cfg: HypervisorConfig = doc.deserialize_path("backend.hypervisor")?.unwrap_or_default();
        let nodes = crate::backend::declared_nodes(doc)?;
        Ok(Self {
            lab: descriptors.lab.clone(),
            cfg,
            descriptors,
            nodes,
        })
    }

    fn ctl(&self, args: &[&str]) -> Result<Vec<String>> {
        let out = Command::new(&self.cfg.ctl)
            .args(args)
            .output()
            .map_err(|e| Error::msg(format!("failed to spawn {}: {e}", self.cfg.ctl)))?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "{} {} failed: {}",
                self.cfg.ctl,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

impl Backend for HypervisorBackend {
    fn start(&mut self, roles: &str, timeout: Duration) -> Result<()> {
        info!(lab = %self.lab, roles, "powering on hypervisor lab");
        self.ctl(&["start", &self.lab])?;
        let deadline = Instant::now() + timeout;
        let targets: Vec<&NodeDescriptor> =
            self.nodes.iter().filter(|n| n.matches(roles)).collect();
        for node in targets {
            loop {
                if tcp_reachable(&node.addr, self.cfg.ssh_port) {
                    debug!(node = %node.name, "node reachable");
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::NodeUnreachable {
                        roles: roles.to_string(),
                        waited_secs: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_secs(2));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        info!(lab = %self.lab, "powering off hypervisor lab");
        self.ctl(&["stop", &self.lab])?;
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool> {
        let catalog = self.ctl(&["snapshot-list", &self.lab])?;
        Ok(catalog.iter().any(|entry| {
            entry == name || entry.split_whitespace().next() == Some(name)
        }))
    }

    fn has_config(&self, name: &str) -> Result<bool> {
        Ok(self.descriptors.exists(name))
    }

    fn create(&mut self, name: &str, description: &str, force: bool) -> Result<()> {
        info!(lab = %self.lab, checkpoint = name, "creating hypervisor snapshot");
        self.ctl(&["suspend", &self.lab])?;
        let mut args = vec!["snapshot-create", &self.lab, name, "--description", description];
        if force {
            args.push("--force");
        }
        let created = self.ctl(&args);
        // Resume even when the snapshot failed; a suspended lab is
        // worse than a missing checkpoint.
        let resumed = self.ctl(&["resume", &self.lab]);
        created?;
        resumed?;
        Ok(())
    }

    fn revert(&mut self, name: &str) -> Result<()> {
        info!(lab = %self.lab, checkpoint = name, "reverting hypervisor snapshot");
        self.ctl(&["suspend", &self.lab])?;
        let reverted = self.ctl(&["snapshot-revert", &self.lab, name]);
        let resumed = self.ctl(&["resume", &self.lab]);
        reverted?;
        resumed?;
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

fn tcp_reachable(addr: &str, port: u16) -> bool {
    let Ok(mut addrs) = (addr, port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|a| TcpStream::connect_timeout(&a, Duration::from_secs(3)).is_ok())
}
