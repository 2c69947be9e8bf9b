use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::{Backend, NodeDescriptor};
use crate::checkpoints::DescriptorPaths;
use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// JSON outputs file written by the external cloud-orchestration
    /// client after stack creation.
    pub outputs_file: String,
    pub expected_status: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub poll_interval_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            outputs_file: "stack-outputs.json".into(),
            expected_status: "CREATE_COMPLETE".into(),
            ssh_user: "root".into(),
            ssh_port: 22,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StackOutputs {
    status: String,
    #[serde(default)]
    nodes: Vec<NodeDescriptor>,
}

/// Cloud-stack labs have no live snapshot primitive. Checkpoint
/// existence degrades to descriptor-file existence: `create` persists
/// nothing beyond the descriptor and `revert` only re-reads it.
#[derive(Debug)]
pub struct CloudBackend {
    cfg: CloudConfig,
    descriptors: DescriptorPaths,
    outputs_path: PathBuf,
}

impl CloudBackend {
    pub fn from_config(doc: &ConfigDoc, descriptors: DescriptorPaths) -> Result<Self> {
        let cfg: CloudConfig = doc.deserialize_path("backend.cloud")?.unwrap_or_default();
        let outputs_path = PathBuf::from(cfg.outputs_file.trim());
        Ok(Self {
            cfg,
            descriptors,
            outputs_path,
        })
    }

    fn outputs(&self) -> Result<StackOutputs> {
        let raw = fs::read_to_string(&self.outputs_path).map_err(|_| {
            Error::EnvironmentNotInitialized
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::msg(format!(
                "failed to parse stack outputs {}: {e}",
                self.outputs_path.display()
            ))
        })
    }

    fn check_stack_status(&self, outputs: &StackOutputs) -> Result<()> {
        let status = outputs.status.trim();
        if status == self.cfg.expected_status {
            return Ok(());
        }
        if status.contains("FAILED") || status.contains("ERROR") {
            return Err(Error::EnvironmentBadState(status.to_string()));
        }
        Err(Error::EnvironmentWrongState {
            expected: self.cfg.expected_status.clone(),
            actual: status.to_string(),
        })
    }

    /// One reachability probe. Freshly provisioned nodes accept TCP
    /// before cloud-init has installed keys, so an authentication
    /// refusal counts as "not yet", not as a failure.
    fn probe(&self, node: &NodeDescriptor) -> ProbeResult {
        let target = format!("{}@{}", self.cfg.ssh_user, node.addr);
        let out = Command::new("ssh")
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-o",
                "ConnectTimeout=5",
                "-p",
            ])
            .arg(self.cfg.ssh_port.to_string())
            .arg(&target)
            .arg("true")
            .output();
        let Ok(out) = out else {
            return ProbeResult::NotYet;
        };
        if out.status.success() {
            return ProbeResult::Ready;
        }
        let text = String::from_utf8_lossy(&out.stderr);
        if text.contains("Permission denied") {
            debug!(node = %node.name, "ssh auth not ready yet");
        }
        ProbeResult::NotYet
    }
}

enum ProbeResult {
    Ready,
    NotYet,
}

impl Backend for CloudBackend {
    fn start(&mut self, roles: &str, timeout: Duration) -> Result<()> {
        let outputs = self.outputs()?;
        self.check_stack_status(&outputs)?;
        info!(roles, "waiting for cloud nodes to become reachable");
        let deadline = Instant::now() + timeout;
        for node in outputs.nodes.iter().filter(|n| n.matches(roles)) {
            loop {
                match self.probe(node) {
                    ProbeResult::Ready => {
                        debug!(node = %node.name, "node reachable");
                        break;
                    }
                    ProbeResult::NotYet => {
                        if Instant::now() >= deadline {
                            return Err(Error::NodeUnreachable {
                                roles: roles.to_string(),
                                waited_secs: timeout.as_secs(),
                            });
                        }
                        std::thread::sleep(Duration::from_secs(self.cfg.poll_interval_secs));
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Teardown belongs to the external cloud client.
        debug!("cloud stack lifecycle is externally managed; stop is a no-op");
        Ok(())
    }

    /// No live snapshot catalog exists; "does this checkpoint exist"
    /// is exactly "does its descriptor exist".
    fn has(&self, name: &str) -> Result<bool> {
        self.has_config(name)
    }

    fn has_config(&self, name: &str) -> Result<bool> {
        Ok(self.descriptors.exists(name))
    }

    fn create(&mut self, name: &str, _description: &str, _force: bool) -> Result<()> {
        info!(checkpoint = name, "cloud checkpoint recorded (descriptor only)");
        Ok(())
    }

    fn revert(&mut self, name: &str) -> Result<()> {
        if !self.descriptors.exists(name) {
            warn!(checkpoint = name, "no descriptor to revert to; lab state unchanged");
        }
        Ok(())
    }

    fn discover_addresses(&self, roles: &str) -> Result<Vec<NodeDescriptor>> {
        let outputs = self.outputs()?;
        Ok(outputs
            .nodes
            .into_iter()
            .filter(|n| n.matches(roles))
            .collect())
    }
}
