use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::environment::Node;
use crate::error::{Error, Result};

/// Captured result of one remote command: exit status plus the merged
/// stdout/stderr lines. Classification (false-success detection) is
/// the executor's concern, not the transport's.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One shell-over-network session against a single node. Sessions are
/// scoped: opened, used for one operation (or a small group), and
/// released.
pub trait RemoteSession {
    fn run(&mut self, cmd: &str, timeout: Option<Duration>) -> Result<CmdOutput>;
    fn send_file(&mut self, local: &Path, remote: &str) -> Result<()>;
    fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()>;
    /// Expand a glob on the remote side into concrete paths.
    fn list_remote(&mut self, pattern: &str) -> Result<Vec<String>>;
}

pub trait SessionFactory {
    fn open(&self, node: &Node) -> Result<Box<dyn RemoteSession>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            identity_file: None,
            strict_host_key_checking: false,
        }
    }
}

pub struct SshSessionFactory {
    cfg: SshConfig,
}

impl SshSessionFactory {
    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let cfg: SshConfig = doc.deserialize_path("ssh")?.unwrap_or_default();
        Ok(Self { cfg })
    }
}

impl SessionFactory for SshSessionFactory {
    fn open(&self, node: &Node) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshSession {
            cfg: self.cfg.clone(),
            user: node.user.clone(),
            addr: node.addr.clone(),
        }))
    }
}

/// ssh/scp subprocess transport. BatchMode keeps a missing key from
/// degenerating into an interactive password prompt.
pub struct SshSession {
    cfg: SshConfig,
    user: String,
    addr: String,
}

impl SshSession {
    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["-o".into(), "BatchMode=yes".into()];
        if !self.cfg.strict_host_key_checking {
            args.push("-o".into());
            args.push("StrictHostKeyChecking=accept-new".into());
        }
        if let Some(identity) = self.cfg.identity_file.as_deref() {
            args.push("-i".into());
            args.push(identity.into());
        }
        args
    }

    fn target(&self) -> String {
        let user = if self.user.is_empty() {
            self.cfg.user.as_str()
        } else {
            self.user.as_str()
        };
        format!("{user}@{}", self.addr)
    }

    fn run_transport(&self, program: &str, args: &[String]) -> Result<CmdOutput> {
        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::msg(format!("failed to spawn {program}: {e}")))?;
        let mut lines = Vec::new();
        for chunk in [&out.stdout, &out.stderr] {
            for line in String::from_utf8_lossy(chunk).lines() {
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
        }
        Ok(CmdOutput {
            exit_code: out.status.code().unwrap_or(-1),
            lines,
        })
    }
}

impl RemoteSession for SshSession {
    fn run(&mut self, cmd: &str, timeout: Option<Duration>) -> Result<CmdOutput> {
        let mut args = self.common_args();
        args.push("-p".into());
        args.push(self.cfg.port.to_string());
        args.push(self.target());
        // A per-operation timeout rides along as a remote `timeout`
        // wrapper and surfaces as an ordinary nonzero exit.
        match timeout {
            Some(t) => args.push(format!("timeout {} sh -c '{}'", t.as_secs(), cmd)),
            None => args.push(cmd.to_string()),
        }
        self.run_transport("ssh", &args)
    }

    fn send_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut args = self.common_args();
        args.push("-P".into());
        args.push(self.cfg.port.to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.target(), remote));
        let out = self.run_transport("scp", &args)?;
        if !out.success() {
            return Err(Error::msg(format!(
                "upload of {} to {remote} failed: {}",
                local.display(),
                out.lines.join(" / ")
            )));
        }
        Ok(())
    }

    fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        let mut args = self.common_args();
        args.push("-P".into());
        args.push(self.cfg.port.to_string());
        args.push(format!("{}:{}", self.target(), remote));
        args.push(local.display().to_string());
        let out = self.run_transport("scp", &args)?;
        if !out.success() {
            return Err(Error::msg(format!(
                "download of {remote} to {} failed: {}",
                local.display(),
                out.lines.join(" / ")
            )));
        }
        Ok(())
    }

    fn list_remote(&mut self, pattern: &str) -> Result<Vec<String>> {
        let out = self.run(&format!("ls -1d {pattern} 2>/dev/null"), None)?;
        // `ls` exits nonzero when nothing matched; an empty listing is
        // the caller's decision to make, not a transport error.
        Ok(out
            .lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}
