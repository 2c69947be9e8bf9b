use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ConfigDoc;
use crate::environment::Environment;
use crate::error::{Error, Result};

fn safe_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::msg("checkpoint name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::msg(format!(
            "checkpoint name '{}' contains invalid characters",
            name
        )));
    }
    Ok(name.to_string())
}

/// Where this lab's serialized configuration descriptors live. One
/// descriptor file per checkpoint, named `{lab}_{checkpoint}.toml`.
#[derive(Debug, Clone)]
pub struct DescriptorPaths {
    pub dir: PathBuf,
    pub lab: String,
}

impl DescriptorPaths {
    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let dir = doc
            .value_path("checkpoints.dir")
            .and_then(toml::Value::as_str)
            .unwrap_or("checkpoints");
        let lab = doc
            .value_path("lab.name")
            .and_then(toml::Value::as_str)
            .unwrap_or("lab");
        Ok(Self {
            dir: PathBuf::from(dir),
            lab: lab.to_string(),
        })
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = safe_name(name)?;
        Ok(self.dir.join(format!("{}_{}.toml", self.lab, name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

/// Pairs backend-level snapshots with serialized configuration
/// descriptors. When the process-wide `checkpoints.enabled` toggle is
/// off (useful for disposable labs), create and revert are complete
/// no-ops: no descriptor write, no backend call, no state mutation.
pub struct CheckpointStore {
    pub descriptors: DescriptorPaths,
    pub enabled: bool,
}

impl CheckpointStore {
    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let enabled = doc
            .value_path("checkpoints.enabled")
            .and_then(toml::Value::as_bool)
            .unwrap_or(true);
        Ok(Self {
            descriptors: DescriptorPaths::from_config(doc)?,
            enabled,
        })
    }

    pub fn create(&self, env: &mut Environment, name: &str, description: &str) -> Result<()> {
        if !self.enabled {
            debug!(checkpoint = name, "checkpointing disabled; create skipped");
            return Ok(());
        }
        let name = safe_name(name)?;
        // Precondition check before the descriptor hits disk.
        env.backend()?;
        let path = self.descriptors.path_for(&name)?;
        atomic_write_text(&path, &env.config.to_toml_string())?;
        env.backend_mut()?.create(&name, description, true)?;
        env.current_checkpoint = Some(name.clone());
        info!(checkpoint = %name, descriptor = %path.display(), "checkpoint created");
        Ok(())
    }

    pub fn revert(&self, env: &mut Environment, name: &str) -> Result<()> {
        if !self.enabled {
            debug!(checkpoint = name, "checkpointing disabled; revert skipped");
            return Ok(());
        }
        let name = safe_name(name)?;
        env.backend_mut()?.revert(&name)?;

        let path = self.descriptors.path_for(&name)?;
        match fs::read_to_string(&path) {
            Ok(raw) => {
                env.config.value = toml::from_str(&raw).map_err(|e| {
                    Error::msg(format!(
                        "corrupt checkpoint descriptor {}: {e}",
                        path.display()
                    ))
                })?;
                debug!(checkpoint = %name, "descriptor loaded into live configuration");
            }
            Err(_) => {
                // Checkpoints that predate descriptor persistence are
                // still usable; the configuration keeps its in-memory
                // defaults.
                warn!(
                    checkpoint = %name,
                    descriptor = %path.display(),
                    "descriptor missing; keeping in-memory configuration"
                );
            }
        }
        env.current_checkpoint = Some(name.clone());
        info!(checkpoint = %name, "reverted");
        Ok(())
    }
}
