use serde::Deserialize;
use tracing::{debug, info};

use crate::checkpoints::CheckpointStore;
use crate::config::ConfigDoc;
use crate::environment::Environment;
use crate::error::{Error, Result};

/// One declared provisioning stage. The dependency order is stated
/// statically in configuration; an entry in `requires` means "this
/// stage's batch presumes that stage already applied". A stage's
/// checkpoint name is its own name.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub batch: Vec<toml::Value>,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub resync_time: bool,
    pub description: Option<String>,
}

pub fn load_stages(doc: &ConfigDoc) -> Result<Vec<StageConfig>> {
    let stages: Vec<StageConfig> = doc.deserialize_path("stages")?.unwrap_or_default();
    for s in &stages {
        for req in &s.requires {
            if !stages.iter().any(|o| &o.name == req) {
                return Err(Error::msg(format!(
                    "stage '{}' requires unknown stage '{}'",
                    s.name, req
                )));
            }
        }
    }
    Ok(stages)
}

pub fn find_stage<'a>(stages: &'a [StageConfig], name: &str) -> Result<(usize, &'a StageConfig)> {
    stages
        .iter()
        .enumerate()
        .find(|(_, s)| s.name == name)
        .ok_or_else(|| Error::msg(format!("unknown stage '{name}'")))
}

/// Ordered checkpoint candidates for a requested stage: the stage's
/// own name first, then the rest of the graph peeled by repeated leaf
/// extraction. Each pass takes the stages that are not a prerequisite
/// of any remaining stage (the ones that would run last), in
/// declaration order, so the sequence runs from most-specific toward
/// most-general.
pub fn candidates(stages: &[StageConfig], requested: &str) -> Result<Vec<String>> {
    find_stage(stages, requested)?;

    let mut out = vec![requested.to_string()];
    let mut remaining: Vec<&StageConfig> =
        stages.iter().filter(|s| s.name != requested).collect();

    while !remaining.is_empty() {
        let leaves: Vec<String> = remaining
            .iter()
            .filter(|s| {
                !remaining
                    .iter()
                    .any(|o| o.requires.iter().any(|r| r == &s.name))
            })
            .map(|s| s.name.clone())
            .collect();
        if leaves.is_empty() {
            return Err(Error::msg(format!(
                "stage dependency cycle among: {}",
                remaining
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        remaining.retain(|s| !leaves.contains(&s.name));
        out.extend(leaves);
    }
    Ok(out)
}

pub fn root_checkpoint(doc: &ConfigDoc) -> String {
    doc.value_path("checkpoints.root")
        .and_then(toml::Value::as_str)
        .unwrap_or("base")
        .to_string()
}

/// Revert the lab to the deepest available checkpoint for `requested`.
/// A candidate counts only when both the backend snapshot and the
/// descriptor exist; partial checkpoints are treated as absent. When
/// nothing matches, fall back to the root checkpoint — an operation
/// that never fails, even on a lab with no checkpoints at all.
pub fn resolve_and_revert(
    env: &mut Environment,
    store: &CheckpointStore,
    requested: &str,
) -> Result<String> {
    let stages = load_stages(&env.config)?;
    for cand in candidates(&stages, requested)? {
        let backend = env.backend()?;
        if backend.has(&cand)? && backend.has_config(&cand)? {
            info!(stage = requested, checkpoint = %cand, "resuming from checkpoint");
            store.revert(env, &cand)?;
            return Ok(cand);
        }
        debug!(checkpoint = %cand, "checkpoint absent or partial; trying next candidate");
    }

    let root = root_checkpoint(&env.config);
    let backend = env.backend()?;
    if backend.has(&root).unwrap_or(false) && backend.has_config(&root).unwrap_or(false) {
        info!(stage = requested, checkpoint = %root, "resuming from root checkpoint");
        store.revert(env, &root)?;
    } else {
        info!(
            stage = requested,
            "no usable checkpoint anywhere; continuing from bootstrap state"
        );
        env.current_checkpoint = Some(root.clone());
    }
    Ok(root)
}
