use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::checkpoints::CheckpointStore;
use crate::environment::Environment;
use crate::error::Result;
use crate::executor::{self, ResilientExecutor};
use crate::resolver;

const DEFAULT_TIME_SYNC_CMD: &str = "chronyc makestep";
const TIME_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Unresolved,
    Reverting,
    Executing,
    Checkpointing,
    Installed,
    Failed,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StagePhase::Unresolved => "unresolved",
            StagePhase::Reverting => "reverting",
            StagePhase::Executing => "executing",
            StagePhase::Checkpointing => "checkpointing",
            StagePhase::Installed => "installed",
            StagePhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Handle to an installed stage: its name, the checkpoint the lab
/// resumed from before the batch ran, and the phase the run ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageHandle {
    pub name: String,
    pub resumed_from: Option<String>,
    pub phase: StagePhase,
}

/// Composes resolver, checkpoint store, and executor:
/// resolve → revert → (skip if installed) → execute → checkpoint →
/// mark installed.
pub struct StageRunner {
    store: CheckpointStore,
    executor: ResilientExecutor,
}

impl StageRunner {
    pub fn new(store: CheckpointStore, executor: ResilientExecutor) -> Self {
        Self { store, executor }
    }

    pub fn install(&self, env: &mut Environment, stage_name: &str) -> Result<StageHandle> {
        let stages = resolver::load_stages(&env.config)?;
        let (_, stage) = resolver::find_stage(&stages, stage_name)?;

        // Idempotence: at most one successful batch execution per
        // checkpoint identity. An installed stage returns its handle
        // without touching the backend at all.
        if stage.installed {
            info!(stage = stage_name, "already installed; nothing to do");
            return Ok(StageHandle {
                name: stage_name.to_string(),
                resumed_from: env.current_checkpoint.clone(),
                phase: StagePhase::Installed,
            });
        }

        let mut phase = StagePhase::Unresolved;
        info!(stage = stage_name, %phase, "installing stage");

        phase = StagePhase::Reverting;
        info!(stage = stage_name, %phase, "resuming from best prior checkpoint");
        let resumed_from = resolver::resolve_and_revert(env, &self.store, stage_name)?;

        // The revert may have replaced the live configuration with the
        // descriptor's snapshot; re-read the stage definition from it.
        let stages = resolver::load_stages(&env.config)?;
        let (idx, stage) = resolver::find_stage(&stages, stage_name)?;
        let ops = executor::parse_batch(&stage.batch)?;
        let resync_time = stage.resync_time;
        let description = stage
            .description
            .clone()
            .unwrap_or_else(|| format!("stage {stage_name}"));

        phase = StagePhase::Executing;
        info!(stage = stage_name, %phase, ops = ops.len(), "running batch");
        if let Err(e) = self.executor.run(env, &ops, stage_name) {
            phase = StagePhase::Failed;
            warn!(stage = stage_name, %phase, error = %e, "stage failed");
            self.diagnostic_checkpoint(env, stage_name);
            return Err(e);
        }

        phase = StagePhase::Checkpointing;
        info!(stage = stage_name, %phase, "persisting checkpoint");
        self.store.create(env, stage_name, &description)?;

        env.config
            .set_bool_path(&format!("stages[{idx}].installed"), true)?;
        if resync_time {
            // Suspend/resume around the snapshot can leave node clocks
            // behind wall time.
            let cmd = env
                .config
                .value_path("time_sync_cmd")
                .and_then(toml::Value::as_str)
                .unwrap_or(DEFAULT_TIME_SYNC_CMD)
                .to_string();
            env.resync_clocks(&cmd, TIME_SYNC_TIMEOUT)?;
        }

        phase = StagePhase::Installed;
        info!(stage = stage_name, %phase, "stage installed");
        Ok(StageHandle {
            name: stage_name.to_string(),
            resumed_from: Some(resumed_from),
            phase,
        })
    }

    /// Best-effort checkpoint of the failed state for post-mortem
    /// inspection; never masks the original failure.
    fn diagnostic_checkpoint(&self, env: &mut Environment, stage_name: &str) {
        let name = format!(
            "{stage_name}-failed-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        match self.store.create(env, &name, "diagnostic checkpoint of failed stage") {
            Ok(()) => info!(checkpoint = %name, "diagnostic checkpoint created"),
            Err(e) => warn!(error = %e, "diagnostic checkpoint failed"),
        }
    }
}
