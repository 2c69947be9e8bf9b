use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::config::ConfigDoc;
use crate::environment::Environment;
use crate::error::{Error, Result};

/// Settle pause before every attempt, independent of the configured
/// retry delay. Remote agents straight out of a revert tend to need a
/// moment before they answer.
const DEFAULT_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub count: u32,
    /// Seconds between attempts.
    pub delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { count: 1, delay: 0 }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.count.max(1)
    }
}

/// One remote action. The batch schema is declarative; operations are
/// immutable once parsed, and the executor matches this enum
/// exhaustively — there is no string-keyed dispatch anywhere.
#[derive(Debug, Clone)]
pub enum Operation {
    Shell {
        cmd: String,
        node: String,
        description: String,
        retry: RetryPolicy,
        skip_on_fail: bool,
        timeout: Option<u64>,
    },
    StateApply {
        target: String,
        states: Vec<String>,
        args: Vec<String>,
        kwargs: BTreeMap<String, String>,
        description: String,
        retry: RetryPolicy,
        skip_on_fail: bool,
    },
    Upload {
        local_path: String,
        local_filename: Option<String>,
        remote_path: String,
        node: String,
        description: String,
        skip_on_fail: bool,
    },
    Download {
        remote_path: String,
        remote_filename: String,
        local_path: String,
        node: String,
        description: String,
        skip_on_fail: bool,
    },
}

impl Operation {
    pub fn description(&self) -> &str {
        match self {
            Operation::Shell { description, .. }
            | Operation::StateApply { description, .. }
            | Operation::Upload { description, .. }
            | Operation::Download { description, .. } => description,
        }
    }

    pub fn skip_on_fail(&self) -> bool {
        match self {
            Operation::Shell { skip_on_fail, .. }
            | Operation::StateApply { skip_on_fail, .. }
            | Operation::Upload { skip_on_fail, .. }
            | Operation::Download { skip_on_fail, .. } => *skip_on_fail,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UploadSpec {
    local_path: String,
    local_filename: Option<String>,
    remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DownloadSpec {
    remote_path: String,
    remote_filename: String,
    local_path: String,
}

/// Wire form of one batch record. Kebab-case keys, kind decided by
/// which fields are present.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BatchRecord {
    Upload {
        upload: UploadSpec,
        node: String,
        #[serde(rename = "skip-on-fail", default)]
        skip_on_fail: bool,
        description: Option<String>,
    },
    Download {
        download: DownloadSpec,
        node: String,
        #[serde(rename = "skip-on-fail", default)]
        skip_on_fail: bool,
        description: Option<String>,
    },
    StateApply {
        #[serde(rename = "do")]
        action: String,
        target: String,
        state: Option<String>,
        states: Option<Vec<String>>,
        #[serde(default)]
        args: Vec<toml::Value>,
        #[serde(default)]
        kwargs: BTreeMap<String, toml::Value>,
        description: Option<String>,
        retry: Option<RetryPolicy>,
        #[serde(rename = "skip-on-fail", default)]
        skip_on_fail: bool,
    },
    Shell {
        cmd: String,
        node: String,
        description: Option<String>,
        retry: Option<RetryPolicy>,
        #[serde(rename = "skip-on-fail", default)]
        skip_on_fail: bool,
        timeout: Option<u64>,
    },
}

fn value_to_arg(v: &toml::Value) -> String {
    match v {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a declarative batch (as carried in a stage's configuration)
/// into concrete operations.
pub fn parse_batch(records: &[toml::Value]) -> Result<Vec<Operation>> {
    let mut ops = Vec::with_capacity(records.len());
    for (i, raw) in records.iter().enumerate() {
        let rec: BatchRecord = raw.clone().try_into().map_err(|e| {
            Error::msg(format!("invalid batch record at position {}: {e}", i + 1))
        })?;
        ops.push(to_operation(rec, i + 1)?);
    }
    Ok(ops)
}

fn to_operation(rec: BatchRecord, ordinal: usize) -> Result<Operation> {
    Ok(match rec {
        BatchRecord::Shell {
            cmd,
            node,
            description,
            retry,
            skip_on_fail,
            timeout,
        } => Operation::Shell {
            description: description.unwrap_or_else(|| format!("run '{cmd}' on {node}")),
            cmd,
            node,
            retry: retry.unwrap_or_default(),
            skip_on_fail,
            timeout,
        },
        BatchRecord::StateApply {
            action,
            target,
            state,
            states,
            args,
            kwargs,
            description,
            retry,
            skip_on_fail,
        } => {
            if action != "state.apply" {
                return Err(Error::msg(format!(
                    "batch record {ordinal}: unsupported action '{action}' (expected 'state.apply')"
                )));
            }
            let states: Vec<String> = match (state, states) {
                (Some(one), None) => vec![one],
                (None, Some(many)) if !many.is_empty() => many,
                _ => {
                    return Err(Error::msg(format!(
                        "batch record {ordinal}: exactly one of 'state'/'states' must be given"
                    )));
                }
            };
            Operation::StateApply {
                description: description
                    .unwrap_or_else(|| format!("apply {} on '{target}'", states.join(","))),
                target,
                args: args.iter().map(value_to_arg).collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_arg(v)))
                    .collect(),
                states,
                retry: retry.unwrap_or_default(),
                skip_on_fail,
            }
        }
        BatchRecord::Upload {
            upload,
            node,
            skip_on_fail,
            description,
        } => Operation::Upload {
            description: description.unwrap_or_else(|| {
                format!(
                    "upload {} to {node}:{}",
                    upload.local_filename.as_deref().unwrap_or(&upload.local_path),
                    upload.remote_path
                )
            }),
            local_path: upload.local_path,
            local_filename: upload.local_filename,
            remote_path: upload.remote_path,
            node,
            skip_on_fail,
        },
        BatchRecord::Download {
            download,
            node,
            skip_on_fail,
            description,
        } => Operation::Download {
            description: description.unwrap_or_else(|| {
                format!(
                    "download {node}:{}/{} to {}",
                    download.remote_path, download.remote_filename, download.local_path
                )
            }),
            remote_path: download.remote_path,
            remote_filename: download.remote_filename,
            local_path: download.local_path,
            node,
            skip_on_fail,
        },
    })
}

static FALSE_SUCCESS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // The state tool reports per-task tallies with exit 0 even
        // when individual sub-tasks failed.
        r"^Failed:\s*[1-9][0-9]*",
        r"did not respond",
        r"\[CRITICAL\s*\]",
        r"Fatal error",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern must compile"))
    .collect()
});

/// Decide whether a command attempt actually succeeded. Exit status
/// alone is not trustworthy; payload output is scanned for the known
/// false-success markers.
pub fn classify_failure(exit_code: i32, lines: &[String]) -> Option<String> {
    if exit_code != 0 {
        return Some(format!("exit status {exit_code}"));
    }
    for line in lines {
        for pat in FALSE_SUCCESS_PATTERNS.iter() {
            if pat.is_match(line) {
                return Some(format!("false success: '{line}'"));
            }
        }
    }
    None
}

/// Render a StateApply into the control-plane invocation issued on the
/// control node. The control plane fans the target selector out to the
/// matching nodes itself; that parallelism is opaque to this engine.
pub fn state_apply_command(
    doc: &ConfigDoc,
    target: &str,
    states: &[String],
    args: &[String],
    kwargs: &BTreeMap<String, String>,
) -> String {
    let ctl = doc
        .value_path("control_plane.apply_cmd")
        .and_then(toml::Value::as_str)
        .unwrap_or("salt");
    let mut cmd = format!("{ctl} '{target}' state.apply {}", states.join(","));
    for a in args {
        cmd.push(' ');
        cmd.push_str(a);
    }
    for (k, v) in kwargs {
        cmd.push_str(&format!(" {k}={v}"));
    }
    cmd
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    BatchStarted {
        label: String,
        ops: usize,
    },
    AttemptStarted {
        label: String,
        ordinal: usize,
        attempt: u32,
        description: String,
    },
    AttemptFinished {
        label: String,
        ordinal: usize,
        attempt: u32,
        ok: bool,
        detail: Option<String>,
    },
    OpSkipped {
        label: String,
        ordinal: usize,
        description: String,
        error: String,
    },
    BatchFinished {
        label: String,
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    attempts: usize,
    failures: usize,
    skipped: usize,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::BatchStarted { label, ops } => {
                println!("BATCH: {label} ({ops} operations)");
            }
            ExecEvent::AttemptStarted {
                label,
                ordinal,
                attempt,
                description,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.attempts = s.attempts.saturating_add(1);
                }
                println!("RUN [{label} {ordinal}] attempt {attempt}: {description}");
            }
            ExecEvent::AttemptFinished {
                label,
                ordinal,
                attempt,
                ok,
                detail,
            } => {
                if ok {
                    println!("OK  [{label} {ordinal}] attempt {attempt}");
                } else {
                    if let Ok(mut s) = self.state.lock() {
                        s.failures = s.failures.saturating_add(1);
                    }
                    println!(
                        "FAIL [{label} {ordinal}] attempt {attempt}: {}",
                        detail.unwrap_or_default()
                    );
                }
            }
            ExecEvent::OpSkipped {
                label,
                ordinal,
                description,
                error,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.skipped = s.skipped.saturating_add(1);
                }
                println!("SKIP [{label} {ordinal}] {description}: {error}");
            }
            ExecEvent::BatchFinished { label, ok, error } => {
                let (attempts, failures, skipped) = self
                    .state
                    .lock()
                    .map(|mut s| {
                        let out = (s.attempts, s.failures, s.skipped);
                        *s = StdoutSinkState::default();
                        out
                    })
                    .unwrap_or_default();
                if ok {
                    println!(
                        "DONE: {label} (attempts={attempts} failed_attempts={failures} skipped={skipped})"
                    );
                } else {
                    println!("DONE: {label} failed {}", error.unwrap_or_default());
                }
            }
        }
    }
}

/// Runs an ordered batch of heterogeneous remote operations with
/// per-operation retry and skip-on-failure policy. Operations run
/// strictly in sequence; later operations may depend on the side
/// effects of earlier ones.
pub struct ResilientExecutor {
    sink: Arc<dyn ExecSink>,
    settle: Duration,
}

impl ResilientExecutor {
    pub fn new(sink: Arc<dyn ExecSink>) -> Self {
        Self {
            sink,
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn run(&self, env: &Environment, ops: &[Operation], label: &str) -> Result<()> {
        self.sink.emit(ExecEvent::BatchStarted {
            label: label.to_string(),
            ops: ops.len(),
        });
        for (i, op) in ops.iter().enumerate() {
            let ordinal = i + 1;
            match self.run_op(env, op, label, ordinal) {
                Ok(()) => {}
                Err(e) if op.skip_on_fail() => {
                    warn!(batch = label, ordinal, error = %e, "operation failed; skipping");
                    self.sink.emit(ExecEvent::OpSkipped {
                        label: label.to_string(),
                        ordinal,
                        description: op.description().to_string(),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    self.sink.emit(ExecEvent::BatchFinished {
                        label: label.to_string(),
                        ok: false,
                        error: Some(e.to_string()),
                    });
                    return Err(e);
                }
            }
        }
        self.sink.emit(ExecEvent::BatchFinished {
            label: label.to_string(),
            ok: true,
            error: None,
        });
        Ok(())
    }

    fn run_op(
        &self,
        env: &Environment,
        op: &Operation,
        label: &str,
        ordinal: usize,
    ) -> Result<()> {
        match op {
            Operation::Shell {
                cmd,
                node,
                description,
                retry,
                timeout,
                ..
            } => self.run_with_retry(env, label, ordinal, description, retry, node, cmd, *timeout),
            Operation::StateApply {
                target,
                states,
                args,
                kwargs,
                description,
                retry,
                ..
            } => {
                let control = env.control_node()?.name.clone();
                let cmd = state_apply_command(&env.config, target, states, args, kwargs);
                self.run_with_retry(env, label, ordinal, description, retry, &control, &cmd, None)
            }
            Operation::Upload {
                local_path,
                local_filename,
                remote_path,
                node,
                description,
                ..
            } => self.run_upload(
                env,
                label,
                ordinal,
                description,
                local_path,
                local_filename.as_deref(),
                remote_path,
                node,
            ),
            Operation::Download {
                remote_path,
                remote_filename,
                local_path,
                node,
                description,
                ..
            } => self.run_download(
                env,
                label,
                ordinal,
                description,
                remote_path,
                remote_filename,
                local_path,
                node,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_with_retry(
        &self,
        env: &Environment,
        label: &str,
        ordinal: usize,
        description: &str,
        retry: &RetryPolicy,
        node: &str,
        cmd: &str,
        timeout: Option<u64>,
    ) -> Result<()> {
        let attempts = retry.attempts();
        let mut last_detail = String::new();
        for attempt in 1..=attempts {
            std::thread::sleep(self.settle);
            self.sink.emit(ExecEvent::AttemptStarted {
                label: label.to_string(),
                ordinal,
                attempt,
                description: description.to_string(),
            });

            let outcome = env
                .open_session(node)
                .and_then(|mut s| s.run(cmd, timeout.map(Duration::from_secs)));
            let failure = match outcome {
                Ok(out) => classify_failure(out.exit_code, &out.lines),
                // Transport-level flakiness is retried like any other
                // failed attempt.
                Err(e) => Some(e.to_string()),
            };

            self.sink.emit(ExecEvent::AttemptFinished {
                label: label.to_string(),
                ordinal,
                attempt,
                ok: failure.is_none(),
                detail: failure.clone(),
            });
            match failure {
                None => return Ok(()),
                Some(detail) => {
                    last_detail = detail;
                    if attempt < attempts && retry.delay > 0 {
                        std::thread::sleep(Duration::from_secs(retry.delay));
                    }
                }
            }
        }
        Err(Error::StepFailed {
            batch: label.to_string(),
            ordinal,
            description: format!("{description} ({last_detail})"),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_upload(
        &self,
        env: &Environment,
        label: &str,
        ordinal: usize,
        description: &str,
        local_path: &str,
        local_filename: Option<&str>,
        remote_path: &str,
        node: &str,
    ) -> Result<()> {
        std::thread::sleep(self.settle);
        self.sink.emit(ExecEvent::AttemptStarted {
            label: label.to_string(),
            ordinal,
            attempt: 1,
            description: description.to_string(),
        });

        // Resolve the glob before any remote session is opened.
        let matched = resolve_local_glob(Path::new(local_path), local_filename)?;
        if matched.is_empty() {
            let pattern = match local_filename {
                Some(f) => format!("{local_path}/{f}"),
                None => local_path.to_string(),
            };
            self.sink.emit(ExecEvent::AttemptFinished {
                label: label.to_string(),
                ordinal,
                attempt: 1,
                ok: false,
                detail: Some(format!("nothing to upload for '{pattern}'")),
            });
            return Err(Error::NothingToTransfer { pattern });
        }

        let mut session = env.open_session(node)?;
        let result = (|| {
            for (abs, rel) in &matched {
                let remote = join_remote(remote_path, rel);
                session.send_file(abs, &remote)?;
            }
            Ok(())
        })();
        self.finish_transfer(label, ordinal, description, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_download(
        &self,
        env: &Environment,
        label: &str,
        ordinal: usize,
        description: &str,
        remote_path: &str,
        remote_filename: &str,
        local_path: &str,
        node: &str,
    ) -> Result<()> {
        std::thread::sleep(self.settle);
        self.sink.emit(ExecEvent::AttemptStarted {
            label: label.to_string(),
            ordinal,
            attempt: 1,
            description: description.to_string(),
        });

        let pattern = join_remote(remote_path, remote_filename);
        let mut session = env.open_session(node)?;
        let matched = session.list_remote(&pattern)?;
        if matched.is_empty() {
            self.sink.emit(ExecEvent::AttemptFinished {
                label: label.to_string(),
                ordinal,
                attempt: 1,
                ok: false,
                detail: Some(format!("nothing to download for '{pattern}'")),
            });
            return Err(Error::NothingToTransfer { pattern });
        }

        let dest_dir = PathBuf::from(local_path);
        let result = (|| {
            std::fs::create_dir_all(&dest_dir)
                .map_err(|e| Error::msg(format!("failed to create {local_path}: {e}")))?;
            for remote in &matched {
                let file_name = remote.rsplit('/').next().unwrap_or(remote);
                session.fetch_file(remote, &dest_dir.join(file_name))?;
            }
            Ok(())
        })();
        self.finish_transfer(label, ordinal, description, result)
    }

    fn finish_transfer(
        &self,
        label: &str,
        ordinal: usize,
        description: &str,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.sink.emit(ExecEvent::AttemptFinished {
                    label: label.to_string(),
                    ordinal,
                    attempt: 1,
                    ok: true,
                    detail: None,
                });
                Ok(())
            }
            Err(e) => {
                self.sink.emit(ExecEvent::AttemptFinished {
                    label: label.to_string(),
                    ordinal,
                    attempt: 1,
                    ok: false,
                    detail: Some(e.to_string()),
                });
                Err(Error::StepFailed {
                    batch: label.to_string(),
                    ordinal,
                    description: format!("{description} ({e})"),
                })
            }
        }
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || name.starts_with('/') {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::msg(format!("invalid glob '{pattern}': {e}")))
}

/// Expand a local upload source. With a filename pattern, walk
/// `local_path` and match each file's relative path against the glob
/// so nested matches keep their structure on the remote side. Without
/// one, `local_path` itself is the (single) file.
fn resolve_local_glob(
    local_path: &Path,
    local_filename: Option<&str>,
) -> Result<Vec<(PathBuf, String)>> {
    let Some(pattern) = local_filename else {
        if local_path.is_file() {
            let name = local_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("file")
                .to_string();
            return Ok(vec![(local_path.to_path_buf(), name)]);
        }
        return Ok(Vec::new());
    };

    let re = glob_to_regex(pattern)?;
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(local_path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(local_path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if re.is_match(&rel) {
            out.push((entry.path().to_path_buf(), rel));
        }
    }
    out.sort();
    Ok(out)
}
