#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhea_lab_orchestrator::backend::{Backend, NodeDescriptor};
use rhea_lab_orchestrator::config::ConfigDoc;
use rhea_lab_orchestrator::environment::{Environment, Node};
use rhea_lab_orchestrator::error::Result;
use rhea_lab_orchestrator::executor::{ExecEvent, ExecSink, ResilientExecutor};
use rhea_lab_orchestrator::session::{CmdOutput, RemoteSession, SessionFactory};

#[derive(Debug, Default)]
pub struct MockBackendState {
    pub snapshots: BTreeSet<String>,
    pub configs: BTreeSet<String>,
    pub created: Vec<String>,
    pub reverted: Vec<String>,
}

/// Backend double with an inspectable snapshot catalog.
#[derive(Debug)]
pub struct MockBackend {
    pub state: Arc<Mutex<MockBackendState>>,
}

impl MockBackend {
    pub fn new() -> (Self, Arc<Mutex<MockBackendState>>) {
        let state = Arc::new(Mutex::new(MockBackendState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    /// Mark a checkpoint as fully present (snapshot + descriptor).
    pub fn seed(state: &Arc<Mutex<MockBackendState>>, name: &str) {
        let mut s = state.lock().unwrap();
        s.snapshots.insert(name.to_string());
        s.configs.insert(name.to_string());
    }
}

impl Backend for MockBackend {
    fn start(&mut self, _roles: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn has(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().snapshots.contains(name))
    }

    fn has_config(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().configs.contains(name))
    }

    fn create(&mut self, name: &str, _description: &str, _force: bool) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.snapshots.insert(name.to_string());
        s.configs.insert(name.to_string());
        s.created.push(name.to_string());
        Ok(())
    }

    fn revert(&mut self, name: &str) -> Result<()> {
        self.state.lock().unwrap().reverted.push(name.to_string());
        Ok(())
    }

    fn discover_addresses(&self, _roles: &str) -> Result<Vec<NodeDescriptor>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct SessionLog {
    pub opens: usize,
    pub runs: Vec<String>,
    pub sent: Vec<(String, String)>,
    pub fetched: Vec<(String, String)>,
    /// Outputs handed back to `run`, front first; exhausted script
    /// defaults to a clean exit 0.
    pub script: VecDeque<CmdOutput>,
    pub listings: VecDeque<Vec<String>>,
}

pub struct ScriptedFactory {
    pub log: Arc<Mutex<SessionLog>>,
}

impl ScriptedFactory {
    pub fn new() -> (Self, Arc<Mutex<SessionLog>>) {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl SessionFactory for ScriptedFactory {
    fn open(&self, _node: &Node) -> Result<Box<dyn RemoteSession>> {
        self.log.lock().unwrap().opens += 1;
        Ok(Box::new(ScriptedSession {
            log: Arc::clone(&self.log),
        }))
    }
}

pub struct ScriptedSession {
    log: Arc<Mutex<SessionLog>>,
}

impl RemoteSession for ScriptedSession {
    fn run(&mut self, cmd: &str, _timeout: Option<Duration>) -> Result<CmdOutput> {
        let mut log = self.log.lock().unwrap();
        log.runs.push(cmd.to_string());
        Ok(log.script.pop_front().unwrap_or_default())
    }

    fn send_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .sent
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    fn fetch_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .fetched
            .push((remote.to_string(), local.display().to_string()));
        Ok(())
    }

    fn list_remote(&mut self, _pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .log
            .lock()
            .unwrap()
            .listings
            .pop_front()
            .unwrap_or_default())
    }
}

pub fn cmd_out(exit_code: i32, lines: &[&str]) -> CmdOutput {
    CmdOutput {
        exit_code,
        lines: lines.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<ExecEvent>>>,
}

impl ExecSink for RecordingSink {
    fn emit(&self, ev: ExecEvent) {
        self.events.lock().unwrap().push(ev);
    }
}

pub fn attempts_started(events: &Arc<Mutex<Vec<ExecEvent>>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ExecEvent::AttemptStarted { .. }))
        .count()
}

pub fn ops_skipped(events: &Arc<Mutex<Vec<ExecEvent>>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ExecEvent::OpSkipped { .. }))
        .count()
}

/// Environment over scripted sessions with a control node and one
/// minion, ready for executor/runner tests.
pub fn test_env(value: toml::Value) -> (Environment, Arc<Mutex<SessionLog>>) {
    let (factory, log) = ScriptedFactory::new();
    let mut env = Environment::new(ConfigDoc::in_memory(value), Box::new(factory));
    env.nodes.push(Node {
        name: "master".into(),
        roles: ["control".to_string()].into_iter().collect(),
        addr: "10.0.0.1".into(),
        user: "root".into(),
    });
    env.nodes.push(Node {
        name: "web01".into(),
        roles: ["minion".to_string()].into_iter().collect(),
        addr: "10.0.0.2".into(),
        user: "root".into(),
    });
    (env, log)
}

/// Executor wired to a recording sink, with the settle delay zeroed so
/// tests do not sleep.
pub fn test_executor() -> (ResilientExecutor, Arc<Mutex<Vec<ExecEvent>>>) {
    let sink = RecordingSink::default();
    let events = Arc::clone(&sink.events);
    (
        ResilientExecutor::new(Arc::new(sink)).with_settle(Duration::ZERO),
        events,
    )
}
