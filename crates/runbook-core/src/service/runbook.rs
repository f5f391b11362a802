//! Run lifecycle service.
//!
//! Every request loads the session from the repository, applies itself
//! through the engine, and checkpoints the result, so any front end (CLI,
//! HTTP) can serve any request for any stored run. Requests against the
//! same run are serialized with a per-run lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use runbook_types::event::RunEvent;
use runbook_types::session::{
    OutcomeRecord, RunMode, RunStatus, SerializedNode, SessionSummary, StepRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::session::SessionRepository;
use crate::runbook::checkpoint::{CheckpointError, CheckpointManager};
use crate::runbook::compiled::OutlineEntry;
use crate::runbook::engine::{AdvanceMode, AdvanceResult, Engine, EngineError, PendingPrompt};
use crate::runbook::executor::{ExecutionError, ExecutorSource};
use crate::runbook::routing::OutcomeSelector;
use crate::runbook::scenario::{
    ScenarioError, build_scenario, parse_scenario, scenario_path, serialize_scenario,
};
use crate::runbook::session::{RunSession, serialize_node};
use crate::service::fs::FileSystem;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// A run as returned by `start` and `replay`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow: PathBuf,
    pub name: String,
    pub status: RunStatus,
    pub mode: RunMode,
    /// Steps declared in the root runbook.
    pub step_count: usize,
}

impl RunSummary {
    fn from_session(session: &RunSession) -> Self {
        Self {
            run_id: session.run_id,
            workflow: session.root_workflow.clone(),
            name: session.level.runbook.name().to_string(),
            status: session.status,
            mode: session.mode.clone(),
            step_count: session.level.runbook.step_count(),
        }
    }
}

/// A suspended parent level in a manifest.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StackEntry {
    pub workflow: String,
    pub run_id: Uuid,
    /// Invoke step the parent is waiting on.
    pub invoking_step: String,
    pub depth: u32,
}

/// Where a run stands: the active runbook's outline, what is queued, and
/// the invoke stack above it.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub root_workflow: PathBuf,
    /// Runbook of the active level.
    pub workflow: String,
    pub level_run_id: Uuid,
    pub status: RunStatus,
    pub outline: Vec<OutlineEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingPrompt>,
    pub queue: Vec<SerializedNode>,
    /// Suspended parents, outermost first.
    pub stack: Vec<StackEntry>,
    pub history: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from run service requests.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("executor unavailable: {0}")]
    Executor(#[from] ExecutionError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

// ---------------------------------------------------------------------------
// RunbookService
// ---------------------------------------------------------------------------

/// Service orchestrating runs end to end.
///
/// Generic over the session repository and filesystem so runbook-core never
/// depends on runbook-infra.
pub struct RunbookService<R: SessionRepository, F: FileSystem> {
    engine: Engine,
    checkpoints: CheckpointManager<R>,
    executors: Arc<dyn ExecutorSource>,
    fs: F,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Cancellation tokens of runs currently advancing.
    active: DashMap<Uuid, CancellationToken>,
}

impl<R: SessionRepository, F: FileSystem> RunbookService<R, F> {
    pub fn new(engine: Engine, repo: R, executors: Arc<dyn ExecutorSource>, fs: F) -> Self {
        Self {
            engine,
            checkpoints: CheckpointManager::new(repo),
            executors,
            fs,
            locks: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Follow events of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.engine.bus().subscribe()
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(run_id).or_default().clone()
    }

    /// Drop the map entry for `run_id` unless another request still holds it.
    /// Call after the guard is released.
    fn release_lock(&self, run_id: Uuid, lock: Arc<Mutex<()>>) {
        self.locks.remove_if(&run_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
    }

    /// Load a stored run and rebuild its session.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunSession, ServiceError> {
        Ok(self
            .checkpoints
            .resume(run_id, self.engine.loader().as_ref())
            .await?)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Load and validate `path`, open a session, and store it.
    pub async fn start(
        &self,
        path: &Path,
        variables: BTreeMap<String, Value>,
        mode: RunMode,
    ) -> Result<RunSummary, ServiceError> {
        let session = self.engine.start_session(path, variables, mode)?;
        self.checkpoints.checkpoint(&session).await?;
        Ok(RunSummary::from_session(&session))
    }

    /// Start a run that answers every action from a saved scenario.
    pub async fn replay(&self, scenario: &Path) -> Result<RunSummary, ServiceError> {
        let path = scenario_path(scenario);
        let json = self
            .fs
            .read_file(&path)
            .await
            .map_err(ScenarioError::from)?;
        let recorded = parse_scenario(&json)?;
        tracing::info!(
            scenario = %path.display(),
            exchanges = recorded.exchanges.len(),
            "replaying scenario"
        );
        self.start(
            &recorded.workflow,
            recorded.variables,
            RunMode::Replay { scenario: path },
        )
        .await
    }

    /// Run forward until blocked, or by one step.
    ///
    /// The session is checkpointed after every executed step, so a crash
    /// mid-advance loses at most the step in flight.
    pub async fn advance(
        &self,
        run_id: Uuid,
        mode: AdvanceMode,
    ) -> Result<AdvanceResult, ServiceError> {
        let lock = self.run_lock(run_id);
        let result = {
            let _guard = lock.lock().await;
            self.advance_locked(run_id, mode).await
        };
        self.release_lock(run_id, lock);
        result
    }

    async fn advance_locked(
        &self,
        run_id: Uuid,
        mode: AdvanceMode,
    ) -> Result<AdvanceResult, ServiceError> {
        let mut session = self.resume(run_id).await?;
        let executor =
            self.executors
                .executor_for(&session.mode, &session.exchanges, &session.inputs)?;

        let cancel = CancellationToken::new();
        self.active.insert(run_id, cancel.clone());

        let result = async {
            loop {
                let result = self
                    .engine
                    .advance(&mut session, executor.as_ref(), AdvanceMode::SingleStep, &cancel)
                    .await?;
                self.checkpoints.checkpoint(&session).await?;
                match (&result, mode) {
                    (AdvanceResult::StepResult(_), AdvanceMode::UntilBlocked) => continue,
                    _ => return Ok::<_, ServiceError>(result),
                }
            }
        }
        .await;

        self.active.remove(&run_id);
        let result = result?;
        tracing::debug!(run_id = %run_id, status = %session.status, "advance finished");
        Ok(result)
    }

    /// Cancel an in-flight `advance`. Returns whether one was running.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    // -- Operator input ------------------------------------------------------

    pub async fn choose_outcome(
        &self,
        run_id: Uuid,
        selector: &OutcomeSelector,
    ) -> Result<AdvanceResult, ServiceError> {
        self.apply(run_id, |engine, session| {
            engine.choose_outcome(session, selector)
        })
        .await
    }

    pub async fn submit_choice(
        &self,
        run_id: Uuid,
        variable: &str,
        value: &str,
    ) -> Result<AdvanceResult, ServiceError> {
        self.apply(run_id, |engine, session| {
            engine.submit_choice(session, variable, value)
        })
        .await
    }

    pub async fn submit_evidence(
        &self,
        run_id: Uuid,
        step_id: &str,
        evidence: BTreeMap<String, Value>,
    ) -> Result<AdvanceResult, ServiceError> {
        self.apply(run_id, |engine, session| {
            engine.submit_evidence(session, step_id, evidence)
        })
        .await
    }

    async fn apply<T>(
        &self,
        run_id: Uuid,
        request: impl FnOnce(&Engine, &mut RunSession) -> Result<T, EngineError> + Send,
    ) -> Result<T, ServiceError> {
        let lock = self.run_lock(run_id);
        let result = async {
            let _guard = lock.lock().await;
            let mut session = self.resume(run_id).await?;
            let value = request(&self.engine, &mut session)?;
            self.checkpoints.checkpoint(&session).await?;
            Ok::<_, ServiceError>(value)
        }
        .await;
        self.release_lock(run_id, lock);
        result
    }

    // -- Queries -------------------------------------------------------------

    /// Variables and captures of the active level, captures winning.
    pub async fn get_variables(
        &self,
        run_id: Uuid,
    ) -> Result<BTreeMap<String, Value>, ServiceError> {
        let session = self.resume(run_id).await?;
        Ok(session.level.context.merged())
    }

    pub async fn get_manifest(&self, run_id: Uuid) -> Result<Manifest, ServiceError> {
        let session = self.resume(run_id).await?;
        let level = &session.level;
        Ok(Manifest {
            run_id: session.run_id,
            root_workflow: session.root_workflow.clone(),
            workflow: level.workflow_label(),
            level_run_id: level.run_id,
            status: session.status,
            outline: level.runbook.outline(),
            pending: self.engine.prompt(&session),
            queue: level.queue.iter().map(serialize_node).collect(),
            stack: session
                .stack
                .iter()
                .map(|frame| StackEntry {
                    workflow: frame.parent.workflow_label(),
                    run_id: frame.parent.run_id,
                    invoking_step: frame.invoking_step.id.clone(),
                    depth: frame.depth,
                })
                .collect(),
            history: session.history.clone(),
            outcome: session.outcome.clone(),
            failure: session.failure.clone(),
        })
    }

    pub async fn list_runs(&self) -> Result<Vec<SessionSummary>, ServiceError> {
        Ok(self.checkpoints.list().await?)
    }

    pub async fn delete_run(&self, run_id: Uuid) -> Result<(), ServiceError> {
        self.checkpoints.delete(run_id).await?;
        self.locks.remove(&run_id);
        Ok(())
    }

    /// Write the run's recorded exchanges and inputs under `dir`.
    pub async fn save_scenario(&self, run_id: Uuid, dir: &Path) -> Result<PathBuf, ServiceError> {
        let session = self.resume(run_id).await?;
        let scenario = build_scenario(&session);
        let path = scenario_path(dir);
        let json = serialize_scenario(&scenario)?;
        self.fs
            .write_file(&path, &json)
            .await
            .map_err(ScenarioError::from)?;

        tracing::info!(
            run_id = %run_id,
            path = %path.display(),
            exchanges = scenario.exchanges.len(),
            inputs = scenario.inputs.len(),
            "saved scenario"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::session::InMemorySessionRepository;
    use crate::runbook::executor::StepExecutor;
    use crate::runbook::expression::JexlEvaluator;
    use crate::runbook::testing::{MapLoader, ScriptedExecutor};
    use runbook_types::config::RunbookConfig;
    use runbook_types::scenario::{RecordedExchange, RecordedInput};
    use serde_json::json;
    use std::time::Duration;

    /// In-memory filesystem for scenario writes.
    #[derive(Default)]
    struct MemoryFileSystem {
        files: DashMap<PathBuf, String>,
    }

    impl FileSystem for MemoryFileSystem {
        async fn write_file(&self, path: &Path, content: &str) -> Result<(), std::io::Error> {
            self.files.insert(path.to_path_buf(), content.to_string());
            Ok(())
        }

        async fn read_file(&self, path: &Path) -> Result<String, std::io::Error> {
            self.files
                .get(path)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }

        async fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
    }

    /// Hands out the same scripted executor for every run.
    struct FixedSource(Arc<ScriptedExecutor>);

    impl ExecutorSource for FixedSource {
        fn executor_for(
            &self,
            _mode: &RunMode,
            _consumed_exchanges: &[RecordedExchange],
            _consumed_inputs: &[RecordedInput],
        ) -> Result<Arc<dyn StepExecutor>, ExecutionError> {
            let executor: Arc<dyn StepExecutor> = self.0.clone();
            Ok(executor)
        }
    }

    const DEPLOY: &str = r#"
name: deploy
variables:
  env: staging
steps:
  - id: check
    type: command
    command: "status {{ env }}"
    capture:
      health: stdout
  - id: decide
    type: manual
    choice:
      variable: action
      options: [ship, hold]
  - id: ship
    type: command
    command: "ship {{ action }}"
"#;

    fn service_with(
        exec: ScriptedExecutor,
    ) -> (
        RunbookService<InMemorySessionRepository, MemoryFileSystem>,
        Arc<ScriptedExecutor>,
    ) {
        let engine = Engine::new(
            Arc::new(MapLoader::new().with("/rb/deploy.yaml", DEPLOY).with(
                "/rb/wait.yaml",
                "name: wait\nsteps:\n  - id: nap\n    type: wait\n    seconds: 30\n",
            )),
            Arc::new(JexlEvaluator::new()),
            EventBus::new(256),
            RunbookConfig::default(),
        );
        let exec = Arc::new(exec);
        let service = RunbookService::new(
            engine,
            InMemorySessionRepository::new(),
            Arc::new(FixedSource(exec.clone())),
            MemoryFileSystem::default(),
        );
        (service, exec)
    }

    #[tokio::test]
    async fn test_start_advance_choice_completes() {
        let (service, exec) = service_with(ScriptedExecutor::new().respond("status staging", "ok", 0));
        let summary = service
            .start(Path::new("/rb/deploy.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap();
        assert_eq!(summary.name, "deploy");
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.step_count, 3);

        let result = service
            .advance(summary.run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();
        let AdvanceResult::AwaitingUser(prompt) = result else {
            panic!("expected a prompt, got {result:?}");
        };
        assert_eq!(prompt.step_id, "decide");

        let stored = service.list_runs().await.unwrap();
        assert_eq!(stored[0].status, RunStatus::AwaitingUser);

        service
            .submit_choice(summary.run_id, "action", "ship")
            .await
            .unwrap();
        let result = service
            .advance(summary.run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();
        assert_eq!(result, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["status staging", "ship ship"]);

        let vars = service.get_variables(summary.run_id).await.unwrap();
        assert_eq!(vars["health"], json!("ok"));
        assert_eq!(vars["action"], json!("ship"));
    }

    #[tokio::test]
    async fn test_single_step_advance_checkpoints_each_step() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let run_id = service
            .start(Path::new("/rb/deploy.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap()
            .run_id;

        let result = service
            .advance(run_id, AdvanceMode::SingleStep)
            .await
            .unwrap();
        let AdvanceResult::StepResult(record) = result else {
            panic!("expected a step result, got {result:?}");
        };
        assert_eq!(record.step_id, "check");

        let manifest = service.get_manifest(run_id).await.unwrap();
        assert_eq!(manifest.history.len(), 1);
        assert_eq!(manifest.queue.len(), 2);
        assert_eq!(manifest.outline.len(), 3);
        assert!(manifest.stack.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_does_not_change_stored_run() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let run_id = service
            .start(Path::new("/rb/deploy.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap()
            .run_id;
        service
            .advance(run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();

        let err = service
            .submit_choice(run_id, "action", "yolo")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Engine(EngineError::InvalidInput(_))
        ));

        let manifest = service.get_manifest(run_id).await.unwrap();
        assert_eq!(manifest.status, RunStatus::AwaitingUser);
        assert_eq!(manifest.pending.unwrap().step_id, "decide");
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let err = service
            .advance(Uuid::now_v7(), AdvanceMode::UntilBlocked)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Checkpoint(CheckpointError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_scenario_and_replay_starts_run() {
        let (service, _) = service_with(ScriptedExecutor::new().respond("status staging", "ok", 0));
        let mut vars = BTreeMap::new();
        vars.insert("env".to_string(), json!("staging"));
        let run_id = service
            .start(Path::new("/rb/deploy.yaml"), vars, RunMode::Live)
            .await
            .unwrap()
            .run_id;
        service
            .advance(run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();

        let path = service
            .save_scenario(run_id, Path::new("/scenarios/deploy"))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/scenarios/deploy/scenario.json"));

        let saved = parse_scenario(&service.fs.read_file(&path).await.unwrap()).unwrap();
        assert_eq!(saved.exchanges.len(), 1);
        assert_eq!(saved.variables["env"], json!("staging"));

        let replayed = service.replay(Path::new("/scenarios/deploy")).await.unwrap();
        assert_ne!(replayed.run_id, run_id);
        assert_eq!(
            replayed.mode,
            RunMode::Replay {
                scenario: path.clone()
            }
        );
        assert_eq!(service.list_runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_advance() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let service = Arc::new(service);
        let run_id = service
            .start(Path::new("/rb/wait.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap()
            .run_id;
        assert!(!service.cancel(run_id));

        let svc = Arc::clone(&service);
        let handle =
            tokio::spawn(async move { svc.advance(run_id, AdvanceMode::UntilBlocked).await });

        let mut cancelled = false;
        for _ in 0..200 {
            if service.cancel(run_id) {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cancelled);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(
            result,
            AdvanceResult::Failed {
                error: "cancelled".to_string()
            }
        );
        let manifest = service.get_manifest(run_id).await.unwrap();
        assert_eq!(manifest.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_locks_released_after_requests() {
        let (service, _) = service_with(ScriptedExecutor::new().respond("status staging", "ok", 0));
        let run_id = service
            .start(Path::new("/rb/deploy.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap()
            .run_id;
        service
            .advance(run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();
        assert!(service.locks.is_empty());

        service.submit_choice(run_id, "action", "yolo").await.unwrap_err();
        assert!(service.locks.is_empty());

        service.submit_choice(run_id, "action", "ship").await.unwrap();
        let result = service
            .advance(run_id, AdvanceMode::UntilBlocked)
            .await
            .unwrap();
        assert_eq!(result, AdvanceResult::Completed);
        assert!(service.locks.is_empty());

        service
            .advance(Uuid::now_v7(), AdvanceMode::UntilBlocked)
            .await
            .unwrap_err();
        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_contended_lock_is_kept() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let run_id = Uuid::now_v7();
        let first = service.run_lock(run_id);
        let waiting = service.run_lock(run_id);
        assert!(Arc::ptr_eq(&first, &waiting));

        service.release_lock(run_id, first);
        assert_eq!(service.locks.len(), 1);
        service.release_lock(run_id, waiting);
        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_delete_run() {
        let (service, _) = service_with(ScriptedExecutor::new());
        let run_id = service
            .start(Path::new("/rb/deploy.yaml"), BTreeMap::new(), RunMode::Live)
            .await
            .unwrap()
            .run_id;
        service.delete_run(run_id).await.unwrap();
        assert!(service.list_runs().await.unwrap().is_empty());
    }
}
