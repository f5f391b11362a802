//! The auto-advance loop.
//!
//! `Engine::advance` pops continuation units off the active level and
//! dispatches them until the run needs the operator, reaches an outcome,
//! completes, or fails. Invoked runbooks swap their level in place of the
//! parent's and swap back on exit; iteration re-queues block steps ahead of
//! a watchpoint that decides whether another pass runs.
//!
//! Everything after an action returns is synchronous, so outcome and gate
//! propagation through nested invoke levels is plain recursion.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runbook_types::config::RunbookConfig;
use runbook_types::event::RunEvent;
use runbook_types::runbook::{
    ApprovalSpec, ChoiceSpec, EvidenceKind, EvidenceSpec, FailurePolicy, InvokeSpec,
    IterateBlock, Outcome, Step, StepKind,
};
use runbook_types::scenario::{RecordedExchange, RecordedInput};
use runbook_types::session::{
    ChildRun, InputKind, OutcomeRecord, RunMode, RunStatus, SessionState, StepRecord, StepStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capture::{StepData, extract_captures};
use super::continuation::{ContinuationError, PendingNode, split_list};
use super::definition::RunbookError;
use super::executor::{CommandRequest, ExecutionError, StepExecutor, ToolRequest};
use super::expression::{ConditionEvaluator, ExpressionError, value_to_string};
use super::invoke::{InvokeFrame, Level, apply_outputs};
use super::loader::{RunbookLoader, resolve_reference};
use super::routing::{OutcomeSelector, RouteDecision, first_outcome, required_inputs, route};
use super::session::{PendingInput, RunSession, SessionError};
use crate::event::EventBus;

/// Evidence key carrying an approval decision.
pub const APPROVED_KEY: &str = "approved";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned to the caller of an engine request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Load(#[from] RunbookError),

    #[error(transparent)]
    Continuation(#[from] ContinuationError),

    #[error("run has no pending input")]
    NoPendingInput,

    #[error("pending step is '{expected}', not '{got}'")]
    StepMismatch { expected: String, got: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run already finished ({0})")]
    RunFinished(RunStatus),
}

/// Conditions that end the whole run.
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("iterate block '{block}' did not converge after {passes} passes")]
    DidNotConverge { block: String, passes: u32 },

    #[error("invoke depth {depth} at step '{step_id}' exceeds the maximum of {max}")]
    DepthExceeded {
        step_id: String,
        depth: usize,
        max: u32,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Continuation(#[from] ContinuationError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Request and result types
// ---------------------------------------------------------------------------

/// How far one `advance` call goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceMode {
    /// Run until the operator is needed or the run ends.
    #[default]
    UntilBlocked,
    /// Stop after the next step finishes.
    SingleStep,
}

/// What the run is doing after a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvanceResult {
    AwaitingUser(PendingPrompt),
    Outcome(OutcomeRecord),
    Completed,
    StepResult(StepRecord),
    Failed { error: String },
}

/// What the pending step asks of the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPrompt {
    pub run_id: Uuid,
    pub step_id: String,
    pub title: String,
    /// Instructions rendered against the current variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub awaiting: Vec<InputKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<ChoiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<OutcomeOption>,
    /// Evidence already submitted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub received: BTreeMap<String, Value>,
    pub workflow: String,
    pub depth: u32,
    pub invoke_depth: usize,
}

/// One outcome the operator can pick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeOption {
    pub index: usize,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recommendation: String,
}

enum Flow {
    Continue,
    Executed(StepRecord),
}

/// How a level ended.
enum LevelEnd {
    Completed,
    Outcome(OutcomeRecord),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives runs. Holds no per-run state: every call takes the session.
pub struct Engine {
    loader: Arc<dyn RunbookLoader>,
    evaluator: Arc<dyn ConditionEvaluator>,
    bus: EventBus,
    config: RunbookConfig,
}

impl Engine {
    pub fn new(
        loader: Arc<dyn RunbookLoader>,
        evaluator: Arc<dyn ConditionEvaluator>,
        bus: EventBus,
        config: RunbookConfig,
    ) -> Self {
        Self {
            loader,
            evaluator,
            bus,
            config,
        }
    }

    pub fn loader(&self) -> &Arc<dyn RunbookLoader> {
        &self.loader
    }

    pub fn evaluator(&self) -> &Arc<dyn ConditionEvaluator> {
        &self.evaluator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &RunbookConfig {
        &self.config
    }

    /// Load `path` and open a session on it.
    pub fn start_session(
        &self,
        path: &Path,
        variables: BTreeMap<String, Value>,
        mode: RunMode,
    ) -> Result<RunSession, EngineError> {
        let runbook = self.loader.load(path)?;
        let session = RunSession::new(runbook, variables, mode)?;
        tracing::info!(
            run_id = %session.run_id,
            workflow = %path.display(),
            "run started"
        );
        Ok(session)
    }

    pub fn restore(&self, state: SessionState) -> Result<RunSession, EngineError> {
        Ok(RunSession::restore(state, self.loader.as_ref())?)
    }

    // -- Advance -------------------------------------------------------------

    /// Run the session forward.
    ///
    /// Terminal runs return their result again; a run awaiting input
    /// returns its prompt without doing anything.
    pub async fn advance(
        &self,
        session: &mut RunSession,
        executor: &dyn StepExecutor,
        mode: AdvanceMode,
        cancel: &CancellationToken,
    ) -> Result<AdvanceResult, EngineError> {
        loop {
            if let Some(result) = self.current_result(session) {
                return Ok(result);
            }
            if cancel.is_cancelled() {
                self.abort(session, RunFailure::Cancelled);
                continue;
            }
            session.status = RunStatus::Running;

            let Some(unit) = session.level.queue.pop_front() else {
                if let Err(failure) = self.finish_level(session, LevelEnd::Completed) {
                    self.abort(session, failure);
                }
                session.touch();
                continue;
            };

            let flow = match self.dispatch(session, executor, unit, cancel).await {
                Ok(flow) => flow,
                Err(failure) => {
                    self.abort(session, failure);
                    Flow::Continue
                }
            };
            session.touch();

            if let (Flow::Executed(record), AdvanceMode::SingleStep) = (flow, mode) {
                return Ok(self.result_after_step(session, record));
            }
        }
    }

    /// Terminal result, or the prompt of a waiting run; `None` while running.
    pub fn current_result(&self, session: &RunSession) -> Option<AdvanceResult> {
        match session.status {
            RunStatus::Completed => Some(AdvanceResult::Completed),
            RunStatus::OutcomeReached => Some(match &session.outcome {
                Some(outcome) => AdvanceResult::Outcome(outcome.clone()),
                None => AdvanceResult::Completed,
            }),
            RunStatus::Failed => Some(AdvanceResult::Failed {
                error: session.failure.clone().unwrap_or_default(),
            }),
            RunStatus::Running | RunStatus::AwaitingUser => {
                self.prompt(session).map(AdvanceResult::AwaitingUser)
            }
        }
    }

    /// Prompt for the pending step, if any.
    pub fn prompt(&self, session: &RunSession) -> Option<PendingPrompt> {
        let pending = session.pending.as_ref()?;
        let step = &pending.step;
        let env = session.level.env();
        let instructions = step.instructions.as_ref().map(|text| {
            self.evaluator.render(text, &env).unwrap_or_else(|e| {
                tracing::warn!(step_id = %step.id, error = %e, "failed to render instructions");
                text.clone()
            })
        });
        Some(PendingPrompt {
            run_id: session.run_id,
            step_id: step.id.clone(),
            title: step.display_title().to_string(),
            instructions,
            awaiting: pending.awaiting.clone(),
            evidence: step.evidence.clone(),
            choice: step.choice.clone(),
            approval: step.approval.clone(),
            outcomes: step
                .outcomes
                .iter()
                .enumerate()
                .map(|(index, o)| OutcomeOption {
                    index,
                    state: o.state.clone(),
                    when: o.when.clone(),
                    recommendation: o.recommendation.clone(),
                })
                .collect(),
            received: pending.evidence.clone(),
            workflow: session.level.workflow_label(),
            depth: pending.depth,
            invoke_depth: session.invoke_depth(),
        })
    }

    fn result_after_step(&self, session: &RunSession, record: StepRecord) -> AdvanceResult {
        self.current_result(session)
            .unwrap_or(AdvanceResult::StepResult(record))
    }

    // -- Operator input ------------------------------------------------------

    /// Resolve pending evidence, approval, or acknowledgment.
    pub fn submit_evidence(
        &self,
        session: &mut RunSession,
        step_id: &str,
        evidence: BTreeMap<String, Value>,
    ) -> Result<AdvanceResult, EngineError> {
        let pending = pending_for(session, Some(step_id))?;
        let step = Arc::clone(&pending.step);
        let mut accepted = false;

        if pending.awaits(InputKind::Evidence) {
            validate_evidence(&step, &pending.evidence, &evidence)?;
            pending.evidence.extend(evidence.clone());
            pending.fulfil(InputKind::Evidence);
            accepted = true;
        }

        if pending.awaits(InputKind::Approval) {
            match evidence.get(APPROVED_KEY) {
                Some(Value::Bool(approved)) => {
                    pending
                        .evidence
                        .insert(APPROVED_KEY.to_string(), json!(approved));
                    pending.fulfil(InputKind::Approval);
                    accepted = true;
                }
                Some(other) => {
                    return Err(EngineError::InvalidInput(format!(
                        "'{APPROVED_KEY}' must be true or false, got {other}"
                    )));
                }
                None if !accepted => {
                    return Err(EngineError::InvalidInput(format!(
                        "step '{}' needs an '{APPROVED_KEY}' decision",
                        step.id
                    )));
                }
                None => {}
            }
        }

        if pending.awaits(InputKind::Acknowledge) {
            pending.evidence.extend(evidence);
            pending.fulfil(InputKind::Acknowledge);
            accepted = true;
        }

        if !accepted {
            return Err(EngineError::InvalidInput(format!(
                "step '{}' is waiting for {}",
                step.id,
                describe(&pending.awaiting)
            )));
        }
        Ok(self.finish_input(session, None))
    }

    /// Resolve a pending choice.
    pub fn submit_choice(
        &self,
        session: &mut RunSession,
        variable: &str,
        value: &str,
    ) -> Result<AdvanceResult, EngineError> {
        let pending = pending_for(session, None)?;
        let step = Arc::clone(&pending.step);
        let spec = match (&step.choice, pending.awaits(InputKind::Choice)) {
            (Some(spec), true) => spec,
            _ => {
                return Err(EngineError::InvalidInput(format!(
                    "step '{}' is not waiting for a choice",
                    step.id
                )));
            }
        };
        if spec.variable != variable {
            return Err(EngineError::InvalidInput(format!(
                "step '{}' sets '{}', not '{variable}'",
                step.id, spec.variable
            )));
        }
        if !spec.options.is_empty() && !spec.options.iter().any(|o| o == value) {
            return Err(EngineError::InvalidInput(format!(
                "'{value}' is not one of: {}",
                spec.options.join(", ")
            )));
        }
        pending.choice = Some(value.to_string());
        pending.fulfil(InputKind::Choice);
        Ok(self.finish_input(session, None))
    }

    /// Resolve the pending step by firing one of its outcomes.
    pub fn choose_outcome(
        &self,
        session: &mut RunSession,
        selector: &OutcomeSelector,
    ) -> Result<AdvanceResult, EngineError> {
        let pending = pending_for(session, None)?;
        let outstanding: Vec<InputKind> = pending
            .awaiting
            .iter()
            .copied()
            .filter(|k| !matches!(k, InputKind::Outcome | InputKind::Acknowledge))
            .collect();
        if !outstanding.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "step '{}' still needs {}",
                pending.step.id,
                describe(&outstanding)
            )));
        }
        let outcome = selector.select(&pending.step).cloned().ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "step '{}' has no outcome {selector:?}",
                pending.step.id
            ))
        })?;
        pending.awaiting.clear();
        Ok(self.finish_input(session, Some(outcome)))
    }

    fn finish_input(&self, session: &mut RunSession, chosen: Option<Outcome>) -> AdvanceResult {
        let ready = session
            .pending
            .as_ref()
            .is_some_and(|p| p.awaiting.is_empty());
        if !ready {
            return self
                .current_result(session)
                .unwrap_or(AdvanceResult::Completed);
        }
        let Some(pending) = session.pending.take() else {
            return AdvanceResult::Completed;
        };
        let result = match self.complete_pending(session, pending, chosen) {
            Ok(record) => self.result_after_step(session, record),
            Err(failure) => {
                self.abort(session, failure);
                self.current_result(session)
                    .unwrap_or(AdvanceResult::Completed)
            }
        };
        session.touch();
        result
    }

    /// Complete a manual step whose inputs are all in.
    fn complete_pending(
        &self,
        session: &mut RunSession,
        pending: PendingInput,
        chosen: Option<Outcome>,
    ) -> Result<StepRecord, RunFailure> {
        session.status = RunStatus::Running;
        let step = pending.step;
        let depth = pending.depth;
        let approved = pending
            .evidence
            .get(APPROVED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let (Some(spec), Some(choice)) = (&step.choice, &pending.choice) {
            session
                .level
                .context
                .set_variable(spec.variable.clone(), json!(choice));
        }
        let data = StepData {
            evidence: pending.evidence.clone(),
            choice: pending.choice.clone(),
            ..StepData::default()
        };
        let captures = extract_captures(&step.capture, &data);
        for (name, value) in &captures {
            session.level.context.set_capture(name.clone(), value.clone());
        }
        session.inputs.push(RecordedInput {
            step_id: step.id.clone(),
            evidence: pending.evidence,
            choice: pending.choice,
            outcome: chosen.as_ref().map(|o| o.state.clone()),
        });

        let mut record = self.record(session, &step.id, depth, StepStatus::Completed);
        record.captures = captures;

        if step.approval.is_some() && !approved {
            record.status = StepStatus::Failed;
            record.error = Some("approval rejected".to_string());
            return self.after_failure(session, &step, depth, record);
        }
        if let Some(outcome) = chosen {
            self.push_completed(session, &record);
            self.fire_outcome(session, &step, &outcome)?;
            return Ok(record);
        }
        self.after_success(session, &step, depth, record)
    }

    // -- Dispatch ------------------------------------------------------------

    async fn dispatch(
        &self,
        session: &mut RunSession,
        executor: &dyn StepExecutor,
        unit: PendingNode,
        cancel: &CancellationToken,
    ) -> Result<Flow, RunFailure> {
        match unit {
            PendingNode::Step { step, depth } => {
                self.dispatch_step(session, executor, step, depth, cancel)
                    .await
            }
            PendingNode::Iterate { block, key, depth } => {
                self.expand_block(session, block, key, depth)?;
                Ok(Flow::Continue)
            }
            PendingNode::Converge {
                block,
                key,
                depth,
                pass,
                max,
            } => {
                self.check_convergence(session, block, key, depth, pass, max)?;
                Ok(Flow::Continue)
            }
            PendingNode::List {
                block,
                key,
                depth,
                items,
                index,
                variable,
            } => {
                self.next_item(session, block, key, depth, items, index, variable)?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch_step(
        &self,
        session: &mut RunSession,
        executor: &dyn StepExecutor,
        step: Arc<Step>,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<Flow, RunFailure> {
        if let Some(precondition) = &step.precondition {
            let env = session.level.env();
            if !self.evaluator.evaluate_bool(precondition, &env)? {
                let mut record = self.record(session, &step.id, depth, StepStatus::Skipped);
                record.reason = Some(format!("precondition not met: {precondition}"));
                self.push_skipped(session, &record);
                return Ok(Flow::Executed(record));
            }
        }

        session.level.step_counter += 1;
        tracing::info!(
            run_id = %session.run_id,
            step_id = %step.id,
            kind = step.kind.as_str(),
            depth,
            "step started"
        );
        self.bus.publish(RunEvent::StepStarted {
            run_id: session.run_id,
            level_run_id: session.level.run_id,
            step_id: step.id.clone(),
            title: step.display_title().to_string(),
            depth,
        });

        match &step.kind {
            StepKind::Invoke(spec) => self.enter_invoke(session, &step, spec, depth),
            StepKind::Manual => self.dispatch_manual(session, executor, &step, depth),
            StepKind::Command { .. } | StepKind::Tool { .. } | StepKind::Wait { .. } => {
                self.execute(session, executor, &step, depth, cancel).await
            }
        }
    }

    fn dispatch_manual(
        &self,
        session: &mut RunSession,
        executor: &dyn StepExecutor,
        step: &Arc<Step>,
        depth: u32,
    ) -> Result<Flow, RunFailure> {
        let awaiting = required_inputs(step);
        if awaiting.is_empty() {
            let record = self.record(session, &step.id, depth, StepStatus::Completed);
            return self
                .after_success(session, step, depth, record)
                .map(Flow::Executed);
        }

        if let Some(input) = executor.recorded_input(&step.id) {
            tracing::debug!(run_id = %session.run_id, step_id = %step.id, "using recorded input");
            let chosen = input
                .outcome
                .as_deref()
                .and_then(|state| step.outcomes.iter().find(|o| o.state == state).cloned());
            let mut pending = PendingInput::new(Arc::clone(step), depth, Vec::new());
            pending.evidence = input.evidence;
            pending.choice = input.choice;
            return self
                .complete_pending(session, pending, chosen)
                .map(Flow::Executed);
        }

        session.set_pending(PendingInput::new(Arc::clone(step), depth, awaiting.clone()))?;
        session.status = RunStatus::AwaitingUser;
        tracing::info!(
            run_id = %session.run_id,
            step_id = %step.id,
            awaiting = %describe(&awaiting),
            "awaiting operator input"
        );
        self.bus.publish(RunEvent::InputRequired {
            run_id: session.run_id,
            step_id: step.id.clone(),
            awaiting,
        });
        Ok(Flow::Continue)
    }

    // -- Actions -------------------------------------------------------------

    async fn execute(
        &self,
        session: &mut RunSession,
        executor: &dyn StepExecutor,
        step: &Arc<Step>,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<Flow, RunFailure> {
        let env = session.level.env();
        let timeout = Duration::from_secs(step.timeout_secs.unwrap_or(self.config.step_timeout_secs));
        let mut record = self.record(session, &step.id, depth, StepStatus::Completed);
        let mut data = StepData::default();
        let mut error = None;

        match &step.kind {
            StepKind::Command { command } => {
                let request = CommandRequest {
                    step_id: step.id.clone(),
                    command: self.evaluator.render(command, &env)?,
                    working_dir: working_dir(session.level.runbook.path()),
                };
                match guarded(cancel, timeout, executor.run_command(&request)).await {
                    Ok(output) => {
                        session.exchanges.push(RecordedExchange {
                            key: request.key(),
                            step_id: step.id.clone(),
                            request: json!(request.command),
                            stdout: output.stdout.clone(),
                            stderr: output.stderr.clone(),
                            exit_code: output.exit_code,
                            output: None,
                            success: output.success(),
                            recorded_at: Utc::now(),
                        });
                        if !output.success() {
                            error = Some(match output.exit_code {
                                Some(code) => format!("command exited with status {code}"),
                                None => "command terminated by signal".to_string(),
                            });
                        }
                        record.exit_code = output.exit_code;
                        record.output = Some(output.stdout.trim().to_string());
                        data.stdout = Some(output.stdout);
                        data.stderr = Some(output.stderr);
                        data.exit_code = output.exit_code;
                    }
                    Err(ExecutionError::Cancelled) => return Err(RunFailure::Cancelled),
                    Err(e) => error = Some(e.to_string()),
                }
            }
            StepKind::Tool { tool, args } => {
                let request = ToolRequest {
                    step_id: step.id.clone(),
                    tool: tool.clone(),
                    args: self.render_args(args, &env)?,
                };
                match guarded(cancel, timeout, executor.run_tool(&request)).await {
                    Ok(output) => {
                        session.exchanges.push(RecordedExchange {
                            key: request.key(),
                            step_id: step.id.clone(),
                            request: request.args.clone(),
                            stdout: String::new(),
                            stderr: String::new(),
                            exit_code: None,
                            output: Some(output.output.clone()),
                            success: output.success,
                            recorded_at: Utc::now(),
                        });
                        if !output.success {
                            error = Some(format!("tool '{tool}' reported failure"));
                        }
                        record.output = Some(value_to_string(&output.output));
                        data.output = Some(output.output);
                    }
                    Err(ExecutionError::Cancelled) => return Err(RunFailure::Cancelled),
                    Err(e) => error = Some(e.to_string()),
                }
            }
            StepKind::Wait { seconds } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RunFailure::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(*seconds)) => {}
                }
            }
            StepKind::Manual | StepKind::Invoke(_) => {}
        }

        record.captures = extract_captures(&step.capture, &data);
        for (name, value) in &record.captures {
            session.level.context.set_capture(name.clone(), value.clone());
        }

        let record = match error {
            None => self.after_success(session, step, depth, record)?,
            Some(message) => {
                record.status = StepStatus::Failed;
                record.error = Some(message);
                self.after_failure(session, step, depth, record)?
            }
        };
        Ok(Flow::Executed(record))
    }

    fn render_args(&self, args: &Value, env: &Value) -> Result<Value, ExpressionError> {
        match args {
            Value::String(template) => self.evaluator.render_value(template, env),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_args(item, env))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::new();
                for (key, value) in map {
                    rendered.insert(key.clone(), self.render_args(value, env)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    // -- Routing -------------------------------------------------------------

    fn after_success(
        &self,
        session: &mut RunSession,
        step: &Arc<Step>,
        depth: u32,
        record: StepRecord,
    ) -> Result<StepRecord, RunFailure> {
        self.push_completed(session, &record);
        self.route_after(session, step, depth)?;
        Ok(record)
    }

    fn after_failure(
        &self,
        session: &mut RunSession,
        step: &Arc<Step>,
        depth: u32,
        mut record: StepRecord,
    ) -> Result<StepRecord, RunFailure> {
        let error = record
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());

        // A failed step that still produced captures gets its outcomes checked.
        if !record.captures.is_empty() {
            let env = session.level.env();
            if let Some(outcome) = first_outcome(step, self.evaluator.as_ref(), &env)?.cloned() {
                tracing::warn!(
                    run_id = %session.run_id,
                    step_id = %step.id,
                    state = %outcome.state,
                    "outcome fired on a failed step"
                );
                self.push_failed(session, &record);
                self.fire_outcome(session, step, &outcome)?;
                return Ok(record);
            }
        }

        match step.on_failure {
            FailurePolicy::Halt => {
                self.push_failed(session, &record);
                self.skip_remaining(session, &format!("step '{}' failed", step.id));
                self.finish_level(
                    session,
                    LevelEnd::Failed(format!("step '{}' failed: {error}", step.id)),
                )?;
            }
            FailurePolicy::Skip => {
                record.status = StepStatus::Skipped;
                record.reason = Some(format!("failed: {error}"));
                self.push_skipped(session, &record);
            }
            FailurePolicy::Continue => {
                self.push_failed(session, &record);
                self.route_after(session, step, depth)?;
            }
        }
        Ok(record)
    }

    fn route_after(
        &self,
        session: &mut RunSession,
        step: &Arc<Step>,
        depth: u32,
    ) -> Result<(), RunFailure> {
        let env = session.level.env();
        match route(step, self.evaluator.as_ref(), &env)? {
            RouteDecision::Outcome(outcome) => {
                let outcome = outcome.clone();
                self.fire_outcome(session, step, &outcome)?;
            }
            RouteDecision::Branch(branch) => {
                tracing::debug!(
                    run_id = %session.run_id,
                    step_id = %step.id,
                    label = ?branch.label,
                    "branch selected"
                );
                self.bus.publish(RunEvent::BranchSelected {
                    run_id: session.run_id,
                    step_id: step.id.clone(),
                    label: branch.label.clone(),
                });
                let runbook = Arc::clone(&session.level.runbook);
                session
                    .level
                    .queue
                    .expand_front(&runbook, &branch.steps, depth + 1, None)?;
            }
            RouteDecision::Continue => {}
        }
        Ok(())
    }

    fn fire_outcome(
        &self,
        session: &mut RunSession,
        step: &Step,
        outcome: &Outcome,
    ) -> Result<(), RunFailure> {
        let env = session.level.env();
        let recommendation = self.evaluator.render(&outcome.recommendation, &env)?;
        tracing::info!(
            run_id = %session.run_id,
            step_id = %step.id,
            state = %outcome.state,
            "outcome reached"
        );
        self.skip_remaining(session, &format!("outcome '{}' reached", outcome.state));
        self.bus.publish(RunEvent::OutcomeReached {
            run_id: session.run_id,
            level_run_id: session.level.run_id,
            state: outcome.state.clone(),
            recommendation: recommendation.clone(),
        });
        let record = OutcomeRecord {
            state: outcome.state.clone(),
            recommendation,
            step_id: step.id.clone(),
            workflow: session.level.workflow_label(),
            next: outcome.next.clone(),
        };
        self.finish_level(session, LevelEnd::Outcome(record))
    }

    /// Drain the active queue, reporting each step and block as skipped.
    fn skip_remaining(&self, session: &mut RunSession, reason: &str) {
        for unit in session.level.queue.drain() {
            if unit.is_watchpoint() {
                continue;
            }
            let mut record =
                self.record(session, unit.label(), unit.depth(), StepStatus::Skipped);
            record.reason = Some(reason.to_string());
            self.push_skipped(session, &record);
        }
    }

    // -- Levels --------------------------------------------------------------

    fn finish_level(&self, session: &mut RunSession, end: LevelEnd) -> Result<(), RunFailure> {
        if let Some(frame) = session.stack.pop() {
            return self.exit_invoke(session, frame, end);
        }

        match end {
            LevelEnd::Completed => {
                session.status = RunStatus::Completed;
                tracing::info!(run_id = %session.run_id, "run completed");
                self.bus.publish(RunEvent::RunCompleted {
                    run_id: session.run_id,
                });
            }
            LevelEnd::Outcome(record) => {
                session.status = RunStatus::OutcomeReached;
                session.outcome = Some(record);
            }
            LevelEnd::Failed(message) => {
                tracing::warn!(run_id = %session.run_id, error = %message, "run failed");
                session.status = RunStatus::Failed;
                self.bus.publish(RunEvent::RunFailed {
                    run_id: session.run_id,
                    error: message.clone(),
                });
                session.failure = Some(message);
            }
        }
        Ok(())
    }

    fn enter_invoke(
        &self,
        session: &mut RunSession,
        step: &Arc<Step>,
        spec: &InvokeSpec,
        depth: u32,
    ) -> Result<Flow, RunFailure> {
        let next_depth = session.stack.len() + 1;
        if next_depth > self.config.max_invoke_depth as usize {
            let failure = RunFailure::DepthExceeded {
                step_id: step.id.clone(),
                depth: next_depth,
                max: self.config.max_invoke_depth,
            };
            let mut record = self.record(session, &step.id, depth, StepStatus::Failed);
            record.error = Some(failure.to_string());
            self.push_failed(session, &record);
            return Err(failure);
        }

        let path = resolve_reference(&session.level.runbook, &spec.workflow);
        let runbook = match self.loader.load(&path) {
            Ok(runbook) => runbook,
            Err(e) => {
                let mut record = self.record(session, &step.id, depth, StepStatus::Failed);
                record.error = Some(format!("failed to load '{}': {e}", path.display()));
                return self
                    .after_failure(session, step, depth, record)
                    .map(Flow::Executed);
            }
        };

        let env = session.level.env();
        let mut input = BTreeMap::new();
        for (name, template) in &spec.input {
            input.insert(name.clone(), self.evaluator.render_value(template, &env)?);
        }

        let child = Level::start(runbook, input)?;
        tracing::info!(
            run_id = %session.run_id,
            child_run_id = %child.run_id,
            workflow = %path.display(),
            depth = next_depth,
            "invoke started"
        );
        self.bus.publish(RunEvent::InvokeStarted {
            run_id: session.run_id,
            child_run_id: child.run_id,
            workflow: spec.workflow.clone(),
            depth: next_depth as u32,
        });
        let parent = std::mem::replace(&mut session.level, child);
        session
            .stack
            .push(InvokeFrame::new(parent, Arc::clone(step), depth));
        Ok(Flow::Continue)
    }

    fn exit_invoke(
        &self,
        session: &mut RunSession,
        frame: InvokeFrame,
        end: LevelEnd,
    ) -> Result<(), RunFailure> {
        let (state, recommendation) = match &end {
            LevelEnd::Completed => ("completed".to_string(), None),
            LevelEnd::Outcome(record) => (record.state.clone(), Some(record.recommendation.clone())),
            LevelEnd::Failed(_) => ("failed".to_string(), None),
        };
        let halts = frame.gate_matches(&state);
        let InvokeFrame {
            parent,
            invoking_step: step,
            depth,
            outputs,
            ..
        } = frame;
        let child = std::mem::replace(&mut session.level, parent);

        session.level.child_runs.push(ChildRun {
            run_id: child.run_id,
            workflow: invoke_reference(&step, &child),
            invoked_by: step.id.clone(),
            state: state.clone(),
            recommendation,
        });
        tracing::info!(
            run_id = %session.run_id,
            child_run_id = %child.run_id,
            state = %state,
            "invoke completed"
        );
        self.bus.publish(RunEvent::InvokeCompleted {
            run_id: session.run_id,
            child_run_id: child.run_id,
            state: state.clone(),
        });

        if let LevelEnd::Failed(message) = &end {
            let mut record = self.record(session, &step.id, depth, StepStatus::Failed);
            record.error = Some(format!(
                "invoked runbook '{}' failed: {message}",
                invoke_reference(&step, &child)
            ));
            self.after_failure(session, &step, depth, record)?;
            return Ok(());
        }

        let mut record = self.record(session, &step.id, depth, StepStatus::Completed);
        record.captures = apply_outputs(&outputs, &child.context, &state, &mut session.level.context);

        if halts {
            self.push_completed(session, &record);
            let outcome = match end {
                LevelEnd::Outcome(outcome) => outcome,
                _ => OutcomeRecord {
                    state: state.clone(),
                    recommendation: String::new(),
                    step_id: step.id.clone(),
                    workflow: session.level.workflow_label(),
                    next: None,
                },
            };
            tracing::info!(
                run_id = %session.run_id,
                step_id = %step.id,
                state = %state,
                "invoke gate halted parent"
            );
            self.skip_remaining(session, &format!("gate '{state}' matched"));
            self.bus.publish(RunEvent::OutcomeReached {
                run_id: session.run_id,
                level_run_id: session.level.run_id,
                state: outcome.state.clone(),
                recommendation: outcome.recommendation.clone(),
            });
            return self.finish_level(session, LevelEnd::Outcome(outcome));
        }

        self.after_success(session, &step, depth, record)?;
        Ok(())
    }

    /// End the run, unwinding any invoke levels.
    fn abort(&self, session: &mut RunSession, failure: RunFailure) {
        let error = failure.to_string();
        tracing::error!(run_id = %session.run_id, error = %error, "run aborted");

        while let Some(frame) = session.stack.pop() {
            let child = std::mem::replace(&mut session.level, frame.parent);
            session.level.child_runs.push(ChildRun {
                run_id: child.run_id,
                workflow: invoke_reference(&frame.invoking_step, &child),
                invoked_by: frame.invoking_step.id.clone(),
                state: "failed".to_string(),
                recommendation: None,
            });
        }
        session.level.queue.drain();
        session.pending = None;
        session.status = RunStatus::Failed;
        session.failure = Some(error.clone());
        self.bus.publish(RunEvent::RunFailed {
            run_id: session.run_id,
            error,
        });
    }

    // -- Iteration -----------------------------------------------------------

    fn expand_block(
        &self,
        session: &mut RunSession,
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
    ) -> Result<(), RunFailure> {
        let runbook = Arc::clone(&session.level.runbook);

        if let Some(over) = &block.over {
            let env = session.level.env();
            let value = self.evaluator.render_value(over, &env)?;
            let items = split_list(&value, block.separator.as_deref());
            tracing::debug!(
                run_id = %session.run_id,
                block = %key,
                items = items.len(),
                "list iteration started"
            );
            self.bus.publish(RunEvent::IterationStarted {
                run_id: session.run_id,
                block: key.clone(),
                total: Some(items.len()),
            });
            let Some(first) = items.first() else {
                self.bus.publish(RunEvent::IterationConverged {
                    run_id: session.run_id,
                    block: key,
                    passes: 0,
                });
                return Ok(());
            };

            session
                .level
                .context
                .set_variable(block.variable.clone(), json!(first));
            session.level.context.set_iteration(0);
            self.publish_pass(session, &key, 0);
            let trailer = PendingNode::List {
                block: Arc::clone(&block),
                key,
                depth,
                variable: block.variable.clone(),
                items,
                index: 0,
            };
            session
                .level
                .queue
                .expand_front(&runbook, &block.steps, depth + 1, Some(trailer))?;
            return Ok(());
        }

        let max = block.max.unwrap_or(self.config.default_max_passes).max(1);
        tracing::debug!(
            run_id = %session.run_id,
            block = %key,
            max,
            "convergence iteration started"
        );
        self.bus.publish(RunEvent::IterationStarted {
            run_id: session.run_id,
            block: key.clone(),
            total: None,
        });
        session.level.context.set_iteration(0);
        self.publish_pass(session, &key, 0);
        let trailer = PendingNode::Converge {
            block: Arc::clone(&block),
            key,
            depth,
            pass: 0,
            max,
        };
        session
            .level
            .queue
            .expand_front(&runbook, &block.steps, depth + 1, Some(trailer))?;
        Ok(())
    }

    fn check_convergence(
        &self,
        session: &mut RunSession,
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
        pass: u32,
        max: u32,
    ) -> Result<(), RunFailure> {
        let converged = match &block.until {
            Some(until) => {
                let env = session.level.env();
                self.evaluator.evaluate_bool(until, &env)?
            }
            None => true,
        };
        if converged {
            tracing::debug!(run_id = %session.run_id, block = %key, passes = pass + 1, "converged");
            self.bus.publish(RunEvent::IterationConverged {
                run_id: session.run_id,
                block: key,
                passes: pass + 1,
            });
            return Ok(());
        }

        let next = pass + 1;
        if next >= max {
            self.bus.publish(RunEvent::IterationFailed {
                run_id: session.run_id,
                block: key.clone(),
                passes: next,
            });
            return Err(RunFailure::DidNotConverge {
                block: key,
                passes: next,
            });
        }

        session.level.context.set_iteration(next);
        self.publish_pass(session, &key, next);
        let runbook = Arc::clone(&session.level.runbook);
        let trailer = PendingNode::Converge {
            block: Arc::clone(&block),
            key,
            depth,
            pass: next,
            max,
        };
        session
            .level
            .queue
            .expand_front(&runbook, &block.steps, depth + 1, Some(trailer))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn next_item(
        &self,
        session: &mut RunSession,
        block: Arc<IterateBlock>,
        key: String,
        depth: u32,
        items: Vec<String>,
        index: usize,
        variable: String,
    ) -> Result<(), RunFailure> {
        let next = index + 1;
        let Some(item) = items.get(next) else {
            self.bus.publish(RunEvent::IterationConverged {
                run_id: session.run_id,
                block: key,
                passes: items.len() as u32,
            });
            return Ok(());
        };

        session
            .level
            .context
            .set_variable(variable.clone(), json!(item));
        session.level.context.set_iteration(next as u32);
        self.publish_pass(session, &key, next as u32);
        let runbook = Arc::clone(&session.level.runbook);
        let trailer = PendingNode::List {
            block: Arc::clone(&block),
            key,
            depth,
            items,
            index: next,
            variable,
        };
        session
            .level
            .queue
            .expand_front(&runbook, &block.steps, depth + 1, Some(trailer))?;
        Ok(())
    }

    fn publish_pass(&self, session: &RunSession, key: &str, iteration: u32) {
        self.bus.publish(RunEvent::IterationPass {
            run_id: session.run_id,
            block: key.to_string(),
            iteration,
        });
    }

    // -- History -------------------------------------------------------------

    fn record(&self, session: &RunSession, id: &str, depth: u32, status: StepStatus) -> StepRecord {
        StepRecord {
            step_id: id.to_string(),
            workflow: session.level.workflow_label(),
            level_run_id: session.level.run_id,
            status,
            depth,
            exit_code: None,
            output: None,
            captures: BTreeMap::new(),
            error: None,
            reason: None,
            finished_at: Utc::now(),
        }
    }

    fn push_completed(&self, session: &mut RunSession, record: &StepRecord) {
        tracing::debug!(run_id = %session.run_id, step_id = %record.step_id, "step completed");
        self.bus.publish(RunEvent::StepCompleted {
            run_id: session.run_id,
            level_run_id: record.level_run_id,
            step_id: record.step_id.clone(),
        });
        session.history.push(record.clone());
    }

    fn push_failed(&self, session: &mut RunSession, record: &StepRecord) {
        let error = record.error.clone().unwrap_or_default();
        tracing::warn!(
            run_id = %session.run_id,
            step_id = %record.step_id,
            error = %error,
            "step failed"
        );
        self.bus.publish(RunEvent::StepFailed {
            run_id: session.run_id,
            level_run_id: record.level_run_id,
            step_id: record.step_id.clone(),
            error,
        });
        session.history.push(record.clone());
    }

    fn push_skipped(&self, session: &mut RunSession, record: &StepRecord) {
        let reason = record.reason.clone().unwrap_or_default();
        tracing::debug!(
            run_id = %session.run_id,
            step_id = %record.step_id,
            reason = %reason,
            "step skipped"
        );
        self.bus.publish(RunEvent::StepSkipped {
            run_id: session.run_id,
            level_run_id: record.level_run_id,
            step_id: record.step_id.clone(),
            reason,
        });
        session.history.push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Race an action against cancellation and a timeout.
async fn guarded<T>(
    cancel: &CancellationToken,
    timeout: Duration,
    action: impl Future<Output = Result<T, ExecutionError>>,
) -> Result<T, ExecutionError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        result = tokio::time::timeout(timeout, action) => match result {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        },
    }
}

fn working_dir(runbook_path: &Path) -> Option<PathBuf> {
    runbook_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn invoke_reference(step: &Step, child: &Level) -> String {
    match &step.kind {
        StepKind::Invoke(spec) => spec.workflow.clone(),
        _ => child.workflow_label(),
    }
}

fn describe(kinds: &[InputKind]) -> String {
    kinds
        .iter()
        .map(InputKind::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The pending slot of an open run, optionally checked against `step_id`.
fn pending_for<'a>(
    session: &'a mut RunSession,
    step_id: Option<&str>,
) -> Result<&'a mut PendingInput, EngineError> {
    if session.status.is_terminal() {
        return Err(EngineError::RunFinished(session.status));
    }
    let pending = session.pending.as_mut().ok_or(EngineError::NoPendingInput)?;
    if let Some(step_id) = step_id {
        if pending.step.id != step_id {
            return Err(EngineError::StepMismatch {
                expected: pending.step.id.clone(),
                got: step_id.to_string(),
            });
        }
    }
    Ok(pending)
}

fn validate_evidence(
    step: &Step,
    received: &BTreeMap<String, Value>,
    submitted: &BTreeMap<String, Value>,
) -> Result<(), EngineError> {
    for spec in &step.evidence {
        let value = submitted
            .get(&spec.name)
            .or_else(|| received.get(&spec.name))
            .filter(|v| !v.is_null());
        let Some(value) = value else {
            if spec.required {
                return Err(EngineError::InvalidInput(format!(
                    "missing required evidence '{}'",
                    spec.name
                )));
            }
            continue;
        };

        match &spec.kind {
            EvidenceKind::Checklist { items } => {
                let Some(checked) = value.as_array() else {
                    return Err(EngineError::InvalidInput(format!(
                        "evidence '{}' must be a list of checked items",
                        spec.name
                    )));
                };
                let checked: Vec<String> = checked.iter().map(value_to_string).collect();
                if let Some(unknown) = checked.iter().find(|c| !items.contains(c)) {
                    return Err(EngineError::InvalidInput(format!(
                        "'{unknown}' is not an item of checklist '{}'",
                        spec.name
                    )));
                }
                if spec.required {
                    if let Some(missing) = items.iter().find(|i| !checked.contains(i)) {
                        return Err(EngineError::InvalidInput(format!(
                            "checklist '{}' item '{missing}' is not checked",
                            spec.name
                        )));
                    }
                }
            }
            EvidenceKind::Text | EvidenceKind::Attachment => {
                if spec.required && value_to_string(value).trim().is_empty() {
                    return Err(EngineError::InvalidInput(format!(
                        "evidence '{}' is empty",
                        spec.name
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runbook::expression::JexlEvaluator;
    use crate::runbook::testing::{MapLoader, ScriptedExecutor};
    use tokio::sync::broadcast;

    fn engine_with(loader: MapLoader, config: RunbookConfig) -> Engine {
        Engine::new(
            Arc::new(loader),
            Arc::new(JexlEvaluator::new()),
            EventBus::new(256),
            config,
        )
    }

    fn engine(loader: MapLoader) -> Engine {
        engine_with(loader, RunbookConfig::default())
    }

    fn single(path: &str, yaml: &str) -> (Engine, RunSession) {
        let engine = engine(MapLoader::new().with(path, yaml));
        let session = engine
            .start_session(Path::new(path), BTreeMap::new(), RunMode::Live)
            .unwrap();
        (engine, session)
    }

    async fn run(engine: &Engine, session: &mut RunSession, exec: &ScriptedExecutor) -> AdvanceResult {
        engine
            .advance(session, exec, AdvanceMode::UntilBlocked, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn status_of(session: &RunSession, step_id: &str) -> Option<StepStatus> {
        session
            .history
            .iter()
            .rev()
            .find(|r| r.step_id == step_id)
            .map(|r| r.status)
    }

    // -- Iteration -----------------------------------------------------------

    #[tokio::test]
    async fn test_convergence_stops_on_pass_k() {
        let (engine, mut session) = single(
            "/rb/poll.yaml",
            r#"
name: poll
steps:
  - iterate:
      id: poll
      max: 5
      until: "state == 'idle'"
      steps:
        - id: check
          type: command
          command: "check {{ iteration }}"
          capture:
            state: stdout
"#,
        );
        let exec = ScriptedExecutor::new()
            .respond("check 0", "busy", 0)
            .respond("check 1", "busy", 0)
            .respond("check 2", "idle", 0);
        let mut rx = engine.bus().subscribe();

        let result = run(&engine, &mut session, &exec).await;
        assert_eq!(result, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["check 0", "check 1", "check 2"]);

        let converged = drain(&mut rx).into_iter().find_map(|e| match e {
            RunEvent::IterationConverged { passes, .. } => Some(passes),
            _ => None,
        });
        assert_eq!(converged, Some(3));
    }

    #[tokio::test]
    async fn test_convergence_exhaustion_fails_run() {
        let (engine, mut session) = single(
            "/rb/never.yaml",
            r#"
name: never
steps:
  - iterate:
      id: spin
      max: 3
      until: "false"
      steps:
        - id: attempt
          type: command
          command: attempt
  - id: after
    type: command
    command: after
"#,
        );
        let exec = ScriptedExecutor::new();
        let mut rx = engine.bus().subscribe();

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Failed { error } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(error.contains("did not converge after 3 passes"));
        assert_eq!(exec.calls().len(), 3);
        assert!(session.level.queue.is_empty());
        assert!(session.outcome.is_none());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, RunEvent::IterationFailed { passes: 3, .. }))
        );
    }

    #[tokio::test]
    async fn test_default_max_passes_from_config() {
        let mut config = RunbookConfig::default();
        config.default_max_passes = 2;
        let engine = engine_with(
            MapLoader::new().with(
                "/rb/d.yaml",
                "name: d\nsteps:\n  - iterate:\n      until: \"false\"\n      steps:\n        - id: a\n          type: command\n          command: a\n",
            ),
            config,
        );
        let mut session = engine
            .start_session(Path::new("/rb/d.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let exec = ScriptedExecutor::new();
        assert!(matches!(
            run(&engine, &mut session, &exec).await,
            AdvanceResult::Failed { .. }
        ));
        assert_eq!(exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_list_iteration_runs_each_item() {
        let (engine, mut session) = single(
            "/rb/hosts.yaml",
            r#"
name: hosts
variables:
  hosts: "a, b,c"
steps:
  - iterate:
      over: "{{ hosts }}"
      as: host
      steps:
        - id: visit
          type: command
          command: "ping {{ host }}"
"#,
        );
        let exec = ScriptedExecutor::new();
        let result = run(&engine, &mut session, &exec).await;
        assert_eq!(result, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["ping a", "ping b", "ping c"]);
        assert_eq!(session.level.context.variables["iteration"], json!(2.0));
        assert_eq!(session.level.context.variables["host"], json!("c"));
    }

    #[tokio::test]
    async fn test_blank_list_converges_immediately() {
        let (engine, mut session) = single(
            "/rb/blank.yaml",
            r#"
name: blank
steps:
  - iterate:
      over: ",,,"
      steps:
        - id: never
          type: command
          command: never
  - id: after
    type: command
    command: after
"#,
        );
        let exec = ScriptedExecutor::new();
        let mut rx = engine.bus().subscribe();
        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["after"]);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, RunEvent::IterationConverged { passes: 0, .. }))
        );
    }

    // -- Outcomes and branches -----------------------------------------------

    const DISK: &str = r#"
name: disk
variables:
  host: web1
steps:
  - id: check
    type: command
    command: df
    capture:
      usage: stdout
    outcomes:
      - when: "usage|number > 90"
        state: disk_full
        recommendation: "free space on {{ host }}"
    branches:
      - when: "usage|number > 70"
        label: warm
        steps:
          - id: trim
            type: command
            command: trim
  - id: later
    type: command
    command: later
  - iterate:
      over: "x"
      steps:
        - id: looped
          type: command
          command: looped
"#;

    #[tokio::test]
    async fn test_outcome_clears_continuation() {
        let (engine, mut session) = single("/rb/disk.yaml", DISK);
        let exec = ScriptedExecutor::new().respond("df", "95", 0);

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Outcome(outcome) = result else {
            panic!("expected outcome, got {result:?}");
        };
        assert_eq!(outcome.state, "disk_full");
        assert_eq!(outcome.recommendation, "free space on web1");
        assert_eq!(outcome.step_id, "check");
        assert_eq!(exec.calls(), vec!["df"]);
        assert_eq!(status_of(&session, "later"), Some(StepStatus::Skipped));
        assert_eq!(status_of(&session, "iterate:looped"), Some(StepStatus::Skipped));
        assert!(session.level.queue.is_empty());
        assert_eq!(session.status, RunStatus::OutcomeReached);
    }

    #[tokio::test]
    async fn test_branch_spliced_before_siblings() {
        let (engine, mut session) = single("/rb/disk.yaml", DISK);
        let exec = ScriptedExecutor::new().respond("df", "75", 0);
        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["df", "trim", "later", "looped"]);
        let trim = session.history.iter().find(|r| r.step_id == "trim").unwrap();
        assert_eq!(trim.depth, 1);
    }

    #[tokio::test]
    async fn test_single_step_mode() {
        let (engine, mut session) = single("/rb/disk.yaml", DISK);
        let exec = ScriptedExecutor::new().respond("df", "10", 0);
        let cancel = CancellationToken::new();

        let first = engine
            .advance(&mut session, &exec, AdvanceMode::SingleStep, &cancel)
            .await
            .unwrap();
        let AdvanceResult::StepResult(record) = first else {
            panic!("expected step result, got {first:?}");
        };
        assert_eq!(record.step_id, "check");
        assert_eq!(record.captures["usage"], json!("10"));
        assert_eq!(exec.calls(), vec!["df"]);

        let second = engine
            .advance(&mut session, &exec, AdvanceMode::SingleStep, &cancel)
            .await
            .unwrap();
        assert!(matches!(second, AdvanceResult::StepResult(r) if r.step_id == "later"));
    }

    #[tokio::test]
    async fn test_failed_step_with_captures_can_fire_outcome() {
        let (engine, mut session) = single(
            "/rb/partial.yaml",
            r#"
name: partial
steps:
  - id: lock_check
    type: command
    command: lock_check
    capture:
      reason: stdout
    outcomes:
      - when: "reason == 'locked'"
        state: locked
  - id: after
    type: command
    command: after
"#,
        );
        let exec = ScriptedExecutor::new().respond("lock_check", "locked", 2);
        let result = run(&engine, &mut session, &exec).await;
        assert!(matches!(result, AdvanceResult::Outcome(ref o) if o.state == "locked"));
        assert_eq!(status_of(&session, "lock_check"), Some(StepStatus::Failed));
    }

    // -- Failure policies ----------------------------------------------------

    #[tokio::test]
    async fn test_failure_policies() {
        let (engine, mut session) = single(
            "/rb/fail.yaml",
            r#"
name: fail
steps:
  - id: optional
    type: command
    command: optional
    on_failure: skip
  - id: tolerated
    type: command
    command: tolerated
    on_failure: continue
  - id: fatal
    type: command
    command: fatal
  - id: unreachable
    type: command
    command: unreachable
"#,
        );
        let exec = ScriptedExecutor::new()
            .respond("optional", "", 1)
            .respond("tolerated", "", 1)
            .respond("fatal", "", 3);
        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Failed { error } = result else {
            panic!("expected failure");
        };
        assert!(error.contains("fatal"));
        assert!(error.contains("status 3"));
        assert_eq!(status_of(&session, "optional"), Some(StepStatus::Skipped));
        assert_eq!(status_of(&session, "tolerated"), Some(StepStatus::Failed));
        assert_eq!(status_of(&session, "unreachable"), Some(StepStatus::Skipped));
        assert!(session.level.queue.is_empty());
        assert_eq!(exec.calls(), vec!["optional", "tolerated", "fatal"]);

        let state = session.to_state();
        let restored = RunSession::restore(state, engine.loader().as_ref()).unwrap();
        assert!(restored.level.queue.is_empty());
        assert_eq!(restored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_timeout_follows_failure_policy() {
        let (engine, mut session) = single(
            "/rb/slow.yaml",
            r#"
name: slow
steps:
  - id: warm_cache
    type: command
    command: warm-cache
    timeout_secs: 1
    on_failure: skip
  - id: drain
    type: command
    command: drain-node
    timeout_secs: 1
  - id: notify
    type: command
    command: notify
"#,
        );
        let exec = ScriptedExecutor::new()
            .hang("warm-cache")
            .hang("drain-node");

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Failed { error } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(error.contains("drain"));
        assert!(error.contains("timed out"));

        let skipped = session
            .history
            .iter()
            .find(|r| r.step_id == "warm_cache")
            .unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.reason.as_deref().unwrap().contains("timed out"));

        let failed = session.history.iter().find(|r| r.step_id == "drain").unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("timed out"));

        assert_eq!(status_of(&session, "notify"), Some(StepStatus::Skipped));
        assert_eq!(session.status, RunStatus::Failed);
        assert_eq!(exec.calls(), vec!["warm-cache", "drain-node"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_fails() {
        let (engine, mut session) = single(
            "/rb/c.yaml",
            "name: c\nsteps:\n  - id: a\n    type: command\n    command: a\n",
        );
        let exec = ScriptedExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine
            .advance(&mut session, &exec, AdvanceMode::UntilBlocked, &cancel)
            .await
            .unwrap();
        assert_eq!(
            result,
            AdvanceResult::Failed {
                error: "cancelled".to_string()
            }
        );
        assert!(exec.calls().is_empty());
    }

    // -- Invoke --------------------------------------------------------------

    const PARENT: &str = r#"
name: parent
variables:
  host: web1
steps:
  - id: call
    type: invoke
    workflow: child.yaml
    input:
      target: "{{ host }}"
    outputs:
      freed: bytes
      verdict: outcome
  - id: after
    type: command
    command: "report {{ freed }} {{ verdict }}"
"#;

    const CHILD: &str = r#"
name: child
variables:
  target: none
steps:
  - id: clean
    type: command
    command: "clean {{ target }}"
    capture:
      bytes: stdout
"#;

    #[tokio::test]
    async fn test_invoke_round_trip_applies_outputs() {
        let engine = engine(
            MapLoader::new()
                .with("/rb/parent.yaml", PARENT)
                .with("/rb/child.yaml", CHILD),
        );
        let mut session = engine
            .start_session(Path::new("/rb/parent.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let parent_vars = session.level.context.variables.clone();
        let exec = ScriptedExecutor::new().respond("clean web1", "2048", 0);

        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["clean web1", "report 2048 completed"]);
        assert!(session.stack.is_empty());
        assert_eq!(session.level.runbook.name(), "parent");
        assert_eq!(session.level.context.variables, parent_vars);
        assert_eq!(session.level.context.captures["freed"], json!("2048"));

        let child = &session.level.child_runs[0];
        assert_eq!(child.state, "completed");
        assert_eq!(child.invoked_by, "call");
        assert_eq!(status_of(&session, "call"), Some(StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_gate_halts_parent_with_child_outcome() {
        let parent = r#"
name: parent
steps:
  - id: call
    type: invoke
    workflow: child
    gate:
      stop_if: [escalate]
  - id: after
    type: command
    command: after
imports:
  child: ./sub/child.yaml
"#;
        let child = r#"
name: child
steps:
  - id: assess
    type: manual
    outcomes:
      - state: escalate
        recommendation: call sre
"#;
        let engine = engine(
            MapLoader::new()
                .with("/rb/parent.yaml", parent)
                .with("/rb/sub/child.yaml", child),
        );
        let mut session = engine
            .start_session(Path::new("/rb/parent.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let exec = ScriptedExecutor::new();

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Outcome(outcome) = result else {
            panic!("expected outcome, got {result:?}");
        };
        assert_eq!(outcome.state, "escalate");
        assert_eq!(outcome.recommendation, "call sre");
        assert_eq!(outcome.step_id, "assess");
        assert!(exec.calls().is_empty());
        assert_eq!(status_of(&session, "after"), Some(StepStatus::Skipped));
        assert!(session.stack.is_empty());
    }

    #[tokio::test]
    async fn test_child_outcome_without_gate_continues_parent() {
        let child = r#"
name: child
variables:
  bytes: "0"
steps:
  - id: assess
    type: manual
    outcomes:
      - state: fine
"#;
        let engine = engine(
            MapLoader::new()
                .with("/rb/parent.yaml", PARENT)
                .with("/rb/child.yaml", child),
        );
        let mut session = engine
            .start_session(Path::new("/rb/parent.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let exec = ScriptedExecutor::new();
        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["report 0 fine"]);
    }

    #[tokio::test]
    async fn test_child_failure_uses_invoking_step_policy() {
        let parent = r#"
name: parent
steps:
  - id: call
    type: invoke
    workflow: child.yaml
    on_failure: skip
  - id: after
    type: command
    command: after
"#;
        let child = "name: child\nsteps:\n  - id: boom\n    type: command\n    command: boom\n";
        let engine = engine(
            MapLoader::new()
                .with("/rb/parent.yaml", parent)
                .with("/rb/child.yaml", child),
        );
        let mut session = engine
            .start_session(Path::new("/rb/parent.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let exec = ScriptedExecutor::new().respond("boom", "", 1);

        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["boom", "after"]);
        assert_eq!(status_of(&session, "call"), Some(StepStatus::Skipped));
        assert_eq!(session.level.child_runs[0].state, "failed");
    }

    #[tokio::test]
    async fn test_self_invocation_exceeds_depth() {
        let mut config = RunbookConfig::default();
        config.max_invoke_depth = 3;
        let engine = engine_with(
            MapLoader::new().with(
                "/rb/loop.yaml",
                "name: loop\nsteps:\n  - id: again\n    type: invoke\n    workflow: loop.yaml\n",
            ),
            config,
        );
        let mut session = engine
            .start_session(Path::new("/rb/loop.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        let exec = ScriptedExecutor::new();

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::Failed { error } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(error.contains("exceeds the maximum of 3"));
        assert!(session.stack.is_empty());
        let failed = session
            .history
            .iter()
            .find(|r| r.status == StepStatus::Failed)
            .unwrap();
        assert_eq!(failed.step_id, "again");
        assert!(failed.error.as_deref().unwrap_or("").contains("depth 4"));
    }

    #[tokio::test]
    async fn test_missing_child_runbook_fails_invoking_step() {
        let (engine, mut session) = single(
            "/rb/p.yaml",
            "name: p\nsteps:\n  - id: call\n    type: invoke\n    workflow: gone.yaml\n",
        );
        let exec = ScriptedExecutor::new();
        let result = run(&engine, &mut session, &exec).await;
        assert!(matches!(result, AdvanceResult::Failed { ref error } if error.contains("call")));
        assert_eq!(status_of(&session, "call"), Some(StepStatus::Failed));
    }

    // -- Operator input ------------------------------------------------------

    const MANUAL: &str = r#"
name: manual
variables:
  host: web1
steps:
  - id: confirm
    type: manual
    instructions: "Check {{ host }}"
  - id: optional
    type: command
    command: optional
    precondition: "host == 'db'"
  - id: decide
    type: manual
    choice:
      variable: action
      options: [restart, ignore]
  - id: verdict
    type: manual
    outcomes:
      - when: "action == 'restart'"
        state: restarted
      - state: ignored
        recommendation: "left {{ host }} alone"
"#;

    #[tokio::test]
    async fn test_manual_flow_with_choice_and_outcome() {
        let (engine, mut session) = single("/rb/manual.yaml", MANUAL);
        let exec = ScriptedExecutor::new();

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::AwaitingUser(prompt) = result else {
            panic!("expected prompt, got {result:?}");
        };
        assert_eq!(prompt.step_id, "confirm");
        assert_eq!(prompt.awaiting, vec![InputKind::Acknowledge]);
        assert_eq!(prompt.instructions.as_deref(), Some("Check web1"));
        assert_eq!(session.status, RunStatus::AwaitingUser);

        // Advancing again does nothing.
        assert!(matches!(
            run(&engine, &mut session, &exec).await,
            AdvanceResult::AwaitingUser(_)
        ));

        let err = engine
            .submit_evidence(&mut session, "decide", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::StepMismatch { .. }));

        let acked = engine
            .submit_evidence(&mut session, "confirm", BTreeMap::new())
            .unwrap();
        assert!(matches!(acked, AdvanceResult::StepResult(ref r) if r.step_id == "confirm"));

        let result = run(&engine, &mut session, &exec).await;
        assert!(matches!(result, AdvanceResult::AwaitingUser(ref p) if p.step_id == "decide"));
        assert_eq!(status_of(&session, "optional"), Some(StepStatus::Skipped));

        let err = engine
            .submit_choice(&mut session, "action", "reboot")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        engine
            .submit_choice(&mut session, "action", "ignore")
            .unwrap();
        assert_eq!(session.level.context.variables["action"], json!("ignore"));

        let result = run(&engine, &mut session, &exec).await;
        let AdvanceResult::AwaitingUser(prompt) = result else {
            panic!("expected outcome prompt");
        };
        assert_eq!(prompt.awaiting, vec![InputKind::Outcome]);
        assert_eq!(prompt.outcomes.len(), 2);

        let result = engine
            .choose_outcome(&mut session, &OutcomeSelector::parse("ignored"))
            .unwrap();
        let AdvanceResult::Outcome(outcome) = result else {
            panic!("expected outcome");
        };
        assert_eq!(outcome.recommendation, "left web1 alone");
        assert_eq!(session.inputs.len(), 3);
        assert_eq!(session.inputs[2].outcome.as_deref(), Some("ignored"));

        let err = engine
            .submit_evidence(&mut session, "confirm", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::RunFinished(RunStatus::OutcomeReached)));
    }

    #[tokio::test]
    async fn test_no_pending_input() {
        let (engine, mut session) = single("/rb/manual.yaml", MANUAL);
        let err = engine
            .submit_choice(&mut session, "action", "ignore")
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPendingInput));
    }

    #[tokio::test]
    async fn test_evidence_and_approval() {
        let (engine, mut session) = single(
            "/rb/ev.yaml",
            r#"
name: ev
steps:
  - id: collect
    type: manual
    evidence:
      - name: ticket
      - name: checks
        kind:
          type: checklist
          items: [backup, notify]
    approval:
      prompt: "Proceed?"
    capture:
      ticket_id: "evidence:ticket"
  - id: after
    type: command
    command: "close {{ ticket_id }}"
"#,
        );
        let exec = ScriptedExecutor::new();
        run(&engine, &mut session, &exec).await;

        let mut partial = BTreeMap::new();
        partial.insert("ticket".to_string(), json!("INC-7"));
        let err = engine
            .submit_evidence(&mut session, "collect", partial.clone())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(ref m) if m.contains("checks")));

        partial.insert("checks".to_string(), json!(["backup"]));
        assert!(engine.submit_evidence(&mut session, "collect", partial.clone()).is_err());

        partial.insert("checks".to_string(), json!(["backup", "notify"]));
        let result = engine
            .submit_evidence(&mut session, "collect", partial)
            .unwrap();
        let AdvanceResult::AwaitingUser(prompt) = result else {
            panic!("approval should still be pending");
        };
        assert_eq!(prompt.awaiting, vec![InputKind::Approval]);
        assert_eq!(prompt.received["ticket"], json!("INC-7"));

        let mut approval = BTreeMap::new();
        approval.insert(APPROVED_KEY.to_string(), json!(true));
        engine
            .submit_evidence(&mut session, "collect", approval)
            .unwrap();
        assert_eq!(run(&engine, &mut session, &exec).await, AdvanceResult::Completed);
        assert_eq!(exec.calls(), vec!["close INC-7"]);
    }

    #[tokio::test]
    async fn test_rejected_approval_fails_step() {
        let (engine, mut session) = single(
            "/rb/ap.yaml",
            "name: ap\nsteps:\n  - id: gate\n    type: manual\n    approval:\n      prompt: ok?\n",
        );
        let exec = ScriptedExecutor::new();
        run(&engine, &mut session, &exec).await;

        let mut decision = BTreeMap::new();
        decision.insert(APPROVED_KEY.to_string(), json!(false));
        let result = engine
            .submit_evidence(&mut session, "gate", decision)
            .unwrap();
        assert!(matches!(result, AdvanceResult::Failed { ref error } if error.contains("approval rejected")));
    }

    #[tokio::test]
    async fn test_recorded_input_resolves_manual_step() {
        let (engine, mut session) = single("/rb/manual.yaml", MANUAL);
        let exec = ScriptedExecutor::new()
            .with_input(RecordedInput {
                step_id: "confirm".to_string(),
                ..RecordedInput::default()
            })
            .with_input(RecordedInput {
                step_id: "decide".to_string(),
                choice: Some("restart".to_string()),
                ..RecordedInput::default()
            })
            .with_input(RecordedInput {
                step_id: "verdict".to_string(),
                outcome: Some("restarted".to_string()),
                ..RecordedInput::default()
            });

        let result = run(&engine, &mut session, &exec).await;
        assert!(matches!(result, AdvanceResult::Outcome(ref o) if o.state == "restarted"));
        assert_eq!(session.inputs.len(), 3);
    }

    // -- Persistence ---------------------------------------------------------

    #[tokio::test]
    async fn test_resume_inside_child_within_list() {
        let parent = r#"
name: fleet
steps:
  - iterate:
      over: "a,b"
      as: host
      steps:
        - id: call
          type: invoke
          workflow: check.yaml
          input:
            host: "{{ host }}"
  - id: done
    type: command
    command: finish
"#;
        let child = r#"
name: check
steps:
  - id: look
    type: manual
    instructions: "look at {{ host }}"
  - id: work
    type: command
    command: "work {{ host }}"
"#;
        let loader = || {
            MapLoader::new()
                .with("/rb/fleet.yaml", parent)
                .with("/rb/check.yaml", child)
        };
        let exec = ScriptedExecutor::new();

        let first = engine(loader());
        let mut session = first
            .start_session(Path::new("/rb/fleet.yaml"), BTreeMap::new(), RunMode::Live)
            .unwrap();
        assert!(matches!(
            run(&first, &mut session, &exec).await,
            AdvanceResult::AwaitingUser(ref p) if p.instructions.as_deref() == Some("look at a")
        ));

        for host in ["a", "b"] {
            let json = serde_json::to_string(&session.to_state()).unwrap();
            let resumed = engine(loader());
            session = resumed.restore(serde_json::from_str(&json).unwrap()).unwrap();
            assert_eq!(session.stack.len(), 1);
            assert_eq!(session.pending.as_ref().unwrap().step.id, "look");
            assert_eq!(session.level.context.variables["host"], json!(host));

            resumed
                .submit_evidence(&mut session, "look", BTreeMap::new())
                .unwrap();
            let result = run(&resumed, &mut session, &exec).await;
            if host == "a" {
                assert!(matches!(
                    result,
                    AdvanceResult::AwaitingUser(ref p) if p.instructions.as_deref() == Some("look at b")
                ));
            } else {
                assert_eq!(result, AdvanceResult::Completed);
            }
        }
        assert_eq!(exec.calls(), vec!["work a", "work b", "finish"]);
        assert_eq!(session.level.child_runs.len(), 2);
    }
}
