//! Interactive run loop (`rbk run`, `rbk resume`).
//!
//! Advances the run, prompts the operator through dialoguer whenever a step
//! waits on them, and streams step events while commands execute. Ctrl+C
//! during an advance cancels the run's in-flight step.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, MultiSelect, Select};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use runbook_core::runbook::engine::{AdvanceMode, AdvanceResult, OutcomeOption, PendingPrompt};
use runbook_core::runbook::evidence::{CollectError, EvidenceCollector, collect_input};
use runbook_core::runbook::loader::resolve_reference;
use runbook_types::event::RunEvent;
use runbook_types::runbook::{ApprovalSpec, ChoiceSpec, EvidenceSpec};
use runbook_types::session::RunMode;

use crate::cli::run::{print_prompt, print_result, print_summary};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DialoguerCollector
// ---------------------------------------------------------------------------

/// Terminal prompts for operator input.
pub struct DialoguerCollector;

fn prompt_error(e: dialoguer::Error) -> CollectError {
    CollectError::Prompt(e.to_string())
}

impl EvidenceCollector for DialoguerCollector {
    fn prompt_text(&self, spec: &EvidenceSpec) -> Result<String, CollectError> {
        Input::<String>::new()
            .with_prompt(spec.prompt.clone().unwrap_or_else(|| spec.name.clone()))
            .allow_empty(!spec.required)
            .interact_text()
            .map_err(prompt_error)
    }

    fn prompt_checklist(
        &self,
        spec: &EvidenceSpec,
        items: &[String],
    ) -> Result<Vec<String>, CollectError> {
        let picked = MultiSelect::new()
            .with_prompt(spec.prompt.clone().unwrap_or_else(|| spec.name.clone()))
            .items(items)
            .interact_opt()
            .map_err(prompt_error)?
            .ok_or(CollectError::Cancelled)?;
        Ok(picked.into_iter().map(|i| items[i].clone()).collect())
    }

    fn prompt_attachment(&self, spec: &EvidenceSpec) -> Result<String, CollectError> {
        Input::<String>::new()
            .with_prompt(format!(
                "{} (path or link)",
                spec.prompt.clone().unwrap_or_else(|| spec.name.clone())
            ))
            .allow_empty(!spec.required)
            .interact_text()
            .map_err(prompt_error)
    }

    fn prompt_approval(&self, spec: &ApprovalSpec) -> Result<bool, CollectError> {
        Confirm::new()
            .with_prompt(&spec.prompt)
            .default(false)
            .interact_opt()
            .map_err(prompt_error)?
            .ok_or(CollectError::Cancelled)
    }

    fn prompt_choice(&self, spec: &ChoiceSpec) -> Result<String, CollectError> {
        let prompt = spec
            .prompt
            .clone()
            .unwrap_or_else(|| format!("Value for '{}'", spec.variable));
        if spec.options.is_empty() {
            return Input::<String>::new()
                .with_prompt(prompt)
                .interact_text()
                .map_err(prompt_error);
        }
        let index = Select::new()
            .with_prompt(prompt)
            .items(&spec.options)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?
            .ok_or(CollectError::Cancelled)?;
        Ok(spec.options[index].clone())
    }

    fn prompt_outcome(&self, options: &[OutcomeOption]) -> Result<usize, CollectError> {
        let labels: Vec<String> = options.iter().map(outcome_label).collect();
        let picked = Select::new()
            .with_prompt("Outcome")
            .items(&labels)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?
            .ok_or(CollectError::Cancelled)?;
        options
            .get(picked)
            .map(|option| option.index)
            .ok_or(CollectError::Cancelled)
    }

    fn acknowledge(&self, prompt: &PendingPrompt) -> Result<(), CollectError> {
        let done = Confirm::new()
            .with_prompt(format!("Mark '{}' as done?", prompt.title))
            .default(true)
            .interact_opt()
            .map_err(prompt_error)?;
        match done {
            Some(true) => Ok(()),
            _ => Err(CollectError::Cancelled),
        }
    }
}

fn outcome_label(option: &OutcomeOption) -> String {
    match &option.when {
        Some(when) => format!("{} (when {when})", option.state),
        None => option.state.clone(),
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Start `path` and walk it interactively.
pub async fn run(
    state: &AppState,
    path: PathBuf,
    variables: BTreeMap<String, serde_json::Value>,
    follow: bool,
    json: bool,
) -> Result<()> {
    let summary = state
        .runbook_service
        .start(&path, variables, RunMode::Live)
        .await?;
    if !json {
        print_summary(&summary);
    }
    drive(state, summary.run_id, follow, json).await
}

/// Walk a stored run until it ends, chaining to `next` runbooks when
/// `follow` is set.
pub async fn drive(state: &AppState, run_id: Uuid, follow: bool, json: bool) -> Result<()> {
    let events = if json {
        None
    } else {
        Some(spawn_event_printer(state))
    };

    let outcome = chain(state, run_id, follow, json).await;

    if let Some(events) = events {
        events.abort();
    }
    outcome
}

async fn chain(state: &AppState, mut run_id: Uuid, follow: bool, json: bool) -> Result<()> {
    loop {
        let result = walk(state, run_id, json).await?;
        print_result(&result, json)?;

        let AdvanceResult::Outcome(record) = &result else {
            return Ok(());
        };
        let Some(next) = record.next.as_deref().filter(|_| follow) else {
            return Ok(());
        };

        let next_path = resolve_next(state, run_id, next).await?;
        let variables = state.runbook_service.get_variables(run_id).await?;
        let summary = state
            .runbook_service
            .start(&next_path, variables, RunMode::Live)
            .await
            .with_context(|| format!("failed to start next runbook {}", next_path.display()))?;
        tracing::info!(from = %run_id, to = %summary.run_id, next, "following outcome");
        if !json {
            print_summary(&summary);
        }
        run_id = summary.run_id;
    }
}

/// Advance and answer prompts until the run reaches a terminal result.
async fn walk(state: &AppState, run_id: Uuid, json: bool) -> Result<AdvanceResult> {
    let collector = DialoguerCollector;
    loop {
        let prompt = match advance_interruptible(state, run_id).await? {
            AdvanceResult::AwaitingUser(prompt) => prompt,
            AdvanceResult::StepResult(_) => continue,
            terminal => return Ok(terminal),
        };

        if !json {
            print_prompt(&prompt);
        }

        let input = match collect_input(&collector, &prompt) {
            Ok(input) => input,
            Err(CollectError::Cancelled) => {
                println!(
                    "  {} Paused. Continue later with: {}",
                    style("i").blue().bold(),
                    style(format!("rbk resume {run_id}")).yellow()
                );
                return Ok(AdvanceResult::AwaitingUser(prompt));
            }
            Err(e) => return Err(e.into()),
        };

        let mut last = None;
        if let Some(evidence) = input.evidence {
            last = Some(
                state
                    .runbook_service
                    .submit_evidence(run_id, &prompt.step_id, evidence)
                    .await?,
            );
        }
        if let Some((variable, value)) = input.choice {
            last = Some(
                state
                    .runbook_service
                    .submit_choice(run_id, &variable, &value)
                    .await?,
            );
        }
        if let Some(selector) = input.outcome {
            last = Some(
                state
                    .runbook_service
                    .choose_outcome(run_id, &selector)
                    .await?,
            );
        }

        match last {
            Some(
                result @ (AdvanceResult::Outcome(_)
                | AdvanceResult::Completed
                | AdvanceResult::Failed { .. }),
            ) => return Ok(result),
            _ => continue,
        }
    }
}

/// Advance until blocked; Ctrl+C cancels the step in flight.
async fn advance_interruptible(state: &AppState, run_id: Uuid) -> Result<AdvanceResult> {
    let service = &state.runbook_service;
    let advance = service.advance(run_id, AdvanceMode::UntilBlocked);
    tokio::pin!(advance);

    let result = tokio::select! {
        result = &mut advance => result,
        _ = tokio::signal::ctrl_c() => {
            service.cancel(run_id);
            advance.await
        }
    };
    Ok(result?)
}

async fn resolve_next(state: &AppState, run_id: Uuid, next: &str) -> Result<PathBuf> {
    let manifest = state.runbook_service.get_manifest(run_id).await?;
    let base = state
        .runbook_service
        .engine()
        .loader()
        .load(&manifest.root_workflow)?;
    Ok(resolve_reference(&base, next))
}

/// Print step events as they arrive.
fn spawn_event_printer(state: &AppState) -> tokio::task::JoinHandle<()> {
    let mut rx = state.runbook_service.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StepStarted { title, depth, .. } => {
            println!(
                "  {}{} {}",
                "  ".repeat(*depth as usize),
                style("▶").cyan(),
                title
            );
        }
        RunEvent::StepFailed { step_id, error, .. } => {
            println!("    {} {step_id}: {}", style("✗").red(), style(error).red());
        }
        RunEvent::StepSkipped { step_id, reason, .. } => {
            println!("    {} {step_id} skipped ({reason})", style("-").dim());
        }
        RunEvent::InvokeStarted { workflow, depth, .. } => {
            println!(
                "  {}{} invoking {}",
                "  ".repeat(*depth as usize),
                style("↳").cyan(),
                style(workflow).cyan()
            );
        }
        RunEvent::IterationPass { block, iteration, .. } => {
            println!("    {} {block} pass {}", style("↻").dim(), iteration + 1);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_label() {
        let option = OutcomeOption {
            index: 0,
            state: "fixed".to_string(),
            when: Some("health == 'ok'".to_string()),
            recommendation: String::new(),
        };
        assert_eq!(outcome_label(&option), "fixed (when health == 'ok')");

        let bare = OutcomeOption {
            when: None,
            ..option
        };
        assert_eq!(outcome_label(&bare), "fixed");
    }

    #[test]
    fn test_prompt_error_maps_to_prompt() {
        let err = prompt_error(dialoguer::Error::IO(std::io::Error::other("tty gone")));
        assert!(matches!(err, CollectError::Prompt(msg) if msg.contains("tty gone")));
    }
}
