//! Run lifecycle commands and their rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use uuid::Uuid;

use runbook_core::runbook::definition::serialize_runbook_yaml;
use runbook_core::runbook::engine::{APPROVED_KEY, AdvanceMode, AdvanceResult, PendingPrompt};
use runbook_core::runbook::expression::value_to_string;
use runbook_core::runbook::routing::OutcomeSelector;
use runbook_core::service::runbook::{Manifest, RunSummary};
use runbook_infra::filesystem::LocalFileSystem;
use runbook_types::session::{InputKind, OutcomeRecord, RunMode, RunStatus, StepRecord, StepStatus};

use crate::state::AppState;

fn spinner(message: impl Into<String>) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(80));
    Ok(spinner)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Start a run and print its id.
pub async fn start(
    state: &AppState,
    path: &Path,
    variables: BTreeMap<String, Value>,
    json: bool,
) -> Result<RunSummary> {
    let summary = state
        .runbook_service
        .start(path, variables, RunMode::Live)
        .await?;

    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }
    Ok(summary)
}

/// Advance a run and print where it stopped.
pub async fn advance(state: &AppState, run_id: Uuid, single_step: bool, json: bool) -> Result<()> {
    let mode = if single_step {
        AdvanceMode::SingleStep
    } else {
        AdvanceMode::UntilBlocked
    };

    let progress = if json {
        None
    } else {
        Some(spinner("Running steps...")?)
    };
    let result = state.runbook_service.advance(run_id, mode).await;
    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    print_result(&result?, json)
}

/// Start a scenario replay and drive it until it needs someone or ends.
pub async fn replay(state: &AppState, scenario: &Path, json: bool) -> Result<()> {
    let summary = state.runbook_service.replay(scenario).await?;
    if !json {
        print_summary(&summary);
    }

    let result = state
        .runbook_service
        .advance(summary.run_id, AdvanceMode::UntilBlocked)
        .await?;

    // Recorded operator input resolves manual steps inline, so a pending
    // prompt here means the scenario ran out of answers.
    if let AdvanceResult::AwaitingUser(prompt) = &result {
        tracing::warn!(run_id = %summary.run_id, step_id = %prompt.step_id, "replay stopped at a prompt");
    }
    print_result(&result, json)
}

/// Save a run as a replay scenario.
pub async fn save_scenario(
    state: &AppState,
    run_id: Uuid,
    dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let dir = dir.unwrap_or_else(|| LocalFileSystem::scenario_dir(&state.data_dir, &run_id));
    let path = state.runbook_service.save_scenario(run_id, &dir).await?;

    if json {
        print_json(&serde_json::json!({ "run_id": run_id, "path": path }))?;
    } else {
        println!(
            "  {} Scenario saved to {}",
            style("✓").green().bold(),
            style(path.display()).cyan()
        );
        println!(
            "  Replay it with: {}",
            style(format!("rbk replay {}", dir.display())).yellow()
        );
    }
    Ok(())
}

/// Delete a stored run, asking first unless forced.
pub async fn delete(state: &AppState, run_id: Uuid, force: bool, json: bool) -> Result<()> {
    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete run {}?", style(run_id).red().bold()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    state.runbook_service.delete_run(run_id).await?;

    if json {
        print_json(&serde_json::json!({ "deleted": true, "run_id": run_id }))?;
    } else {
        println!("  {} Run {} deleted.", style("✓").red().bold(), run_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operator input
// ---------------------------------------------------------------------------

pub async fn choose(state: &AppState, run_id: Uuid, outcome: &str, json: bool) -> Result<()> {
    let result = state
        .runbook_service
        .choose_outcome(run_id, &OutcomeSelector::parse(outcome))
        .await?;
    print_result(&result, json)
}

pub async fn choice(
    state: &AppState,
    run_id: Uuid,
    variable: &str,
    value: &str,
    json: bool,
) -> Result<()> {
    let result = state
        .runbook_service
        .submit_choice(run_id, variable, value)
        .await?;
    print_result(&result, json)
}

pub async fn evidence(
    state: &AppState,
    run_id: Uuid,
    step_id: &str,
    values: BTreeMap<String, Value>,
    json: bool,
) -> Result<()> {
    let result = state
        .runbook_service
        .submit_evidence(run_id, step_id, values)
        .await?;
    print_result(&result, json)
}

pub async fn approve(
    state: &AppState,
    run_id: Uuid,
    step_id: &str,
    approved: bool,
    json: bool,
) -> Result<()> {
    let mut values = BTreeMap::new();
    values.insert(APPROVED_KEY.to_string(), Value::Bool(approved));
    evidence(state, run_id, step_id, values, json).await
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub async fn vars(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let variables = state.runbook_service.get_variables(run_id).await?;

    if json {
        return print_json(&variables);
    }

    if variables.is_empty() {
        println!("  {} No variables set.", style("i").blue().bold());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);
    for (name, value) in &variables {
        table.add_row(vec![
            Cell::new(name).fg(Color::Cyan),
            Cell::new(truncate(&value_to_string(value), 80)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn manifest(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let manifest = state.runbook_service.get_manifest(run_id).await?;
    if json {
        return print_json(&manifest);
    }
    print_manifest(&manifest);
    Ok(())
}

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let runs = state.runbook_service.list_runs().await?;

    if json {
        return print_json(&runs);
    }

    if runs.is_empty() {
        println!();
        println!(
            "  {} No runs found. Start one with: {}",
            style("i").blue().bold(),
            style("rbk start <runbook.yaml>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(run.run_id).fg(Color::Cyan),
            Cell::new(run.workflow.display()),
            status_cell(run.status),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} run{}",
        style(runs.len()).bold(),
        if runs.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// Load a runbook through the engine's loader and report its outline.
pub fn validate(state: &AppState, path: &Path, normalized: bool, json: bool) -> Result<()> {
    let runbook = state.runbook_service.engine().loader().load(path)?;

    if normalized {
        print!("{}", serialize_runbook_yaml(runbook.definition())?);
        return Ok(());
    }

    if json {
        return print_json(&serde_json::json!({
            "name": runbook.name(),
            "path": runbook.path(),
            "digest": runbook.digest(),
            "step_count": runbook.step_count(),
            "outline": runbook.outline(),
        }));
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green().bold(),
        style(runbook.name()).cyan(),
        runbook.step_count()
    );
    for entry in runbook.outline() {
        println!(
            "    {}{} {}",
            "  ".repeat(entry.depth as usize),
            style(&entry.key).cyan(),
            style(format!("[{}]", entry.kind)).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn status_cell(status: RunStatus) -> Cell {
    let label = format!("{} {status}", status_marker(status));
    match status {
        RunStatus::Running => Cell::new(label).fg(Color::Blue),
        RunStatus::AwaitingUser => Cell::new(label).fg(Color::Yellow),
        RunStatus::Completed | RunStatus::OutcomeReached => Cell::new(label).fg(Color::Green),
        RunStatus::Failed => Cell::new(label).fg(Color::Red),
    }
}

fn status_marker(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "▶",
        RunStatus::AwaitingUser => "?",
        RunStatus::Completed | RunStatus::OutcomeReached => "●",
        RunStatus::Failed => "✗",
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "  {} Started '{}' ({} steps)",
        style("▶").cyan().bold(),
        style(&summary.name).cyan(),
        summary.step_count
    );
    println!("  Run id: {}", style(summary.run_id).bold());
    if let RunMode::Replay { scenario } = &summary.mode {
        println!("  Replaying {}", style(scenario.display()).dim());
    }
    println!();
}

/// Print an `AdvanceResult`, as JSON or styled text.
pub fn print_result(result: &AdvanceResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }

    match result {
        AdvanceResult::AwaitingUser(prompt) => print_prompt(prompt),
        AdvanceResult::Outcome(record) => print_outcome(record),
        AdvanceResult::Completed => {
            println!("  {} Run completed.", style("✓").green().bold());
        }
        AdvanceResult::StepResult(record) => print_step(record),
        AdvanceResult::Failed { error } => {
            println!("  {} Run failed: {}", style("✗").red().bold(), style(error).red());
        }
    }
    Ok(())
}

pub fn print_step(record: &StepRecord) {
    let marker = match record.status {
        StepStatus::Completed => style("✓").green(),
        StepStatus::Failed => style("✗").red(),
        StepStatus::Skipped => style("-").dim(),
    };
    let indent = "  ".repeat(record.depth as usize);
    println!("  {indent}{marker} {} ({})", record.step_id, record.status);
    if let Some(error) = &record.error {
        println!("  {indent}    {}", style(error).red());
    }
    if let Some(reason) = &record.reason {
        println!("  {indent}    {}", style(reason).dim());
    }
}

pub fn print_outcome(record: &OutcomeRecord) {
    println!(
        "  {} Outcome '{}' reached at step '{}'",
        style("●").green().bold(),
        style(&record.state).green().bold(),
        record.step_id
    );
    if !record.recommendation.is_empty() {
        println!("    {}", record.recommendation);
    }
    if let Some(next) = &record.next {
        println!("    Next runbook: {}", style(next).cyan());
    }
}

pub fn print_prompt(prompt: &PendingPrompt) {
    println!();
    println!(
        "  {} Step '{}' needs input: {}",
        style("?").yellow().bold(),
        style(&prompt.title).bold(),
        prompt
            .awaiting
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    if let Some(instructions) = &prompt.instructions {
        for line in instructions.lines() {
            println!("    {}", style(line).dim());
        }
    }

    let id = prompt.run_id;
    for kind in &prompt.awaiting {
        let hint = match kind {
            InputKind::Evidence => {
                let names: Vec<&str> = prompt
                    .evidence
                    .iter()
                    .filter(|spec| !prompt.received.contains_key(&spec.name))
                    .map(|spec| spec.name.as_str())
                    .collect();
                format!("rbk evidence {id} {} {}=...", prompt.step_id, names.join("=... "))
            }
            InputKind::Approval => format!("rbk approve {id} {} [--reject]", prompt.step_id),
            InputKind::Choice => match &prompt.choice {
                Some(choice) if !choice.options.is_empty() => format!(
                    "rbk choice {id} {} <{}>",
                    choice.variable,
                    choice.options.join("|")
                ),
                Some(choice) => format!("rbk choice {id} {} <value>", choice.variable),
                None => continue,
            },
            InputKind::Acknowledge => format!("rbk ack {id} {}", prompt.step_id),
            InputKind::Outcome => {
                for option in &prompt.outcomes {
                    println!("    [{}] {}", option.index, option.state);
                }
                format!("rbk choose {id} <index|state>")
            }
        };
        println!("    {}", style(hint).yellow());
    }
    println!();
}

fn print_manifest(manifest: &Manifest) {
    println!();
    println!(
        "  {} {} [{}]",
        style(status_marker(manifest.status)).bold(),
        style(&manifest.workflow).cyan().bold(),
        manifest.status
    );
    println!("  Run id: {}", manifest.run_id);
    if manifest.level_run_id != manifest.run_id {
        println!("  Level run id: {}", manifest.level_run_id);
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Key").fg(Color::White),
        Cell::new("Kind").fg(Color::White),
        Cell::new("Title").fg(Color::White),
        Cell::new("State").fg(Color::White),
    ]);
    for entry in &manifest.outline {
        let state = manifest
            .history
            .iter()
            .rev()
            .find(|record| record.step_id == entry.key && record.level_run_id == manifest.level_run_id)
            .map(|record| record.status.to_string());
        let pending = manifest
            .pending
            .as_ref()
            .is_some_and(|prompt| prompt.step_id == entry.key);
        let state_cell = match (pending, state) {
            (true, _) => Cell::new("awaiting input").fg(Color::Yellow),
            (false, Some(state)) => Cell::new(state).fg(Color::Green),
            (false, None) => Cell::new("").fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(format!("{}{}", "  ".repeat(entry.depth as usize), entry.key)).fg(Color::Cyan),
            Cell::new(&entry.kind),
            Cell::new(&entry.title),
            state_cell,
        ]);
    }
    println!("{table}");

    if !manifest.stack.is_empty() {
        println!();
        println!("  {}", style("── Invoke stack ──").dim());
        for frame in &manifest.stack {
            println!(
                "  {}{} (waiting on '{}')",
                "  ".repeat(frame.depth as usize),
                frame.workflow,
                frame.invoking_step
            );
        }
    }

    if let Some(prompt) = &manifest.pending {
        print_prompt(prompt);
    }
    if let Some(outcome) = &manifest.outcome {
        println!();
        print_outcome(outcome);
    }
    if let Some(failure) = &manifest.failure {
        println!();
        println!("  {} {}", style("✗").red().bold(), style(failure).red());
    }
    println!();
}
