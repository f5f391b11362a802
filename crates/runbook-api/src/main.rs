//! Runbook engine CLI and REST API entry point.
//!
//! Binary name: `rbk`
//!
//! Parses CLI arguments, initializes the session store and engine, then
//! dispatches to the appropriate command handler or starts the REST API
//! server.

mod cli;
mod http;
mod state;

use anyhow::anyhow;
use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands, into_map};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,runbook=debug",
        _ => "trace",
    };
    runbook_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "rbk", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = dispatch(&cli, state).await;

    runbook_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: &Cli, state: AppState) -> anyhow::Result<()> {
    let json = cli.json;

    match &cli.command {
        Commands::Start { path, vars } => {
            cli::run::start(&state, path, into_map(vars.clone()), json).await?;
        }

        Commands::Advance { run_id, step } => {
            cli::run::advance(&state, *run_id, *step, json).await?;
        }

        Commands::Choose { run_id, outcome } => {
            cli::run::choose(&state, *run_id, outcome, json).await?;
        }

        Commands::Choice {
            run_id,
            variable,
            value,
        } => {
            cli::run::choice(&state, *run_id, variable, value, json).await?;
        }

        Commands::Evidence {
            run_id,
            step_id,
            values,
        } => {
            cli::run::evidence(&state, *run_id, step_id, into_map(values.clone()), json).await?;
        }

        Commands::Approve {
            run_id,
            step_id,
            reject,
        } => {
            cli::run::approve(&state, *run_id, step_id, !reject, json).await?;
        }

        Commands::Ack { run_id, step_id } => {
            cli::run::evidence(&state, *run_id, step_id, Default::default(), json).await?;
        }

        Commands::Vars { run_id } => {
            cli::run::vars(&state, *run_id, json).await?;
        }

        Commands::Manifest { run_id } => {
            cli::run::manifest(&state, *run_id, json).await?;
        }

        Commands::SaveScenario { run_id, dir } => {
            cli::run::save_scenario(&state, *run_id, dir.clone(), json).await?;
        }

        Commands::Replay { scenario } => {
            cli::run::replay(&state, scenario, json).await?;
        }

        Commands::Run { path, vars, follow } => {
            cli::interactive::run(&state, path.clone(), into_map(vars.clone()), *follow, json)
                .await?;
        }

        Commands::Resume { run_id, follow } => {
            cli::interactive::drive(&state, *run_id, *follow, json).await?;
        }

        Commands::Validate { path, normalized } => {
            cli::run::validate(&state, path, *normalized, json)?;
        }

        Commands::List => {
            cli::run::list(&state, json).await?;
        }

        Commands::Delete { run_id, force } => {
            cli::run::delete(&state, *run_id, *force, json).await?;
        }

        Commands::Serve { port, host } => {
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Runbook API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            tracing::info!(
                addr = %addr,
                backend = ?state.config.session_backend,
                data_dir = %state.data_dir.display(),
                "serving runbook API"
            );
            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
