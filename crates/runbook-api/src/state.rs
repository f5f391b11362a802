//! Application state wiring the run service together.
//!
//! AppState holds the concrete service used by both CLI and REST API. The
//! service is generic over repository and filesystem traits; AppState pins
//! it to the infra implementations selected by `config.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use runbook_core::event::EventBus;
use runbook_core::runbook::engine::Engine;
use runbook_core::runbook::expression::JexlEvaluator;
use runbook_core::service::runbook::RunbookService;
use runbook_infra::config::load_config;
use runbook_infra::executor::DefaultExecutorSource;
use runbook_infra::filesystem::{LocalFileSystem, resolve_data_dir};
use runbook_infra::loader::FsRunbookLoader;
use runbook_infra::repository::AnySessionRepository;
use runbook_types::config::RunbookConfig;

/// Run service pinned to the infra implementations.
pub type ConcreteRunbookService = RunbookService<AnySessionRepository, LocalFileSystem>;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub runbook_service: Arc<ConcreteRunbookService>,
    pub config: Arc<RunbookConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: load config, open the session
    /// store, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;

        let repo = AnySessionRepository::open(&config, &data_dir)
            .await
            .context("failed to open session store")?;

        let engine = Engine::new(
            Arc::new(FsRunbookLoader::new()),
            Arc::new(JexlEvaluator::new()),
            EventBus::new(config.event_capacity),
            config.clone(),
        );

        let runbook_service = RunbookService::new(
            engine,
            repo,
            Arc::new(DefaultExecutorSource::new(&config)),
            LocalFileSystem::new(),
        );

        tracing::debug!(
            data_dir = %data_dir.display(),
            backend = ?config.session_backend,
            "application state initialized"
        );

        Ok(Self {
            runbook_service: Arc::new(runbook_service),
            config: Arc::new(config),
            data_dir,
        })
    }
}
