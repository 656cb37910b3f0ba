//! Application state wiring the engine to its infrastructure.
//!
//! The engine, trigger manager and resumption gateway are generic over the
//! instance store; AppState pins them to the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use talentflow_core::workflow::catalog::TemplateCatalog;
use talentflow_core::workflow::engine::WorkflowEngine;
use talentflow_core::workflow::gateway::ResumptionGateway;
use talentflow_core::workflow::timers::TimerSweeper;
use talentflow_core::workflow::trigger::TriggerManager;
use talentflow_infra::collaborator::default_collaborators;
use talentflow_infra::config::{data_dir, database_url, load_engine_config};
use talentflow_infra::sqlite::{DatabasePool, SqliteInstanceStore};
use talentflow_types::config::EngineConfig;

pub type Engine = WorkflowEngine<SqliteInstanceStore>;
pub type Triggers = TriggerManager<SqliteInstanceStore>;
pub type Gateway = ResumptionGateway<SqliteInstanceStore>;

/// Shared state for every command.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub catalog: Arc<TemplateCatalog>,
    pub engine: Engine,
    pub triggers: Triggers,
    pub gateway: Gateway,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Open the database, load the catalog and register every template.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url(&data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let collaborators =
            default_collaborators(&config).context("failed to set up collaborators")?;
        let engine = WorkflowEngine::new(
            SqliteInstanceStore::new(db_pool.clone()),
            collaborators,
            config.clone(),
        );

        let catalog = TemplateCatalog::load(config.templates_dir.as_deref())
            .context("failed to load workflow templates")?;
        let triggers = TriggerManager::new(engine.clone());
        for def in catalog.iter() {
            triggers
                .register(Arc::clone(def))
                .await
                .with_context(|| format!("failed to register template '{}'", def.name()))?;
        }

        let gateway = ResumptionGateway::new(engine.clone());

        Ok(Self {
            data_dir,
            config,
            catalog: Arc::new(catalog),
            engine,
            triggers,
            gateway,
            db_pool,
        })
    }

    pub fn sweeper(&self) -> TimerSweeper<SqliteInstanceStore> {
        TimerSweeper::new(self.gateway.clone())
    }
}
