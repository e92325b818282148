use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::OrchestratorConfig;

/// Apply the state DB migrations (queue table + job ledger).
pub async fn run(cfg: &OrchestratorConfig) -> anyhow::Result<()> {
    let pool = connect(cfg).await?;
    apply(&pool).await?;
    tracing::info!(event = "validation.migrate.done", "migrations complete");
    Ok(())
}

pub async fn connect(cfg: &OrchestratorConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")
}

pub async fn apply(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations/state")
        .run(pool)
        .await
        .context("migrate state db")
}
