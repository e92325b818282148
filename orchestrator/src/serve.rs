use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio::sync::mpsc;
use validation_core::{
    ledger::Ledger,
    lite::{pgledger::PgLedger, pgqueue::PgQueue},
    pool::WorkerPool,
    sandbox::Sandbox,
    validators::ValidatorRegistry,
    Error, Queue,
};
use validation_exec::JobExecutionService;
use validation_prep::{sda_client::SdaClient, JobPreparationService};

use crate::{apptainer::ApptainerSandbox, config::OrchestratorConfig, migrate};

/// Which pools a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Prepare,
    Execute,
    All,
}

impl Role {
    fn prepares(self) -> bool {
        matches!(self, Role::Prepare | Role::All)
    }

    fn executes(self) -> bool {
        matches!(self, Role::Execute | Role::All)
    }
}

pub async fn load_registry(
    cfg: &OrchestratorConfig,
    sandbox: &dyn Sandbox,
) -> anyhow::Result<ValidatorRegistry> {
    let registry = ValidatorRegistry::load(&cfg.validator_paths, sandbox)
        .await
        .context("load validators")?;
    if registry.is_empty() {
        tracing::warn!(
            event = "validation.registry.empty",
            "no validators configured; every job will fail"
        );
    }
    Ok(registry)
}

/// Run the pools of `role` until ctrl-c, or until a pool reports a fatal error.
pub async fn run(cfg: &OrchestratorConfig, role: Role) -> anyhow::Result<()> {
    let db = migrate::connect(cfg).await?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(db.clone()));
    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(db));
    let sandbox: Arc<dyn Sandbox> = Arc::new(ApptainerSandbox::from_config(cfg));
    let registry = Arc::new(load_registry(cfg, sandbox.as_ref()).await?);

    tracing::info!(
        event = "validation.orchestrator.starting",
        role = ?role,
        validators = registry.len(),
        config = ?cfg,
        "orchestrator starting"
    );

    let mut pools = Vec::new();

    if role.prepares() {
        let service = JobPreparationService::builder()
            .queue(queue.clone())
            .ledger(ledger.clone())
            .registry(registry.clone())
            .file_service(Arc::new(SdaClient::new(
                cfg.sda_api_url.clone(),
                cfg.sda_api_token.clone(),
            )))
            .work_dir(cfg.work_dir.clone())
            .destination_queue(cfg.execution_queue.clone())
            .build()?;
        let mut pool = pool_builder(cfg, queue.clone())
            .name("job-preparation-worker")
            .queue_name(cfg.preparation_queue.clone())
            .worker_count(cfg.preparation_workers)
            .build()?;
        pool.start(Arc::new(service))?;
        pools.push(pool);
    }

    if role.executes() {
        let service = JobExecutionService::builder()
            .ledger(ledger.clone())
            .registry(registry.clone())
            .sandbox(sandbox.clone())
            .build()?;
        let mut pool = pool_builder(cfg, queue.clone())
            .name("job-execution-worker")
            .queue_name(cfg.execution_queue.clone())
            .worker_count(cfg.execution_workers)
            .build()?;
        pool.start(Arc::new(service))?;
        pools.push(pool);
    }

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<(String, Error)>(pools.len().max(1));
    for pool in &mut pools {
        let name = pool.queue_name().to_string();
        let mut monitor = pool.monitor();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            while let Some(err) = monitor.recv().await {
                if fatal_tx.send((name.clone(), err)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(fatal_tx);

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => {
                tracing::info!(event = "validation.orchestrator.stopping", "shutdown requested");
                Ok(())
            }
            Err(err) => Err(anyhow::Error::from(err).context("wait for ctrl-c")),
        },
        Some((queue_name, err)) = fatal_rx.recv() => {
            tracing::error!(
                event = "validation.orchestrator.pool_failed",
                queue = %queue_name,
                error = %err,
                "worker pool failed; shutting down"
            );
            Err(anyhow!("worker pool on queue {queue_name} failed: {err}"))
        }
    };

    for pool in pools {
        pool.shutdown().await;
    }
    outcome
}

fn pool_builder(
    cfg: &OrchestratorConfig,
    queue: Arc<dyn Queue>,
) -> validation_core::pool::WorkerPoolBuilder {
    WorkerPool::builder()
        .queue(queue)
        .poll_interval(cfg.poll_interval())
        .visibility_timeout(cfg.visibility_timeout())
        .requeue_delay(cfg.requeue_delay())
        .max_deliveries(cfg.max_deliveries)
}
