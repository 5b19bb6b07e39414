use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use simplebank_infra::config::Config;
use simplebank_infra::db::{LedgerStore, PgDatabase};
use simplebank_infra::mail::LogEmailSender;
use simplebank_infra::tasks::{ProcessorConfig, RedisTaskQueue, TaskProcessor, VerifyEmailHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simplebank_observability::init();

    let config = Config::from_env().context("failed to load config")?;

    let db = PgDatabase::connect(&config.database)
        .await
        .context("failed to connect to postgres")?;
    db.apply_schema().await.context("failed to apply schema")?;
    let store = LedgerStore::new(db);

    let queue = RedisTaskQueue::connect(&config.worker.redis_url, config.worker.namespace.clone())
        .await
        .context("failed to connect to redis")?;

    let mut processor = TaskProcessor::new(Arc::new(queue));
    let mailer = LogEmailSender::new(
        config.email.sender_name.clone(),
        config.email.sender_address.clone(),
    );
    Arc::new(VerifyEmailHandler::new(
        store,
        Arc::new(mailer),
        config.email.verify_url.clone(),
    ))
    .register(&mut processor);

    let handle = processor.spawn(
        ProcessorConfig::default()
            .with_name("simplebank-worker")
            .with_concurrency(config.worker.concurrency)
            .with_lease(config.worker.lease)
            .with_task_timeout(config.worker.task_timeout),
    );
    info!(
        namespace = %config.worker.namespace,
        concurrency = config.worker.concurrency,
        "task processor started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down task processor");

    let stats = handle.shutdown().await;
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead = stats.dead,
        "task processor stopped"
    );
    Ok(())
}
