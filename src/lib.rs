pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod payloads;
pub mod provider;
pub mod queue;
pub mod store;
pub mod workers;

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support;

use std::sync::{Arc, Once};

use env_logger::Env;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::llm::LlmClient;
use crate::provider::EmailProvider;
use crate::queue::JobQueue;
use crate::workers::backfill::BackfillOrchestrator;
use crate::workers::extraction::{ExtractionEnqueuer, ExtractionWorker};
use crate::workers::monitor::CompletionMonitor;
use crate::workers::thread_sync::ThreadSyncWorker;
use crate::workers::webhook::WebhookConsumer;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}

/// Spawn every worker role and block until a shutdown signal drains them.
///
/// The webhook consumer, backfill orchestrator, extraction enqueuer and
/// completion monitor are singletons; thread-sync and extraction workers fan
/// out per settings. All roles share one cancellation token, cancelled by
/// ctrl-c; each worker observes it at the top of its poll loop and at natural
/// seams, so in-flight iterations finish before the join completes.
pub async fn run_until_shutdown(
    pool: PgPool,
    settings: Settings,
    provider: Arc<dyn EmailProvider>,
    llm: Arc<dyn LlmClient>,
) {
    let shutdown = CancellationToken::new();
    let queue = JobQueue::new(pool.clone());

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(
        BackfillOrchestrator::new(
            pool.clone(),
            queue.clone(),
            provider.clone(),
            settings.backfill.clone(),
            settings.provider.api_delay,
        )
        .run(shutdown.clone()),
    ));

    for worker_id in 0..settings.thread_sync.workers {
        tasks.push(tokio::spawn(
            ThreadSyncWorker::new(
                pool.clone(),
                queue.clone(),
                provider.clone(),
                settings.thread_sync.clone(),
                settings.provider.api_delay,
                worker_id,
            )
            .run(shutdown.clone()),
        ));
    }

    tasks.push(tokio::spawn(
        WebhookConsumer::new(
            pool.clone(),
            queue.clone(),
            provider.clone(),
            settings.webhook.clone(),
        )
        .run(shutdown.clone()),
    ));

    tasks.push(tokio::spawn(
        CompletionMonitor::new(pool.clone(), settings.monitor.clone()).run(shutdown.clone()),
    ));

    tasks.push(tokio::spawn(
        ExtractionEnqueuer::new(
            pool.clone(),
            queue.clone(),
            llm.clone(),
            settings.llm.clone(),
            settings.extraction.clone(),
        )
        .run(shutdown.clone()),
    ));

    for worker_id in 0..settings.extraction.workers {
        tasks.push(tokio::spawn(
            ExtractionWorker::new(
                pool.clone(),
                queue.clone(),
                llm.clone(),
                settings.llm.clone(),
                settings.extraction.clone(),
                worker_id,
            )
            .run(shutdown.clone()),
        ));
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("shutdown signal received, draining workers");
                signal_token.cancel();
            }
            Err(e) => log::error!("failed to install signal handler: {}", e),
        }
    });

    for task in tasks {
        if let Err(e) = task.await {
            // A panicked role takes the installation down gracefully.
            log::error!("worker task failed: {}", e);
            shutdown.cancel();
        }
    }
}
