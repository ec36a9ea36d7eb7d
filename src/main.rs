use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskplane::cancel::Canceller;
use taskplane::config::Config;
use taskplane::dispatch::{Dispatcher, HttpWorkerTransport, WorkerEndpoint, WorkerRegistry};
use taskplane::ingest::{self, Ingestor};
use taskplane::limits::RateLimiter;
use taskplane::server::{build_router, AppContext};
use taskplane::store::{MemoryStore, TaskStore, UsageStore};
use taskplane::token::{AppTokenProvider, InstallationTokenService};
use taskplane::types::WorkerLocation;
use taskplane::webhook::{HttpDeliveryTransport, PendingQueue, WebhookSender};

const GITHUB_API_BASE: &str = "https://api.github.com";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskplane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let store = Arc::new(MemoryStore::new());
    let task_store: Arc<dyn TaskStore> = store.clone();
    let usage_store: Arc<dyn UsageStore> = store.clone();
    let limiter = Arc::new(RateLimiter::new(usage_store, config.rate_limits.clone()));

    let mut workers = Vec::new();
    if let Some(url) = &config.host_worker_url {
        workers.push(WorkerEndpoint::new(WorkerLocation::Host, url.clone(), 1));
    }
    if let Some(url) = &config.vm_worker_url {
        workers.push(WorkerEndpoint::new(WorkerLocation::Vm, url.clone(), 2));
    }
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(HttpWorkerTransport::new()?),
        WorkerRegistry::new(workers),
        task_store.clone(),
        config.shared_secret.as_bytes().to_vec(),
        config.callback_base_url.clone(),
        config.system_prompt_hash.clone(),
    ));

    let ingestor = Arc::new(Ingestor::new(
        task_store.clone(),
        limiter.clone(),
        dispatcher.clone(),
    ));
    let canceller = Arc::new(Canceller::new(
        task_store.clone(),
        limiter.clone(),
        dispatcher,
    ));
    let ctx = AppContext::new(
        task_store.clone(),
        limiter.clone(),
        ingestor,
        canceller,
        config.shared_secret.as_bytes().to_vec(),
    );

    let shutdown = CancellationToken::new();
    let mut background = tokio::task::JoinSet::new();

    // Pending-webhook sweep.
    let webhook_sender = Arc::new(WebhookSender::new(
        Arc::new(HttpDeliveryTransport::new()?),
        PendingQueue::new(config.pending_queue_path())?,
    ));
    {
        let sender = webhook_sender.clone();
        let shutdown = shutdown.clone();
        let interval = config.pending_sweep_interval;
        background.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = sender.retry_pending().await {
                            tracing::warn!(error = %e, "pending webhook sweep failed");
                        }
                    }
                }
            }
        });
    }

    // Zombie reconciliation.
    {
        let store = task_store.clone();
        let limiter = limiter.clone();
        let shutdown = shutdown.clone();
        let interval = config.zombie_sweep_interval;
        let stale = chrono::Duration::from_std(config.zombie_stale_threshold)?;
        background.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let reconciled = ingest::reconcile_zombies(&store, &limiter, stale).await;
                        if reconciled > 0 {
                            tracing::info!(reconciled, "zombie sweep reconciled tasks");
                        }
                    }
                }
            }
        });
    }

    // Installation token rotation, when App credentials are configured.
    if let Some(app) = &config.github_app {
        let provider = AppTokenProvider::new(
            app.app_id.clone(),
            app.installation_id.to_string(),
            app.private_key_path.clone(),
            GITHUB_API_BASE,
        )?;
        let service = Arc::new(InstallationTokenService::new(
            Arc::new(provider),
            config.token_file_path(),
        ));
        service.on_degraded(|failures| {
            tracing::error!(failures, "GitHub token refresh degraded, operator attention needed");
        });
        let shutdown = shutdown.clone();
        let check_interval = config.token_check_interval;
        background.spawn(async move {
            service.run(shutdown, check_interval).await;
        });
    }

    let app = build_router(ctx);
    tracing::info!(addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("failed to listen for shutdown signal");
                }
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    while background.join_next().await.is_some() {}
    Ok(())
}
