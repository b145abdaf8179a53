use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;

use reply_proxy::channels::StdinEvents;
use reply_proxy::config::{DelayConfig, PlannerConfig, Principal, TriggerConfig};
use reply_proxy::decision::{LlmCapability, Outcome, ResponsePlanner};
use reply_proxy::dispatch::{Dispatcher, LogDispatcher, SlackDispatcher};
use reply_proxy::llm::{LlmConfig, create_provider};
use reply_proxy::scheduler::{DelayScheduler, spawn_prune_task};
use reply_proxy::store::LibSqlStore;

/// How often finished replies are pruned, and how many are kept.
const PRUNE_EVERY: Duration = Duration::from_secs(300);
const PRUNE_KEEP: usize = 500;

#[tokio::main]
async fn main() -> reply_proxy::error::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // ── Configuration ────────────────────────────────────────────────────
    let delays = DelayConfig::from_env()?;
    let triggers = TriggerConfig::from_env();
    let principal = Principal::from_env()?;
    let planner_config = PlannerConfig::from_env()?;
    let llm_config = LlmConfig::from_env()?;

    eprintln!("📨 Reply proxy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Acting for: {} ({})", principal.name, principal.user_id);
    eprintln!("   Trigger keywords: {}", triggers.keywords.join(", "));
    eprintln!("   Reading JSON-lines events from stdin.\n");

    let llm = create_provider(&llm_config)?;
    let capability = Arc::new(LlmCapability::new(llm));

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(match std::env::var("REPLY_PROXY_DB_PATH") {
        Ok(path) => LibSqlStore::new_local(Path::new(&path)).await?,
        Err(_) => {
            tracing::warn!("REPLY_PROXY_DB_PATH not set, using in-memory store");
            LibSqlStore::new_memory().await?
        }
    });

    // ── Dispatch + scheduling ────────────────────────────────────────────
    let dispatcher: Arc<dyn Dispatcher> = match SlackDispatcher::from_env()? {
        Some(slack) => {
            tracing::info!("Slack dispatcher enabled");
            Arc::new(slack)
        }
        None => {
            tracing::info!("SLACK_BOT_TOKEN not set, replies will only be logged");
            Arc::new(LogDispatcher)
        }
    };

    let scheduler = DelayScheduler::new(delays, dispatcher);
    let prune_handle = spawn_prune_task(Arc::clone(&scheduler), PRUNE_EVERY, PRUNE_KEEP);

    let principal_id = principal.user_id.clone();
    let planner = Arc::new(
        ResponsePlanner::builder(capability, store.clone(), Arc::clone(&scheduler))
            .checkpoints(store.clone())
            .triggers(triggers)
            .principal(principal)
            .config(planner_config)
            .build(),
    );

    // ── Event loop ───────────────────────────────────────────────────────
    let mut events = StdinEvents::start();
    let mut tasks = JoinSet::new();
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(message) = event else { break };

                if let Err(e) = store.record_message(&message).await {
                    tracing::warn!(message_id = %message.id, error = %e, "Failed to record message");
                }

                // The principal's own messages are history, not work.
                if message.user_id == principal_id {
                    continue;
                }

                let planner = Arc::clone(&planner);
                tasks.spawn(async move {
                    let message_id = message.id.clone();
                    let outcome = planner.handle(message).await;
                    if let Outcome::Scheduled(ref scheduled) = outcome {
                        tracing::info!(
                            message_id = %message_id,
                            urgency = %scheduled.urgency,
                            delay_secs = scheduled.delay.as_secs(),
                            "Reply queued"
                        );
                    }
                });

                while let Some(result) = tasks.try_join_next() {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Planner task failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    if interrupted {
        eprintln!("\nInterrupted, cancelling pending replies.");
        tasks.abort_all();
        scheduler.shutdown().await;
    } else {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Planner task failed");
            }
        }
        let pending = scheduler.pending_count().await;
        if pending > 0 {
            eprintln!("Input closed, waiting for {pending} pending replies.");
        }
        tokio::select! {
            _ = scheduler.drain() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted, cancelling pending replies.");
                scheduler.shutdown().await;
            }
        }
    }

    prune_handle.abort();
    tracing::info!("Reply proxy stopped");
    Ok(())
}
