use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use task_relay::api::{ApiState, task_routes};
use task_relay::callback::CallbackDispatcher;
use task_relay::config::Config;
use task_relay::executor;
use task_relay::queue::{TaskQueue, reconcile_on_startup};
use task_relay::store::{LibSqlTaskStore, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // _guard must live until main() returns to flush the file writer
    let _guard = init_tracing(&config)?;

    eprintln!("📋 Task Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   API: http://{}", config.bind_addr());
    eprintln!("   Executor: {:?}", config.executor);

    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlTaskStore::new_local(&config.database_path, config.limits.clone())
            .await
            .context("Failed to open task database")?,
    );

    // Nothing from a previous process is still in the in-memory queue.
    reconcile_on_startup(store.as_ref())
        .await
        .context("Startup reconciliation failed")?;

    let executor = executor::from_config(&config.executor).context("Invalid executor")?;
    let dispatcher = Arc::new(CallbackDispatcher::new(
        Arc::clone(&store),
        config.webhook.clone(),
    ));
    let queue = TaskQueue::new(
        Arc::clone(&store),
        executor,
        dispatcher,
        config.queue.clone(),
    );
    queue.start().await;

    let app = task_routes(ApiState {
        queue: Arc::clone(&queue),
        store,
        api_key: Arc::new(config.api_key.clone()),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %config.bind_addr(), "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    tracing::info!("Shutting down task queue");
    queue.stop().await;
    Ok(())
}

/// Log to stderr and a daily-rolling file in `LOG_DIR`.
fn init_tracing(config: &Config) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create {}", config.log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("api")
        .filename_suffix("log")
        .build(&config.log_dir)
        .context("Failed to create log appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
