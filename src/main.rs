use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatbi::config::Config;
use chatbi::utils::ScheduledExecutor;
use chatbi::{Services, db};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let _log_guard = init_tracing(&config);
    tracing::info!("ChatBI engine starting up");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Metadata store ready");

    let services = Services::build(&config, pool).await?;
    tracing::info!(
        "Services wired: {} datasource(s) registered",
        services.datasources.list().await.map(|d| d.len()).unwrap_or(0)
    );

    let monitoring_handle = if config.monitoring.enabled {
        let interval = std::time::Duration::from_millis(config.monitoring.tick_interval_ms);
        tracing::info!("Starting monitoring loop with interval {:?}", interval);
        let executor = ScheduledExecutor::new("monitoring", interval);
        let handle = executor.shutdown_handle();
        let monitoring = Arc::clone(&services.monitoring);
        tokio::spawn(async move {
            executor.start(monitoring).await;
        });
        Some(handle)
    } else {
        tracing::warn!("Monitoring loop disabled by configuration");
        None
    };

    tracing::info!("ChatBI engine is ready");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    if let Some(handle) = monitoring_handle {
        handle.shutdown();
    }

    Ok(())
}

/// Console layer always; daily-rolling file layer when configured. The
/// returned guard must live as long as the process.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("chatbi.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    }
}
