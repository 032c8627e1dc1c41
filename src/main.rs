use clap::Parser;
use sqlx::migrate::Migrator;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payment_reconciler::cli::{self, Cli, Commands, DbCommands, TxCommands};
use payment_reconciler::clock::{Clock, SystemClock};
use payment_reconciler::config::{Config, LogFormat};
use payment_reconciler::db::{self, MemoryTransactionStore, PostgresTransactionStore, TransactionStore};
use payment_reconciler::middleware::request_logger::RequestLogSettings;
use payment_reconciler::providers::HttpStatusClient;
use payment_reconciler::services::{
    Broadcaster, Notifier, PollingScheduler, ProviderPoller, Reconciler, SubscriberRegistry,
};
use payment_reconciler::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Tx(command) => {
            let store = open_store(&config).await?;
            // Notifications from a one-off CLI process have no listeners.
            let (notifier, _notifications) = Notifier::detached();
            let reconciler = Reconciler::new(store.clone(), notifier, config.reconcile_guard);

            match command {
                TxCommands::Show { order_id } => cli::handle_tx_show(store.as_ref(), &order_id).await,
                TxCommands::ForceComplete {
                    order_id,
                    settlement_reference,
                    payment_id,
                } => cli::handle_tx_force_complete(
                    store.as_ref(),
                    &reconciler,
                    &order_id,
                    settlement_reference,
                    payment_id,
                )
                .await
                .map(|_| ()),
                TxCommands::ForceFail { order_id, reason } => {
                    cli::handle_tx_force_fail(store.as_ref(), &reconciler, &order_id, reason)
                        .await
                        .map(|_| ())
                }
            }
        }
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TransactionStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;

            let migrator = Migrator::new(Path::new("./migrations")).await?;
            migrator.run(&pool).await?;
            tracing::info!("Database migrations completed");

            Ok(Arc::new(PostgresTransactionStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory transaction store");
            Ok(Arc::new(MemoryTransactionStore::new()))
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config).await?;

    let registry = Arc::new(SubscriberRegistry::new());
    let broadcaster = Broadcaster::start(registry.clone());
    let reconciler = Reconciler::new(store.clone(), broadcaster.notifier(), config.reconcile_guard);
    tracing::info!(guard = ?config.reconcile_guard, "Reconciler initialized");

    let codecs = config.codecs();
    if codecs.is_empty() {
        tracing::warn!("No payment provider configured, every webhook will be answered 404");
    }
    for provider in codecs.keys() {
        tracing::info!(provider = %provider, "Webhook endpoint enabled");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pollers: Vec<ProviderPoller> = config
        .status_endpoints()
        .into_iter()
        .map(|(codec, endpoint)| {
            tracing::info!(provider = %codec.provider(), url = %endpoint.base_url, "Status polling enabled");
            ProviderPoller::new(
                Arc::new(HttpStatusClient::new(codec, endpoint.base_url, endpoint.api_key)),
                store.clone(),
                reconciler.clone(),
                clock.clone(),
                config.polling.clone(),
            )
        })
        .collect();
    let scheduler = PollingScheduler::start(pollers);

    let app = create_app(AppState {
        store,
        reconciler,
        codecs: Arc::new(codecs),
        registry: registry.clone(),
        live_heartbeat: config.live_heartbeat,
        request_log: RequestLogSettings {
            log_body: config.log_request_body,
        },
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    scheduler.stop().await;
    broadcaster.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(registry: Arc<SubscriberRegistry>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let closed = registry.close_all();
    tracing::info!(live_streams = closed, "Shutdown signal received");
}
