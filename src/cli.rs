use clap::{Parser, Subcommand};
use serde_json::json;

use crate::config::{Config, LogFormat};
use crate::db::TransactionStore;
use crate::domain::{CanonicalStatus, EventSource, ProviderEvent, Transaction};
use crate::services::{ReconcileOutcome, Reconciler};
use crate::utils::sanitize::mask_str;

#[derive(Parser)]
#[command(name = "payment-reconciler")]
#[command(about = "Payment Reconciler - webhook, polling and live status reconciliation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and pollers (default)
    Serve,

    /// Transaction management commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Print the effective configuration with secrets masked
    Config,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Show a transaction and its audit trail
    Show {
        #[arg(value_name = "ORDER_ID")]
        order_id: String,
    },

    /// Mark a pending transaction as completed
    ForceComplete {
        #[arg(value_name = "ORDER_ID")]
        order_id: String,

        /// Bank settlement reference (e.g. UTR)
        #[arg(long)]
        settlement_reference: Option<String>,

        /// Provider-assigned payment id
        #[arg(long)]
        payment_id: Option<String>,
    },

    /// Mark a pending transaction as failed
    ForceFail {
        #[arg(value_name = "ORDER_ID")]
        order_id: String,

        /// Operator note stored in the audit trail
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_tx_show(store: &dyn TransactionStore, order_id: &str) -> anyhow::Result<()> {
    let Some(tx) = store.find_by_order_id(order_id).await? else {
        anyhow::bail!("Order {} not found", order_id)
    };
    println!("{}", serde_json::to_string_pretty(&tx)?);
    Ok(())
}

/// A manual operator action, run through the same guard as provider events.
fn manual_event(
    tx: &Transaction,
    status: CanonicalStatus,
    provider_payment_id: Option<String>,
    settlement_reference: Option<String>,
    message: Option<String>,
) -> ProviderEvent {
    ProviderEvent {
        provider: tx.provider,
        order_id: tx.order_id.clone(),
        raw_payload: json!({
            "action": format!("force-{}", status),
            "providerPaymentId": provider_payment_id,
            "settlementReference": settlement_reference,
        }),
        provider_payment_id,
        settlement_reference,
        raw_status_code: "MANUAL".to_string(),
        canonical_status: status,
        amount: None,
        message,
        source: EventSource::Manual,
    }
}

async fn force_status(
    store: &dyn TransactionStore,
    reconciler: &Reconciler,
    event_for: impl FnOnce(&Transaction) -> ProviderEvent,
    order_id: &str,
) -> anyhow::Result<ReconcileOutcome> {
    let Some(tx) = store.find_by_order_id(order_id).await? else {
        tracing::warn!("Order {} not found", order_id);
        anyhow::bail!("Order {} not found", order_id)
    };

    let event = event_for(&tx);
    let outcome = reconciler.reconcile(&event).await?;
    match outcome {
        ReconcileOutcome::Applied(status) => {
            tracing::info!(order_id = %order_id, status = %status, source = "manual", "Order status forced");
            println!("✓ Order {} marked as {}", order_id, status);
            Ok(outcome)
        }
        ReconcileOutcome::SkippedNotFound => anyhow::bail!("Order {} not found", order_id),
        _ => {
            let current = store
                .find_by_order_id(order_id)
                .await?
                .map(|tx| tx.status.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!("Order {} is already {}, nothing changed", order_id, current)
        }
    }
}

pub async fn handle_tx_force_complete(
    store: &dyn TransactionStore,
    reconciler: &Reconciler,
    order_id: &str,
    settlement_reference: Option<String>,
    payment_id: Option<String>,
) -> anyhow::Result<ReconcileOutcome> {
    force_status(
        store,
        reconciler,
        |tx| {
            manual_event(
                tx,
                CanonicalStatus::Completed,
                payment_id,
                settlement_reference,
                Some("Forced complete via CLI".to_string()),
            )
        },
        order_id,
    )
    .await
}

pub async fn handle_tx_force_fail(
    store: &dyn TransactionStore,
    reconciler: &Reconciler,
    order_id: &str,
    reason: Option<String>,
) -> anyhow::Result<ReconcileOutcome> {
    force_status(
        store,
        reconciler,
        |tx| {
            manual_event(
                tx,
                CanonicalStatus::Failed,
                None,
                None,
                Some(reason.unwrap_or_else(|| "Forced failure via CLI".to_string())),
            )
        },
        order_id,
    )
    .await
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    use sqlx::migrate::Migrator;
    use std::path::Path;

    let Some(database_url) = &config.database_url else {
        anyhow::bail!("DATABASE_URL is not set, nothing to migrate")
    };
    let pool = crate::db::create_pool(database_url).await?;
    let migrator = Migrator::new(Path::new("./migrations")).await?;

    tracing::info!("Running database migrations...");
    migrator.run(&pool).await?;

    tracing::info!("Database migrations completed");
    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    match &config.database_url {
        Some(url) => println!("  Database URL: {}", mask_password(url)),
        None => println!("  Database URL: <unset, in-memory store>"),
    }
    println!("  Reconcile Guard: {:?}", config.reconcile_guard);
    println!("  Live Heartbeat: {}s", config.live_heartbeat.as_secs());
    println!(
        "  Log Format: {}",
        match config.log_format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    );
    println!(
        "  Polling: every {}s, window {}h, batch {}, delay {}ms, denial threshold {}",
        config.polling.interval.as_secs(),
        config.polling.window.num_hours(),
        config.polling.batch_limit,
        config.polling.call_delay.as_millis(),
        config.polling.denial_threshold
    );

    if let Some(a) = &config.gateway_a {
        println!("  Gateway A: merchant key {}", mask_str(&a.merchant_key));
    }
    if let Some(b) = &config.gateway_b {
        println!("  Gateway B: webhook secret {}", mask_str(&b.webhook_secret));
    }
    if config.gateway_c.is_some() {
        println!("  Gateway C: enabled");
    }
    for (codec, endpoint) in config.status_endpoints() {
        println!(
            "  {} status API: {}{}",
            codec.provider(),
            endpoint.base_url,
            if endpoint.api_key.is_some() { " (api key set)" } else { "" }
        );
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
