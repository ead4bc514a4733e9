use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use listwatch_cli::{Command, Config, CredentialAction};
use listwatch_client::{Credential, CredentialStore, ListingApiClient, RateLimitedFetcher};
use listwatch_core::{
    load_config, AppConfig, BatchRunSummary, CollectionService, RunLogger, TracingObserver,
};
use listwatch_db::{run_migrations, ListingRepository, RunRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr keeps stdout for summaries)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let app_config = load_config(config.config.as_deref()).context("Failed to load configuration")?;

    match config.command {
        Command::Run { region } => {
            let pool = connect(config.database_url.as_deref(), &app_config).await?;
            run(pool, &app_config, region.as_deref()).await?;
        }
        Command::Credentials { action } => {
            credentials(&app_config, action).await?;
        }
        Command::Migrate => {
            let pool = connect(config.database_url.as_deref(), &app_config).await?;
            run_migrations(&pool).await.context("Failed to apply migrations")?;
        }
    }

    Ok(())
}

async fn connect(database_url: Option<&str>, config: &AppConfig) -> anyhow::Result<PgPool> {
    let url = database_url.context("DATABASE_URL is required for this command")?;

    info!("Connecting to database...");
    PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

/// Run enabled regions, or the one named on the command line
async fn run(pool: PgPool, config: &AppConfig, region: Option<&str>) -> anyhow::Result<()> {
    let regions = match region {
        Some(key) => {
            let entry = config
                .find_region(key)
                .with_context(|| format!("Region '{}' not found in configuration", key))?;
            vec![entry]
        }
        None => config.enabled_regions(),
    };
    if regions.is_empty() {
        bail!("No enabled regions in configuration");
    }

    // Ctrl-C cancels cooperatively; nothing is persisted for interrupted regions
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    // Initialize services
    let credentials = Arc::new(
        CredentialStore::from_config(&config.credentials)
            .await
            .context("Failed to open credential pool")?,
    );
    let fetcher = RateLimitedFetcher::new(&config.http, &config.api.user_agent, credentials)?
        .with_cancellation(cancel.clone());
    let client = ListingApiClient::new(&config.api, Arc::new(fetcher))?;

    let logger = RunLogger::new()
        .with_observer(Arc::new(TracingObserver))
        .with_observer(Arc::new(RunRepository::new(pool.clone())));
    let service = CollectionService::new(client, ListingRepository::new(pool), config.collect.clone())
        .with_logger(logger);

    let summary = service.run_regions(&regions, cancel).await;
    print_summary(&summary);

    if summary.failed_count() > 0 {
        bail!(
            "{} of {} regions failed",
            summary.failed_count(),
            summary.total_regions()
        );
    }
    if summary.cancelled_count() > 0 {
        bail!("Run cancelled");
    }
    Ok(())
}

fn print_summary(summary: &BatchRunSummary) {
    println!("\nRun summary\n");
    for result in &summary.results {
        let status = if result.cancelled {
            "cancelled"
        } else if result.error.is_some() {
            "failed"
        } else {
            "ok"
        };
        let stats = &result.stats;
        println!(
            "  {:<16} {:<10} created {:>5}  changed {:>5}  seen {:>6}  closed {:>5}  reopened {:>4}",
            result.region_code,
            status,
            stats.created,
            stats.changed,
            stats.seen,
            stats.closed,
            stats.reopened
        );
        if let Some(suppression) = &stats.closure_suppression {
            println!("  {:<16} {}", "", suppression.message);
        }
        if stats.persist_failures > 0 {
            println!("  {:<16} {} persistence steps failed", "", stats.persist_failures);
        }
        if let Some(error) = &result.error {
            println!("  {:<16} {}", "", error);
        }
    }
    println!(
        "\n  {} successful, {} failed, {} cancelled, {} listings reconciled\n",
        summary.successful_count(),
        summary.failed_count(),
        summary.cancelled_count(),
        summary.total_listings()
    );
}

/// Manage the credential pool file
async fn credentials(config: &AppConfig, action: CredentialAction) -> anyhow::Result<()> {
    let store = CredentialStore::from_config(&config.credentials)
        .await
        .context("Failed to open credential pool")?;
    let margin = chrono::Duration::seconds(config.credentials.safety_margin_secs);

    match action {
        CredentialAction::List => {
            let pool = store.list().await;
            if pool.is_empty() {
                println!("No credentials in pool.");
                return Ok(());
            }
            let now = chrono::Utc::now();
            for credential in pool {
                let state = if credential.is_usable(now, margin) {
                    "usable"
                } else {
                    "expired"
                };
                println!(
                    "  {}  expires {}  {}",
                    credential.fingerprint(),
                    credential.expires_at.format("%Y-%m-%d %H:%M:%SZ"),
                    state
                );
            }
        }
        CredentialAction::Add { token, expires_in } => {
            if expires_in <= 0 {
                bail!("--expires-in must be positive");
            }
            let expires_at = chrono::Utc::now() + chrono::Duration::seconds(expires_in);
            let credential = Credential::new(token, serde_json::Value::Null, expires_at);
            let fingerprint = credential.fingerprint();
            store.add(credential).await.context("Failed to save credential")?;
            println!("Added credential {}", fingerprint);
        }
        CredentialAction::Prune => {
            let removed = store.prune().await.context("Failed to prune credentials")?;
            println!("Removed {} expired credentials", removed);
        }
    }

    Ok(())
}
