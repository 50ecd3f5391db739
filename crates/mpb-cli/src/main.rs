use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use mpb_adapters::{source_for, MarketSource, SourceKind};
use mpb_bot::{
    run_polling, BotConfig, BotHandler, Dispatcher, DispatcherConfig, PriceLookup, TelegramClient,
    Update,
};
use mpb_core::ItemQuery;
use mpb_guard::{sweep, terminate, GuardError, LockState, ProcessGuard};
use mpb_web::{AppState, WEBHOOK_PATH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const UPDATE_QUEUE: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "mpb-cli")]
#[command(about = "Market price chat bot")]
struct Cli {
    /// Market source strategy: `api` or `rendered`. Overrides MARKET_SOURCE.
    #[arg(long, global = true)]
    source: Option<SourceKind>,

    /// Lock file path. Overrides MPB_LOCK_PATH.
    #[arg(long, global = true)]
    lock_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the chat bot (default).
    Run,
    /// Look up one item and print the reply.
    Lookup {
        #[arg(required = true)]
        item: Vec<String>,
        /// Print the full lookup outcome as JSON instead of the chat reply.
        #[arg(long)]
        json: bool,
    },
    /// Stop the instance holding the lock and sweep stray bot processes.
    Cleanup {
        #[arg(long, default_value = "mpb-cli")]
        signature: String,
        #[arg(long, default_value_t = 1000)]
        grace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env()?;
    if let Some(source) = cli.source {
        config.source = source;
    }
    if let Some(lock_path) = cli.lock_path {
        config.lock_path = lock_path;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Lookup { item, json } => lookup_once(&config, &item.join(" "), json).await,
        Commands::Cleanup {
            signature,
            grace_ms,
        } => cleanup(&config, &signature, Duration::from_millis(grace_ms)).await,
    }
}

fn market_source(config: &BotConfig) -> Arc<dyn MarketSource> {
    info!(source = %config.source, base_url = %config.market_base_url, "market source selected");
    Arc::from(source_for(config.source, &config.market_config()))
}

async fn run(config: BotConfig) -> Result<()> {
    let token = config.require_token()?.to_string();
    let guard = ProcessGuard::new(&config.lock_path);
    let mut ownership = match guard.acquire() {
        Ok(ownership) => ownership,
        Err(GuardError::AlreadyRunning { pid }) => bail!(
            "another bot instance is already running (pid {pid}); stop it or run `mpb-cli cleanup`"
        ),
        Err(err) => return Err(err).context("acquiring process lock"),
    };

    let result = run_bot(&config, token).await;
    if let Err(err) = ownership.release() {
        warn!(error = %err, "could not release process lock");
    }
    result
}

async fn run_bot(config: &BotConfig, token: String) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let client = Arc::new(TelegramClient::new(
        config.telegram_api_base.as_str(),
        token,
        config.http_config(),
    )?);
    let handler = Arc::new(BotHandler::new(
        PriceLookup::new(market_source(config)),
        client.clone(),
    ));
    let (updates_tx, updates_rx) = mpsc::channel::<Update>(UPDATE_QUEUE);

    let listener = mpb_web::bind(config.port)
        .await
        .with_context(|| format!("binding liveness port {}", config.port))?;

    let (web_state, poller) = match &config.webhook_url {
        Some(base) => {
            let url = format!("{base}{WEBHOOK_PATH}");
            client
                .set_webhook(&url, config.webhook_secret.as_deref())
                .await
                .context("registering webhook")?;
            info!("receiving chat updates via webhook");
            (
                AppState::with_webhook(updates_tx, config.webhook_secret.clone()),
                None,
            )
        }
        None => (
            AppState::liveness_only(),
            Some(tokio::spawn(run_polling(
                client.clone(),
                updates_tx,
                cancel.clone(),
            ))),
        ),
    };
    let web = tokio::spawn(mpb_web::serve(listener, web_state, cancel.clone()));

    info!("bot started");
    Dispatcher::new(handler, DispatcherConfig::default(), cancel.clone())
        .run(updates_rx)
        .await;
    cancel.cancel();

    if let Some(poller) = poller {
        if let Err(err) = poller.await {
            warn!(error = %err, "poller task failed");
        }
    }
    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "liveness server failed"),
        Err(err) => warn!(error = %err, "liveness server task failed"),
    }
    info!("bot stopped");
    Ok(())
}

async fn watch_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    cancel.cancel();
}

async fn lookup_once(config: &BotConfig, item: &str, json: bool) -> Result<()> {
    let query = ItemQuery::new(item).context("item name must not be empty")?;
    let lookup = PriceLookup::new(market_source(config));
    if json {
        let outcome = lookup.lookup(&query).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", lookup.reply_for(&query).await);
    }
    Ok(())
}

async fn cleanup(config: &BotConfig, signature: &str, grace: Duration) -> Result<()> {
    let guard = ProcessGuard::new(&config.lock_path);
    match guard.inspect()? {
        LockState::Held { pid } if pid != std::process::id() => {
            let outcome = terminate(pid, grace).await?;
            println!("lock holder {pid}: {outcome:?}");
        }
        LockState::Held { .. } | LockState::Free => {
            println!("no running instance holds {}", guard.path().display());
        }
        LockState::Stale { pid } => {
            println!(
                "{} names pid {pid}, which is not running; the next start reclaims it",
                guard.path().display()
            );
        }
        LockState::Unreadable { contents } => {
            println!(
                "{} has unreadable contents {contents:?}; the next start reclaims it",
                guard.path().display()
            );
        }
    }

    let report = sweep(signature, grace).await?;
    for process in &report.terminated {
        println!(
            "terminated pid={} outcome={:?} command={}",
            process.pid, process.outcome, process.command
        );
    }
    for process in &report.failed {
        eprintln!("could not terminate pid={} command={}", process.pid, process.command);
    }
    println!(
        "cleanup complete: terminated={} failed={}",
        report.terminated.len(),
        report.failed.len()
    );
    Ok(())
}
