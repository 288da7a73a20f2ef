mod cli;
mod config;

use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kwatch_engine::{
    Command, CommandService, ConsoleNotifier, EngineHandle, EngineMetrics, IncomingMessage,
    JsonFileStore, QuotaLedger, SenderBlacklist, SourceRegistry, SubscriptionKind,
    SubscriptionRegistry,
};

use crate::cli::{Args, Commands};
use crate::config::AppConfig;

/// Default log filter directive.
const DEFAULT_LOG_FILTER: &str = "kwatch=info,kwatch_engine=info";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Run => run_engine(config).await,
        Commands::Add {
            owner,
            pattern,
            regex,
        } => {
            let kind = if regex {
                SubscriptionKind::Regex
            } else {
                SubscriptionKind::Literal
            };
            execute(
                &config,
                Command::Subscribe {
                    owner_id: owner,
                    pattern,
                    kind,
                    filters: Default::default(),
                },
            )
            .await
        }
        Commands::Remove { owner, pattern } => {
            execute(
                &config,
                Command::Unsubscribe {
                    owner_id: owner,
                    pattern,
                },
            )
            .await
        }
        Commands::List { owner } => execute(&config, Command::List { owner_id: owner }).await,
        Commands::Stats { owner } => execute(&config, Command::Stats { owner_id: owner }).await,
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Run one command against the subscription store, without starting the
/// pipeline.
async fn execute(config: &AppConfig, command: Command) -> Result<()> {
    let service = command_service(config).await?;
    let reply = service.execute(command).await?;
    println!("{reply}");
    Ok(())
}

async fn command_service(config: &AppConfig) -> Result<Arc<CommandService>> {
    let quotas = Arc::new(QuotaLedger::new());
    let sources = Arc::new(SourceRegistry::new());
    let blacklist = Arc::new(SenderBlacklist::new());
    let registry = Arc::new(SubscriptionRegistry::new(
        quotas.clone(),
        Arc::new(JsonFileStore::new(&config.store_path)),
        sources.clone(),
        blacklist.clone(),
        config.engine.monitor.max_keywords_per_user,
    ));
    registry.load_from_store().await?;
    Ok(Arc::new(CommandService::new(
        registry,
        sources,
        blacklist,
        quotas,
        Arc::new(EngineMetrics::new()),
        config.engine.clone(),
    )))
}

/// Run the pipeline, feeding it JSON-line messages from stdin.
async fn run_engine(config: AppConfig) -> Result<()> {
    info!(store = %config.store_path.display(), "starting engine");
    let handle = EngineHandle::start(
        config.engine,
        Arc::new(JsonFileStore::new(&config.store_path)),
        Arc::new(ConsoleNotifier),
    )
    .await?;

    let mut alerts = handle.alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            warn!(
                owner_id = alert.owner_id,
                subscription_id = alert.subscription_id,
                reason = %alert.reason,
                "delivery problem"
            );
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IncomingMessage>(line) {
                        Ok(message) => {
                            handle.on_message(message);
                        }
                        Err(e) => warn!("skipping unparseable message record: {e}"),
                    }
                }
                None => {
                    info!("input stream ended");
                    break;
                }
            },
        }
    }

    let snapshot = handle.metrics();
    handle.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
