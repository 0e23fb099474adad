use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flatwatch_core::SortMode;
use flatwatch_storage::SnapshotStore;
use flatwatch_sync::{
    load_registry, shutdown, EnvType, LogNotifier, SegmentCatalog, WatchConfig, WatchService,
};
use flatwatch_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flatwatch", version)]
#[command(about = "Polls new-build flat listings and announces new listings and price drops")]
struct Cli {
    /// Overrides FLATWATCH_ENV.
    #[arg(long, global = true)]
    env: Option<EnvType>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every segment until Ctrl-C.
    Run,
    /// Run a single pass and drain deliveries.
    SyncOnce,
    /// Print recently updated listings of a segment.
    Dump {
        slug: String,
        #[arg(long)]
        sort_by_avg: bool,
    },
    /// Print one listing with its history and the price envelope of similar listings.
    Info { slug: String, id: i64 },
    /// Serve the JSON info surface.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = WatchConfig::from_env().context("reading configuration")?;
    if let Some(env) = cli.env {
        config.env = env;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::SyncOnce => {
            let service = WatchService::from_config(config)?;
            let (summary, delivered) = service.sync_once(Arc::new(LogNotifier)).await?;
            println!(
                "sync complete: run_id={} segments={} ok={} failed={} digests={} sent={}",
                summary.run_id,
                summary.planned,
                summary.succeeded,
                summary.failed,
                summary.digests_enqueued,
                delivered.sent
            );
        }
        Commands::Dump { slug, sort_by_avg } => {
            let mode = if sort_by_avg {
                SortMode::BelowAverage
            } else {
                SortMode::Price
            };
            let store = segment_store(&config, &slug)?;
            let text = flatwatch_sync::dump_text(&store, &slug, mode, Utc::now()).await?;
            match text {
                Some(text) => println!("{text}"),
                None => println!("no flats on sale in {slug}"),
            }
        }
        Commands::Info { slug, id } => {
            let store = segment_store(&config, &slug)?;
            let info = flatwatch_sync::listing_info(&store, &slug, id, Utc::now())
                .await?
                .with_context(|| format!("listing {id} not found in {slug}"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Serve => {
            config.validate()?;
            let (catalog, _) = load_registry(&config.registry_path, config.env)?;
            let state = AppState::new(store(&config), Arc::new(catalog));
            flatwatch_web::serve(state, config.web_port, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
    }

    Ok(())
}

fn store(config: &WatchConfig) -> SnapshotStore {
    SnapshotStore::new(&config.storage_dir, config.env.as_str())
}

/// Store for `slug`, refusing segments the registry does not list.
fn segment_store(config: &WatchConfig, slug: &str) -> Result<SnapshotStore> {
    let (catalog, _) = load_registry(&config.registry_path, config.env)?;
    ensure_known(&catalog, slug)?;
    Ok(store(config))
}

fn ensure_known(catalog: &SegmentCatalog, slug: &str) -> Result<()> {
    if catalog.get(slug).is_none() {
        bail!("unknown segment {slug:?}");
    }
    Ok(())
}

async fn run(config: WatchConfig) -> Result<()> {
    let grace = config.shutdown_grace;
    let service = WatchService::from_config(config)?;
    let queue = service.start_delivery(Arc::new(LogNotifier));
    let scheduler = service.scheduler(queue.handle());

    let (stop_tx, stop_rx) = shutdown::channel();
    let mut scheduler_task = tokio::spawn(async move { scheduler.run_forever(stop_rx).await });

    tokio::select! {
        res = &mut scheduler_task => {
            res.context("scheduler task join")?;
            warn!("scheduler exited on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received; shutting down");
        }
    }
    shutdown::request(&stop_tx);

    let drained = tokio::time::timeout(grace, async {
        if !scheduler_task.is_finished() {
            scheduler_task.await.context("scheduler task join")?;
        }
        queue.shutdown().await
    })
    .await;

    match drained {
        Ok(Ok(stats)) => {
            info!(sent = stats.sent, failed = stats.failed, "done");
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => bail!("shutdown did not finish within {}s", grace.as_secs()),
    }
}
