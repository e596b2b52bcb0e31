use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use govsense::cache::{invalidate_on_refresh, TtlCache};
use govsense::ingest::Fetcher;
use govsense::refresh::Orchestrator;
use govsense::registry::Registry;
use govsense::settings::Settings;
use govsense::store::MemoryStore;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;

    let registry = Arc::new(Registry::from_settings(&settings));
    let fetcher = Fetcher::new(
        settings.data_gouv_base_url(),
        settings.fetch_timeout(),
        settings.fetch_max_retries(),
    )
    .context("cannot build fetcher")?;
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(registry, Arc::new(fetcher), store);

    let cache: Arc<TtlCache<serde_json::Value>> = Arc::new(TtlCache::new());
    let _invalidator = invalidate_on_refresh(Arc::clone(&cache), orchestrator.subscribe());

    match settings.refresh_interval_seconds {
        Some(secs) => {
            let scheduler = Arc::clone(&orchestrator).start_periodic(Duration::from_secs(secs));
            tokio::signal::ctrl_c()
                .await
                .context("cannot listen for shutdown signal")?;
            scheduler.stop();
            info!("shutting down");
        }
        None => {
            let run = orchestrator
                .trigger_now()
                .await
                .context("manual refresh rejected")?;
            info!(run_id = %run.id, status = ?run.status, rows = ?run.rows, "one-shot refresh done");
        }
    }
    Ok(())
}
