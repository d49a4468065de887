mod cache;
mod config;
mod extract;
mod fallback;
mod pacer;
mod refresher;
mod server;
mod single_flight;
mod upstream;
mod utils;

use anyhow::Result;
use clap::Parser;

use crate::{config::Settings, refresher::MarketCapService};

#[derive(Debug, Parser)]
#[command(name = "mcapd", version)]
struct Cli {
    /// Override PORT
    #[arg(long)]
    port: Option<u16>,

    /// Override MINT (the token whose market cap is served)
    #[arg(long)]
    mint: Option<String>,

    /// Override STATIC_DIR
    #[arg(long)]
    static_dir: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(p) = cli.port {
        settings.port = p;
    }
    if let Some(m) = cli.mint {
        settings.mint = m.trim().to_string();
    }
    if let Some(d) = cli.static_dir {
        settings.static_dir = d;
    }
    settings.validate()?;

    log::info!(
        "app.start mint={} cache_ttl_ms={} timeout_ms={} min_interval_ms={} max_backoff_ms={}",
        settings.mint,
        settings.cache_ttl_ms,
        settings.upstream_timeout_ms,
        settings.upstream_min_interval_ms,
        settings.rate_limit_max_backoff_ms
    );

    let service = MarketCapService::from_settings(&settings)?;

    // Pay for the first upstream call before the first visitor does.
    if settings.warm_on_start {
        let svc = service.clone();
        tokio::spawn(async move {
            let e = svc.read().await;
            log::info!("app.warm mc={:?} ok={}", e.value, e.healthy);
        });
    }

    server::serve(settings, service).await
}
