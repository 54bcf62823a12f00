mod config;
mod delivery;
mod error;
mod invoice_links;
mod ledger;
mod order_parser;
mod page;
mod runner;
mod storefront;
mod webdriver;

use std::path::Path;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use delivery::Delivery;
use error::Result;
use ledger::Ledger;
use page::Page;
use runner::{CancelFlag, Runner};
use webdriver::WebDriverPage;

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "invoice_harvest.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(config = %config_path, "Configuration loaded");

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received. Finishing the current card and stopping...");
                cancel.request();
            }
        });
    }

    match &config.schedule {
        Some(schedule) => {
            let interval = config::parse_schedule_interval(schedule)?;
            info!(schedule = %schedule, interval_secs = interval.as_secs(), "Scheduled mode enabled");

            let mut run_count: u64 = 0;
            while !cancel.is_requested() {
                run_count += 1;
                info!(run = run_count, "Starting scheduled run");
                if let Err(run_error) = run_once(&config, &cancel).await {
                    error!(error = %run_error, "Scheduled run failed");
                }
                if cancel.is_requested() {
                    break;
                }
                info!(schedule = %schedule, "Waiting until next run");
                wait_interruptible(interval, &cancel).await;
            }
            info!("Scheduled mode stopped");
        }
        None => {
            run_once(&config, &cancel).await?;
        }
    }

    Ok(())
}

/// One independent run: fresh browser session, fresh ledger handle. The
/// browser session is released on every exit path.
async fn run_once(config: &Config, cancel: &CancelFlag) -> Result<()> {
    let ledger = Ledger::open(&config.storage.db_path)?;

    info!(endpoint = %config.webdriver.endpoint, "Setting up browser session...");
    let page = WebDriverPage::connect(&config.webdriver.endpoint).await?;

    let output_folder = config.storage.output_folder.as_deref().map(Path::new);
    let delivery = Delivery::new(output_folder, config.paperless.as_ref());
    let runner = Runner::new(&page, config, &ledger, &delivery, cancel.clone());

    let result = runner.run().await;

    info!("Closing browser...");
    if let Err(close_error) = page.close().await {
        error!(error = %close_error, "Could not close browser session");
    }

    let stats = result?;
    info!(
        cards = stats.cards_seen,
        completed = stats.invoices_completed,
        failed = stats.invoices_failed,
        "Run finished"
    );
    Ok(())
}

/// Sleep in short chunks so a cancellation request cuts the wait short.
async fn wait_interruptible(interval: Duration, cancel: &CancelFlag) {
    let mut elapsed = Duration::ZERO;
    while elapsed < interval && !cancel.is_requested() {
        let chunk = std::cmp::min(Duration::from_secs(10), interval - elapsed);
        sleep(chunk).await;
        elapsed += chunk;
    }
}
