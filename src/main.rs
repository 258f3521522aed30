mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use refdata_sync::clock::{ExchangeClock, MarketSessionClock};
use refdata_sync::config::{loader, Settings};
use refdata_sync::error::{Context, Result};
use refdata_sync::manager::Manager;
use refdata_sync::provider::http::HttpTransport;
use refdata_sync::provider::{Provider, ProviderEvent, QueueEngine};
use refdata_sync::store::CsvStore;
use refdata_sync::utils::current_human_timestamp;

use cli::{Cli, Commands};

/// What the event loop waits for before the process exits.
#[derive(Default)]
struct Awaiting {
    symbols: bool,
    sectors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = loader::load_or_default(cli.config.as_deref())?;
    if let Some(directory) = &cli.store {
        settings.store.directory = directory.clone();
    }

    let clock = Arc::new(settings.clock()?);
    let store = Arc::new(
        CsvStore::open(settings.store.directory.clone())
            .with_context(|| format!("failed to open store at {}", settings.store.directory.display()))?,
    );
    let transport = HttpTransport::new(settings.provider.http.clone())?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = QueueEngine::new(transport, settings.engine_settings(), events_tx);
    let dispatcher = engine.start();

    let manager = Manager::new(
        engine.clone(),
        store,
        clock.clone(),
        settings.manager.clone(),
    );

    let result = run_command(&cli.command, &manager, &engine, &settings, &clock, events_rx).await;

    engine.shutdown();
    if let Some(handle) = dispatcher {
        let _ = handle.await;
    }
    result
}

async fn run_command(
    command: &Commands,
    manager: &Manager,
    engine: &Arc<QueueEngine<HttpTransport>>,
    settings: &Settings,
    clock: &ExchangeClock,
    events: UnboundedReceiver<ProviderEvent>,
) -> Result<()> {
    let mut awaiting = Awaiting::default();

    match command {
        Commands::Update {
            tickers,
            force,
            as_of,
        } => {
            for ticker in tickers {
                manager.add_security(ticker)?;
            }
            let all = manager.securities()?;
            let selected: Vec<_> = if tickers.is_empty() {
                all.iter().cloned().collect()
            } else {
                let wanted: Vec<String> = tickers.iter().map(|t| t.trim().to_uppercase()).collect();
                all.iter()
                    .filter(|security| wanted.contains(&security.ticker))
                    .cloned()
                    .collect()
            };
            if selected.is_empty() {
                println!("Nothing to update. Add tickers first.");
                return Ok(());
            }

            manager.connect()?;
            let as_of = as_of.unwrap_or_else(|| clock.today());
            let ids = manager.update_security_price_data_batch(&selected, as_of, *force)?;
            println!(
                "Queued {} of {} securities for update through {as_of}",
                ids.len(),
                selected.len()
            );
        }
        Commands::Contract { ticker } => {
            let security = manager.add_security(ticker)?;
            manager.connect()?;
            manager.request_contract_data(&security)?;
        }
        Commands::Company { ticker } => {
            let security = manager.add_security(ticker)?;
            manager.connect()?;
            manager.request_company_info(&security)?;
        }
        Commands::Symbols { .. } => {
            manager.connect()?;
            awaiting.symbols = true;
            manager.request_provider_supported_symbols();
        }
        Commands::Sectors => {
            manager.connect()?;
            awaiting.sectors = true;
            manager.request_provider_sectors();
        }
        Commands::Add { tickers } => {
            for ticker in tickers {
                let security = manager.add_security(ticker)?;
                println!("Added {}", security.ticker);
            }
            return Ok(());
        }
        Commands::Remove { tickers } => {
            for ticker in tickers {
                if manager.remove_security(ticker)? {
                    println!("Removed {}", ticker.trim().to_uppercase());
                } else {
                    println!("{} is not cached", ticker.trim().to_uppercase());
                }
            }
            return Ok(());
        }
        Commands::List => {
            print_securities(manager)?;
            return Ok(());
        }
        Commands::Status => {
            print_status(manager);
            return Ok(());
        }
    }

    let quiet = Duration::from_millis(settings.provider.poll_interval_ms.saturating_mul(2).max(200));
    drive(manager, engine.as_ref(), events, quiet, awaiting).await;

    match command {
        Commands::Symbols { limit } => {
            let symbols = manager.supported_symbols();
            println!("{} symbols listed by {}", symbols.len(), manager.provider().name());
            for listing in symbols.iter().take(*limit) {
                println!(
                    "  {:<10} {:<8} {}",
                    listing.ticker,
                    listing.exchange.as_deref().unwrap_or("-"),
                    listing.name
                );
            }
        }
        Commands::Sectors => {
            for sector in manager.sectors() {
                println!("{} ({} industries)", sector.name, sector.industries.len());
            }
        }
        _ => print_securities(manager)?,
    }
    print_status(manager);
    Ok(())
}

/// Feed provider events to the manager until the queue is empty, nothing
/// has arrived for `quiet`, and any one-shot lookups have answered.
async fn drive(
    manager: &Manager,
    engine: &dyn Provider,
    mut events: UnboundedReceiver<ProviderEvent>,
    quiet: Duration,
    mut awaiting: Awaiting,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("provider event channel closed early");
                    break;
                };
                match &event {
                    ProviderEvent::SupportedSymbolsResponse(_) => awaiting.symbols = false,
                    ProviderEvent::SectorsResponse(_) => awaiting.sectors = false,
                    _ => {}
                }
                manager.handle_provider_event(event);
            }
            _ = tokio::time::sleep(quiet) => {
                if engine.pending_count() == 0 && !awaiting.symbols && !awaiting.sectors {
                    break;
                }
                if !engine.session().connected {
                    warn!("provider disconnected: {}", engine.session().message);
                    break;
                }
            }
        }
    }
    info!("{} requests left in the queue", engine.pending_count());
}

fn print_securities(manager: &Manager) -> Result<()> {
    let securities = manager.securities()?;
    println!("# {} securities as of {}", securities.len(), current_human_timestamp());
    for security in securities.iter() {
        let range = match (security.first_bar_date(), security.last_bar_date()) {
            (Some(first), Some(last)) => format!("{first} .. {last}"),
            _ => "no bars".to_string(),
        };
        let mut flags = Vec::new();
        if security.missing_data {
            flags.push("missing-data");
        }
        if security.zero_volume {
            flags.push("zero-volume");
        }
        println!(
            "  {:<10} {:<6} {:>6} bars  {:<24} {} {}",
            security.ticker,
            security.exchange.as_deref().unwrap_or("-"),
            security.bars.len(),
            range,
            security.name.as_deref().unwrap_or(""),
            flags.join(",")
        );
    }
    Ok(())
}

fn print_status(manager: &Manager) {
    for (label, value) in manager.display_fields() {
        if !value.is_empty() {
            println!("{label:>16}: {value}");
        }
    }
}
